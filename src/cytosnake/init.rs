use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::DEFAULT_CONFIG;
use crate::errors::AggregateError;
use crate::project::{
    AGGREGATE_CONFIG, BARCODES_FILE, CONFIG_DIR, DATA_DIR, METADATA_DIR, PROJECT_MARKER,
    RESULTS_DIR,
};

/// Sets up `root` as a project, moving the inputs into its `data` directory.
#[derive(Debug)]
pub struct CLI {
    pub root: PathBuf,
    pub data: Vec<PathBuf>,
    pub barcode: PathBuf,
    pub metadata: PathBuf,
}

impl CLI {
    pub fn run(&self) -> Result<()> {
        let data_dir = self.root.join(DATA_DIR);
        if data_dir.exists() {
            return Err(AggregateError::AlreadyExists(data_dir).into());
        }

        for input in self.data.iter().chain([&self.barcode, &self.metadata]) {
            if !input.exists() {
                return Err(AggregateError::MissingFile(input.clone()).into());
            }
        }

        let mut moves = Vec::with_capacity(self.data.len() + 2);
        for plate in self.data.iter() {
            let name = plate
                .file_name()
                .ok_or_else(|| AggregateError::BadPlatePath(plate.clone()))?;
            moves.push((plate.as_path(), data_dir.join(name)));
        }
        moves.push((self.barcode.as_path(), data_dir.join(BARCODES_FILE)));
        moves.push((self.metadata.as_path(), data_dir.join(METADATA_DIR)));

        fs::create_dir_all(&data_dir).with_context(|| format!("creating {:?}", data_dir))?;
        for (done, (from, to)) in moves.iter().enumerate() {
            if let Err(err) = move_path(from, to) {
                roll_back(&moves[..done], &data_dir);
                return Err(err);
            }
        }

        let config_dir = self.root.join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).with_context(|| format!("creating {:?}", config_dir))?;
        let aggregate_config = config_dir.join(AGGREGATE_CONFIG);
        if !aggregate_config.exists() {
            fs::write(&aggregate_config, DEFAULT_CONFIG)
                .with_context(|| format!("writing {:?}", aggregate_config))?;
        }

        fs::create_dir_all(self.root.join(RESULTS_DIR))?;
        fs::create_dir_all(self.root.join(PROJECT_MARKER))?;

        info!(
            "initialized project in {:?} with {} plates",
            self.root,
            self.data.len()
        );
        Ok(())
    }
}

/// Renames `from` to `to`, copying plain files when a rename is not possible.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) if from.is_file() => {
            copy_and_remove(from, to).with_context(|| {
                format!("moving {:?} to {:?} (rename failed: {})", from, to, rename_err)
            })
        }
        Err(rename_err) => {
            Err(rename_err).with_context(|| format!("moving {:?} to {:?}", from, to))
        }
    }
}

/// Returns already moved inputs to where they came from and removes
/// `data_dir`, so a failed init can be retried.
fn roll_back(moved: &[(&Path, PathBuf)], data_dir: &Path) {
    for (from, to) in moved.iter().rev() {
        if let Err(err) = move_path(to, from) {
            warn!("could not restore {:?}: {:#}", from, err);
        }
    }
    if let Err(err) = fs::remove_dir(data_dir) {
        warn!("could not remove {:?}: {}", data_dir, err);
    }
}

fn copy_and_remove(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AggregateConfig;
    use crate::project::{config_paths, is_project_dir, plate_files};

    fn staged_inputs(dir: &Path) -> CLI {
        let incoming = dir.join("incoming");
        fs::create_dir_all(incoming.join("metadata").join("platemap")).unwrap();
        fs::write(incoming.join("PlateA.sqlite"), "").unwrap();
        fs::write(incoming.join("PlateB.sqlite"), "").unwrap();
        fs::write(incoming.join("barcode_platemap.csv"), "").unwrap();

        let root = dir.join("project");
        fs::create_dir(&root).unwrap();
        CLI {
            root,
            data: vec![incoming.join("PlateA.sqlite"), incoming.join("PlateB.sqlite")],
            barcode: incoming.join("barcode_platemap.csv"),
            metadata: incoming.join("metadata"),
        }
    }

    #[test]
    fn init_project() {
        let dir = tempfile::tempdir().unwrap();
        let cli = staged_inputs(dir.path());

        cli.run().unwrap();

        let data = cli.root.join(DATA_DIR);
        assert!(is_project_dir(&cli.root));
        assert_eq!(plate_files(&data).unwrap().len(), 2);
        assert!(data.join(BARCODES_FILE).is_file());
        assert!(data.join(METADATA_DIR).join("platemap").is_dir());
        assert!(cli.root.join(RESULTS_DIR).is_dir());
        assert!(!cli.barcode.exists());

        let configs = config_paths(&cli.root).unwrap();
        AggregateConfig::from_path(&configs[AGGREGATE_CONFIG]).unwrap();
    }

    #[test]
    fn existing_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cli = staged_inputs(dir.path());
        fs::create_dir(cli.root.join(DATA_DIR)).unwrap();

        let err = cli.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregateError>(),
            Some(AggregateError::AlreadyExists(_))
        ));
        assert!(cli.data[0].exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_move_restores_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = staged_inputs(dir.path());
        // a plate file named like the metadata directory blocks its move
        let other = dir.path().join("other");
        fs::create_dir(&other).unwrap();
        fs::write(other.join(METADATA_DIR), "").unwrap();
        cli.data.push(other.join(METADATA_DIR));

        let err = cli.run().unwrap_err();
        assert!(err.to_string().contains("moving"));
        for plate in cli.data.iter() {
            assert!(plate.is_file());
        }
        assert!(cli.barcode.is_file());
        assert!(cli.metadata.join("platemap").is_dir());
        assert!(!cli.root.join(DATA_DIR).exists());
        assert!(!is_project_dir(&cli.root));

        fs::remove_file(other.join(METADATA_DIR)).unwrap();
        cli.data.pop();
        cli.run().unwrap();
        assert!(is_project_dir(&cli.root));
    }

    #[test]
    fn missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = staged_inputs(dir.path());
        cli.data.push(dir.path().join("PlateC.sqlite"));

        assert!(cli.run().is_err());
        assert!(!cli.root.join(DATA_DIR).exists());
        assert!(!is_project_dir(&cli.root));
    }
}
