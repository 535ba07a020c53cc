//! Layout of a cytosnake project directory.
//!
//! ```text
//! <root>/
//!   .cytosnake/        marker
//!   configs/aggregate.yaml
//!   data/<plate>.sqlite, data/barcodes.csv, data/metadata/platemap/*.csv
//!   results/
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AggregateError, Result};

pub const PROJECT_MARKER: &str = ".cytosnake";
pub const CONFIG_DIR: &str = "configs";
pub const DATA_DIR: &str = "data";
pub const RESULTS_DIR: &str = "results";
pub const BARCODES_FILE: &str = "barcodes.csv";
pub const METADATA_DIR: &str = "metadata";
pub const AGGREGATE_CONFIG: &str = "aggregate.yaml";
pub const PLATE_EXTENSION: &str = "sqlite";

const IGNORED_DIRS: [&str; 3] = [".vscode", ".git", PROJECT_MARKER];

pub fn is_project_dir<P: AsRef<Path>>(dir: P) -> bool {
    dir.as_ref().join(PROJECT_MARKER).is_dir()
}

/// Absolute path of `dir`, provided it has been set up as a project.
pub fn project_root<P: AsRef<Path>>(dir: P) -> Result<PathBuf> {
    let dir = absolute(dir.as_ref())?;
    if is_project_dir(&dir) {
        Ok(dir)
    } else {
        Err(AggregateError::NotProject(dir))
    }
}

/// Files in the project's `configs` directory, keyed by file name.
pub fn config_paths<P: AsRef<Path>>(root: P) -> Result<BTreeMap<String, PathBuf>> {
    file_search(&root.as_ref().join(CONFIG_DIR))
}

/// Top-level project directories, keyed by name.
pub fn project_dirpaths<P: AsRef<Path>>(root: P) -> Result<BTreeMap<String, PathBuf>> {
    let root = absolute(root.as_ref())?;
    let mut dirs = BTreeMap::new();
    for entry_res in fs::read_dir(&root)? {
        let entry = entry_res?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_DIRS.contains(&name.as_str()) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.insert(name, entry.path());
        }
    }
    Ok(dirs)
}

/// Plate data files in `data_dir`, sorted by path.
pub fn plate_files<P: AsRef<Path>>(data_dir: P) -> Result<Vec<PathBuf>> {
    let mut plates = Vec::new();
    for entry_res in fs::read_dir(data_dir.as_ref())? {
        let path = entry_res?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == PLATE_EXTENSION) {
            plates.push(path);
        }
    }
    plates.sort();
    Ok(plates)
}

fn file_search(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(AggregateError::MissingDirectory(dir.to_path_buf()));
    }

    let mut files = BTreeMap::new();
    for entry_res in fs::read_dir(dir)? {
        let entry = entry_res?;
        if entry.file_type()?.is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned(), entry.path());
        }
    }
    Ok(files)
}

fn absolute(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_required() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_project_dir(dir.path()));
        assert!(matches!(
            project_root(dir.path()),
            Err(AggregateError::NotProject(_))
        ));

        fs::create_dir(dir.path().join(PROJECT_MARKER)).unwrap();
        assert!(is_project_dir(dir.path()));
        assert_eq!(project_root(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn configs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            config_paths(dir.path()),
            Err(AggregateError::MissingDirectory(_))
        ));

        let configs = dir.path().join(CONFIG_DIR);
        fs::create_dir_all(configs.join("extra")).unwrap();
        fs::write(configs.join(AGGREGATE_CONFIG), "").unwrap();
        fs::write(configs.join("normalize.yaml"), "").unwrap();

        let found = config_paths(dir.path()).unwrap();
        assert_eq!(
            found.keys().collect::<Vec<_>>(),
            vec!["aggregate.yaml", "normalize.yaml"]
        );
        assert_eq!(found[AGGREGATE_CONFIG], configs.join(AGGREGATE_CONFIG));
    }

    #[test]
    fn dirpaths_skip_ignored() {
        let dir = tempfile::tempdir().unwrap();
        for sub in [".git", ".vscode", PROJECT_MARKER, DATA_DIR, RESULTS_DIR].iter() {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        fs::write(dir.path().join("README.md"), "").unwrap();

        let dirs = project_dirpaths(dir.path()).unwrap();
        assert_eq!(dirs.keys().collect::<Vec<_>>(), vec!["data", "results"]);
        assert_eq!(dirs[DATA_DIR], dir.path().join(DATA_DIR));
    }

    #[test]
    fn plates_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["PlateB.sqlite", "PlateA.sqlite", "barcodes.csv"].iter() {
            fs::write(dir.path().join(name), "").unwrap();
        }
        assert_eq!(
            plate_files(dir.path()).unwrap(),
            vec![dir.path().join("PlateA.sqlite"), dir.path().join("PlateB.sqlite")]
        );
    }
}
