use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::info;

use crate::barcode::plate_id;
use crate::config::AggregateConfig;
use crate::dispatch::{plate_jobs, run_jobs};
use crate::errors::AggregateError;
use crate::project::{
    config_paths, plate_files, project_dirpaths, project_root, AGGREGATE_CONFIG, BARCODES_FILE,
    CONFIG_DIR, DATA_DIR, METADATA_DIR, RESULTS_DIR,
};
use crate::sqlite::SqliteAggregator;

pub const WORKFLOWS: [&str; 1] = ["aggregate"];

/// Runs a named workflow over the project rooted at `root`.
#[derive(Debug)]
pub struct CLI {
    pub root: PathBuf,
    pub workflow: String,
    pub threads: usize,
}

impl CLI {
    pub fn run(&self) -> Result<()> {
        match self.workflow.as_str() {
            "aggregate" => self.aggregate(),
            other => bail!(
                "unknown workflow {:?}, expected one of: {}",
                other,
                WORKFLOWS.join(", ")
            ),
        }
    }

    fn aggregate(&self) -> Result<()> {
        let root = project_root(&self.root)?;
        let dirs = project_dirpaths(&root)?;

        let data_dir = dirs
            .get(DATA_DIR)
            .ok_or_else(|| AggregateError::MissingDirectory(root.join(DATA_DIR)))?;
        let results_dir = root.join(RESULTS_DIR);
        fs::create_dir_all(&results_dir).with_context(|| format!("creating {:?}", results_dir))?;

        let config_path = config_paths(&root)?
            .remove(AGGREGATE_CONFIG)
            .ok_or_else(|| AggregateError::MissingFile(root.join(CONFIG_DIR).join(AGGREGATE_CONFIG)))?;
        let config = AggregateConfig::from_path(&config_path)?;

        let plate_data = plate_files(data_dir)?;
        let mut cell_counts = Vec::with_capacity(plate_data.len());
        let mut aggregate_profiles = Vec::with_capacity(plate_data.len());
        for plate in plate_data.iter() {
            let plate = plate_id(plate)?;
            cell_counts.push(results_dir.join(format!("{}_cell_counts.tsv", plate)));

            let aggregate = results_dir.join(config.aggregate_file_name(&plate));
            if let Some(parent) = aggregate.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
            }
            aggregate_profiles.push(aggregate);
        }

        info!("found {} plates in {:?}", plate_data.len(), data_dir);

        let jobs = plate_jobs(
            &plate_data,
            &cell_counts,
            &aggregate_profiles,
            &data_dir.join(METADATA_DIR),
            &data_dir.join(BARCODES_FILE),
            &config_path,
        )?;
        run_jobs(&jobs, self.threads, &SqliteAggregator::default())
            .context("aggregate workflow failed")?;

        Ok(())
    }
}
