use std::iter::repeat;
use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::izip;
use log::{error, info, warn};
use rayon::prelude::*;

use crate::aggregator::Aggregator;
use crate::errors::{AggregateError, Result};
use crate::job::PlateJob;
use crate::sqlite::SqliteAggregator;

/// Direct aggregation of explicit plate files, one output pair per plate.
#[derive(Debug)]
pub struct CLI {
    pub plate_data: Vec<PathBuf>,
    pub cell_counts: Vec<PathBuf>,
    pub aggregate_profiles: Vec<PathBuf>,
    pub metadata_dir: PathBuf,
    pub barcodes: PathBuf,
    pub config: PathBuf,
    pub threads: usize,
}

impl CLI {
    pub fn run(&self) -> anyhow::Result<()> {
        let jobs = plate_jobs(
            &self.plate_data,
            &self.cell_counts,
            &self.aggregate_profiles,
            &self.metadata_dir,
            &self.barcodes,
            &self.config,
        )?;

        run_jobs(&jobs, self.threads, &SqliteAggregator::default())
            .with_context(|| format!("aggregating {} plates", jobs.len()))
    }
}

/// Pairs each plate's data file and outputs with the shared metadata,
/// barcode and config paths.
pub fn plate_jobs(
    plate_data: &[PathBuf],
    cell_counts: &[PathBuf],
    aggregate_profiles: &[PathBuf],
    metadata_dir: &Path,
    barcodes: &Path,
    config: &Path,
) -> Result<Vec<PlateJob>> {
    if plate_data.len() != cell_counts.len() || plate_data.len() != aggregate_profiles.len() {
        return Err(AggregateError::MismatchedInputs {
            plates: plate_data.len(),
            cell_counts: cell_counts.len(),
            aggregates: aggregate_profiles.len(),
        });
    }

    Ok(izip!(
        plate_data,
        repeat(metadata_dir),
        repeat(barcodes),
        cell_counts,
        aggregate_profiles,
        repeat(config)
    )
    .map(
        |(plate, metadata, barcodes, cell_count, aggregate, config)| PlateJob {
            plate_data: plate.clone(),
            metadata_dir: metadata.to_path_buf(),
            barcode_path: barcodes.to_path_buf(),
            cell_count_out: cell_count.clone(),
            aggregate_out: aggregate.clone(),
            config_path: config.to_path_buf(),
        },
    )
    .collect())
}

/// Worker count actually used for `n_jobs` jobs: never more workers than
/// jobs, and at least one. Logs a warning when the request is reduced.
pub fn effective_workers(requested: usize, n_jobs: usize) -> usize {
    let (workers, warning) = clamp_workers(requested, n_jobs);
    if let Some(warning) = warning {
        warn!("{}", warning);
    }
    workers
}

fn clamp_workers(requested: usize, n_jobs: usize) -> (usize, Option<String>) {
    let workers = requested.min(n_jobs).max(1);
    let warning = if requested > n_jobs {
        Some(format!(
            "number of specified workers ({}) exceeds number of inputs ({}), defaulting to {}",
            requested, n_jobs, workers
        ))
    } else {
        None
    };
    (workers, warning)
}

/// Runs every job on a pool of `workers` threads.
///
/// A failing plate does not stop the others: every job runs, each failure
/// is logged, and the first failure in input order is returned tagged with
/// its plate.
pub fn run_jobs<A: Aggregator + ?Sized>(
    jobs: &[PlateJob],
    workers: usize,
    aggregator: &A,
) -> Result<()> {
    if jobs.is_empty() {
        info!("no plates to aggregate");
        return Ok(());
    }

    let workers = effective_workers(workers, jobs.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|idx| format!("cytosnake-worker-{}", idx))
        .build()?;

    info!("aggregating {} plates with {} workers", jobs.len(), workers);
    let failures: Vec<AggregateError> = pool.install(|| {
        jobs.par_iter()
            .with_max_len(1)
            .filter_map(|job| job.run(aggregator).err().map(|err| job_failure(job, err)))
            .collect()
    });

    if !failures.is_empty() {
        error!("{} of {} plates failed", failures.len(), jobs.len());
    }
    match failures.into_iter().next() {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

fn job_failure(job: &PlateJob, err: AggregateError) -> AggregateError {
    let plate = job
        .plate()
        .unwrap_or_else(|_| job.plate_data.display().to_string());
    error!("plate {} failed: {}", plate, err);
    AggregateError::Job {
        plate,
        source: Box::new(err),
    }
}
