use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AggregateError>;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("loading aggregation config {path:?}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("plate {plate:?} not found in barcode table {path:?}")]
    BarcodeLookup { plate: String, path: PathBuf },

    #[error("missing file {0:?}")]
    MissingFile(PathBuf),

    #[error("column {column:?} missing from {table}")]
    MissingColumn { column: String, table: String },

    #[error("bad plate data path {0:?}")]
    BadPlatePath(PathBuf),

    #[error("mismatched inputs: {plates} plate files, {cell_counts} cell count outputs, {aggregates} aggregate outputs")]
    MismatchedInputs {
        plates: usize,
        cell_counts: usize,
        aggregates: usize,
    },

    #[error("aggregation backend: {0}")]
    Backend(String),

    #[error("plate {plate}: {source}")]
    Job {
        plate: String,
        #[source]
        source: Box<AggregateError>,
    },

    #[error("current directory {0:?} is not a project folder")]
    NotProject(PathBuf),

    #[error("unable to find directory {0:?}")]
    MissingDirectory(PathBuf),

    #[error("{0:?} already exists")]
    AlreadyExists(PathBuf),

    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("aggregation backend: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),
}

impl AggregateError {
    pub fn config_load<P: Into<PathBuf>, E: std::fmt::Display>(path: P, reason: E) -> Self {
        AggregateError::ConfigLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_column<C: Into<String>, T: Into<String>>(column: C, table: T) -> Self {
        AggregateError::MissingColumn {
            column: column.into(),
            table: table.into(),
        }
    }
}
