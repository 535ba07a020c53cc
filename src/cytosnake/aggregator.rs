use std::path::Path;

use crate::config::AggregateConfig;
use crate::errors::Result;
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Everything a backend needs to profile one plate.
#[derive(Debug, Clone, Copy)]
pub struct ProfileParams<'a> {
    pub config: &'a AggregateConfig,
    /// Image column that `config.fields_of_view` filters on.
    pub fields_of_view_feature: &'a str,
}

/// Single-cell profiling capability.
///
/// Implementations must be safe to call from several worker threads at
/// once, each call working on its own plate.
pub trait Aggregator: Sync {
    /// Cells per strata group, with the strata columns followed by
    /// `cell_count`.
    fn count_cells(&self, source: &Path, params: &ProfileParams<'_>) -> Result<Table>;

    /// Aggregates per-cell features by strata and writes the profiles to
    /// `output`.
    fn aggregate_profiles(
        &self,
        source: &Path,
        params: &ProfileParams<'_>,
        output: &Path,
        compression: Compression,
    ) -> Result<()>;
}
