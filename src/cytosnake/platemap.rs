use std::path::{Path, PathBuf};

use crate::errors::{AggregateError, Result};
use crate::table::Table;

pub const WELL_POSITION_COLUMN: &str = "well_position";
pub const WELL_ROW_COLUMN: &str = "WellRow";
pub const WELL_COL_COLUMN: &str = "WellCol";

/// Platemap columns removed from the cell counts after joining.
pub const DROPPED_COLUMNS: [&str; 3] = [WELL_ROW_COLUMN, WELL_COL_COLUMN, WELL_POSITION_COLUMN];

/// `<metadata_dir>/platemap/<name>.csv`
pub fn platemap_path<P: AsRef<Path>>(metadata_dir: P, name: &str) -> PathBuf {
    metadata_dir
        .as_ref()
        .join("platemap")
        .join(format!("{}.csv", name))
}

/// Per-well metadata for one plate layout.
#[derive(Debug, Clone)]
pub struct Platemap(Table);

impl Platemap {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AggregateError::MissingFile(path.to_path_buf()));
        }
        Self::from_table(Table::from_path(path, b',')?)
    }

    pub fn from_table(table: Table) -> Result<Self> {
        for column in DROPPED_COLUMNS.iter() {
            table.column(column)?;
        }
        Ok(Platemap(table))
    }

    /// Left-joins `cell_counts` to this platemap on `well_column` and
    /// removes the platemap's well layout columns.
    pub fn annotate(&self, cell_counts: &Table, well_column: &str) -> Result<Table> {
        cell_counts
            .left_join(&self.0, well_column, WELL_POSITION_COLUMN)?
            .drop_columns(&DROPPED_COLUMNS)
    }
}
