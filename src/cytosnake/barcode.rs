use std::path::Path;

use log::warn;

use crate::errors::{AggregateError, Result};
use crate::table::Table;

pub const PLATE_COLUMN: &str = "Assay_Plate_Barcode";
pub const PLATEMAP_COLUMN: &str = "Plate_Map_Name";

/// Plate identifier for a plate data file: its file name without the
/// final extension, so `SQ00014613.sqlite` is plate `SQ00014613`.
pub fn plate_id<P: AsRef<Path>>(plate_data: P) -> Result<String> {
    let plate_data = plate_data.as_ref();
    plate_data
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| AggregateError::BadPlatePath(plate_data.to_path_buf()))
}

/// Barcode-to-platemap assignments, in file order.
#[derive(Debug, Clone)]
pub struct BarcodeTable {
    name: String,
    assignments: Vec<(String, String)>,
}

impl BarcodeTable {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_table(Table::from_path(path, b',')?)
    }

    pub fn from_table(table: Table) -> Result<Self> {
        let plate_col = table.column(PLATE_COLUMN)?;
        let platemap_col = table.column(PLATEMAP_COLUMN)?;

        let assignments = table
            .rows()
            .iter()
            .map(|row| (row[plate_col].clone(), row[platemap_col].clone()))
            .collect();

        Ok(BarcodeTable {
            name: table.name().to_string(),
            assignments,
        })
    }

    /// Platemap name of the first row assigned to `plate`.
    ///
    /// Additional rows for the same plate are ignored with a warning.
    pub fn platemap_for(&self, plate: &str) -> Option<&str> {
        let mut matches = self
            .assignments
            .iter()
            .filter(|(barcode, _)| barcode == plate)
            .map(|(_, platemap)| platemap.as_str());

        let first = matches.next()?;
        let extra = matches.count();
        if extra > 0 {
            warn!(
                "{} rows in {} match plate {:?}, using platemap {:?}",
                extra + 1,
                self.name,
                plate,
                first
            );
        }
        Some(first)
    }
}
