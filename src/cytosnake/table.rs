use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use crate::errors::{AggregateError, Result};

/// Delimited text table held as strings, with a single header row.
///
/// Every row has exactly as many fields as the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<N, I, S>(name: N, header: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Table {
            name: name.into(),
            header: header.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row<I, S>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let row: Vec<String> = row.into_iter().map(Into::into).collect();
        if row.len() != self.header.len() {
            return Err(AggregateError::Backend(format!(
                "row of {} fields added to {} with {} columns",
                row.len(),
                self.name,
                self.header.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column(&self, column: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| AggregateError::missing_column(column, self.name.as_str()))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.header.iter().any(|h| h == column)
    }

    pub fn column_values<'a>(&'a self, column: &str) -> Result<impl Iterator<Item = &'a str>> {
        let idx = self.column(column)?;
        Ok(self.rows.iter().map(move |row| row[idx].as_str()))
    }

    pub fn from_path<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                AggregateError::MissingFile(path.to_path_buf())
            } else {
                AggregateError::Io(e)
            }
        })?;
        Self::read(path.display().to_string(), file, delimiter)
    }

    pub fn read<N: Into<String>, R: Read>(name: N, input: R, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(input);

        let mut table = Table::new(name, reader.headers()?.iter());
        for rec_res in reader.records() {
            let rec = rec_res?;
            table.rows.push(rec.iter().map(str::to_string).collect());
        }

        Ok(table)
    }

    pub fn write<W: Write>(&self, out: W, delimiter: u8) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(out);

        writer.write_record(&self.header)?;
        for row in self.rows.iter() {
            writer.write_record(row)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Left join on `left_on` = `right.right_on`.
    ///
    /// Left row order is preserved and a left row is repeated once per
    /// matching right row. Unmatched left rows get empty right fields.
    /// Non-key columns present on both sides are suffixed `_x` (left) and
    /// `_y` (right). When both keys share a name the right key is omitted.
    pub fn left_join(&self, right: &Table, left_on: &str, right_on: &str) -> Result<Table> {
        let left_key = self.column(left_on)?;
        let right_key = right.column(right_on)?;
        let shared_key = left_on == right_on;

        let right_cols: Vec<usize> = (0..right.header.len())
            .filter(|&idx| !(shared_key && idx == right_key))
            .collect();

        let left_names: HashSet<&str> = self.header.iter().map(String::as_str).collect();
        let right_names: HashSet<&str> = right_cols
            .iter()
            .map(|&idx| right.header[idx].as_str())
            .collect();

        let mut header = Vec::with_capacity(self.header.len() + right_cols.len());
        for name in self.header.iter() {
            if right_names.contains(name.as_str()) {
                header.push(format!("{}_x", name));
            } else {
                header.push(name.clone());
            }
        }
        for &idx in right_cols.iter() {
            let name = &right.header[idx];
            if left_names.contains(name.as_str()) {
                header.push(format!("{}_y", name));
            } else {
                header.push(name.clone());
            }
        }

        let mut right_index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (row_no, row) in right.rows.iter().enumerate() {
            right_index
                .entry(row[right_key].as_str())
                .or_default()
                .push(row_no);
        }

        let mut joined = Table {
            name: format!("{} joined with {}", self.name, right.name),
            header,
            rows: Vec::with_capacity(self.rows.len()),
        };

        for left_row in self.rows.iter() {
            match right_index.get(left_row[left_key].as_str()) {
                Some(matches) => {
                    for &right_row_no in matches.iter() {
                        let right_row = &right.rows[right_row_no];
                        let mut row = left_row.clone();
                        row.extend(right_cols.iter().map(|&idx| right_row[idx].clone()));
                        joined.rows.push(row);
                    }
                }
                None => {
                    let mut row = left_row.clone();
                    row.resize(left_row.len() + right_cols.len(), String::new());
                    joined.rows.push(row);
                }
            }
        }

        Ok(joined)
    }

    /// Drops the named columns; every name must be present.
    pub fn drop_columns(&self, columns: &[&str]) -> Result<Table> {
        let mut dropped = HashSet::new();
        for column in columns.iter() {
            dropped.insert(self.column(column)?);
        }

        let keep: Vec<usize> = (0..self.header.len())
            .filter(|idx| !dropped.contains(idx))
            .collect();

        Ok(Table {
            name: self.name.clone(),
            header: keep.iter().map(|&idx| self.header[idx].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|&idx| row[idx].clone()).collect())
                .collect(),
        })
    }
}
