//! Profiling backend for CellProfiler SQLite output.
//!
//! A plate database holds one `Image` table with per-image metadata and
//! one table per object compartment (`Cells`, `Cytoplasm`, `Nuclei`).
//! Compartment rows are tied to their image by the configured merge
//! columns and grouped by the strata columns of that image.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use itertools::Itertools;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};

use crate::aggregator::{Aggregator, Compression, ProfileParams};
use crate::config::{AggregationOperation, Selection};
use crate::errors::{AggregateError, Result};
use crate::table::Table;

pub const IMAGE_TABLE: &str = "Image";
pub const DEFAULT_COMPARTMENTS: [&str; 3] = ["cells", "cytoplasm", "nuclei"];
pub const CELL_COUNT_COLUMN: &str = "cell_count";
pub const OBJECT_COUNT_COLUMN: &str = "Metadata_Object_Count";

#[derive(Debug, Clone)]
pub struct SqliteAggregator {
    compartments: Vec<String>,
}

impl Default for SqliteAggregator {
    fn default() -> Self {
        SqliteAggregator {
            compartments: DEFAULT_COMPARTMENTS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl SqliteAggregator {
    /// Backend over the given compartment tables. Cells are counted in the
    /// first compartment.
    pub fn new(compartments: Vec<String>) -> Result<Self> {
        if compartments.is_empty() {
            return Err(AggregateError::Backend("no compartments given".to_string()));
        }
        Ok(SqliteAggregator { compartments })
    }
}

impl Aggregator for SqliteAggregator {
    fn count_cells(&self, source: &Path, params: &ProfileParams<'_>) -> Result<Table> {
        let config = params.config;
        let conn = open(source)?;
        let images = Images::load(&conn, params, false)?;

        let compartment = &self.compartments[0];
        let mut columns: Vec<&str> = config.merge_cols.iter().map(String::as_str).collect();
        columns.push(&config.object_feature);
        require_columns(&table_columns(&conn, compartment)?, &columns, compartment)?;

        let n_merge = config.merge_cols.len();
        let mut counts: BTreeMap<Vec<String>, usize> = BTreeMap::new();
        query_rows(&conn, compartment, &columns, |row| {
            let key = text_fields(row, 0..n_merge)?;
            if let Some(group) = images.strata.get(&key) {
                let count = counts.entry(group.clone()).or_insert(0);
                if !matches!(row.get_ref(n_merge)?, ValueRef::Null) {
                    *count += 1;
                }
            }
            Ok(())
        })?;

        let mut table = Table::new(
            "cell counts",
            config
                .strata
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(CELL_COUNT_COLUMN)),
        );
        for (group, count) in counts {
            table.push_row(group.into_iter().chain(std::iter::once(count.to_string())))?;
        }

        Ok(table)
    }

    fn aggregate_profiles(
        &self,
        source: &Path,
        params: &ProfileParams<'_>,
        output: &Path,
        compression: Compression,
    ) -> Result<()> {
        let config = params.config;
        if config.add_image_features && !config.load_image_data {
            return Err(AggregateError::Backend(
                "add_image_features requires load_image_data".to_string(),
            ));
        }

        let conn = open(source)?;
        let images = Images::load(&conn, params, config.add_image_features)?;

        let mut rng = match config.subsampling_random_state {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut selected: Option<HashSet<ObjectId>> = None;

        let mut header = config.strata.clone();
        let mut profiles: Option<BTreeMap<Vec<String>, Vec<String>>> = None;

        for (compartment_no, compartment) in self.compartments.iter().enumerate() {
            let objects = Compartment::load(&conn, compartment, &images, params)?;
            debug!(
                "{:?}: {} features over {} groups in {}",
                source,
                objects.features.len(),
                objects.groups.len(),
                compartment
            );

            if let Some(frac) = config.subsampling() {
                if selected.is_none() {
                    selected = Some(objects.subsample(frac, &mut rng));
                }
            }

            let first = compartment_no == 0;
            if first {
                header.push(OBJECT_COUNT_COLUMN.to_string());
            }
            header.extend(objects.features.iter().cloned());

            let mut aggregated = BTreeMap::new();
            for (group, rows) in objects.groups.iter() {
                let kept: Vec<&ObjectRow> = rows
                    .iter()
                    .filter(|row| selected.as_ref().map_or(true, |s| s.contains(&row.id)))
                    .collect();

                let mut values = Vec::with_capacity(objects.features.len() + 1);
                if first {
                    values.push(kept.len().to_string());
                }
                for feature in 0..objects.features.len() {
                    let summary = summarize(
                        config.aggregation_operation,
                        kept.iter().filter_map(|row| row.values[feature]),
                    );
                    values.push(format_value(summary));
                }
                aggregated.insert(group.clone(), values);
            }

            profiles = Some(merge_groups(profiles, aggregated));
        }

        if config.add_image_features {
            header.extend(images.feature_names.iter().cloned());
            let mut aggregated = BTreeMap::new();
            for (group, rows) in images.features.iter() {
                let values: Vec<String> = (0..images.feature_names.len())
                    .map(|feature| {
                        format_value(summarize(
                            config.aggregation_operation,
                            rows.iter().filter_map(|row| row[feature]),
                        ))
                    })
                    .collect();
                aggregated.insert(group.clone(), values);
            }
            profiles = Some(merge_groups(profiles, aggregated));
        }

        let mut table = Table::new("aggregate profiles", header);
        for (group, values) in profiles.unwrap_or_default() {
            table.push_row(group.into_iter().chain(values))?;
        }

        write_profiles(&table, output, compression)
    }
}

/// An object is identified by its image key and object number.
type ObjectId = (Vec<String>, String);

/// Image rows that pass the field-of-view filter.
struct Images {
    /// merge column values -> strata values
    strata: HashMap<Vec<String>, Vec<String>>,
    feature_names: Vec<String>,
    /// strata values -> per-image feature values
    features: BTreeMap<Vec<String>, Vec<Vec<Option<f64>>>>,
}

impl Images {
    fn load(conn: &Connection, params: &ProfileParams<'_>, with_features: bool) -> Result<Self> {
        let config = params.config;
        let available = table_columns(conn, IMAGE_TABLE)?;

        let mut columns: Vec<&str> = Vec::new();
        for column in config
            .image_cols
            .iter()
            .chain(config.merge_cols.iter())
            .chain(config.strata.iter())
        {
            push_unique(&mut columns, column);
        }
        let filter_fov = matches!(config.fields_of_view, Selection::Only(_));
        if filter_fov {
            push_unique(&mut columns, params.fields_of_view_feature);
        }
        require_columns(&available, &columns, IMAGE_TABLE)?;

        let position = |name: &str| columns.iter().position(|c| *c == name).unwrap_or(0);
        let merge_idx: Vec<usize> = config.merge_cols.iter().map(|c| position(c)).collect();
        let strata_idx: Vec<usize> = config.strata.iter().map(|c| position(c)).collect();
        let fov_idx = position(params.fields_of_view_feature);

        let feature_names: Vec<String> = if with_features {
            available
                .iter()
                .filter(|column| {
                    config
                        .image_feature_categories
                        .iter()
                        .any(|category| column.starts_with(&format!("Image_{}_", category)))
                })
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let n_meta = columns.len();
        let mut query_columns = columns.clone();
        query_columns.extend(feature_names.iter().map(String::as_str));

        let mut images = Images {
            strata: HashMap::new(),
            feature_names: Vec::new(),
            features: BTreeMap::new(),
        };

        query_rows(conn, IMAGE_TABLE, &query_columns, |row| {
            let fields = text_fields(row, 0..n_meta)?;
            if filter_fov && !config.fields_of_view.contains(&fields[fov_idx]) {
                return Ok(());
            }

            let key: Vec<String> = merge_idx.iter().map(|&i| fields[i].clone()).collect();
            let group: Vec<String> = strata_idx.iter().map(|&i| fields[i].clone()).collect();

            if with_features {
                let values = number_fields(row, n_meta..query_columns.len())?;
                images.features.entry(group.clone()).or_default().push(values);
            }
            images.strata.insert(key, group);
            Ok(())
        })?;

        images.feature_names = feature_names;
        Ok(images)
    }
}

struct ObjectRow {
    id: ObjectId,
    values: Vec<Option<f64>>,
}

/// Feature values of one compartment, grouped by strata.
struct Compartment {
    features: Vec<String>,
    groups: BTreeMap<Vec<String>, Vec<ObjectRow>>,
}

impl Compartment {
    fn load(
        conn: &Connection,
        compartment: &str,
        images: &Images,
        params: &ProfileParams<'_>,
    ) -> Result<Self> {
        let config = params.config;
        let available = table_columns(conn, compartment)?;

        let prefix = feature_prefix(compartment);
        let metadata_prefix = format!("{}Metadata_", prefix);
        let features: Vec<String> = available
            .iter()
            .filter(|column| {
                column.starts_with(&prefix)
                    && !column.starts_with(&metadata_prefix)
                    && **column != config.object_feature
                    && !config.merge_cols.contains(column)
                    && config.features.contains(column)
            })
            .cloned()
            .collect();

        let mut columns: Vec<&str> = config.merge_cols.iter().map(String::as_str).collect();
        columns.push(&config.object_feature);
        require_columns(&available, &columns, compartment)?;

        let n_merge = config.merge_cols.len();
        let n_meta = columns.len();
        columns.extend(features.iter().map(String::as_str));

        let mut groups: BTreeMap<Vec<String>, Vec<ObjectRow>> = BTreeMap::new();
        query_rows(conn, compartment, &columns, |row| {
            let key = text_fields(row, 0..n_merge)?;
            if let Some(group) = images.strata.get(&key) {
                let object = field_text(row.get_ref(n_merge)?);
                let values = number_fields(row, n_meta..columns.len())?;
                groups.entry(group.clone()).or_default().push(ObjectRow {
                    id: (key, object),
                    values,
                });
            }
            Ok(())
        })?;

        Ok(Compartment { features, groups })
    }

    /// Draws `frac` of the objects in each group, rounded to the nearest
    /// whole object.
    fn subsample(&self, frac: f64, rng: &mut StdRng) -> HashSet<ObjectId> {
        let mut selected = HashSet::new();
        for rows in self.groups.values() {
            let amount = ((rows.len() as f64) * frac).round() as usize;
            for idx in rand::seq::index::sample(rng, rows.len(), amount.min(rows.len())) {
                selected.insert(rows[idx].id.clone());
            }
        }
        selected
    }
}

fn open(source: &Path) -> Result<Connection> {
    if !source.is_file() {
        return Err(AggregateError::MissingFile(source.to_path_buf()));
    }
    Ok(Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT 0", quote_ident(table)))?;
    Ok(stmt.column_names().into_iter().map(str::to_string).collect())
}

fn require_columns(available: &[String], wanted: &[&str], table: &str) -> Result<()> {
    for column in wanted.iter() {
        if !available.iter().any(|a| a == column) {
            return Err(AggregateError::missing_column(*column, format!("{} table", table)));
        }
    }
    Ok(())
}

fn query_rows<F>(conn: &Connection, table: &str, columns: &[&str], mut each_row: F) -> Result<()>
where
    F: FnMut(&Row<'_>) -> Result<()>,
{
    let sql = format!(
        "SELECT {} FROM {}",
        columns.iter().map(|c| quote_ident(c)).join(", "),
        quote_ident(table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        each_row(row)?;
    }
    Ok(())
}

fn push_unique<'a>(columns: &mut Vec<&'a str>, column: &'a str) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

fn feature_prefix(compartment: &str) -> String {
    let mut chars = compartment.chars();
    match chars.next() {
        Some(first) => format!("{}{}_", first.to_uppercase(), chars.as_str()),
        None => "_".to_string(),
    }
}

fn field_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

fn field_number(value: ValueRef<'_>) -> Option<f64> {
    let number = match value {
        ValueRef::Integer(i) => i as f64,
        ValueRef::Real(f) => f,
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok()?,
        ValueRef::Null | ValueRef::Blob(_) => return None,
    };
    if number.is_nan() {
        None
    } else {
        Some(number)
    }
}

fn text_fields(row: &Row<'_>, indices: std::ops::Range<usize>) -> Result<Vec<String>> {
    let mut fields = Vec::with_capacity(indices.len());
    for idx in indices {
        fields.push(field_text(row.get_ref(idx)?));
    }
    Ok(fields)
}

fn number_fields(row: &Row<'_>, indices: std::ops::Range<usize>) -> Result<Vec<Option<f64>>> {
    let mut fields = Vec::with_capacity(indices.len());
    for idx in indices {
        fields.push(field_number(row.get_ref(idx)?));
    }
    Ok(fields)
}

/// Median or mean of the values, `None` when there are none.
fn summarize<I: Iterator<Item = f64>>(operation: AggregationOperation, values: I) -> Option<f64> {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    match operation {
        AggregationOperation::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggregationOperation::Median => {
            values.sort_by(|a, b| a.total_cmp(b));
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                Some((values[mid - 1] + values[mid]) / 2.0)
            } else {
                Some(values[mid])
            }
        }
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

/// Inner join of per-group values, appending `next` after `prev`.
fn merge_groups(
    prev: Option<BTreeMap<Vec<String>, Vec<String>>>,
    mut next: BTreeMap<Vec<String>, Vec<String>>,
) -> BTreeMap<Vec<String>, Vec<String>> {
    match prev {
        None => next,
        Some(prev) => prev
            .into_iter()
            .filter_map(|(group, mut values)| {
                next.remove(&group).map(|more| {
                    values.extend(more);
                    (group, values)
                })
            })
            .collect(),
    }
}

fn write_profiles(table: &Table, output: &Path, compression: Compression) -> Result<()> {
    let file = BufWriter::new(File::create(output)?);
    match compression {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(file, flate2::Compression::default());
            table.write(&mut encoder, b',')?;
            encoder.finish()?.flush()?;
        }
        Compression::None => {
            let mut writer = file;
            table.write(&mut writer, b',')?;
            writer.flush()?;
        }
    }
    Ok(())
}
