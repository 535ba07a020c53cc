use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{AggregateError, Result};

/// Configuration written by `cyto init` into `configs/aggregate.yaml`.
pub const DEFAULT_CONFIG: &str = r#"single_cell_config:
  params:
    strata:
      - Image_Metadata_Plate
      - Image_Metadata_Well
    image_cols:
      - TableNumber
      - ImageNumber
    aggregation_operation: median
    output_file: "{plate}_aggregate.csv.gz"
    merge_cols:
      - TableNumber
      - ImageNumber
    add_image_features: true
    image_feature_categories:
      - Count
      - Intensity
    features: infer
    load_image_data: true
    subsample_frac: 1.0
    subsampling_random_state: 0
    fields_of_view: all
    object_feature: Metadata_ObjectNumber
"#;

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "{plate}_aggregate.csv.gz";

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    single_cell_config: SingleCellConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct SingleCellConfig {
    params: AggregateConfig,
}

/// Parameters handed to the aggregation backend, read from
/// `single_cell_config.params`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateConfig {
    pub strata: Vec<String>,
    pub image_cols: Vec<String>,
    #[serde(default)]
    pub aggregation_operation: AggregationOperation,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default = "default_merge_cols")]
    pub merge_cols: Vec<String>,
    #[serde(default)]
    pub add_image_features: bool,
    #[serde(default)]
    pub image_feature_categories: Vec<String>,
    #[serde(default)]
    pub features: Selection,
    #[serde(default = "default_true")]
    pub load_image_data: bool,
    #[serde(default)]
    pub subsample_frac: Option<f64>,
    #[serde(default)]
    pub subsampling_random_state: Option<u64>,
    #[serde(default)]
    pub fields_of_view: Selection,
    #[serde(default = "default_object_feature")]
    pub object_feature: String,
}

fn default_merge_cols() -> Vec<String> {
    vec!["TableNumber".to_string(), "ImageNumber".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_object_feature() -> String {
    "Metadata_ObjectNumber".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationOperation {
    #[default]
    Median,
    Mean,
}

/// Either every value ("all" / "infer") or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "RawSelection")]
pub enum Selection {
    #[default]
    All,
    Only(Vec<String>),
}

impl Selection {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(values) => values.iter().any(|v| v == value),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawSelection {
    Sentinel(String),
    List(Vec<Scalar>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Text(String),
}

impl TryFrom<RawSelection> for Selection {
    type Error = String;

    fn try_from(raw: RawSelection) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawSelection::Sentinel(s) if s == "all" || s == "infer" => Ok(Selection::All),
            RawSelection::Sentinel(s) => Err(format!(
                "expected a list, \"all\" or \"infer\", found {:?}",
                s
            )),
            RawSelection::List(values) => Ok(Selection::Only(
                values
                    .into_iter()
                    .map(|v| match v {
                        Scalar::Int(i) => i.to_string(),
                        Scalar::Text(s) => s,
                    })
                    .collect(),
            )),
        }
    }
}

impl AggregateConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                AggregateError::config_load(path, "file not found")
            } else {
                AggregateError::config_load(path, e)
            }
        })?;
        Self::parse(&contents).map_err(|reason| AggregateError::config_load(path, reason))
    }

    /// Parses a full configuration document and validates its parameters.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let config_file: ConfigFile = serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
        let params = config_file.single_cell_config.params;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.strata.is_empty() {
            return Err("strata must name at least one column".to_string());
        }
        if self.merge_cols.is_empty() {
            return Err("merge_cols must name at least one column".to_string());
        }
        if let Some(frac) = self.subsample_frac {
            if !(frac > 0.0 && frac <= 1.0) {
                return Err(format!("subsample_frac must be in (0, 1], found {}", frac));
            }
        }
        Ok(())
    }

    /// Fraction of cells to keep per group, `None` when every cell is used.
    pub fn subsampling(&self) -> Option<f64> {
        self.subsample_frac.filter(|&frac| frac < 1.0)
    }

    /// Aggregate profile file name for `plate`, from the `output_file`
    /// template with `{plate}` substituted.
    pub fn aggregate_file_name(&self, plate: &str) -> String {
        let template = match self.output_file.as_deref() {
            None | Some("") | Some("none") => DEFAULT_OUTPUT_TEMPLATE,
            Some(template) => template,
        };
        if template.contains("{plate}") {
            template.replace("{plate}", plate)
        } else {
            format!("{}_{}", plate, template)
        }
    }
}
