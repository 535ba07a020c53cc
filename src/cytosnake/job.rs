use std::path::{Path, PathBuf};

use log::info;
use tempfile::{Builder, NamedTempFile};

use crate::aggregator::{Aggregator, Compression, ProfileParams};
use crate::barcode::{plate_id, BarcodeTable};
use crate::config::AggregateConfig;
use crate::errors::{AggregateError, Result};
use crate::platemap::{platemap_path, Platemap};

/// Image column holding the well position; cell counts are joined to the
/// platemap on it and fields of view are filtered by it.
pub const WELL_COLUMN: &str = "Image_Metadata_Well";

/// Aggregation of a single plate: one data file in, cell counts and
/// aggregate profiles out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateJob {
    pub plate_data: PathBuf,
    pub metadata_dir: PathBuf,
    pub barcode_path: PathBuf,
    pub cell_count_out: PathBuf,
    pub aggregate_out: PathBuf,
    pub config_path: PathBuf,
}

impl PlateJob {
    pub fn new<P: Into<PathBuf>>(
        plate_data: P,
        metadata_dir: P,
        barcode_path: P,
        cell_count_out: P,
        aggregate_out: P,
        config_path: P,
    ) -> Self {
        PlateJob {
            plate_data: plate_data.into(),
            metadata_dir: metadata_dir.into(),
            barcode_path: barcode_path.into(),
            cell_count_out: cell_count_out.into(),
            aggregate_out: aggregate_out.into(),
            config_path: config_path.into(),
        }
    }

    pub fn plate(&self) -> Result<String> {
        plate_id(&self.plate_data)
    }

    /// Runs the job to completion. Both outputs are staged next to their
    /// destinations and moved into place only once both are written.
    pub fn run<A: Aggregator + ?Sized>(&self, aggregator: &A) -> Result<()> {
        let config = AggregateConfig::from_path(&self.config_path)?;

        let plate = self.plate()?;
        let barcodes = BarcodeTable::from_path(&self.barcode_path)?;
        let platemap_name =
            barcodes
                .platemap_for(&plate)
                .ok_or_else(|| AggregateError::BarcodeLookup {
                    plate: plate.clone(),
                    path: self.barcode_path.clone(),
                })?;
        let platemap = Platemap::from_path(platemap_path(&self.metadata_dir, platemap_name))?;

        let params = ProfileParams {
            config: &config,
            fields_of_view_feature: WELL_COLUMN,
        };

        info!("{}: counting cells within each well", plate);
        let cell_counts = aggregator.count_cells(&self.plate_data, &params)?;
        let cell_counts = platemap.annotate(&cell_counts, WELL_COLUMN)?;

        info!("{}: saving cell counts in {:?}", plate, self.cell_count_out);
        let mut cell_count_staged = staging_file(&self.cell_count_out)?;
        cell_counts.write(cell_count_staged.as_file_mut(), b'\t')?;

        info!("{}: aggregating cells into {:?}", plate, self.aggregate_out);
        let aggregate_staged = staging_file(&self.aggregate_out)?;
        aggregator.aggregate_profiles(
            &self.plate_data,
            &params,
            aggregate_staged.path(),
            Compression::Gzip,
        )?;

        cell_count_staged.persist(&self.cell_count_out)?;
        aggregate_staged.persist(&self.aggregate_out)?;

        Ok(())
    }
}

/// Temp file beside `dest`, created with the same mode a plain
/// `File::create` would give it so the persisted output keeps the umask.
fn staging_file(dest: &Path) -> Result<NamedTempFile> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut builder = Builder::new();
    builder.prefix(".cytosnake-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    Ok(builder.tempfile_in(dir)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::sqlite::tests::{write_fixture, TEST_CONFIG};
    use crate::sqlite::SqliteAggregator;
    use crate::table::Table;

    pub(crate) const BARCODES: &str = "Assay_Plate_Barcode,Plate_Map_Name\nPlateA,MapX\nPlateB,MapX\n";
    pub(crate) const PLATEMAP: &str = "WellRow,WellCol,well_position,broad_sample,mmoles_per_liter\n\
                                       A,1,A01,DMSO,0\n\
                                       A,2,A02,BRD-K18895904,3.33\n";

    /// Shared inputs in `dir`: (metadata dir, barcode table, config).
    pub(crate) fn write_inputs(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let metadata = dir.join("metadata");
        fs::create_dir_all(metadata.join("platemap")).unwrap();
        fs::write(platemap_path(&metadata, "MapX"), PLATEMAP).unwrap();
        let barcodes = dir.join("barcodes.csv");
        fs::write(&barcodes, BARCODES).unwrap();
        let config = dir.join("aggregate.yaml");
        fs::write(&config, TEST_CONFIG).unwrap();
        (metadata, barcodes, config)
    }

    fn job_for(dir: &Path, plate_data: PathBuf) -> PlateJob {
        let (metadata, barcodes, config) = write_inputs(dir);
        let plate = plate_id(&plate_data).unwrap();
        PlateJob::new(
            plate_data,
            metadata,
            barcodes,
            dir.join(format!("{}_cell_counts.tsv", plate)),
            dir.join(format!("{}_aggregate.csv.gz", plate)),
            config,
        )
    }

    /// Returns fixed cell counts and writes a fixed profile.
    pub(crate) struct FakeAggregator;

    impl Aggregator for FakeAggregator {
        fn count_cells(&self, source: &Path, _params: &ProfileParams<'_>) -> Result<Table> {
            let plate = plate_id(source)?;
            let mut counts = Table::new(
                "counts",
                vec!["Image_Metadata_Plate", "Image_Metadata_Well", "cell_count"],
            );
            counts.push_row(vec![plate.as_str(), "A01", "120"])?;
            counts.push_row(vec![plate.as_str(), "A02", "98"])?;
            Ok(counts)
        }

        fn aggregate_profiles(
            &self,
            source: &Path,
            _params: &ProfileParams<'_>,
            output: &Path,
            compression: Compression,
        ) -> Result<()> {
            assert_eq!(compression, Compression::Gzip);
            fs::write(output, format!("profile {}", plate_id(source)?))?;
            Ok(())
        }
    }

    /// Counts cells but fails while aggregating.
    struct FailingAggregator;

    impl Aggregator for FailingAggregator {
        fn count_cells(&self, source: &Path, params: &ProfileParams<'_>) -> Result<Table> {
            FakeAggregator.count_cells(source, params)
        }

        fn aggregate_profiles(
            &self,
            _source: &Path,
            _params: &ProfileParams<'_>,
            _output: &Path,
            _compression: Compression,
        ) -> Result<()> {
            Err(AggregateError::Backend("malformed relational source".to_string()))
        }
    }

    fn staged_leftovers(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".cytosnake-")
            })
            .count()
    }

    #[test]
    fn annotated_cell_counts() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), dir.path().join("PlateA.sqlite"));

        job.run(&FakeAggregator).unwrap();

        assert_eq!(
            fs::read_to_string(&job.cell_count_out).unwrap(),
            "Image_Metadata_Plate\tImage_Metadata_Well\tcell_count\tbroad_sample\tmmoles_per_liter\n\
             PlateA\tA01\t120\tDMSO\t0\n\
             PlateA\tA02\t98\tBRD-K18895904\t3.33\n"
        );
        assert_eq!(
            fs::read_to_string(&job.aggregate_out).unwrap(),
            "profile PlateA"
        );
        assert_eq!(staged_leftovers(dir.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn outputs_respect_umask() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), dir.path().join("PlateA.sqlite"));
        job.run(&FakeAggregator).unwrap();

        let plain = dir.path().join("plain.txt");
        fs::write(&plain, "").unwrap();
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;

        assert_eq!(mode(&job.cell_count_out), mode(&plain));
        assert_eq!(mode(&job.aggregate_out), mode(&plain));
    }

    #[test]
    fn unknown_plate() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), dir.path().join("PlateQ.sqlite"));

        match job.run(&FakeAggregator) {
            Err(AggregateError::BarcodeLookup { plate, .. }) => assert_eq!(plate, "PlateQ"),
            other => panic!("expected barcode lookup error, got {:?}", other),
        }
        assert!(!job.cell_count_out.exists());
        assert!(!job.aggregate_out.exists());
    }

    #[test]
    fn missing_platemap() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), dir.path().join("PlateA.sqlite"));
        fs::remove_file(platemap_path(&job.metadata_dir, "MapX")).unwrap();

        assert!(matches!(
            job.run(&FakeAggregator),
            Err(AggregateError::MissingFile(_))
        ));
        assert!(!job.cell_count_out.exists());
    }

    #[test]
    fn missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_for(dir.path(), dir.path().join("PlateA.sqlite"));
        job.config_path = dir.path().join("nowhere.yaml");

        assert!(matches!(
            job.run(&FakeAggregator),
            Err(AggregateError::ConfigLoad { .. })
        ));
    }

    #[test]
    fn failed_aggregation_leaves_no_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_for(dir.path(), dir.path().join("PlateA.sqlite"));

        assert!(matches!(
            job.run(&FailingAggregator),
            Err(AggregateError::Backend(_))
        ));
        assert!(!job.cell_count_out.exists());
        assert!(!job.aggregate_out.exists());
        assert_eq!(staged_leftovers(dir.path()), 0);
    }

    #[test]
    fn rerun_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_fixture(dir.path(), "PlateA");
        let first = job_for(dir.path(), source.clone());
        let mut second = first.clone();
        second.cell_count_out = dir.path().join("again_cell_counts.tsv");
        second.aggregate_out = dir.path().join("again_aggregate.csv.gz");

        let aggregator = SqliteAggregator::default();
        first.run(&aggregator).unwrap();
        second.run(&aggregator).unwrap();

        assert_eq!(
            fs::read(&first.cell_count_out).unwrap(),
            fs::read(&second.cell_count_out).unwrap()
        );
        assert_eq!(
            fs::read(&first.aggregate_out).unwrap(),
            fs::read(&second.aggregate_out).unwrap()
        );
    }

    #[test]
    fn sqlite_plate() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_fixture(dir.path(), "PlateA");
        let job = job_for(dir.path(), source);

        job.run(&SqliteAggregator::default()).unwrap();

        assert_eq!(
            fs::read_to_string(&job.cell_count_out).unwrap(),
            "Image_Metadata_Plate\tImage_Metadata_Well\tcell_count\tbroad_sample\tmmoles_per_liter\n\
             PlateA\tA01\t3\tDMSO\t0\n\
             PlateA\tA02\t2\tBRD-K18895904\t3.33\n"
        );

        let mut profiles = String::new();
        GzDecoder::new(fs::File::open(&job.aggregate_out).unwrap())
            .read_to_string(&mut profiles)
            .unwrap();
        let profiles = Table::read("profiles", profiles.as_bytes(), b',').unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(profiles.has_column("Cells_AreaShape_Area"));
    }
}
