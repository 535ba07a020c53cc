use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

use cytosnake::dispatch::CLI;

fn main() {
    cytosnake::init_logging();

    let matches = Command::new("cyto-aggregate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Aggregate single cells into per-well counts and profiles, one job per plate")
        .arg(
            Arg::new("sql_file")
                .short('s')
                .long("sql-file")
                .value_name("PLATE.SQLITE")
                .help("Single-cell plate data file (repeat once per plate)")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("cell_counts")
                .short('c')
                .long("cell-counts")
                .value_name("COUNTS.TSV")
                .help("Cell count output, in the same order as --sql-file")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("aggregate_profile")
                .short('a')
                .long("aggregate-profile")
                .value_name("PROFILE.CSV.GZ")
                .help("Aggregate profile output, in the same order as --sql-file")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("metadata")
                .short('m')
                .long("metadata")
                .value_name("METADATA-DIR")
                .help("Metadata directory containing platemap/<name>.csv")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("barcodes")
                .short('b')
                .long("barcodes")
                .value_name("BARCODES.CSV")
                .help("Barcode table assigning platemaps to plates")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("AGGREGATE.YAML")
                .help("Aggregation configuration")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("Number of plates to process at once")
                .value_parser(value_parser!(usize))
                .default_value("1"),
        )
        .get_matches();

    let paths = |id: &str| -> Vec<PathBuf> {
        matches
            .get_many::<PathBuf>(id)
            .unwrap()
            .cloned()
            .collect()
    };

    let cli = CLI {
        plate_data: paths("sql_file"),
        cell_counts: paths("cell_counts"),
        aggregate_profiles: paths("aggregate_profile"),
        metadata_dir: matches.get_one::<PathBuf>("metadata").unwrap().clone(),
        barcodes: matches.get_one::<PathBuf>("barcodes").unwrap().clone(),
        config: matches.get_one::<PathBuf>("config").unwrap().clone(),
        threads: *matches.get_one::<usize>("threads").unwrap(),
    };

    if let Err(err) = cli.run() {
        eprintln!("error: {}", err);
        for cause in err.chain().skip(1) {
            eprintln!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
