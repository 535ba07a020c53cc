use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

use cytosnake::{init, workflow};

fn cli() -> Command {
    Command::new("cyto")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cell profiling project setup and per-plate aggregation")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("init")
                .about("Set up the current directory as a project, moving the inputs into data/")
                .arg(
                    Arg::new("data")
                        .short('d')
                        .long("data")
                        .value_name("PLATE.SQLITE")
                        .help("Single-cell plate data files")
                        .num_args(1..)
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(PathBuf))
                        .required(true),
                )
                .arg(
                    Arg::new("barcode")
                        .short('b')
                        .long("barcode")
                        .value_name("BARCODES.CSV")
                        .help("Barcode table assigning platemaps to plates")
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
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run a workflow over the project in the current directory")
                .arg(
                    Arg::new("workflow")
                        .value_name("WORKFLOW")
                        .help("Workflow to run (aggregate)")
                        .index(1)
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
                ),
        )
}

fn main() {
    cytosnake::init_logging();

    let matches = cli().get_matches();

    let result = std::env::current_dir()
        .map_err(anyhow::Error::from)
        .and_then(|root| match matches.subcommand() {
            Some(("init", sub)) => init::CLI {
                root,
                data: sub.get_many::<PathBuf>("data").unwrap().cloned().collect(),
                barcode: sub.get_one::<PathBuf>("barcode").unwrap().clone(),
                metadata: sub.get_one::<PathBuf>("metadata").unwrap().clone(),
            }
            .run(),
            Some(("run", sub)) => workflow::CLI {
                root,
                workflow: sub.get_one::<String>("workflow").unwrap().clone(),
                threads: *sub.get_one::<usize>("threads").unwrap(),
            }
            .run(),
            _ => unreachable!("subcommand required"),
        });

    if let Err(err) = result {
        eprintln!("error: {}", err);
        for cause in err.chain().skip(1) {
            eprintln!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
