pub mod aggregator;
pub mod barcode;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod init;
pub mod job;
pub mod platemap;
pub mod project;
pub mod sqlite;
pub mod table;
pub mod workflow;

/// Sets up `env_logger` for the binaries, logging at `info` unless
/// `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init()
        .ok();
}
