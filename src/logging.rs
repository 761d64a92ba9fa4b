//! Logger setup for applications embedding the call services.

use chrono::Local;
use std::io::Write;

/// Install an env_logger backend.
///
/// `RUST_LOG` overrides `default_filter`. Returns an error when a logger is
/// already installed.
pub fn init(default_filter: &str) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}
