//! sshdeck - multiplexed remote shell sessions over one event channel.
//!
//! The client core (`session`, `channel`, `protocol`) tracks any number of
//! remote shells over a single ordered connection; the server (`server`,
//! `orchestrator`) owns the real ssh connections behind it.

pub mod channel;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod profiles;
pub mod protocol;
pub mod server;
pub mod session;

/// Initialize `env_logger`, using `default_filter` when `RUST_LOG` is unset
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}
