//! Logger bootstrap shared by the CLI and any future daemonized surface.

use env_logger::Env;

/// Initialise the global logger once, honouring `RUST_LOG` overrides.
///
/// Safe to call multiple times; later calls are ignored.
pub fn init(default_level: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .try_init();
}
