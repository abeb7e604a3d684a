use env_logger::Env;

use crate::config::Config;

/// Default filter for `config`: `debug` with `-brcmfxdbg`, `info` otherwise.
pub fn default_level(config: &Config) -> &'static str {
    if config.debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global logger. `RUST_LOG` still overrides the default filter.
///
/// Only the first call installs a logger; later calls are ignored.
pub fn init(config: &Config) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_level(config)))
        .try_init();
}
