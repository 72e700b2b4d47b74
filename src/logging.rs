//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Builds the `RUST_LOG`-driven filter layer, falling back to a level derived
/// from the config file's `debugLevel` when `RUST_LOG` isn't set.
pub fn build_loglevel_filter_layer(debug_level: u8) -> EnvFilter {
    let default_level = match debug_level {
        0 => "herdns=info,warn",
        1 => "herdns=debug,info",
        _ => "herdns=trace,debug",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global tracing subscriber. Call once, at startup.
pub fn init_subscriber(debug_level: u8) -> Result<(), String> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_loglevel_filter_layer(debug_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}
