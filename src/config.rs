//! Declarative server configuration, loaded from TOML and held live behind a
//! copy-on-write cell so a reload is an atomic pointer swap for readers.

use crate::error::HerdNsError;
use crate::rules::RuleConfig;
use crate::zones::FileZone;
use concread::cowcell::asynch::{CowCell, CowCellReadTxn};
use config::Config;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{error, info};

fn default_listeners() -> Vec<String> {
    vec!["127.0.0.1:15353".to_string()]
}
fn default_debug_level() -> u8 {
    0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParentConfig {
    pub address: String,
}

impl Default for ParentConfig {
    fn default() -> Self {
        ParentConfig {
            address: "1.1.1.1:53".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A `builtin:<name>` reference to a compiled-in [crate::plugins::Plugin],
    /// or a filesystem path to a dynamic library loaded via `libloading`.
    pub path: String,
    /// The dylib symbol to call for the pre-resolution phase, or empty to
    /// skip this plugin in that phase. Ignored (but must be non-empty to
    /// register) for `builtin:` paths, which have a fixed entry point.
    #[serde(default)]
    #[serde(rename = "preHandler")]
    pub pre_handler: String,
    /// Same as `pre_handler`, for the post-resolution phase.
    #[serde(default)]
    #[serde(rename = "postHandler")]
    pub post_handler: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Record types this plugin is invoked for; empty means "all".
    #[serde(default)]
    pub monitor: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// The live, reloadable server configuration. Mirrors the `[settings]` table
/// plus the `[[zone]]`, `[[rule]]` and `[[plugin]]` arrays of tables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigFile {
    /// The server's hostname, used when generating SOA/NS defaults; defaults
    /// to the result of `gethostname()`.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// DNS listener addresses, `host:port` form, UDP and TCP both bind each.
    #[serde(default = "default_listeners")]
    pub listeners: Vec<String>,
    /// Round-robin multiple A/AAAA answers instead of always returning them
    /// in configuration order.
    #[serde(default)]
    pub load_balance: bool,
    /// Skip the rule engine evaluation entirely.
    #[serde(default)]
    pub disable_rule_engine: bool,
    /// Serve CNAME chases lazily: stop at the first CNAME instead of
    /// flattening to the final A/AAAA record.
    #[serde(default)]
    pub lazy: bool,
    /// Enable the recursive answer cache.
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Flatten cached CNAME chains down to their terminal A/AAAA records.
    #[serde(default = "default_true")]
    pub flatten: bool,
    /// Watch the config and zone files for changes and reload automatically.
    #[serde(default = "default_true")]
    pub auto_reload: bool,
    #[serde(default = "default_debug_level")]
    pub debug_level: u8,
    /// Write every inbound/outbound packet to `./captures/`.
    #[serde(default)]
    pub capture_packets: bool,
    /// How long until we drop idle TCP client connections, in seconds.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_client_timeout: u64,
    pub parent: ParentConfig,
    #[serde(default, rename = "zone")]
    pub zones: Vec<FileZone>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginConfig>,
}

fn default_hostname() -> String {
    gethostname().into_string().unwrap_or_else(|_| "localhost".to_string())
}
fn default_tcp_timeout() -> u64 {
    5
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listeners: default_listeners(),
            load_balance: false,
            disable_rule_engine: false,
            lazy: false,
            cache: true,
            flatten: true,
            auto_reload: true,
            debug_level: default_debug_level(),
            capture_packets: false,
            tcp_client_timeout: default_tcp_timeout(),
            parent: ParentConfig::default(),
            zones: vec![],
            rules: vec![],
            plugins: vec![],
        }
    }
}

impl ConfigFile {
    /// Pretty-print the effective config as TOML, for `export-config`.
    pub fn as_toml_pretty(&self) -> Result<String, HerdNsError> {
        toml::to_string_pretty(self).map_err(|e| HerdNsError::ConfigError(e.to_string()))
    }

    /// Parses the listener addresses, logging and skipping any that don't parse.
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| match SocketAddr::from_str(l) {
                Ok(addr) => Some(addr),
                Err(err) => {
                    error!(listener = %l, %err, "failed to parse listener address, skipping");
                    None
                }
            })
            .collect()
    }

    pub fn parent_address(&self) -> Result<SocketAddr, HerdNsError> {
        SocketAddr::from_str(&self.parent.address)
            .map_err(|e| HerdNsError::ConfigError(format!("invalid parent address: {e}")))
    }

    /// Loads configuration from the given path, or from the default search
    /// locations (`./herdns.toml`, `~/.config/herdns.toml`) if none given.
    pub fn try_from_file(config_path: Option<&str>) -> Result<ConfigFile, HerdNsError> {
        let file_locations: Vec<String> = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        let found_file = file_locations.iter().find_map(|f| {
            let path = shellexpand::tilde(f).into_owned();
            std::path::Path::new(&path).exists().then_some(path)
        });

        let path = found_file.ok_or_else(|| {
            HerdNsError::FileError(format!(
                "No configuration file found, tried: {}",
                file_locations.join(", ")
            ))
        })?;

        let builder = Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("herdns").separator("__"));

        let built = builder.build()?;
        info!(path = %path, "loaded configuration");
        built.try_deserialize().map_err(HerdNsError::from)
    }

    /// Wraps a loaded [ConfigFile] in a [CowCell] for live, atomic-swap access.
    pub fn try_as_cowcell(config_path: Option<&str>) -> Result<CowCell<ConfigFile>, HerdNsError> {
        Ok(CowCell::new(ConfigFile::try_from_file(config_path)?))
    }
}

impl FromStr for ConfigFile {
    type Err = HerdNsError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        toml::from_str(input).map_err(HerdNsError::from)
    }
}

static CONFIG_LOCATIONS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["./herdns.toml", "~/.config/herdns.toml"]);

/// A separate, usually more tightly permissioned file holding the TSIG key
/// used to authenticate UPDATE requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretFile {
    pub key: String,
    /// base64-encoded HMAC secret.
    pub signature: String,
}

impl SecretFile {
    pub fn try_from_file(path: &str) -> Result<Self, HerdNsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HerdNsError::FileError(format!("failed to read secret file {path}: {e}"))
        })?;
        toml::from_str(&contents).map_err(HerdNsError::from)
    }
}

/// Convenience alias used by call sites that just want read access.
pub type ConfigReadTxn = CowCellReadTxn<ConfigFile>;
