//! Global configuration parsing for Interceptor
//!
//! Parses `global.json` using serde

use crate::error::{Error, Result};
use crate::registry::Whitelist;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Version announced to HQ on startup
    #[serde(default = "default_version")]
    pub version: String,

    /// Debug level: 0=warn, 1=info, 2=debug, 3+=trace
    #[serde(default)]
    pub debug: u8,

    /// Heartbeat period in seconds
    #[serde(default = "default_pulse")]
    pub pulse: u64,

    /// Ping HQ every this many heartbeat ticks
    #[serde(default = "default_hq_pulse_every")]
    pub hq_pulse_every: u64,

    /// Default offense count before a jail, per module
    #[serde(default = "default_attempt")]
    pub default_attempt: u32,

    /// Default jail duration in seconds, per module
    #[serde(default = "default_jail_duration")]
    pub default_jail_duration: i64,

    /// Global whitelist: bare IPv4 addresses or CIDR blocks
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Path of the embedded store file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory containing module descriptor files
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Directory for the daemon log file
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Managed firewall chain; "INPUT" means operate on INPUT directly
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Path of the iptables binary
    #[serde(default = "default_iptables_path")]
    pub iptables_path: PathBuf,

    /// Available API configurations
    #[serde(default)]
    pub api: ApiConfig,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_pulse() -> u64 {
    5
}

fn default_hq_pulse_every() -> u64 {
    12
}

fn default_attempt() -> u32 {
    4
}

fn default_jail_duration() -> i64 {
    120
}

fn default_db_path() -> PathBuf {
    PathBuf::from("db/software.db")
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_chain() -> String {
    "INTERCEPTOR".to_string()
}

fn default_iptables_path() -> PathBuf {
    PathBuf::from("/sbin/iptables")
}

/// Remote API configurations
#[derive(Debug, Default, Deserialize)]
pub struct ApiConfig {
    /// HQ coordination endpoint
    pub intc_hq: Option<HqApiConfig>,
}

/// HQ endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HqApiConfig {
    /// Consult HQ reputation when deciding jails
    #[serde(default)]
    pub active: bool,

    /// Forward offenses to HQ
    #[serde(default)]
    pub report: bool,

    /// Base URL of the HQ endpoint
    pub url: String,

    /// API key sent in the `Key` header
    #[serde(default)]
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_hq_timeout")]
    pub timeout: u64,
}

fn default_hq_timeout() -> u64 {
    30
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pulse == 0 {
            return Err(Error::ConfigValidation("pulse must be at least 1".into()));
        }

        if self.default_attempt == 0 {
            return Err(Error::ConfigValidation(
                "default_attempt must be at least 1".into(),
            ));
        }

        if self.default_jail_duration <= 0 {
            return Err(Error::ConfigValidation(
                "default_jail_duration must be positive".into(),
            ));
        }

        if self.hq_pulse_every == 0 {
            return Err(Error::ConfigValidation(
                "hq_pulse_every must be at least 1".into(),
            ));
        }

        // Whitelist entries must parse now, not at jail time
        Whitelist::parse(&self.whitelist)
            .map_err(|e| Error::ConfigValidation(format!("whitelist: {}", e)))?;

        if let Some(hq) = &self.api.intc_hq {
            if (hq.active || hq.report) && hq.url.is_empty() {
                return Err(Error::ConfigValidation(
                    "api.intc_hq.url is required when intc_hq is active".into(),
                ));
            }
        }

        Ok(())
    }

    /// Log level directive derived from the debug level
    pub fn log_level(&self) -> &'static str {
        match self.debug {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
