//! Configuration for the gateway
//!
//! Settings come from a TOML file merged with command line flags; flags win.
//! Keys mirror the flag names (`run.pollingDuration`, `run.addr`, ...). A
//! missing config file is not an error: defaults apply.

use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Default full-reconcile period, seconds
pub const DEFAULT_POLLING_DURATION_SECS: u64 = 300;

/// Default plain listener address
pub const DEFAULT_ADDR: &str = ":80";

/// Default TLS listener address
pub const DEFAULT_SECURE_ADDR: &str = ":443";

/// Global configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (Trace, Debug, Info, Warn, Error)
    #[serde(rename = "logLevel")]
    pub log_level: String,

    /// Use JSON log format
    #[serde(rename = "logJSON")]
    pub log_json: bool,

    /// Settings for the run command
    pub run: RunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "Info".to_string(),
            log_json: true,
            run: RunConfig::default(),
        }
    }
}

/// Settings for the run command
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    /// Full-reconcile period in seconds
    pub polling_duration: u64,

    /// Address used by the plain web server
    pub addr: String,

    /// Address used by the secure web server
    pub secure_addr: String,

    /// Queue on which service change events are published
    pub services_queue_name: String,

    /// Queue on which frontend change events are published
    pub frontends_queue_name: String,

    /// TOML file describing the service registry
    pub services_file: String,

    /// TOML file describing the frontend store
    pub frontends_file: String,

    /// Directory holding file-backed queues; empty disables queue watching
    pub queue_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            polling_duration: DEFAULT_POLLING_DURATION_SECS,
            addr: DEFAULT_ADDR.to_string(),
            secure_addr: DEFAULT_SECURE_ADDR.to_string(),
            services_queue_name: String::new(),
            frontends_queue_name: String::new(),
            services_file: "services.toml".to_string(),
            frontends_file: "frontends.toml".to_string(),
            queue_dir: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        info!(path = %path.display(), "using config file");

        Ok(config)
    }
}
