use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_exploratory_interval_secs() -> u64 {
    30
}
fn default_publish_interval_secs() -> u64 {
    40 * 60
}
fn default_destination_keys_path() -> String {
    "destination.keys".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub netdb: NetdbConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetdbConfig {
    /// Seconds between exploratory lookup rounds (stretched 3x past 2500
    /// known routers).
    pub exploratory_interval_secs: u64,
    /// Seconds between publishing our router record to the closest
    /// floodfills.
    pub publish_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Private keys of the shared local destination, relative to data_dir.
    /// Generated on first start when missing.
    pub destination_keys_path: String,
    /// Whether the shared local destination publishes its lease set.
    pub is_public: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            netdb: NetdbConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for NetdbConfig {
    fn default() -> Self {
        Self {
            exploratory_interval_secs: default_exploratory_interval_secs(),
            publish_interval_secs: default_publish_interval_secs(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            destination_keys_path: default_destination_keys_path(),
            is_public: false,
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, writing the defaults
    /// there on first start.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let cfg = Self::default();
            cfg.persist(path)?;
            return Ok(cfg);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn netdb_dir(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join("netDb")
    }

    pub fn destination_keys_path(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join(&self.streaming.destination_keys_path)
    }
}

/// Priority order: RUST_LOG, then the configured level, then "info".
pub fn init_tracing(config: &Config) {
    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| config.general.log_level.clone());
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
