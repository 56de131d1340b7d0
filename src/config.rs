//! Configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::hashtable::DEFAULT_HASHTABLE_POWER;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cache sizing and file loading.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Background expiration sweep.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Hard ceiling on bytes held by item buffers (e.g. "64MB").
    #[serde(default = "default_memory_limit", deserialize_with = "deserialize_size")]
    pub memory_limit: usize,

    /// Payload size of the smallest class.
    #[serde(default = "default_item_size_min", deserialize_with = "deserialize_size")]
    pub item_size_min: usize,

    /// Payload size of the largest class (e.g. "1MB").
    #[serde(default = "default_item_size_max", deserialize_with = "deserialize_size")]
    pub item_size_max: usize,

    /// Growth factor between consecutive classes.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Initial hash index buckets as a power of two.
    #[serde(default = "default_hashtable_power")]
    pub hashtable_power: u8,

    /// Root for file loading; files are read from `<home_dir>/webapps/`.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Extra or overriding suffix to MIME type mappings.
    #[serde(default)]
    pub mime_types: HashMap<String, String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            item_size_min: default_item_size_min(),
            item_size_max: default_item_size_max(),
            growth_factor: default_growth_factor(),
            hashtable_power: default_hashtable_power(),
            home_dir: default_home_dir(),
            mime_types: HashMap::new(),
        }
    }
}

fn default_memory_limit() -> usize {
    64 * 1024 * 1024
}

fn default_item_size_min() -> usize {
    48
}

fn default_item_size_max() -> usize {
    1024 * 1024
}

fn default_growth_factor() -> f64 {
    1.25
}

fn default_hashtable_power() -> u8 {
    DEFAULT_HASHTABLE_POWER
}

fn default_home_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
    /// Single-line.
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive such as "info" or "xixibase=debug".
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "LoggingConfig::default_true")]
    pub timestamps: bool,

    /// Include the module target.
    #[serde(default = "LoggingConfig::default_true")]
    pub target: bool,

    /// Include thread names.
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_true() -> bool {
        true
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Milliseconds between expiration sweeps.
    #[serde(default = "MaintenanceConfig::default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
        }
    }
}

impl MaintenanceConfig {
    fn default_interval_ms() -> u64 {
        1000
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "48", "512KB" or "64MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::InvalidSize("empty size string".to_string()));
    }

    let (digits, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (s[..idx].trim(), s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(s.to_string()))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(ConfigError::InvalidSize(s.to_string())),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(s.to_string()))
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;

        if cache.growth_factor.is_nan() || cache.growth_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "growth_factor ({}) must be greater than 1.0",
                cache.growth_factor
            )));
        }

        if cache.item_size_min == 0 {
            return Err(ConfigError::Invalid(
                "item_size_min must be greater than 0".to_string(),
            ));
        }

        if cache.item_size_min > cache.item_size_max {
            return Err(ConfigError::Invalid(format!(
                "item_size_min ({}) must not exceed item_size_max ({})",
                cache.item_size_min, cache.item_size_max
            )));
        }

        if cache.memory_limit < cache.item_size_max {
            return Err(ConfigError::Invalid(format!(
                "memory_limit ({}) must be at least item_size_max ({})",
                cache.memory_limit, cache.item_size_max
            )));
        }

        if cache.hashtable_power > 30 {
            return Err(ConfigError::Invalid(
                "hashtable_power must be <= 30".to_string(),
            ));
        }

        if self.maintenance.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "maintenance.interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Default configuration, as printed by `xixi-cache --print-config`.
pub const DEFAULT_CONFIG: &str = r#"# xixi-cache configuration

[cache]
# Hard ceiling on item memory (e.g. "64MB", "1GB")
memory_limit = "64MB"
# Payload size of the smallest size class
item_size_min = 48
# Payload size of the largest size class; bigger items are rejected
item_size_max = "1MB"
# Growth factor between consecutive size classes
growth_factor = 1.25
# Initial hash index buckets (2^power)
hashtable_power = 16
# Files are loaded from <home_dir>/webapps/<key>
home_dir = "."

# Extra suffix to MIME type mappings
[cache.mime_types]
# md = "text/markdown"

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty", "json" or "compact"
format = "pretty"
timestamps = true
target = true
thread_names = false

[maintenance]
# Milliseconds between expiration sweeps
interval_ms = 1000
"#;
