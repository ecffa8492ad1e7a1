use derive_builder::Builder;
use serde::Deserialize;
use std::{fs, path, time::Duration};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://edge.api.flagsmith.com/api/v1/";
pub const DEFAULT_EVENT_SOURCE_BASE_URL: &str = "https://realtime.flagsmith.com/";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
    #[error("Missing config section: {0}")]
    MissingSection(String),
    #[error("Invalid url for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

pub trait Configurable {
    fn config(&self) -> &serde_yaml::Value;

    // read configuration from yaml config
    fn load_config(
        config_file_path: impl AsRef<path::Path>,
    ) -> Result<serde_yaml::Value, ConfigError> {
        let content: String = fs::read_to_string(config_file_path)?;
        let config: serde_yaml::Value = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Extract Value from config using dot notation i.e. "flagsmith.cache"
    fn get_config_value(&self, key: &str) -> Option<&serde_yaml::Value> {
        let keys: Vec<&str> = key.split('.').collect();
        get_value_recursive(self.config(), &keys)
    }
}

fn get_value_recursive<'a>(
    config: &'a serde_yaml::Value,
    keys: &[&str],
) -> Option<&'a serde_yaml::Value> {
    let (key, remaining_keys) = keys.split_first()?;
    if key.is_empty() {
        return None;
    }

    match config {
        serde_yaml::Value::Mapping(map) => {
            let value = map.get(serde_yaml::Value::String(key.to_string()))?;
            if remaining_keys.is_empty() {
                Some(value)
            } else {
                get_value_recursive(value, remaining_keys)
            }
        }
        _ => None,
    }
}

/// YAML configuration file loaded once and queried by dot-path.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    config: serde_yaml::Value,
}

impl ConfigFile {
    pub fn open(path: impl AsRef<path::Path>) -> Result<Self, ConfigError> {
        Ok(Self {
            config: Self::load_config(path)?,
        })
    }

    pub fn from_value(config: serde_yaml::Value) -> Self {
        Self { config }
    }
}

impl Configurable for ConfigFile {
    fn config(&self) -> &serde_yaml::Value {
        &self.config
    }
}

/// Local HTTP response cache settings.
#[derive(Builder, Clone, Debug, Deserialize, PartialEq)]
#[builder(public, setter(into), default)]
#[serde(default)]
pub struct CacheConfig {
    pub enable_cache: bool,
    pub cache_directory: path::PathBuf,
    pub cache_size_bytes: u64,
    pub cache_ttl_secs: u64,
    pub accept_stale_on_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: false,
            cache_directory: path::PathBuf::new(),
            cache_size_bytes: 10 * 1024 * 1024,
            cache_ttl_secs: 180,
            accept_stale_on_error: true,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Reconnect policy for the push-update stream.
#[derive(Builder, Clone, Debug, Deserialize, PartialEq)]
#[builder(public, setter(into), default)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_interval_ms: u64,
    pub max_interval_secs: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_secs: 30,
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }
}

/// Everything the client needs to talk to one Flagsmith environment.
///
/// Can be built in code through [`FlagsmithConfigBuilder`] or deserialized
/// from a YAML section:
/// ```yaml
/// flagsmith:
///     environment_key: ser.abc
///     enable_realtime_updates: true
///     cache:
///         enable_cache: true
///         cache_directory: /tmp/flagsmith
///         cache_ttl_secs: 60
/// ```
#[derive(Builder, Clone, Debug, Deserialize, PartialEq)]
#[builder(public, setter(into), default)]
#[serde(default)]
pub struct FlagsmithConfig {
    pub environment_key: String,
    pub base_url: String,
    pub event_source_base_url: String,
    pub user_agent: Option<String>,
    pub enable_analytics: bool,
    pub analytics_flush_period_secs: u64,
    pub enable_realtime_updates: bool,
    pub request_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub cache: CacheConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for FlagsmithConfig {
    fn default() -> Self {
        Self {
            environment_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            event_source_base_url: DEFAULT_EVENT_SOURCE_BASE_URL.to_string(),
            user_agent: None,
            enable_analytics: true,
            analytics_flush_period_secs: 10,
            enable_realtime_updates: false,
            request_timeout_secs: 4,
            read_timeout_secs: 6,
            write_timeout_secs: 6,
            connect_timeout_secs: 6,
            cache: CacheConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl FlagsmithConfig {
    /// Deserialize from an already extracted YAML mapping and validate it.
    pub fn from_config(config: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_value(config.clone())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file and read the mapping found at `section` (dot notation).
    pub fn load(
        config_file_path: impl AsRef<path::Path>,
        section: &str,
    ) -> Result<Self, ConfigError> {
        let file = ConfigFile::open(config_file_path)?;
        let value = file
            .get_config_value(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;
        Self::from_config(value)
    }

    /// Reject settings that can never work. Called eagerly by the client
    /// constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "environment_key",
                reason: "must not be empty".into(),
            });
        }
        self.api_url()?;
        if self.enable_realtime_updates {
            self.event_stream_url()?;
        }
        if self.cache.enable_cache {
            if self.cache.cache_directory.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "cache.cache_directory",
                    reason: "must be provided when cache is enabled".into(),
                });
            }
            if self.cache.cache_size_bytes == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cache.cache_size_bytes",
                    reason: "must be greater than zero".into(),
                });
            }
            if self.cache.cache_ttl_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "cache.cache_ttl_secs",
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.enable_analytics && self.analytics_flush_period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "analytics_flush_period_secs",
                reason: "must be greater than zero when analytics is enabled".into(),
            });
        }
        Ok(())
    }

    /// Base url of the REST api, always ending with `/`.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_base_url("base_url", &self.base_url)
    }

    /// Per-environment push-update stream url.
    pub fn event_stream_url(&self) -> Result<Url, ConfigError> {
        let base =
            parse_base_url("event_source_base_url", &self.event_source_base_url)?;
        base.join(&format!(
            "sse/environments/{}/stream",
            self.environment_key
        ))
        .map_err(|source| ConfigError::InvalidUrl {
            field: "event_source_base_url",
            source,
        })
    }

    pub fn analytics_flush_period(&self) -> Duration {
        Duration::from_secs(self.analytics_flush_period_secs)
    }
}

fn parse_base_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|source| ConfigError::InvalidUrl { field, source })
}
