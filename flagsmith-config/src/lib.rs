pub mod config;
pub mod http;

pub use backoff;
pub use config::{
    CacheConfig, CacheConfigBuilder, ConfigError, ConfigFile, Configurable,
    FlagsmithConfig, FlagsmithConfigBuilder, ReconnectConfig,
    ReconnectConfigBuilder,
};
