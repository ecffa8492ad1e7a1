//! HTTP client construction for the Flagsmith REST api and its push-update
//! stream.
//!
//! Two clients are built from one [`FlagsmithConfig`]:
//! - the api client, bounded by request/read/connect timeouts
//! - the event stream client, which keeps a single response open for minutes
//!   and therefore only bounds connect and idle-read time
//!
//! Reconnects of the event stream follow [`reconnect_backoff`], a capped
//! exponential backoff with jitter.
//!
//! # Example
//! ```no_run
//! use flagsmith_config::{FlagsmithConfig, http::{HttpClientParams, build_http_client}};
//!
//! let config = FlagsmithConfig::load("flagsmith.yml", "flagsmith").unwrap();
//! let client = build_http_client(HttpClientParams::from_config(&config)).unwrap();
//! ```
use crate::config::{FlagsmithConfig, ReconnectConfig};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

pub const ENVIRONMENT_KEY_HEADER: &str = "X-Environment-Key";
pub const DEFAULT_USER_AGENT: &str =
    concat!("flagsmith-rust-client/", env!("CARGO_PKG_VERSION"));

const EVENT_STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const EVENT_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Parameters for configuring an HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpClientParams<'a> {
    pub request_timeout: Duration,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: &'a str,
}

impl<'a> HttpClientParams<'a> {
    /// Timeouts and user agent for the api client.
    pub fn from_config(config: &'a FlagsmithConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            user_agent: config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
        }
    }

    /// The stream stays open indefinitely, so there is no total timeout and
    /// the read timeout only detects a dead connection.
    pub fn for_event_stream(config: &'a FlagsmithConfig) -> Self {
        Self {
            request_timeout: Duration::ZERO,
            read_timeout: EVENT_STREAM_READ_TIMEOUT,
            connect_timeout: EVENT_STREAM_CONNECT_TIMEOUT,
            user_agent: config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
        }
    }
}

/// Builds an HTTP client with the specified parameters.
///
/// A zero `request_timeout` means no total timeout.
pub fn build_http_client(
    params: HttpClientParams,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client_builder = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .gzip(true)
        .read_timeout(params.read_timeout)
        .connect_timeout(params.connect_timeout)
        .user_agent(params.user_agent);

    if !params.request_timeout.is_zero() {
        client_builder = client_builder.timeout(params.request_timeout);
    }

    client_builder.build()
}

/// Client used for the long-lived server-sent events connection.
pub fn build_event_stream_client(
    config: &FlagsmithConfig,
) -> Result<reqwest::Client, reqwest::Error> {
    build_http_client(HttpClientParams::for_event_stream(config))
}

/// Backoff between reconnect attempts of the push-update stream. Never gives
/// up; `max_interval_secs` caps a single wait.
pub fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_interval_ms))
        .with_max_interval(Duration::from_secs(config.max_interval_secs))
        .with_multiplier(config.multiplier)
        .with_randomization_factor(config.randomization_factor)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlagsmithConfigBuilder;
    use backoff::backoff::Backoff;

    const YAML_CONF_TEXT: &str = r#"
    environment_key: ser.test
    user_agent: hellobot
    request_timeout_secs: 30
    read_timeout_secs: 20
    connect_timeout_secs: 10
    "#;

    #[test]
    fn test_build_client() {
        let client = build_http_client(HttpClientParams {
            request_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            user_agent: "hello",
        });

        assert!(client.is_ok());
    }

    #[test]
    fn test_build_client_from_config() {
        let config: serde_yaml::Value =
            serde_yaml::from_str(YAML_CONF_TEXT).unwrap();
        let config = FlagsmithConfig::from_config(&config).unwrap();
        let params = HttpClientParams::from_config(&config);

        assert_eq!(params.request_timeout, Duration::from_secs(30));
        assert_eq!(params.read_timeout, Duration::from_secs(20));
        assert_eq!(params.connect_timeout, Duration::from_secs(10));
        assert_eq!(params.user_agent, "hellobot");
        assert!(build_http_client(params).is_ok());
    }

    #[test]
    fn test_default_user_agent() {
        let config = FlagsmithConfigBuilder::default()
            .environment_key("ser.test")
            .build()
            .unwrap();
        let params = HttpClientParams::from_config(&config);
        assert!(params.user_agent.starts_with("flagsmith-rust-client/"));
    }

    #[test]
    fn test_event_stream_client_has_no_total_timeout() {
        let config = FlagsmithConfigBuilder::default()
            .environment_key("ser.test")
            .build()
            .unwrap();
        let params = HttpClientParams::for_event_stream(&config);
        assert!(params.request_timeout.is_zero());
        assert_eq!(params.read_timeout, EVENT_STREAM_READ_TIMEOUT);
        assert!(build_event_stream_client(&config).is_ok());
    }

    #[test]
    fn test_reconnect_backoff_is_capped_and_never_gives_up() {
        let config = ReconnectConfig {
            initial_interval_ms: 100,
            max_interval_secs: 1,
            multiplier: 2.0,
            randomization_factor: 0.5,
        };
        let mut backoff = reconnect_backoff(&config);

        for _ in 0..50 {
            let wait = backoff.next_backoff().expect("backoff must not stop");
            // jitter may push a single wait up to 1.5x the cap
            assert!(wait < Duration::from_millis(1501));
        }
    }

    #[test]
    fn test_reconnect_backoff_reset() {
        let config = ReconnectConfig {
            initial_interval_ms: 100,
            max_interval_secs: 10,
            multiplier: 2.0,
            randomization_factor: 0.0,
        };
        let mut backoff = reconnect_backoff(&config);
        for _ in 0..5 {
            backoff.next_backoff();
        }
        backoff.reset();
        let wait = backoff.next_backoff().unwrap();
        assert!(wait >= Duration::from_millis(100));
        assert!(wait < Duration::from_millis(101));
    }
}
