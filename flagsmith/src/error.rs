use flagsmith_config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagsmithError {
    /// Connect, read or write failure below http.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Server responded with {status}: {body}")]
    Server { status: u16, body: String },

    /// The push-update stream delivered something it cannot frame.
    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<ConfigError> for FlagsmithError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl FlagsmithError {
    /// Failures a stale cached response may stand in for.
    pub fn is_transport_or_server(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }
}
