use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MtdError {
    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("credentials file not found at {0}")]
    CredentialsNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error("malformed cloud locator '{0}'")]
    MalformedLocator(String),

    #[error("locator '{locator}' belongs to provider '{found}', expected '{expected}'")]
    ProviderMismatch {
        locator: String,
        expected: String,
        found: String,
    },

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("service '{0}' is not eligible for migration")]
    ServiceNotEligible(String),

    #[error("cloud operation failed: {0}")]
    Cloud(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("instance '{instance}' is {state}, expected running")]
    InstanceNotRunning { instance: String, state: String },

    #[error("instance '{0}' has no usable address")]
    NoInstanceAddress(String),

    #[error("image '{0}' failed to build")]
    ImageBuildFailed(String),

    #[error("timed out after {after:?} waiting for {what}")]
    WaitTimeout { what: String, after: Duration },

    #[error("no other availability zone than '{0}' in region")]
    NoAlternateZone(String),

    #[error("service '{0}' has no proxy control endpoint")]
    NoControlEndpoint(String),

    #[error("proxy request failed: {0}")]
    ProxyTransport(String),

    #[error("proxy rejected command ({status}): {body}")]
    ProxyRejected { status: u16, body: String },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, MtdError>;
