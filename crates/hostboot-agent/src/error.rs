//! Agent configuration and bootstrap errors
//!
//! `ConfigError` covers loading and validating the agent configuration.
//! `BootstrapError` names the fatal step failures that abort a run under
//! the strict failure policy.

use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON configuration
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// One or more fields failed validation
    #[error("Invalid config: {0}")]
    Invalid(#[from] garde::Report),

    /// `region` disagrees with the region encoded in an ECR registry host
    #[error("Invalid config: region '{region}' does not match registry {registry} in {registry_region}")]
    RegionMismatch {
        region: String,
        registry: String,
        registry_region: String,
    },
}

impl ConfigError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Fatal bootstrap failures
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A package could not be installed or the runtime could not be enabled
    #[error("Package installation failed: {0}")]
    PackageInstall(String),

    /// Instance-role credentials never became usable
    #[error("Instance credentials not available after {timeout_secs}s: {reason}")]
    CredentialsUnavailable { timeout_secs: u64, reason: String },

    /// Every pull attempt failed
    #[error("Failed to pull {image} after {attempts} attempts")]
    ImagePullExhausted { image: String, attempts: u32 },

    /// A container with the reserved name already exists and replacement is disabled
    #[error("A container named '{0}' already exists")]
    ContainerNameConflict(String),

    /// `docker run` failed
    #[error("Failed to launch container '{name}': {reason}")]
    ContainerLaunch { name: String, reason: String },

    /// The proxy certificate could not be generated or written
    #[error("Certificate provisioning failed: {0}")]
    Certificate(String),

    /// The rendered proxy configuration did not pass `nginx -t`
    #[error("Proxy configuration rejected by nginx: {0}")]
    ProxyConfigInvalid(String),

    /// The proxy service could not be started
    #[error("Failed to start proxy service: {0}")]
    ProxyService(String),

    /// The run was cancelled by a signal
    #[error("Bootstrap cancelled")]
    Cancelled,
}
