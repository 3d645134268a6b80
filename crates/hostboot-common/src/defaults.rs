//! Default configuration values shared between the agent and its tooling
//!
//! These constants ensure consistent defaults across all hostboot components.

/// AWS region used when neither the configuration nor an ECR registry host
/// names one
pub const DEFAULT_REGION: &str = "us-east-2";

/// Default image tag
pub const DEFAULT_TAG: &str = "latest";

/// Reserved name of the API container
pub const DEFAULT_CONTAINER_NAME: &str = "api";

/// Host port the API container is published on
pub const DEFAULT_HOST_PORT: u16 = 8000;

/// Port the API listens on inside the container
pub const DEFAULT_CONTAINER_PORT: u16 = 8000;

/// NGINX `server_name` (catch-all)
pub const DEFAULT_SERVER_NAME: &str = "_";

/// Number of `docker pull` attempts before giving up
pub const DEFAULT_PULL_ATTEMPTS: u32 = 3;

/// Delay between `docker pull` attempts in seconds
pub const DEFAULT_PULL_RETRY_DELAY_SECS: u64 = 10;

/// Maximum time to wait for instance-role credentials in seconds
pub const DEFAULT_CREDENTIAL_TIMEOUT_SECS: u64 = 120;

/// Maximum time to wait for the container to report running in seconds
pub const DEFAULT_SETTLE_TIMEOUT_SECS: u64 = 15;

/// Directory receiving diagnostic files
pub const DEFAULT_DIAGNOSTICS_DIR: &str = "/tmp";

/// Directory holding the proxy certificate and key
pub const DEFAULT_CERT_DIR: &str = "/etc/nginx/ssl";

/// Certificate validity in days
pub const DEFAULT_CERT_VALIDITY_DAYS: u32 = 365;

/// Regenerate the certificate when it expires within this many days
pub const DEFAULT_CERT_RENEW_BEFORE_DAYS: u32 = 30;

/// Location of the rendered NGINX configuration (replaces the distribution default)
pub const DEFAULT_NGINX_CONF_PATH: &str = "/etc/nginx/nginx.conf";

/// Default agent configuration path on the instance
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostboot/config.json";

/// Container runtime package
pub const DOCKER_PACKAGE: &str = "docker";

/// Reverse proxy package
pub const NGINX_PACKAGE: &str = "nginx";

/// Login user added to the docker group (Amazon Linux default)
pub const DEFAULT_ADMIN_USER: &str = "ec2-user";

// Serde default functions for struct field defaults

pub fn default_admin_user() -> Option<String> {
    Some(DEFAULT_ADMIN_USER.to_string())
}

pub fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

pub fn default_container_name() -> String {
    DEFAULT_CONTAINER_NAME.to_string()
}

pub fn default_host_port() -> u16 {
    DEFAULT_HOST_PORT
}

pub fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

pub fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

pub fn default_pull_attempts() -> u32 {
    DEFAULT_PULL_ATTEMPTS
}

pub fn default_pull_retry_delay_secs() -> u64 {
    DEFAULT_PULL_RETRY_DELAY_SECS
}

pub fn default_credential_timeout_secs() -> u64 {
    DEFAULT_CREDENTIAL_TIMEOUT_SECS
}

pub fn default_settle_timeout_secs() -> u64 {
    DEFAULT_SETTLE_TIMEOUT_SECS
}

pub fn default_diagnostics_dir() -> String {
    DEFAULT_DIAGNOSTICS_DIR.to_string()
}

pub fn default_cert_dir() -> String {
    DEFAULT_CERT_DIR.to_string()
}

pub fn default_cert_validity_days() -> u32 {
    DEFAULT_CERT_VALIDITY_DAYS
}

pub fn default_cert_renew_before_days() -> u32 {
    DEFAULT_CERT_RENEW_BEFORE_DAYS
}

pub fn default_nginx_conf_path() -> String {
    DEFAULT_NGINX_CONF_PATH.to_string()
}

/// Returns `true`; used for boolean fields that default to enabled
pub fn default_true() -> bool {
    true
}
