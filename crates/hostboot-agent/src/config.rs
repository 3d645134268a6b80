//! Configuration loading from JSON

use crate::error::ConfigError;
use crate::proxy;
use hostboot_common::KeyAlgorithm;
use hostboot_common::defaults::{
    DEFAULT_REGION, DOCKER_PACKAGE, NGINX_PACKAGE, default_admin_user, default_cert_dir, default_cert_renew_before_days,
    default_cert_validity_days, default_container_name, default_container_port,
    default_credential_timeout_secs, default_diagnostics_dir, default_host_port,
    default_nginx_conf_path, default_pull_attempts, default_pull_retry_delay_secs,
    default_server_name, default_settle_timeout_secs, default_tag, default_true,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when a fatal-class step fails
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FailurePolicy {
    /// Abort at the first fatal failure
    #[default]
    Strict,
    /// Record every failure and keep going
    FailForward,
}

/// Agent configuration loaded from JSON
#[derive(Debug, Clone, Serialize, Deserialize, garde::Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// AWS region of the registry. Taken from an ECR registry host when unset.
    #[serde(default)]
    #[garde(custom(validate_region))]
    pub region: Option<String>,

    /// Registry host, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com`
    #[garde(custom(validate_registry))]
    pub registry: String,

    /// Repository within the registry
    #[garde(length(min = 1), custom(validate_no_whitespace))]
    pub repository: String,

    /// Image tag
    #[serde(default = "default_tag")]
    #[garde(length(min = 1), custom(validate_no_whitespace))]
    pub tag: String,

    /// Reserved container name
    #[serde(default = "default_container_name")]
    #[garde(length(min = 1), custom(validate_no_whitespace))]
    pub container_name: String,

    /// Host port the container is published on
    #[serde(default = "default_host_port")]
    #[garde(range(min = 1))]
    pub host_port: u16,

    /// Port the API listens on inside the container
    #[serde(default = "default_container_port")]
    #[garde(range(min = 1))]
    pub container_port: u16,

    /// Install NGINX with a self-signed certificate in front of the API
    #[serde(default)]
    #[garde(skip)]
    pub enable_proxy: bool,

    /// NGINX `server_name`, a single host name or `_`
    #[serde(default = "default_server_name")]
    #[garde(custom(validate_server_name))]
    pub server_name: String,

    /// Extra packages installed next to docker (and nginx)
    #[serde(default)]
    #[garde(inner(length(min = 1)))]
    pub packages: Vec<String>,

    /// Login user added to the docker group; `null` leaves groups alone
    #[serde(default = "default_admin_user")]
    #[garde(custom(validate_admin_user))]
    pub admin_user: Option<String>,

    /// Number of pull attempts
    #[serde(default = "default_pull_attempts")]
    #[garde(range(min = 1, max = 20))]
    pub pull_attempts: u32,

    /// Delay between pull attempts in seconds
    #[serde(default = "default_pull_retry_delay_secs")]
    #[garde(skip)]
    pub pull_retry_delay_secs: u64,

    /// Maximum wait for instance-role credentials in seconds
    #[serde(default = "default_credential_timeout_secs")]
    #[garde(range(min = 1))]
    pub credential_timeout_secs: u64,

    /// Maximum wait for the container to report running in seconds
    #[serde(default = "default_settle_timeout_secs")]
    #[garde(range(min = 1))]
    pub settle_timeout_secs: u64,

    /// Remove an existing container with the reserved name before launching
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub replace_existing: bool,

    #[serde(default)]
    #[garde(skip)]
    pub failure_policy: FailurePolicy,

    /// Directory for diagnostic files
    #[serde(default = "default_diagnostics_dir")]
    #[garde(length(min = 1))]
    pub diagnostics_dir: String,

    /// Directory for the proxy certificate
    #[serde(default = "default_cert_dir")]
    #[garde(length(min = 1))]
    pub cert_dir: String,

    #[serde(default = "default_cert_validity_days")]
    #[garde(range(min = 1))]
    pub cert_validity_days: u32,

    #[serde(default = "default_cert_renew_before_days")]
    #[garde(skip)]
    pub cert_renew_before_days: u32,

    #[serde(default)]
    #[garde(skip)]
    pub key_algorithm: KeyAlgorithm,

    /// Where the rendered NGINX site configuration is written
    #[serde(default = "default_nginx_conf_path")]
    #[garde(length(min = 1))]
    pub nginx_conf_path: String,
}

fn validate_registry(value: &str, _ctx: &()) -> garde::Result {
    if value.is_empty() {
        return Err(garde::Error::new("registry cannot be empty"));
    }
    if value.contains("://") {
        return Err(garde::Error::new("registry must be a host name, not a URL"));
    }
    if value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(garde::Error::new(
            "registry must not contain '/' or whitespace",
        ));
    }
    Ok(())
}

fn validate_server_name(value: &str, _ctx: &()) -> garde::Result {
    proxy::check_directive_value(value).map_err(|e| garde::Error::new(format!("{e:#}")))
}

fn validate_region(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(region) if region.is_empty() || region.chars().any(char::is_whitespace) => {
            Err(garde::Error::new("region must be a non-empty name without whitespace"))
        }
        _ => Ok(()),
    }
}

fn validate_admin_user(value: &Option<String>, _ctx: &()) -> garde::Result {
    let Some(user) = value else {
        return Ok(());
    };
    let valid = !user.is_empty()
        && !user.starts_with('-')
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(garde::Error::new(
            "must be a user name of letters, digits, '-', '_' or '.'",
        ));
    }
    Ok(())
}

fn validate_no_whitespace(value: &str, _ctx: &()) -> garde::Result {
    if value.chars().any(char::is_whitespace) {
        return Err(garde::Error::new("must not contain whitespace"));
    }
    Ok(())
}

impl Config {
    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::io(path.display().to_string(), e))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        garde::Validate::validate(&config)?;
        if let (Some(region), Some(registry_region)) =
            (config.region.as_deref(), config.registry_region())
        {
            if region != registry_region {
                return Err(ConfigError::RegionMismatch {
                    region: region.to_string(),
                    registry: config.registry.clone(),
                    registry_region: registry_region.to_string(),
                });
            }
        }
        Ok(config)
    }

    /// Region used for STS and ECR: the configured one, else the one in an
    /// ECR registry host, else the default
    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .or_else(|| self.registry_region())
            .unwrap_or(DEFAULT_REGION)
    }

    /// Fully-qualified image reference
    pub fn image_reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Account ID encoded in an ECR registry host, if any
    pub fn registry_account_id(&self) -> Option<&str> {
        let (account, rest) = self.registry.split_once('.')?;
        let is_account = account.len() == 12 && account.chars().all(|c| c.is_ascii_digit());
        (is_account && rest.starts_with("dkr.ecr.")).then_some(account)
    }

    /// Region encoded in an ECR registry host, if any
    pub fn registry_region(&self) -> Option<&str> {
        self.registry_account_id()?;
        let rest = self.registry.split_once(".dkr.ecr.")?.1;
        let (region, domain) = rest.split_once('.')?;
        (!region.is_empty() && domain.starts_with("amazonaws.com")).then_some(region)
    }

    /// Packages to install, runtime first
    pub fn package_list(&self) -> Vec<String> {
        let mut packages = vec![DOCKER_PACKAGE.to_string()];
        if self.enable_proxy {
            packages.push(NGINX_PACKAGE.to_string());
        }
        for extra in &self.packages {
            if !packages.contains(extra) {
                packages.push(extra.clone());
            }
        }
        packages
    }

    pub fn pull_retry_delay(&self) -> Duration {
        Duration::from_secs(self.pull_retry_delay_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        PathBuf::from(&self.diagnostics_dir)
    }

    pub fn cert_dir(&self) -> PathBuf {
        PathBuf::from(&self.cert_dir)
    }

    pub fn strict(&self) -> bool {
        self.failure_policy == FailurePolicy::Strict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"{
        "registry": "123456789012.dkr.ecr.us-east-1.amazonaws.com",
        "repository": "api"
    }"#;

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{MINIMAL}").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.region, None);
        assert_eq!(config.region(), "us-east-1");
        assert_eq!(config.admin_user.as_deref(), Some("ec2-user"));
        assert_eq!(config.tag, "latest");
        assert_eq!(config.container_name, "api");
        assert_eq!(config.host_port, 8000);
        assert_eq!(config.pull_attempts, 3);
        assert_eq!(config.pull_retry_delay(), Duration::from_secs(10));
        assert!(config.replace_existing);
        assert!(!config.enable_proxy);
        assert_eq!(config.failure_policy, FailurePolicy::Strict);
        assert_eq!(config.key_algorithm, KeyAlgorithm::Rsa2048);
        assert_eq!(
            config.image_reference(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/api:latest"
        );
    }

    #[test]
    fn test_registry_account_id() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.registry_account_id(), Some("123456789012"));

        let config = Config::from_json(
            r#"{"registry": "registry.example.com", "repository": "api"}"#,
        )
        .unwrap();
        assert_eq!(config.registry_account_id(), None);
    }

    #[test]
    fn test_region_follows_registry_host() {
        let config = Config::from_json(
            r#"{"registry": "123456789012.dkr.ecr.us-east-2.amazonaws.com", "repository": "api"}"#,
        )
        .unwrap();
        assert_eq!(config.registry_region(), Some("us-east-2"));
        assert_eq!(config.region(), "us-east-2");

        let config = Config::from_json(
            r#"{"registry": "123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn", "repository": "api"}"#,
        )
        .unwrap();
        assert_eq!(config.region(), "cn-north-1");

        let config = Config::from_json(
            r#"{"registry": "registry.example.com", "repository": "api"}"#,
        )
        .unwrap();
        assert_eq!(config.registry_region(), None);
        assert_eq!(config.region(), DEFAULT_REGION);

        let config = Config::from_json(
            r#"{"registry": "registry.example.com", "repository": "api", "region": "eu-west-1"}"#,
        )
        .unwrap();
        assert_eq!(config.region(), "eu-west-1");
    }

    #[test]
    fn test_rejects_region_mismatch() {
        let err = Config::from_json(
            r#"{"registry": "123456789012.dkr.ecr.us-east-2.amazonaws.com", "repository": "api", "region": "us-east-1"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::RegionMismatch { ref region, ref registry_region, .. }
                if region == "us-east-1" && registry_region == "us-east-2"
        ));

        let config = Config::from_json(
            r#"{"registry": "123456789012.dkr.ecr.us-east-2.amazonaws.com", "repository": "api", "region": "us-east-2"}"#,
        )
        .unwrap();
        assert_eq!(config.region(), "us-east-2");
    }

    #[test]
    fn test_rejects_unsafe_server_name() {
        for name in ["a; return 200", "api.example.com www.example.com", "a{b", ""] {
            let json = serde_json::json!({
                "registry": "r.example.com",
                "repository": "api",
                "server_name": name,
            });
            let err = Config::from_json(&json.to_string()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{name:?}");
            assert!(err.to_string().contains("server_name"), "{err}");
        }

        let config = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "server_name": "api.example.com"}"#,
        )
        .unwrap();
        assert_eq!(config.server_name, "api.example.com");
    }

    #[test]
    fn test_admin_user() {
        let config = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "admin_user": null}"#,
        )
        .unwrap();
        assert_eq!(config.admin_user, None);

        let config = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "admin_user": "ubuntu"}"#,
        )
        .unwrap();
        assert_eq!(config.admin_user.as_deref(), Some("ubuntu"));

        let err = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "admin_user": "root; reboot"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_package_list() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.package_list(), vec!["docker"]);

        config.enable_proxy = true;
        config.packages = vec!["nginx".into(), "jq".into()];
        assert_eq!(config.package_list(), vec!["docker", "nginx", "jq"]);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "bogus": 1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_url_registry() {
        let err = Config::from_json(
            r#"{"registry": "https://r.example.com", "repository": "api"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("registry"));
    }

    #[test]
    fn test_rejects_zero_pull_attempts() {
        let err = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "pull_attempts": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_failure_policy_parsing() {
        let config = Config::from_json(
            r#"{"registry": "r.example.com", "repository": "api", "failure_policy": "fail_forward"}"#,
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailForward);
        assert!(!config.strict());
        assert_eq!("strict".parse::<FailurePolicy>().unwrap(), FailurePolicy::Strict);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/hostboot.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
