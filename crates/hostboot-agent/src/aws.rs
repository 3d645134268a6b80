//! AWS calls made by the agent: caller identity (STS) and registry
//! credentials (ECR)

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::future::Future;
use tracing::{debug, info};

/// Strongly-typed AWS account ID (12-digit string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::Deref)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(account: impl Into<String>) -> Self {
        Self(account.into())
    }
}

/// Identity the instance credentials resolve to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: AccountId,
    pub arn: String,
    pub user_id: String,
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Account: {}", self.account)?;
        writeln!(f, "Arn:     {}", self.arn)?;
        write!(f, "UserId:  {}", self.user_id)
    }
}

/// Short-lived registry login, consumed immediately by `docker login`
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    /// Registry endpoint the token is valid for, if reported
    pub endpoint: Option<String>,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Decode an ECR authorization token (`base64("AWS:<password>")`)
pub fn decode_authorization_token(token: &str) -> Result<(String, String)> {
    let bytes = STANDARD
        .decode(token.trim())
        .context("Authorization token is not valid base64")?;
    let decoded = String::from_utf8(bytes).context("Authorization token is not UTF-8")?;
    let (user, password) = decoded
        .split_once(':')
        .context("Authorization token is not in user:password form")?;
    if password.is_empty() {
        anyhow::bail!("Authorization token has an empty password");
    }
    Ok((user.to_string(), password.to_string()))
}

/// Trait for cloud operations that can be faked in tests.
pub trait CloudOperations: Send + Sync {
    /// Resolve the identity of the instance credentials
    fn caller_identity(&self) -> impl Future<Output = Result<CallerIdentity>> + Send;

    /// Fetch a registry login, optionally for a specific registry account
    fn registry_credentials(
        &self,
        registry_id: Option<&str>,
    ) -> impl Future<Output = Result<RegistryCredentials>> + Send;
}

/// STS and ECR clients bound to one region
#[derive(Debug, Clone)]
pub struct AwsCloud {
    sts: aws_sdk_sts::Client,
    ecr: aws_sdk_ecr::Client,
}

impl AwsCloud {
    /// Build clients from the default credential chain (instance role on EC2)
    pub async fn from_region(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            sts: aws_sdk_sts::Client::new(&config),
            ecr: aws_sdk_ecr::Client::new(&config),
        }
    }
}

impl CloudOperations for AwsCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        let identity = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .context("Failed to get AWS caller identity - check instance role")?;

        let account = identity
            .account()
            .context("No account ID returned from STS GetCallerIdentity")?;

        debug!(account_id = %account, "Caller identity resolved");

        Ok(CallerIdentity {
            account: AccountId::new(account),
            arn: identity.arn().unwrap_or_default().to_string(),
            user_id: identity.user_id().unwrap_or_default().to_string(),
        })
    }

    async fn registry_credentials(&self, registry_id: Option<&str>) -> Result<RegistryCredentials> {
        let output = self
            .ecr
            .get_authorization_token()
            .set_registry_ids(registry_id.map(|id| vec![id.to_string()]))
            .send()
            .await
            .context("Failed to get ECR authorization token")?;

        let data = output
            .authorization_data()
            .first()
            .context("ECR returned no authorization data")?;
        let token = data
            .authorization_token()
            .context("ECR authorization data has no token")?;
        let (username, password) = decode_authorization_token(token)?;

        info!(
            endpoint = data.proxy_endpoint().unwrap_or("<default>"),
            "Obtained registry authorization token"
        );

        Ok(RegistryCredentials {
            username,
            password,
            endpoint: data.proxy_endpoint().map(str::to_string),
        })
    }
}
