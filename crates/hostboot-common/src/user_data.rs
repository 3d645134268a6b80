//! EC2 user-data generation
//!
//! The user-data script is the only thing cloud-init runs: it fetches the
//! agent binary, drops the agent configuration on disk and hands over to
//! `hostboot run`. Everything else happens inside the agent.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Log file the user-data script tees its output into
pub const BOOTSTRAP_LOG_PATH: &str = "/var/log/hostboot.log";

/// Where the agent binary is installed on the instance
pub const AGENT_INSTALL_PATH: &str = "/usr/local/bin/hostboot";

/// Patterns in the console output that indicate the launcher itself failed
const BOOTSTRAP_FAILURE_PATTERNS: &[&str] = &[
    "unbound variable",
    "Failed to start cloud-final",
    "cc_scripts_user.py[WARNING]: Failed to run module scripts-user",
    "hostboot: command not found",
    "fatal error: An error occurred (403)",
];

/// Inputs rejected before interpolation into the script
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserDataError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("{field} contains forbidden character: {found:?}")]
    ForbiddenCharacter { field: &'static str, found: char },
}

/// Parameters for the user-data launcher
#[derive(Debug, Clone)]
pub struct UserDataParams<'a> {
    /// S3 bucket holding the agent binary
    pub bucket: &'a str,
    /// Object key prefix; the binary is fetched from `<prefix>/hostboot-<arch>`
    pub prefix: &'a str,
    /// Agent configuration JSON, embedded verbatim
    pub config_json: &'a str,
    /// Path the configuration is written to
    pub config_path: &'a str,
}

/// Reject characters that could break a double-quoted bash string or
/// enable injection (`"`, `\`, `` ` ``, `$`, newlines).
fn validate_shell_input(value: &str, field: &'static str) -> Result<(), UserDataError> {
    const FORBIDDEN: &[char] = &['"', '\\', '`', '$', '\n', '\r'];
    if value.is_empty() {
        return Err(UserDataError::Empty { field });
    }
    if let Some(found) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(UserDataError::ForbiddenCharacter { field, found });
    }
    Ok(())
}

/// Generate the user-data script for the API host.
///
/// The configuration is base64-encoded so arbitrary JSON survives shell
/// quoting; the remaining inputs are validated instead.
pub fn generate_user_data(params: &UserDataParams<'_>) -> Result<String, UserDataError> {
    validate_shell_input(params.bucket, "bucket")?;
    validate_shell_input(params.prefix, "prefix")?;
    validate_shell_input(params.config_path, "config_path")?;
    if params.config_json.trim().is_empty() {
        return Err(UserDataError::Empty {
            field: "config_json",
        });
    }

    let encoded = STANDARD.encode(params.config_json.as_bytes());
    let prefix = params.prefix.trim_end_matches('/');

    Ok(format!(
        r#"#!/bin/bash
set -euo pipefail

exec > >(tee {log}) 2>&1

BUCKET="{bucket}"
PREFIX="{prefix}"
CONFIG_PATH="{config_path}"
ARCH=$(uname -m)

echo "Writing agent configuration to ${{CONFIG_PATH}}..."
mkdir -p "$(dirname "${{CONFIG_PATH}}")"
echo "{encoded}" | base64 -d > "${{CONFIG_PATH}}"
chmod 600 "${{CONFIG_PATH}}"

echo "Fetching agent from S3..."
aws s3 cp "s3://${{BUCKET}}/${{PREFIX}}/hostboot-${{ARCH}}" {agent}
chmod +x {agent}

echo "Starting hostboot..."
exec {agent} run --config "${{CONFIG_PATH}}"
"#,
        log = BOOTSTRAP_LOG_PATH,
        bucket = params.bucket,
        prefix = prefix,
        config_path = params.config_path,
        encoded = encoded,
        agent = AGENT_INSTALL_PATH,
    ))
}

/// Check if console output indicates the launcher failed before the agent ran
pub fn detect_bootstrap_failure(console_output: &str) -> Option<&'static str> {
    BOOTSTRAP_FAILURE_PATTERNS
        .iter()
        .find(|pattern| console_output.contains(*pattern))
        .copied()
}
