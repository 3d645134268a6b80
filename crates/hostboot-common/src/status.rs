//! Canonical bootstrap steps and their outcome status
//!
//! Both enums are persisted in the JSON bootstrap report, so their
//! serialized names must remain stable.

use serde::{Deserialize, Serialize};

/// Outcome of a single bootstrap step
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StepStatus {
    /// Step completed successfully
    Ok,
    /// Step ran and failed
    Failed,
    /// Step was not run (disabled, or an earlier fatal step aborted the run)
    Skipped,
}

impl StepStatus {
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// Bootstrap steps in execution order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Step {
    /// Install docker (and nginx) and enable the runtime
    Packages,
    /// Wait for instance-role credentials to become usable
    Credentials,
    /// Record the resolved caller identity
    Identity,
    /// Log the container runtime into the registry
    RegistryLogin,
    /// Pull the API image with bounded retry
    ImagePull,
    /// Start the API container
    Launch,
    /// Certificate, NGINX configuration and service
    Proxy,
    /// Wait for the container and capture diagnostics
    Verify,
}

impl Step {
    /// Whether a failure of this step makes the whole bootstrap fail.
    ///
    /// Identity and registry login only feed diagnostics; verification
    /// captures are best-effort. A failed registry login surfaces as a
    /// failed pull instead.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Packages | Self::Credentials | Self::ImagePull | Self::Launch | Self::Proxy
        )
    }
}
