//! hostboot-common - Shared types and utilities
//!
//! This crate holds the pieces of hostboot that have no AWS SDK or process
//! dependencies, so they can be used by the agent and by tooling that
//! prepares an instance launch.
//!
//! ## Modules
//!
//! - [`defaults`]: Default configuration values
//! - [`status`]: Bootstrap steps and step outcome status
//! - [`tls`]: Self-signed certificate provisioning with expiry tracking
//! - [`user_data`]: EC2 user-data launcher generation

pub mod defaults;
pub mod status;
pub mod tls;
pub mod user_data;

pub use status::{Step, StepStatus};
pub use tls::{CertAction, CertKeyPair, CertMetadata, CertRequest, KeyAlgorithm};
