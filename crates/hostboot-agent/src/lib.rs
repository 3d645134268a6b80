//! hostboot-agent - First-boot provisioning agent
//!
//! This crate provides the `hostboot` binary that runs once on a freshly
//! launched instance: it installs the container runtime, authenticates to
//! the image registry, launches the API container and optionally puts a
//! TLS-terminating NGINX in front of it. Every step is recorded in plain
//! text diagnostics and a JSON report for later inspection.

pub mod aws;
pub mod bootstrap;
pub mod command;
pub mod config;
pub mod container;
pub mod diagnostics;
pub mod error;
pub mod packages;
pub mod proxy;
pub mod registry;
pub mod report;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;
