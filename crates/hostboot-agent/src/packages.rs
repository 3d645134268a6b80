//! System package installation

use crate::command::{CommandRunner, CommandSpec};
use crate::error::BootstrapError;
use hostboot_common::defaults::DOCKER_PACKAGE;
use std::path::Path;
use tracing::{info, warn};

/// Timeout for a package manager transaction
const INSTALL_TIMEOUT_SECS: u64 = 900;

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PackageManager {
    Dnf,
    Yum,
    AptGet,
}

impl PackageManager {
    /// Pick the package manager present under `root` (`/` on a real host)
    pub fn detect(root: &Path) -> Option<Self> {
        [
            ("usr/bin/dnf", Self::Dnf),
            ("usr/bin/yum", Self::Yum),
            ("usr/bin/apt-get", Self::AptGet),
        ]
        .into_iter()
        .find(|(binary, _)| root.join(binary).exists())
        .map(|(_, manager)| manager)
    }

    /// Distribution-specific package name
    fn package_name(self, package: &str) -> String {
        match (self, package) {
            (Self::AptGet, DOCKER_PACKAGE) => "docker.io".to_string(),
            _ => package.to_string(),
        }
    }

    /// Commands that install `packages` non-interactively
    pub fn install_commands(self, packages: &[String]) -> Vec<CommandSpec> {
        let names: Vec<String> = packages.iter().map(|p| self.package_name(p)).collect();
        let install = |program: &str, prefix: &[&str]| {
            let args = prefix
                .iter()
                .map(|s| s.to_string())
                .chain(names.iter().cloned());
            CommandSpec::new(program, args).with_timeout_secs(INSTALL_TIMEOUT_SECS)
        };

        match self {
            Self::Dnf => vec![install("dnf", &["install", "-y"])],
            Self::Yum => vec![install("yum", &["install", "-y"])],
            Self::AptGet => vec![
                CommandSpec::new("apt-get", ["update"]).with_timeout_secs(INSTALL_TIMEOUT_SECS),
                install("apt-get", &["install", "-y", "--no-install-recommends"]),
            ],
        }
    }
}

/// Install `packages` and enable the container runtime so it survives reboots.
/// `admin_user`, when it exists on the host, is then added to the docker group.
pub async fn install_packages<R: CommandRunner>(
    runner: &R,
    manager: PackageManager,
    packages: &[String],
    admin_user: Option<&str>,
) -> Result<(), BootstrapError> {
    info!(manager = %manager, packages = ?packages, "Installing packages");

    let mut commands = manager.install_commands(packages);
    commands.push(CommandSpec::new("systemctl", ["enable", "--now", "docker"]).with_timeout_secs(120));

    for spec in commands {
        let output = runner
            .run(&spec)
            .await
            .map_err(|e| BootstrapError::PackageInstall(format!("{e:#}")))?;
        if !output.success {
            return Err(BootstrapError::PackageInstall(format!(
                "{}: {}",
                spec.display(),
                output.summary()
            )));
        }
    }

    info!("Packages installed, docker enabled");

    if let Some(user) = admin_user {
        grant_docker_access(runner, user).await;
    }
    Ok(())
}

/// Best effort: a missing user or a failed `usermod` only logs.
async fn grant_docker_access<R: CommandRunner>(runner: &R, user: &str) {
    let exists = runner
        .run(&CommandSpec::new("id", ["-u", user]).with_timeout_secs(10))
        .await
        .is_ok_and(|output| output.success);
    if !exists {
        info!(user, "User not present, skipping docker group membership");
        return;
    }

    let spec = CommandSpec::new("usermod", ["-a", "-G", "docker", user]).with_timeout_secs(30);
    match runner.run(&spec).await {
        Ok(output) if output.success => info!(user, "Added user to the docker group"),
        Ok(output) => warn!(user, error = %output.summary(), "Failed to add user to the docker group"),
        Err(e) => warn!(user, error = %e, "Failed to add user to the docker group"),
    }
}
