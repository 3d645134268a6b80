//! Host bootstrap: packages, credentials, registry, container, proxy
//!
//! Steps run strictly in order. Every step leaves a [`StepOutcome`] in the
//! report; fatal-class failures abort the rest of the run under the strict
//! policy and are only recorded under fail-forward. The completion marker
//! and JSON report are written whatever happened.
//!
//! [`StepOutcome`]: crate::report::StepOutcome

use crate::aws::CloudOperations;
use crate::command::{CommandOutput, CommandRunner};
use crate::config::Config;
use crate::container::{ContainerSpec, Docker};
use crate::diagnostics::{self, Diagnostics};
use crate::error::BootstrapError;
use crate::packages::{PackageManager, install_packages};
use crate::proxy::{self, ProxySite};
use crate::registry;
use crate::report::BootstrapReport;
use crate::wait::{WaitConfig, WaitError, wait_until_ready};
use anyhow::Result;
use chrono::Utc;
use hostboot_common::tls::{CertPaths, CertRequest, ensure_certificate};
use hostboot_common::{Step, StepStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a step ended when it did not fail
enum Completed {
    Done(String),
    Skipped(String),
}

enum StepError {
    /// Failure of a fatal-class step
    Fatal(BootstrapError),
    /// Failure of a best-effort step; recorded, never aborts
    BestEffort(anyhow::Error),
}

impl From<BootstrapError> for StepError {
    fn from(e: BootstrapError) -> Self {
        Self::Fatal(e)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        Self::BestEffort(e)
    }
}

/// Result of a bootstrap run
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub report: BootstrapReport,
    /// First fatal failure, if any
    pub error: Option<BootstrapError>,
}

impl BootstrapOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.report.succeeded()
    }
}

/// Runs the bootstrap sequence against a command runner and cloud API
pub struct Bootstrapper<'a, R, C> {
    config: &'a Config,
    runner: &'a R,
    cloud: &'a C,
    diagnostics: Diagnostics,
    cancel: CancellationToken,
    package_root: PathBuf,
}

impl<'a, R: CommandRunner, C: CloudOperations> Bootstrapper<'a, R, C> {
    pub fn new(config: &'a Config, runner: &'a R, cloud: &'a C, cancel: CancellationToken) -> Self {
        Self {
            config,
            runner,
            cloud,
            diagnostics: Diagnostics::new(config.diagnostics_dir()),
            cancel,
            package_root: PathBuf::from("/"),
        }
    }

    /// Filesystem root searched for a package manager
    pub fn with_package_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.package_root = root.into();
        self
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Run every step, then write the completion marker and report
    pub async fn run(&self) -> BootstrapOutcome {
        let mut report = BootstrapReport::new(self.config, Utc::now());
        let mut first_fatal: Option<BootstrapError> = None;
        let mut abort_reason: Option<String> = None;

        info!(
            image = %report.image,
            container = %self.config.container_name,
            proxy = self.config.enable_proxy,
            policy = %self.config.failure_policy,
            "Starting bootstrap"
        );

        for step in Step::iter() {
            if abort_reason.is_none() && self.cancel.is_cancelled() {
                abort_reason = Some(BootstrapError::Cancelled.to_string());
                first_fatal.get_or_insert(BootstrapError::Cancelled);
            }
            if let Some(reason) = &abort_reason {
                report.record(
                    step,
                    StepStatus::Skipped,
                    format!("not run: {reason}"),
                    Duration::ZERO,
                );
                continue;
            }

            info!(step = %step, "Step started");
            let started = Instant::now();
            let result = self.execute(step).await;
            let elapsed = started.elapsed();

            match result {
                Ok(Completed::Done(message)) => {
                    info!(step = %step, duration_ms = elapsed.as_millis() as u64, "{message}");
                    report.record(step, StepStatus::Ok, message, elapsed);
                }
                Ok(Completed::Skipped(message)) => {
                    info!(step = %step, "Step skipped: {message}");
                    report.record(step, StepStatus::Skipped, message, elapsed);
                }
                Err(StepError::BestEffort(e)) => {
                    warn!(step = %step, error = %format!("{e:#}"), "Step failed, continuing");
                    report.record(step, StepStatus::Failed, format!("{e:#}"), elapsed);
                }
                Err(StepError::Fatal(e)) => {
                    error!(step = %step, error = %e, "Step failed");
                    report.record(step, StepStatus::Failed, e.to_string(), elapsed);
                    if self.config.strict() || matches!(e, BootstrapError::Cancelled) {
                        abort_reason = Some(e.to_string());
                    }
                    first_fatal.get_or_insert(e);
                }
            }
        }

        self.capture_diagnostics().await;
        report.finish(Utc::now(), abort_reason);
        self.write_summary(&report);

        if report.succeeded() {
            info!("Bootstrap complete");
        } else {
            error!(failed = ?report.fatal_failures(), "Bootstrap finished with failures");
        }

        BootstrapOutcome {
            report,
            error: first_fatal,
        }
    }

    async fn execute(&self, step: Step) -> Result<Completed, StepError> {
        match step {
            Step::Packages => Ok(self.install_packages().await?),
            Step::Credentials => Ok(self.wait_for_credentials().await?),
            Step::Identity => Ok(self.check_identity().await?),
            Step::RegistryLogin => Ok(self.login().await?),
            Step::ImagePull => Ok(self.pull_image().await?),
            Step::Launch => Ok(self.launch().await?),
            Step::Proxy => Ok(self.install_proxy().await?),
            Step::Verify => Ok(self.verify().await?),
        }
    }

    async fn install_packages(&self) -> Result<Completed, BootstrapError> {
        let manager = PackageManager::detect(&self.package_root).ok_or_else(|| {
            BootstrapError::PackageInstall(format!(
                "no supported package manager (dnf, yum, apt-get) under {}",
                self.package_root.display()
            ))
        })?;
        let packages = self.config.package_list();
        install_packages(
            self.runner,
            manager,
            &packages,
            self.config.admin_user.as_deref(),
        )
        .await?;
        Ok(Completed::Done(format!(
            "installed {} with {manager}",
            packages.join(", ")
        )))
    }

    /// Instance-role credentials can lag behind boot; poll until STS answers.
    async fn wait_for_credentials(&self) -> Result<Completed, BootstrapError> {
        let cloud = self.cloud;
        let wait = WaitConfig::with_timeout(self.config.credential_timeout());

        let probes = wait_until_ready(&wait, &self.cancel, "instance credentials", move || async move {
            cloud.caller_identity().await.map(|_| true)
        })
        .await
        .map_err(|e| match e {
            WaitError::Cancelled(_) => BootstrapError::Cancelled,
            timeout @ WaitError::Timeout { .. } => BootstrapError::CredentialsUnavailable {
                timeout_secs: self.config.credential_timeout_secs,
                reason: timeout.to_string(),
            },
        })?;

        Ok(Completed::Done(format!(
            "credentials available after {probes} probe(s)"
        )))
    }

    async fn check_identity(&self) -> Result<Completed> {
        match self.cloud.caller_identity().await {
            Ok(identity) => {
                self.diagnostics
                    .write(diagnostics::IDENTITY_CHECK, &format!("{identity}\n"));
                Ok(Completed::Done(format!("running as {}", identity.arn)))
            }
            Err(e) => {
                self.diagnostics.write(
                    diagnostics::IDENTITY_CHECK,
                    &format!("Identity check failed: {e:#}\n"),
                );
                Err(e)
            }
        }
    }

    async fn login(&self) -> Result<Completed> {
        registry::login(
            self.runner,
            self.cloud,
            &self.diagnostics,
            &self.config.registry,
            self.config.registry_account_id(),
        )
        .await?;
        Ok(Completed::Done(format!(
            "logged in to {}",
            self.config.registry
        )))
    }

    async fn pull_image(&self) -> Result<Completed, BootstrapError> {
        let image = self.config.image_reference();
        let outcome = Docker::new(self.runner)
            .pull_with_retry(
                &image,
                self.config.pull_attempts,
                self.config.pull_retry_delay(),
                &self.cancel,
            )
            .await?;

        if outcome.succeeded {
            return Ok(Completed::Done(format!(
                "pulled {image} on attempt {}",
                outcome.attempts
            )));
        }
        if let Some(last_error) = &outcome.last_error {
            warn!(image = %image, last_error = %last_error, "Pull attempts exhausted");
        }
        Err(BootstrapError::ImagePullExhausted {
            image,
            attempts: outcome.attempts,
        })
    }

    async fn launch(&self) -> Result<Completed, BootstrapError> {
        let docker = Docker::new(self.runner);
        let name = &self.config.container_name;

        docker
            .ensure_name_available(name, self.config.replace_existing)
            .await?;
        let id = docker
            .run_detached(&ContainerSpec {
                name: name.clone(),
                image: self.config.image_reference(),
                host_port: self.config.host_port,
                container_port: self.config.container_port,
            })
            .await?;

        let short_id = id.get(..12).unwrap_or(&id);
        Ok(Completed::Done(format!(
            "container {name} started ({short_id}) on port {}",
            self.config.host_port
        )))
    }

    async fn install_proxy(&self) -> Result<Completed, BootstrapError> {
        if !self.config.enable_proxy {
            return Ok(Completed::Skipped("proxy disabled".to_string()));
        }

        let cert_dir = self.config.cert_dir();
        let request = CertRequest::for_server_name(
            &self.config.server_name,
            self.config.cert_validity_days,
            self.config.key_algorithm,
        );
        let (action, metadata) = ensure_certificate(
            &cert_dir,
            &request,
            self.config.cert_renew_before_days,
            Utc::now(),
        )
        .map_err(|e| BootstrapError::Certificate(format!("{e:#}")))?;

        let paths = CertPaths::in_dir(&cert_dir);
        let site = ProxySite::new(
            &self.config.server_name,
            self.config.host_port,
            &paths.cert,
            &paths.key,
        );
        proxy::install(
            self.runner,
            &self.diagnostics,
            &site,
            Path::new(&self.config.nginx_conf_path),
        )
        .await?;

        Ok(Completed::Done(format!(
            "nginx terminating TLS for {} (certificate {action}, expires {})",
            self.config.server_name,
            metadata.not_after.date_naive()
        )))
    }

    /// Poll until the container reports running instead of sleeping blindly.
    async fn verify(&self) -> Result<Completed> {
        let runner = self.runner;
        let name = self.config.container_name.as_str();
        let wait = WaitConfig::with_timeout(self.config.settle_timeout());

        wait_until_ready(&wait, &self.cancel, &format!("container {name}"), move || async move {
            Docker::new(runner).is_running(name).await
        })
        .await?;

        Ok(Completed::Done(format!("container {name} running")))
    }

    /// Snapshot container and proxy state for later inspection
    async fn capture_diagnostics(&self) {
        let docker = Docker::new(self.runner);
        self.record_output(diagnostics::CONTAINER_LIST, docker.list_all().await);
        self.record_output(
            diagnostics::CONTAINER_LOGS,
            docker.logs(&self.config.container_name).await,
        );

        if self.config.enable_proxy {
            let conf_path = Path::new(&self.config.nginx_conf_path);
            if let Err(e) = proxy::test_config(self.runner, &self.diagnostics, conf_path).await {
                self.diagnostics
                    .write(diagnostics::PROXY_CONFIG_TEST, &format!("{e:#}\n"));
            }
            proxy::capture_status(self.runner, &self.diagnostics).await;
        }
    }

    fn record_output(&self, name: &str, output: Result<CommandOutput>) {
        let content = match output {
            Ok(output) => output.combined(),
            Err(e) => format!("{e:#}\n"),
        };
        self.diagnostics.write(name, &content);
    }

    fn write_summary(&self, report: &BootstrapReport) {
        self.diagnostics
            .write(diagnostics::COMPLETION_MARKER, &report.completion_marker());
        match report.to_json() {
            Ok(json) => {
                self.diagnostics.write(diagnostics::REPORT, &json);
            }
            Err(e) => warn!(error = %e, "Failed to serialize bootstrap report"),
        }
    }
}
