//! hostboot: first-boot provisioning agent for a single API host
//!
//! `hostboot run` performs the bootstrap. The remaining subcommands expose
//! individual pieces (certificate provisioning, proxy rendering, user-data
//! generation) and read back the report of a previous run.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hostboot_agent::aws::AwsCloud;
use hostboot_agent::bootstrap::Bootstrapper;
use hostboot_agent::command::SystemRunner;
use hostboot_agent::config::{Config, FailurePolicy};
use hostboot_agent::diagnostics;
use hostboot_agent::proxy::{self, ProxySite};
use hostboot_agent::report::BootstrapReport;
use hostboot_common::KeyAlgorithm;
use hostboot_common::defaults::{
    DEFAULT_CERT_DIR, DEFAULT_CERT_RENEW_BEFORE_DAYS, DEFAULT_CERT_VALIDITY_DAYS,
    DEFAULT_CONFIG_PATH, DEFAULT_DIAGNOSTICS_DIR, DEFAULT_HOST_PORT, DEFAULT_SERVER_NAME,
};
use hostboot_common::tls::{CertPaths, CertRequest, ensure_certificate};
use hostboot_common::user_data::{
    BOOTSTRAP_LOG_PATH, UserDataParams, detect_bootstrap_failure, generate_user_data,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hostboot")]
#[command(about = "First-boot provisioning agent for a containerized API host")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Arguments for the run command
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Agent configuration file (JSON)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the diagnostics directory
    #[arg(long)]
    diagnostics_dir: Option<String>,

    /// Override the failure policy (strict, fail_forward)
    #[arg(long)]
    policy: Option<FailurePolicy>,

    /// Skip the reverse proxy even if the configuration enables it
    #[arg(long)]
    no_proxy: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bootstrap sequence
    Run(RunArgs),

    /// Generate or rotate the proxy's self-signed certificate
    Cert {
        /// Directory for server.crt, server.key and server.json
        #[arg(long, default_value = DEFAULT_CERT_DIR)]
        dir: PathBuf,

        /// NGINX server name the certificate is issued for
        #[arg(long, default_value = DEFAULT_SERVER_NAME)]
        server_name: String,

        /// Validity in days
        #[arg(long, default_value_t = DEFAULT_CERT_VALIDITY_DAYS)]
        validity_days: u32,

        /// Rotate when the certificate expires within this many days
        #[arg(long, default_value_t = DEFAULT_CERT_RENEW_BEFORE_DAYS)]
        renew_before_days: u32,

        /// Key algorithm (rsa2048, ecdsa_p256)
        #[arg(long, default_value_t = KeyAlgorithm::default())]
        key_algorithm: KeyAlgorithm,

        /// Regenerate even if the existing certificate is still valid
        #[arg(long)]
        force: bool,
    },

    /// Render the NGINX configuration to stdout or a file
    RenderProxy {
        #[arg(long, default_value = DEFAULT_SERVER_NAME)]
        server_name: String,

        /// Local port the API container is published on
        #[arg(long, default_value_t = DEFAULT_HOST_PORT)]
        port: u16,

        /// Directory holding server.crt and server.key
        #[arg(long, default_value = DEFAULT_CERT_DIR)]
        cert_dir: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the EC2 user-data launcher for a configuration
    UserData {
        /// S3 bucket holding the agent binaries
        #[arg(long)]
        bucket: String,

        /// Key prefix of the agent binaries
        #[arg(long, default_value = "hostboot")]
        prefix: String,

        /// Agent configuration to embed (validated before embedding)
        #[arg(short, long)]
        config: PathBuf,

        /// Path the configuration is written to on the instance
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config_path: String,
    },

    /// Show the report of the last bootstrap run
    Status {
        #[arg(long, default_value = DEFAULT_DIAGNOSTICS_DIR)]
        diagnostics_dir: PathBuf,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,

        /// Launcher log scanned for known failure patterns
        #[arg(long, default_value = BOOTSTRAP_LOG_PATH)]
        launcher_log: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print the error and its cause chain
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");
    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run(run_args) => handle_run(run_args).await,

        Command::Cert {
            dir,
            server_name,
            validity_days,
            renew_before_days,
            key_algorithm,
            force,
        } => {
            if force {
                remove_if_exists(&CertPaths::in_dir(&dir).metadata)?;
            }
            let request = CertRequest::for_server_name(&server_name, validity_days, key_algorithm);
            let (action, metadata) =
                ensure_certificate(&dir, &request, renew_before_days, Utc::now())?;
            println!(
                "{action}: {} ({}, expires {}, {} days remaining)",
                metadata.common_name,
                metadata.key_algorithm,
                metadata.not_after.to_rfc3339(),
                metadata.days_remaining(Utc::now())
            );
            Ok(())
        }

        Command::RenderProxy {
            server_name,
            port,
            cert_dir,
            output,
        } => {
            let paths = CertPaths::in_dir(&cert_dir);
            let site = ProxySite::new(&server_name, port, &paths.cert, &paths.key);
            let rendered = site.render()?;
            match output {
                Some(path) => {
                    proxy::write_config(&path, &rendered)?;
                    info!(path = %path.display(), "Wrote nginx configuration");
                }
                None => print!("{rendered}"),
            }
            Ok(())
        }

        Command::UserData {
            bucket,
            prefix,
            config,
            config_path,
        } => {
            // Refuse to embed a configuration the agent would reject on boot
            Config::load(&config)?;
            let config_json = std::fs::read_to_string(&config)
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let script = generate_user_data(&UserDataParams {
                bucket: &bucket,
                prefix: &prefix,
                config_json: &config_json,
                config_path: &config_path,
            })?;
            print!("{script}");
            Ok(())
        }

        Command::Status {
            diagnostics_dir,
            json,
            launcher_log,
        } => handle_status(&diagnostics_dir, json, &launcher_log),
    }
}

async fn handle_run(args: RunArgs) -> Result<()> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(dir) = args.diagnostics_dir {
        config.diagnostics_dir = dir;
    }
    if let Some(policy) = args.policy {
        config.failure_policy = policy;
    }
    if args.no_proxy {
        config.enable_proxy = false;
    }

    info!(
        config = %args.config.display(),
        image = %config.image_reference(),
        region = %config.region(),
        "Starting hostboot"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let cloud = AwsCloud::from_region(config.region()).await;
    let runner = SystemRunner;
    let outcome = Bootstrapper::new(&config, &runner, &cloud, cancel)
        .run()
        .await;

    println!("{}", outcome.report.to_table());
    match outcome.error {
        Some(e) => Err(anyhow::Error::new(e).context("Bootstrap failed")),
        None if !outcome.report.succeeded() => anyhow::bail!("Bootstrap failed"),
        None => Ok(()),
    }
}

/// Cancel the run on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        warn!("Signal received, cancelling bootstrap");
        cancel.cancel();
    });
}

fn handle_status(diagnostics_dir: &Path, json: bool, launcher_log: &Path) -> Result<()> {
    let report_path = diagnostics_dir.join(diagnostics::REPORT);
    let report = BootstrapReport::load(&report_path)?;

    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("Image:     {}", report.image);
    println!("Container: {}", report.container_name);
    println!("Policy:    {}", report.failure_policy);
    println!("Started:   {}", report.started_at.to_rfc3339());
    if let Some(finished) = report.finished_at {
        println!("Finished:  {}", finished.to_rfc3339());
    }
    println!("{}", report.to_table());

    if let Ok(log) = std::fs::read_to_string(launcher_log) {
        if let Some(pattern) = detect_bootstrap_failure(&log) {
            println!("Launcher log {} shows a failure: {pattern}", launcher_log.display());
        }
    }

    if report.succeeded() {
        println!("Result:    success");
        Ok(())
    } else {
        if let Some(error) = &report.error {
            println!("Aborted:   {error}");
        }
        anyhow::bail!("Last bootstrap failed: {:?}", report.fatal_failures())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
