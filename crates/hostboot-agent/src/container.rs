//! Container runtime operations via the docker CLI

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::BootstrapError;
use crate::wait::sleep_cancellable;
use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a single `docker pull` may take
const PULL_TIMEOUT_SECS: u64 = 900;

/// Lines of container log captured for diagnostics
const LOG_TAIL_LINES: &str = "200";

/// The container to run
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Result of the bounded pull loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub succeeded: bool,
    /// Short reason of the last failure
    pub last_error: Option<String>,
}

/// docker CLI wrapper bound to a runner
pub struct Docker<'a, R> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> Docker<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    async fn docker<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&CommandSpec::new("docker", args)).await
    }

    /// Pull `image`, retrying up to `attempts` times with `delay` between
    /// attempts. Stops at the first success and never sleeps after it.
    pub async fn pull_with_retry(
        &self,
        image: &str,
        attempts: u32,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome, BootstrapError> {
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!(image = %image, attempt, max_attempts = attempts, "Pulling image");
            let spec =
                CommandSpec::new("docker", ["pull", image]).with_timeout_secs(PULL_TIMEOUT_SECS);
            match self.runner.run(&spec).await {
                Ok(output) if output.success => {
                    info!(image = %image, attempt, "Image pulled");
                    return Ok(PullOutcome {
                        attempts: attempt,
                        succeeded: true,
                        last_error: None,
                    });
                }
                Ok(output) => {
                    warn!(image = %image, attempt, error = %output.summary(), "Pull failed");
                    last_error = Some(output.summary());
                }
                Err(e) => {
                    warn!(image = %image, attempt, error = %e, "Pull failed");
                    last_error = Some(format!("{e:#}"));
                }
            }

            if attempt < attempts && !sleep_cancellable(delay, cancel).await {
                return Err(BootstrapError::Cancelled);
            }
        }

        Ok(PullOutcome {
            attempts,
            succeeded: false,
            last_error,
        })
    }

    /// Whether a container with exactly this name exists (running or not)
    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^/{name}$");
        let output = self
            .docker(["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .await?;
        if !output.success {
            anyhow::bail!("docker ps failed: {}", output.summary());
        }
        Ok(output.stdout.lines().any(|line| line.trim() == name))
    }

    /// Force-remove a container
    pub async fn remove(&self, name: &str) -> Result<()> {
        let output = self.docker(["rm", "-f", name]).await?;
        if !output.success {
            anyhow::bail!("docker rm failed: {}", output.summary());
        }
        Ok(())
    }

    /// Clear the reserved name before a launch.
    ///
    /// With `replace_existing`, an existing container is removed; otherwise
    /// its presence is a [`BootstrapError::ContainerNameConflict`].
    pub async fn ensure_name_available(
        &self,
        name: &str,
        replace_existing: bool,
    ) -> Result<(), BootstrapError> {
        let launch_error = |reason: String| BootstrapError::ContainerLaunch {
            name: name.to_string(),
            reason,
        };

        let exists = self
            .container_exists(name)
            .await
            .map_err(|e| launch_error(format!("{e:#}")))?;
        if !exists {
            return Ok(());
        }
        if !replace_existing {
            return Err(BootstrapError::ContainerNameConflict(name.to_string()));
        }

        info!(container = %name, "Removing existing container before relaunch");
        self.remove(name)
            .await
            .map_err(|e| launch_error(format!("{e:#}")))
    }

    /// `docker run -d` with an unless-stopped restart policy
    pub async fn run_detached(&self, spec: &ContainerSpec) -> Result<String, BootstrapError> {
        let publish = format!("{}:{}", spec.host_port, spec.container_port);
        let output = self
            .docker([
                "run",
                "-d",
                "--name",
                spec.name.as_str(),
                "--restart",
                "unless-stopped",
                "-p",
                publish.as_str(),
                spec.image.as_str(),
            ])
            .await
            .map_err(|e| BootstrapError::ContainerLaunch {
                name: spec.name.clone(),
                reason: format!("{e:#}"),
            })?;

        if !output.success {
            return Err(BootstrapError::ContainerLaunch {
                name: spec.name.clone(),
                reason: output.summary(),
            });
        }

        let id = output.stdout.trim().to_string();
        info!(container = %spec.name, id = %id, port = %publish, "Container started");
        Ok(id)
    }

    /// Whether the container reports `State.Running`
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .docker(["inspect", "--format", "{{.State.Running}}", name])
            .await?;
        if !output.success {
            anyhow::bail!("docker inspect failed: {}", output.summary());
        }
        Ok(output.stdout.trim() == "true")
    }

    /// `docker ps -a`, combined output
    pub async fn list_all(&self) -> Result<CommandOutput> {
        self.docker(["ps", "-a"]).await
    }

    /// Tail of the container log, combined output
    pub async fn logs(&self, name: &str) -> Result<CommandOutput> {
        self.docker(["logs", "--tail", LOG_TAIL_LINES, name]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, gap};
    use tokio::time::Instant;

    const IMAGE: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/api:latest";
    const DELAY: Duration = Duration::from_secs(10);

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "api".into(),
            image: IMAGE.into(),
            host_port: 8000,
            container_port: 8000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_first_attempt_never_sleeps() {
        let runner = ScriptedRunner::new();
        let docker = Docker::new(&runner);
        let start = Instant::now();

        let outcome = docker
            .pull_with_retry(IMAGE, 3, DELAY, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.succeeded);
        assert_eq!(runner.count("docker pull"), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_stops_at_first_success() {
        for success_on in 1..=3u32 {
            let mut responses: Vec<CommandOutput> = (1..success_on)
                .map(|_| CommandOutput::failed(1, "net/http: TLS handshake timeout"))
                .collect();
            responses.push(CommandOutput::ok("Status: Downloaded newer image\n"));
            let runner = ScriptedRunner::new().on("docker pull", responses);
            let docker = Docker::new(&runner);
            let start = Instant::now();

            let outcome = docker
                .pull_with_retry(IMAGE, 3, DELAY, &CancellationToken::new())
                .await
                .unwrap();

            assert!(outcome.succeeded);
            assert_eq!(outcome.attempts, success_on);
            assert_eq!(runner.count("docker pull"), success_on as usize);
            assert_eq!(start.elapsed(), DELAY * (success_on - 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_exhaustion() {
        let runner = ScriptedRunner::new().on(
            "docker pull",
            vec![CommandOutput::failed(1, "no basic auth credentials")],
        );
        let docker = Docker::new(&runner);
        let start = Instant::now();

        let outcome = docker
            .pull_with_retry(IMAGE, 3, DELAY, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error.as_deref(), Some("no basic auth credentials"));
        // Two delays between three attempts, none after the last
        assert_eq!(start.elapsed(), DELAY * 2);

        let pulls = runner.calls_matching("docker pull");
        assert_eq!(gap(&pulls[0], &pulls[1]), DELAY);
        assert_eq!(gap(&pulls[1], &pulls[2]), DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_spawn_errors_are_retried() {
        let runner = ScriptedRunner::new().on_spawn_error("docker pull", "docker: not found");
        let docker = Docker::new(&runner);

        let outcome = docker
            .pull_with_retry(IMAGE, 2, DELAY, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(runner.count("docker pull"), 2);
        assert!(outcome.last_error.unwrap().contains("docker: not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_cancelled_during_delay() {
        let runner = ScriptedRunner::new()
            .on("docker pull", vec![CommandOutput::failed(1, "timeout")]);
        let docker = Docker::new(&runner);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = docker
            .pull_with_retry(IMAGE, 3, DELAY, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Cancelled));
        assert_eq!(runner.count("docker pull"), 1);
    }

    #[tokio::test]
    async fn test_run_detached_arguments() {
        let runner = ScriptedRunner::new();
        let docker = Docker::new(&runner);
        docker.pull_with_retry(IMAGE, 1, DELAY, &CancellationToken::new()).await.unwrap();

        docker.run_detached(&spec()).await.unwrap();

        let runs = runner.calls_matching("docker run");
        assert_eq!(runs.len(), 1);
        assert_eq!(
            runs[0].line(),
            format!("docker run -d --name api --restart unless-stopped -p 8000:8000 {IMAGE}")
        );
        assert!(runner.has_container("api"));
    }

    #[tokio::test]
    async fn test_name_conflict_without_replacement() {
        let runner = ScriptedRunner::new().with_container("api");
        let docker = Docker::new(&runner);

        let err = docker.ensure_name_available("api", false).await.unwrap_err();
        assert!(matches!(err, BootstrapError::ContainerNameConflict(ref n) if n == "api"));
        assert_eq!(runner.count("docker rm"), 0);
    }

    #[tokio::test]
    async fn test_existing_container_is_replaced() {
        let runner = ScriptedRunner::new().with_container("api");
        let docker = Docker::new(&runner);

        docker.ensure_name_available("api", true).await.unwrap();
        assert_eq!(runner.count("docker rm -f api"), 1);
        assert!(!runner.has_container("api"));
    }

    #[tokio::test]
    async fn test_name_filter_is_exact() {
        let runner = ScriptedRunner::new().on(
            "docker ps -a --filter",
            vec![CommandOutput::ok("api-old\n")],
        );
        let docker = Docker::new(&runner);
        assert!(!docker.container_exists("api").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_without_image_fails() {
        let runner = ScriptedRunner::new();
        let docker = Docker::new(&runner);

        let err = docker.run_detached(&spec()).await.unwrap_err();
        match err {
            BootstrapError::ContainerLaunch { name, reason } => {
                assert_eq!(name, "api");
                assert!(reason.contains("pull access denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_is_running() {
        let runner = ScriptedRunner::new().with_container("api");
        let docker = Docker::new(&runner);
        assert!(docker.is_running("api").await.unwrap());
        assert!(docker.is_running("missing").await.is_err());
    }
}
