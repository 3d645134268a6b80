//! Container registry authentication

use crate::aws::CloudOperations;
use crate::command::{CommandRunner, CommandSpec};
use crate::diagnostics::{self, Diagnostics};
use anyhow::Result;
use tracing::{info, warn};

/// Fetch a registry token and pipe it into `docker login`.
///
/// The combined output (or the error that prevented the login) always ends
/// up in the registry-login diagnostic. The password is only ever passed on
/// stdin.
pub async fn login<R, C>(
    runner: &R,
    cloud: &C,
    diagnostics: &Diagnostics,
    registry: &str,
    registry_id: Option<&str>,
) -> Result<()>
where
    R: CommandRunner,
    C: CloudOperations,
{
    let result = try_login(runner, cloud, registry, registry_id).await;
    match &result {
        Ok(output) => {
            info!(registry = %registry, "Registry login succeeded");
            diagnostics.write(diagnostics::REGISTRY_LOGIN, output);
        }
        Err(e) => {
            warn!(registry = %registry, error = %e, "Registry login failed");
            diagnostics.write(
                diagnostics::REGISTRY_LOGIN,
                &format!("Registry login to {registry} failed: {e:#}\n"),
            );
        }
    }
    result.map(|_| ())
}

async fn try_login<R, C>(
    runner: &R,
    cloud: &C,
    registry: &str,
    registry_id: Option<&str>,
) -> Result<String>
where
    R: CommandRunner,
    C: CloudOperations,
{
    let credentials = cloud.registry_credentials(registry_id).await?;
    let spec = CommandSpec::new(
        "docker",
        ["login", "--username", credentials.username.as_str(), "--password-stdin", registry],
    )
    .with_stdin(credentials.password.clone())
    .with_timeout_secs(60);

    let output = runner.run(&spec).await?;
    if !output.success {
        anyhow::bail!("{}", output.combined().trim_end());
    }
    Ok(output.combined())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::testing::{FakeCloud, ScriptedRunner};
    use tempfile::TempDir;

    const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

    #[tokio::test]
    async fn test_login_pipes_password_on_stdin() {
        let dir = TempDir::new().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let runner = ScriptedRunner::new().on(
            "docker login",
            vec![CommandOutput::ok("Login Succeeded\n")],
        );

        login(&runner, &FakeCloud::new(), &diagnostics, REGISTRY, Some("123456789012"))
            .await
            .unwrap();

        let calls = runner.calls_matching("docker login");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].line(),
            format!("docker login --username AWS --password-stdin {REGISTRY}")
        );
        assert_eq!(calls[0].spec.stdin.as_deref(), Some("registry-password"));
        assert!(!calls[0].line().contains("registry-password"));
        assert_eq!(
            diagnostics.read(diagnostics::REGISTRY_LOGIN).as_deref(),
            Some("Login Succeeded\n")
        );
    }

    #[tokio::test]
    async fn test_token_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let runner = ScriptedRunner::new();
        let cloud = FakeCloud::new().registry_fails("AccessDeniedException: not authorized to perform ecr:GetAuthorizationToken");

        let err = login(&runner, &cloud, &diagnostics, REGISTRY, None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("AccessDeniedException"));
        assert_eq!(runner.count("docker login"), 0);
        let recorded = diagnostics.read(diagnostics::REGISTRY_LOGIN).unwrap();
        assert!(recorded.contains("failed"));
        assert!(recorded.contains("AccessDeniedException"));
    }

    #[tokio::test]
    async fn test_docker_login_failure_is_recorded() {
        let dir = TempDir::new().unwrap();
        let diagnostics = Diagnostics::new(dir.path());
        let runner = ScriptedRunner::new().on(
            "docker login",
            vec![CommandOutput::failed(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock")],
        );

        assert!(login(&runner, &FakeCloud::new(), &diagnostics, REGISTRY, None).await.is_err());
        assert!(diagnostics
            .read(diagnostics::REGISTRY_LOGIN)
            .unwrap()
            .contains("Cannot connect to the Docker daemon"));
    }
}
