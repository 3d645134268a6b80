//! NGINX reverse proxy with TLS termination
//!
//! The configuration is a typed [`ProxySite`] rendered through an embedded
//! tera template, so values never get spliced into the file by hand.

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::diagnostics::{self, Diagnostics};
use crate::error::BootstrapError;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tera::Tera;
use tracing::{info, warn};

const TEMPLATE_NAME: &str = "nginx.conf";
const TEMPLATE: &str = include_str!("../templates/nginx.conf.tera");

/// Characters with structural meaning in an nginx configuration
const FORBIDDEN: &[char] = &[';', '{', '}', '"', '\'', '$', '#'];

/// Check that `value` is a single non-empty token that can be spliced into
/// an nginx directive without changing its structure.
pub fn check_directive_value(value: &str) -> Result<()> {
    if value.is_empty() {
        anyhow::bail!("cannot be empty");
    }
    if let Some(bad) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        anyhow::bail!("contains forbidden character: {bad:?}");
    }
    if value.chars().any(char::is_whitespace) {
        anyhow::bail!("must not contain whitespace");
    }
    Ok(())
}

/// Cross-origin headers applied to every response
#[derive(Debug, Clone, Serialize)]
pub struct CorsPolicy {
    pub allow_origin: String,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub max_age_secs: u32,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allow_headers: ["Authorization", "Content-Type", "Accept", "Origin", "X-Requested-With"]
                .map(String::from)
                .to_vec(),
            max_age_secs: 86400,
        }
    }
}

/// One TLS-terminating site in front of the local API
#[derive(Debug, Clone, Serialize)]
pub struct ProxySite {
    pub server_name: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub tls_protocols: Vec<String>,
    pub client_max_body_size: String,
    pub cors: CorsPolicy,
}

impl ProxySite {
    /// Site proxying to `127.0.0.1:<upstream_port>` with TLS 1.2/1.3
    pub fn new(server_name: &str, upstream_port: u16, cert_path: &Path, key_path: &Path) -> Self {
        Self {
            server_name: server_name.to_string(),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port,
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            tls_protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
            client_max_body_size: "10m".to_string(),
            cors: CorsPolicy::default(),
        }
    }

    /// Reject values that would change the structure of the rendered file
    fn validate(&self) -> Result<()> {
        let mut values: Vec<(&str, String)> = vec![
            ("server_name", self.server_name.clone()),
            ("upstream_host", self.upstream_host.clone()),
            ("cert_path", self.cert_path.display().to_string()),
            ("key_path", self.key_path.display().to_string()),
            ("client_max_body_size", self.client_max_body_size.clone()),
            ("cors.allow_origin", self.cors.allow_origin.clone()),
        ];
        values.extend(self.tls_protocols.iter().map(|p| ("tls_protocols", p.clone())));
        values.extend(self.cors.allow_methods.iter().map(|m| ("cors.allow_methods", m.clone())));
        values.extend(self.cors.allow_headers.iter().map(|h| ("cors.allow_headers", h.clone())));

        for (field, value) in values {
            check_directive_value(&value).with_context(|| format!("invalid {field}"))?;
        }
        if self.upstream_port == 0 {
            anyhow::bail!("upstream_port must be non-zero");
        }
        Ok(())
    }

    /// Render the full nginx.conf
    pub fn render(&self) -> Result<String> {
        self.validate()?;

        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, TEMPLATE)
            .context("Failed to load nginx template")?;
        let context =
            tera::Context::from_serialize(self).context("Failed to build template context")?;
        tera.render(TEMPLATE_NAME, &context)
            .context("Failed to render nginx configuration")
    }
}

/// Write the rendered configuration, creating parent directories
pub fn write_config(path: &Path, rendered: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, rendered).with_context(|| format!("Failed to write {}", path.display()))
}

/// `nginx -t -c <conf_path>`, output recorded in the proxy config test
/// diagnostic
pub async fn test_config<R: CommandRunner>(
    runner: &R,
    diagnostics: &Diagnostics,
    conf_path: &Path,
) -> Result<CommandOutput> {
    let conf = conf_path.display().to_string();
    let output = runner
        .run(&CommandSpec::new("nginx", ["-t", "-c", conf.as_str()]).with_timeout_secs(30))
        .await?;
    diagnostics.write(diagnostics::PROXY_CONFIG_TEST, &output.combined());
    Ok(output)
}

/// Sibling of `conf_path` the candidate configuration is tested at
fn staging_path(conf_path: &Path) -> PathBuf {
    let mut name = conf_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "nginx.conf".into());
    name.push(".staged");
    conf_path.with_file_name(name)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove staged nginx configuration");
    }
}

/// `systemctl status nginx`, output recorded in the proxy status diagnostic
pub async fn capture_status<R: CommandRunner>(runner: &R, diagnostics: &Diagnostics) {
    let spec = CommandSpec::new("systemctl", ["status", "nginx", "--no-pager"]).with_timeout_secs(30);
    match runner.run(&spec).await {
        Ok(output) => {
            diagnostics.write(diagnostics::PROXY_STATUS, &output.combined());
        }
        Err(e) => {
            warn!(error = %e, "Failed to query nginx status");
            diagnostics.write(diagnostics::PROXY_STATUS, &format!("{e:#}\n"));
        }
    }
}

/// Render the configuration to a staging file next to `conf_path`, test it
/// there and move it into place only once nginx accepts it. Then enable and
/// restart the service.
pub async fn install<R: CommandRunner>(
    runner: &R,
    diagnostics: &Diagnostics,
    site: &ProxySite,
    conf_path: &Path,
) -> Result<(), BootstrapError> {
    let rendered = site
        .render()
        .map_err(|e| BootstrapError::ProxyConfigInvalid(format!("{e:#}")))?;
    let staged = staging_path(conf_path);
    write_config(&staged, &rendered)
        .map_err(|e| BootstrapError::ProxyConfigInvalid(format!("{e:#}")))?;

    let tested = match test_config(runner, diagnostics, &staged).await {
        Ok(output) => output,
        Err(e) => {
            discard(&staged);
            return Err(BootstrapError::ProxyConfigInvalid(format!("{e:#}")));
        }
    };
    if !tested.success {
        discard(&staged);
        return Err(BootstrapError::ProxyConfigInvalid(tested.summary()));
    }

    fs::rename(&staged, conf_path).map_err(|e| {
        discard(&staged);
        BootstrapError::ProxyConfigInvalid(format!(
            "Failed to move {} into place: {e}",
            staged.display()
        ))
    })?;
    info!(path = %conf_path.display(), server_name = %site.server_name, "Wrote nginx configuration");

    for args in [["enable", "nginx"], ["restart", "nginx"]] {
        let spec = CommandSpec::new("systemctl", args).with_timeout_secs(60);
        let output = runner
            .run(&spec)
            .await
            .map_err(|e| BootstrapError::ProxyService(format!("{e:#}")))?;
        if !output.success {
            return Err(BootstrapError::ProxyService(format!(
                "{}: {}",
                spec.display(),
                output.summary()
            )));
        }
    }

    info!("nginx enabled and running");
    Ok(())
}
