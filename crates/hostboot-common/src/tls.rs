//! Self-signed certificate provisioning for the TLS reverse proxy
//!
//! The proxy terminates TLS with a self-signed certificate generated on the
//! instance. Alongside the PEM files a small JSON metadata file records the
//! validity window so that later runs can reuse a still-valid certificate
//! and rotate one that is close to expiry.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DnType, KeyPair, RsaKeySize};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";
const METADATA_FILE: &str = "server.json";

/// Private key algorithm for the generated certificate
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum KeyAlgorithm {
    /// RSA 2048-bit key, SHA-256 signature
    #[default]
    Rsa2048,
    /// ECDSA P-256 key, SHA-256 signature
    EcdsaP256,
}

impl KeyAlgorithm {
    fn generate(self) -> Result<KeyPair> {
        match self {
            Self::Rsa2048 => {
                KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
                    .context("Failed to generate RSA-2048 key pair")
            }
            Self::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .context("Failed to generate ECDSA P-256 key pair"),
        }
    }
}

/// PEM-encoded certificate and private key pair
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Parameters for a self-signed certificate
#[derive(Debug, Clone)]
pub struct CertRequest {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// Validity period in days
    pub validity_days: u32,
    pub key_algorithm: KeyAlgorithm,
}

impl CertRequest {
    /// Build a request for an NGINX `server_name`.
    ///
    /// The catch-all name `_` maps to `localhost`; any other name is added
    /// next to `localhost` as a SAN.
    pub fn for_server_name(server_name: &str, validity_days: u32, key_algorithm: KeyAlgorithm) -> Self {
        let mut dns_names = vec!["localhost".to_string()];
        let common_name = if server_name.is_empty() || server_name == "_" {
            "localhost".to_string()
        } else {
            dns_names.push(server_name.to_string());
            server_name.to_string()
        };
        Self {
            common_name,
            dns_names,
            validity_days,
            key_algorithm,
        }
    }
}

/// Validity window and identity of a generated certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertMetadata {
    pub common_name: String,
    pub key_algorithm: KeyAlgorithm,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertMetadata {
    /// Whole days left until expiry (negative once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Whether the certificate expires within `days` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, days: u32) -> bool {
        self.not_after - now <= Duration::days(i64::from(days))
    }

    /// Whether this certificate was issued for the same name and key type
    pub fn matches(&self, request: &CertRequest) -> bool {
        self.common_name == request.common_name && self.key_algorithm == request.key_algorithm
    }
}

fn to_offset_date_time(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .with_context(|| format!("Timestamp out of range: {at}"))
}

/// Generate a self-signed certificate valid from `now` for the requested days.
pub fn generate_self_signed(
    request: &CertRequest,
    now: DateTime<Utc>,
) -> Result<(CertKeyPair, CertMetadata)> {
    let mut params = CertificateParams::new(request.dns_names.clone())
        .context("Invalid subject alternative names")?;
    params
        .distinguished_name
        .push(DnType::CommonName, request.common_name.as_str());
    params
        .distinguished_name
        .push(DnType::OrganizationName, "hostboot");

    let not_before = now;
    let not_after = now + Duration::days(i64::from(request.validity_days));
    params.not_before = to_offset_date_time(not_before)?;
    params.not_after = to_offset_date_time(not_after)?;

    let key_pair = request.key_algorithm.generate()?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign certificate")?;

    let metadata = CertMetadata {
        common_name: request.common_name.clone(),
        key_algorithm: request.key_algorithm,
        not_before,
        not_after,
    };

    Ok((
        CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        },
        metadata,
    ))
}

/// File locations of a certificate inside its directory
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub metadata: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            metadata: dir.join(METADATA_FILE),
        }
    }

    /// Read the metadata file, returning `None` if any of the three files is
    /// missing or the metadata cannot be parsed.
    pub fn load_metadata(&self) -> Option<CertMetadata> {
        if !self.cert.exists() || !self.key.exists() {
            return None;
        }
        let content = fs::read_to_string(&self.metadata).ok()?;
        match serde_json::from_str(&content) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!(path = %self.metadata.display(), error = %e, "Unreadable certificate metadata");
                None
            }
        }
    }

    fn write(&self, pair: &CertKeyPair, metadata: &CertMetadata) -> Result<()> {
        fs::write(&self.cert, &pair.cert_pem)
            .with_context(|| format!("Failed to write {}", self.cert.display()))?;
        write_private(&self.key, &pair.key_pem)?;
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&self.metadata, json)
            .with_context(|| format!("Failed to write {}", self.metadata.display()))?;
        Ok(())
    }
}

/// Write a file readable by its owner only. New files are created 0600;
/// an existing file keeps its inode, so its mode is reset as well.
#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// What [`ensure_certificate`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CertAction {
    /// No usable certificate existed
    Generated,
    /// The existing certificate was inside the renewal window or was
    /// issued for a different name or key algorithm
    Renewed,
    /// The existing certificate is still valid
    Reused,
}

/// Make sure `dir` holds a certificate for `request` that is valid for
/// longer than `renew_before_days`, generating or rotating it as needed.
pub fn ensure_certificate(
    dir: &Path,
    request: &CertRequest,
    renew_before_days: u32,
    now: DateTime<Utc>,
) -> Result<(CertAction, CertMetadata)> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let paths = CertPaths::in_dir(dir);

    let action = match paths.load_metadata() {
        Some(existing) if !existing.matches(request) => {
            info!(
                common_name = %existing.common_name,
                algorithm = %existing.key_algorithm,
                requested_name = %request.common_name,
                requested_algorithm = %request.key_algorithm,
                "Certificate issued for a different name or key, rotating"
            );
            CertAction::Renewed
        }
        Some(existing) if !existing.expires_within(now, renew_before_days) => {
            info!(
                common_name = %existing.common_name,
                days_remaining = existing.days_remaining(now),
                "Reusing existing certificate"
            );
            return Ok((CertAction::Reused, existing));
        }
        Some(existing) => {
            info!(
                common_name = %existing.common_name,
                not_after = %existing.not_after,
                renew_before_days,
                "Certificate inside renewal window, rotating"
            );
            CertAction::Renewed
        }
        None => CertAction::Generated,
    };

    let (pair, metadata) = generate_self_signed(request, now)?;
    paths.write(&pair, &metadata)?;

    info!(
        action = %action,
        common_name = %metadata.common_name,
        algorithm = %metadata.key_algorithm,
        not_after = %metadata.not_after,
        dir = %dir.display(),
        "Certificate written"
    );
    Ok((action, metadata))
}
