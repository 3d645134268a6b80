//! Plain-text diagnostic artifacts
//!
//! Each capture lands in its own file under the diagnostics directory so an
//! operator can inspect a half-provisioned host after the fact. Writing a
//! diagnostic never fails the bootstrap.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const IDENTITY_CHECK: &str = "identity-check.log";
pub const REGISTRY_LOGIN: &str = "registry-login.log";
pub const CONTAINER_LIST: &str = "docker-ps.log";
pub const CONTAINER_LOGS: &str = "docker-logs.log";
pub const PROXY_CONFIG_TEST: &str = "nginx-test.log";
pub const PROXY_STATUS: &str = "nginx-status.log";
pub const COMPLETION_MARKER: &str = "bootstrap-complete.txt";
pub const REPORT: &str = "bootstrap-report.json";

/// Writes diagnostic files into one directory
#[derive(Debug, Clone)]
pub struct Diagnostics {
    dir: PathBuf,
}

impl Diagnostics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `content` to `name`, logging instead of failing on error.
    /// Returns whether the file was written.
    pub fn write(&self, name: &str, content: &str) -> bool {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to create diagnostics directory");
            return false;
        }
        let path = self.path(name);
        match fs::write(&path, content) {
            Ok(()) => {
                debug!(path = %path.display(), bytes = content.len(), "Wrote diagnostic");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write diagnostic");
                false
            }
        }
    }

    /// Read a diagnostic back, if present
    pub fn read(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.path(name)).ok()
    }
}
