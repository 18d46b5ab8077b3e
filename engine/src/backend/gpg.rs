//! GnuPG signature backend
//!
//! Runs `gpg --verify` with `--status-fd 1` against a single keyring file and
//! `gpg --recv-keys` for key retrieval.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SignatureBackend;
use crate::error::{Result, TrustError};

/// GnuPG configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpgConfig {
    /// gpg binary name or path
    #[serde(default = "default_program")]
    pub program: String,
    /// Key server used for `--recv-keys`
    #[serde(default = "default_keyserver")]
    pub keyserver: String,
    /// Persistent keyring; a temporary keyring is used when unset
    #[serde(default)]
    pub keyring: Option<PathBuf>,
    /// Download missing public keys into the temporary keyring
    #[serde(default = "default_true")]
    pub allow_key_download: bool,
}

fn default_program() -> String {
    "gpg".to_string()
}

fn default_keyserver() -> String {
    "hkps://keys.openpgp.org".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            keyserver: default_keyserver(),
            keyring: None,
            allow_key_download: true,
        }
    }
}

/// `gpg` command line backend
#[derive(Debug, Clone)]
pub struct GpgBackend {
    program: PathBuf,
    keyserver: String,
}

impl GpgBackend {
    /// Locate the configured gpg binary
    pub fn new(config: &GpgConfig) -> Result<Self> {
        let program = which::which(&config.program).map_err(|e| TrustError::Backend {
            reason: format!("{} not found: {}", config.program, e),
        })?;
        debug!(program = %program.display(), "Using gpg binary");
        Ok(Self::with_program(program, config.keyserver.clone()))
    }

    pub fn with_program(program: impl Into<PathBuf>, keyserver: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            keyserver: keyserver.into(),
        }
    }

    fn keyring_args(keyring: &Path) -> Vec<OsString> {
        vec![
            "--batch".into(),
            "--no-tty".into(),
            "--no-default-keyring".into(),
            "--keyring".into(),
            keyring.into(),
        ]
    }

    fn verify_args(payload: &Path, signature: &Path, keyring: &Path) -> Vec<OsString> {
        let mut args = Self::keyring_args(keyring);
        args.push("--status-fd".into());
        args.push("1".into());
        args.push("--verify".into());
        args.push(signature.into());
        args.push(payload.into());
        args
    }

    fn recv_key_args(&self, keyring: &Path, key_id: &str) -> Vec<OsString> {
        let mut args = Self::keyring_args(keyring);
        args.push("--keyserver".into());
        args.push(OsString::from(&self.keyserver));
        args.push("--recv-keys".into());
        args.push(key_id.into());
        args
    }

    fn spawn_error(&self, err: std::io::Error) -> TrustError {
        TrustError::Backend {
            reason: format!("failed to run {}: {}", self.program.display(), err),
        }
    }
}

/// Status lines from gpg's status file descriptor output
fn status_lines(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

impl SignatureBackend for GpgBackend {
    fn check(&self, payload: &Path, signature: &Path, keyring: &Path) -> Result<Vec<String>> {
        // A bad or unverifiable signature exits non-zero; only the status lines matter
        let output = Command::new(&self.program)
            .args(Self::verify_args(payload, signature, keyring))
            .output()
            .map_err(|e| self.spawn_error(e))?;

        debug!(
            exit_code = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "gpg --verify finished"
        );

        Ok(status_lines(&output.stdout))
    }

    fn download_key(&self, keyring: &Path, key_id: &str) -> Result<()> {
        let output = Command::new(&self.program)
            .args(self.recv_key_args(keyring, key_id))
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(TrustError::KeyDownload {
                key_id: key_id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
