//! Reverse-proxy configuration editing with atomic rollback.
//!
//! The save protocol: back up the live file, write the new content, run the
//! proxy's config test, reload on success, and restore the backup on any
//! failure. The proxy binary itself is hidden behind [`ProxyControl`] so
//! the rollback logic can be exercised against a stub and other proxies can
//! be swapped in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use stackd_utils::cmd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const RELOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// The two capabilities the save protocol needs from a proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Validate the config at `path`; `Err` carries the tool's stderr.
    async fn test(&self, path: &Path) -> Result<(), String>;
    /// Make the proxy pick up the config on disk.
    async fn reload(&self) -> Result<(), String>;
}

/// nginx implementation: `nginx -t`, `nginx -s reload`, with the service
/// manager as reload fallback when the binary cannot signal the daemon.
#[derive(Debug, Default)]
pub struct NginxControl;

#[async_trait]
impl ProxyControl for NginxControl {
    async fn test(&self, path: &Path) -> Result<(), String> {
        let path = path.to_string_lossy();
        let out = cmd::run_allowed("nginx", &["-t", "-c", &path], &[], TEST_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if out.success() {
            Ok(())
        } else {
            Err(out.stderr)
        }
    }

    async fn reload(&self) -> Result<(), String> {
        match cmd::run_allowed("nginx", &["-s", "reload"], &[], RELOAD_TIMEOUT).await {
            Ok(out) if out.success() => return Ok(()),
            Ok(out) => warn!("nginx -s reload failed: {}", out.stderr.trim()),
            Err(e) => warn!("nginx -s reload unavailable: {e:#}"),
        }
        let out = cmd::run_allowed("systemctl", &["reload", "nginx"], &[], RELOAD_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        if out.success() {
            Ok(())
        } else {
            Err(out.stderr)
        }
    }
}

/// Reported to the client when a save was rolled back.
#[derive(Debug, Serialize)]
pub struct SaveFailure {
    pub phase: &'static str,
    pub stderr: String,
}

#[derive(Debug)]
pub enum SaveError {
    /// Test or reload failed; the previous config is back in place.
    RolledBack(SaveFailure),
    Io(anyhow::Error),
}

pub struct ProxyEditor {
    path: PathBuf,
    control: std::sync::Arc<dyn ProxyControl>,
}

impl ProxyEditor {
    #[must_use]
    pub fn new(path: PathBuf, control: std::sync::Arc<dyn ProxyControl>) -> Self {
        Self { path, control }
    }

    /// Current live config; empty when the file does not exist yet.
    pub async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    /// Write, test, reload; the previous content is restored byte-for-byte
    /// when test or reload fails.
    pub async fn save(&self, content: &str) -> Result<(), SaveError> {
        let backup = self.make_backup().await.map_err(SaveError::Io)?;

        if let Err(e) = tokio::fs::write(&self.path, content).await {
            self.restore(&backup).await;
            return Err(SaveError::Io(
                anyhow::anyhow!("writing {}: {e}", self.path.display()),
            ));
        }

        if let Err(stderr) = self.control.test(&self.path).await {
            warn!("proxy config test failed, rolling back");
            self.restore(&backup).await;
            self.discard(&backup).await;
            return Err(SaveError::RolledBack(SaveFailure {
                phase: "test",
                stderr,
            }));
        }

        if let Err(stderr) = self.control.reload().await {
            warn!("proxy reload failed, rolling back");
            self.restore(&backup).await;
            self.discard(&backup).await;
            return Err(SaveError::RolledBack(SaveFailure {
                phase: "reload",
                stderr,
            }));
        }

        self.discard(&backup).await;
        info!("proxy config saved and reloaded");
        Ok(())
    }

    /// Copy the live file to a timestamped sibling. `None` when there is no
    /// live file yet.
    async fn make_backup(&self) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "proxy.conf".to_string());
        let backup = self.path.with_file_name(format!("{name}.{ts}.bak"));
        tokio::fs::copy(&self.path, &backup)
            .await
            .with_context(|| format!("backing up to {}", backup.display()))?;
        Ok(Some(backup))
    }

    async fn restore(&self, backup: &Option<PathBuf>) {
        let result = match backup {
            Some(backup) => tokio::fs::copy(backup, &self.path).await.map(|_| ()),
            // No previous config existed: undo means removing the write.
            None => tokio::fs::remove_file(&self.path).await,
        };
        if let Err(e) = result {
            warn!("failed to restore {}: {e}", self.path.display());
        }
    }

    async fn discard(&self, backup: &Option<PathBuf>) {
        if let Some(backup) = backup {
            if let Err(e) = tokio::fs::remove_file(backup).await {
                warn!("failed to remove backup {}: {e}", backup.display());
            }
        }
    }
}
