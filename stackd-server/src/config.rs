//! Daemon configuration, assembled from environment variables.

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Helper scripts whose presence marks a directory as a project, in the
/// order (connect, restart, stop).
pub const HELPER_SCRIPTS: [&str; 3] = ["connect.sh", "restart.sh", "stop.sh"];

/// Name of the protected template project.
pub const TEMPLATE_PROJECT: &str = "template";

/// Per-project directory holding auxiliary config files served over the
/// config CRUD endpoints.
pub const CONFIG_DIR: &str = "config";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Workspace root containing the project directories.
    pub root: PathBuf,
    pub bind: IpAddr,
    pub http_port: u16,
    pub https_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Admin password; login is disabled when unset.
    pub password: Option<String>,
    pub cors_origins: Vec<String>,
    /// Network name that is never pruned from a manifest's top level.
    pub default_network: String,
    /// Fallback /24 base for IP allocation when a network carries no hint.
    pub subnet_base: Ipv4Addr,
    /// Manifest filename that identifies a project.
    pub compose_file: String,
    /// Where the derived index is persisted.
    pub mapper_file: PathBuf,
    pub nginx_conf: PathBuf,
    pub access_logs: Vec<PathBuf>,
    /// Static UI directory; API-only when unset.
    pub ui_dir: Option<PathBuf>,
    pub reconcile_interval: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let root = PathBuf::from(env_or("STACKD_ROOT", "."));
        let root = root
            .canonicalize()
            .with_context(|| format!("workspace root {}", root.display()))?;

        let mapper_file = env_opt("STACKD_MAPPER_FILE")
            .map_or_else(|| root.join("mapper.json"), PathBuf::from);

        let access_logs = env_or("STACKD_ACCESS_LOGS", "/var/log/nginx/access.log")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(Self {
            root,
            bind: env_or("STACKD_BIND", "127.0.0.1")
                .parse()
                .context("STACKD_BIND")?,
            http_port: env_or("STACKD_HTTP_PORT", "8080")
                .parse()
                .context("STACKD_HTTP_PORT")?,
            https_port: env_opt("STACKD_HTTPS_PORT")
                .map(|v| v.parse().context("STACKD_HTTPS_PORT"))
                .transpose()?,
            tls_cert: env_opt("STACKD_TLS_CERT").map(PathBuf::from),
            tls_key: env_opt("STACKD_TLS_KEY").map(PathBuf::from),
            password: env_opt("STACKD_PASSWORD"),
            cors_origins: env_opt("STACKD_CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            default_network: env_or("STACKD_DEFAULT_NETWORK", "stackd-net"),
            subnet_base: env_or("STACKD_SUBNET_BASE", "172.28.0")
                .split('.')
                .chain(std::iter::repeat("0"))
                .take(4)
                .collect::<Vec<_>>()
                .join(".")
                .parse()
                .context("STACKD_SUBNET_BASE")?,
            compose_file: env_or("STACKD_COMPOSE_FILE", "docker-compose.yml"),
            mapper_file,
            nginx_conf: PathBuf::from(env_or("STACKD_NGINX_CONF", "/etc/nginx/conf.d/stackd.conf")),
            access_logs,
            ui_dir: env_opt("STACKD_UI_DIR").map(PathBuf::from),
            reconcile_interval: Duration::from_secs(
                env_or("STACKD_RECONCILE_SECS", "5")
                    .parse()
                    .context("STACKD_RECONCILE_SECS")?,
            ),
        })
    }

    /// Manifest path for a project directory.
    #[must_use]
    pub fn manifest_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.compose_file)
    }

    /// Project directory for a workspace-relative path, traversal-checked.
    pub fn project_dir(&self, rel: &str) -> Result<PathBuf> {
        stackd_utils::fs::safe_join(&self.root, rel)
    }
}

#[cfg(test)]
impl ServerConfig {
    /// A config rooted at a scratch directory, for unit tests.
    pub(crate) fn for_tests(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port: 0,
            https_port: None,
            tls_cert: None,
            tls_key: None,
            password: None,
            cors_origins: Vec::new(),
            default_network: "stackd-net".into(),
            subnet_base: Ipv4Addr::new(172, 28, 0, 0),
            compose_file: "docker-compose.yml".into(),
            mapper_file: root.join("mapper.json"),
            nginx_conf: root.join("nginx.conf"),
            access_logs: Vec::new(),
            ui_dir: None,
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_base_padding() {
        // Three octets pad out to a full address for parsing.
        let padded: Ipv4Addr = "172.28.0"
            .split('.')
            .chain(std::iter::repeat("0"))
            .take(4)
            .collect::<Vec<_>>()
            .join(".")
            .parse()
            .unwrap();
        assert_eq!(padded, Ipv4Addr::new(172, 28, 0, 0));
    }
}
