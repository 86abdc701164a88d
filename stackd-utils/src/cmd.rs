//! External command execution.
//!
//! The daemon shells out for lifecycle and proxy operations only. Every
//! invocation goes through [`run_allowed`], which enforces the allowlist
//! (container CLI, reverse-proxy binary, service manager) and a hard
//! timeout. Project-local helper scripts are the one exception; they are
//! run via [`run_script`], which requires the script to live under a
//! caller-supplied root and be executable.

use anyhow::{bail, Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Programs the daemon may invoke directly.
pub const ALLOWED_COMMANDS: &[&str] = &["docker", "nginx", "systemctl"];

/// Captured result of a finished command. Non-zero exit is not an error at
/// this layer; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

async fn run(mut command: Command, label: &str, timeout: Duration) -> Result<CmdOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running {label} (timeout {:?})", timeout);
    let child = command
        .spawn()
        .with_context(|| format!("spawning {label}"))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("{label} timed out after {timeout:?}"))?
        .with_context(|| format!("waiting for {label}"))?;

    Ok(CmdOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run an allowlisted program with the given arguments and extra
/// environment. Refuses anything not in [`ALLOWED_COMMANDS`].
pub async fn run_allowed(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CmdOutput> {
    if !ALLOWED_COMMANDS.contains(&program) {
        bail!("command not allowed: {program}");
    }
    let mut command = Command::new(program);
    command.args(args);
    for (k, v) in envs {
        command.env(k, v);
    }
    let label = format!("{program} {}", args.join(" "));
    run(command, &label, timeout).await
}

/// Run a project-local helper script. The script must resolve under
/// `root` and carry an executable bit.
pub async fn run_script(
    root: &Path,
    script: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
    timeout: Duration,
) -> Result<CmdOutput> {
    let resolved = script
        .canonicalize()
        .with_context(|| format!("resolving {}", script.display()))?;
    let root = root
        .canonicalize()
        .with_context(|| format!("resolving {}", root.display()))?;
    if !resolved.starts_with(&root) {
        bail!("script outside workspace: {}", script.display());
    }
    if !is_executable(&resolved) {
        bail!("script is not executable: {}", script.display());
    }

    let mut command = Command::new(&resolved);
    command.args(args);
    if let Some(dir) = resolved.parent() {
        command.current_dir(dir);
    }
    for (k, v) in envs {
        command.env(k, v);
    }
    let label = resolved.display().to_string();
    run(command, &label, timeout).await
}

/// Whether the file at `path` has any executable bit set.
#[must_use]
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
