//! Service lifecycle: start/stop/restart/status through the container CLI
//! or project-local helper scripts.
//!
//! Every operation is scoped by `(project, service)`. Before the CLI is
//! invoked the service enters a transient state (`restarting`/`stopping`)
//! that the status aggregator reports until the terminal state is observed
//! again, so clients see progress even while `docker compose ps` still
//! returns the pre-operation answer.

use crate::config::ServerConfig;
use crate::discovery::ProjectRef;
use crate::error::ApiError;
use stackd_core::mapper::ServiceStatus;
use stackd_utils::cmd::{self, CmdOutput};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const RESTART_SCRIPT: &str = "restart.sh";
pub const STOP_SCRIPT: &str = "stop.sh";

const OP_TIMEOUT: Duration = Duration::from_secs(20);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait between CLI return and the settle re-query.
const SETTLE_DWELL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientState {
    Restarting,
    Stopping,
}

impl TransientState {
    #[must_use]
    pub fn as_status(self) -> ServiceStatus {
        match self {
            Self::Restarting => ServiceStatus::Restarting,
            Self::Stopping => ServiceStatus::Stopping,
        }
    }

    /// Terminal state that clears the transient entry.
    fn expected_running(self) -> bool {
        matches!(self, Self::Restarting)
    }
}

/// Derive the compose project-name override from the folder name: its
/// lowercase alphanumeric tail. Two folders can collapse to the same key;
/// the reconciler detects that and the driver refuses to touch either.
#[must_use]
pub fn project_key(folder_name: &str) -> String {
    folder_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug)]
pub struct LifecycleDriver {
    config: Arc<ServerConfig>,
    transient: Mutex<HashMap<(String, String), TransientState>>,
    /// Relative paths of projects whose name key collides with another
    /// project; refreshed by the reconciler each tick.
    collisions: RwLock<HashSet<String>>,
}

impl LifecycleDriver {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            transient: Mutex::new(HashMap::new()),
            collisions: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_collisions(&self, collided: HashSet<String>) {
        *self.collisions.write().expect("collisions lock") = collided;
    }

    fn guard_collision(&self, project: &ProjectRef) -> Result<(), ApiError> {
        if self
            .collisions
            .read()
            .expect("collisions lock")
            .contains(&project.rel)
        {
            return Err(ApiError::Conflict(format!(
                "Project name '{}' collides with another project; rename one of them",
                project_key(project.folder_name())
            )));
        }
        Ok(())
    }

    pub fn transient_for(&self, rel: &str, service: &str) -> Option<TransientState> {
        self.transient
            .lock()
            .expect("transient lock")
            .get(&(rel.to_string(), service.to_string()))
            .copied()
    }

    fn set_transient(&self, project: &ProjectRef, service: &str, state: TransientState) {
        self.transient
            .lock()
            .expect("transient lock")
            .insert((project.rel.clone(), service.to_string()), state);
    }

    fn clear_transient(&self, rel: &str, service: &str) {
        self.transient
            .lock()
            .expect("transient lock")
            .remove(&(rel.to_string(), service.to_string()));
    }

    /// Restart (or start) a service. Prefers the project-local restart
    /// script, falls back to `docker compose restart`.
    pub async fn restart(
        self: &Arc<Self>,
        project: &ProjectRef,
        service: &str,
    ) -> Result<CmdOutput, ApiError> {
        self.run_lifecycle(project, service, TransientState::Restarting)
            .await
    }

    /// Stop a service, preferring the project-local stop script.
    pub async fn stop(
        self: &Arc<Self>,
        project: &ProjectRef,
        service: &str,
    ) -> Result<CmdOutput, ApiError> {
        self.run_lifecycle(project, service, TransientState::Stopping)
            .await
    }

    async fn run_lifecycle(
        self: &Arc<Self>,
        project: &ProjectRef,
        service: &str,
        state: TransientState,
    ) -> Result<CmdOutput, ApiError> {
        self.guard_collision(project)?;
        self.set_transient(project, service, state);

        let result = self.invoke(project, service, state).await;
        self.spawn_settle(project, service, state);
        result
    }

    async fn invoke(
        &self,
        project: &ProjectRef,
        service: &str,
        state: TransientState,
    ) -> Result<CmdOutput, ApiError> {
        let script_name = match state {
            TransientState::Restarting => RESTART_SCRIPT,
            TransientState::Stopping => STOP_SCRIPT,
        };
        let verb = match state {
            TransientState::Restarting => "restart",
            TransientState::Stopping => "stop",
        };

        let key = project_key(project.folder_name());
        let envs = [("COMPOSE_PROJECT_NAME", key.as_str())];

        let script = project.dir.join(script_name);
        let out = if cmd::is_executable(&script) {
            cmd::run_script(&self.config.root, &script, &[service], &envs, OP_TIMEOUT)
                .await
                .map_err(ApiError::Internal)?
        } else {
            self.compose(project, &[verb, service], OP_TIMEOUT)
                .await
                .map_err(ApiError::Internal)?
        };

        if out.success() {
            return Ok(out);
        }

        // A leftover container holding the name blocks compose; remove it
        // by id and retry once.
        if let Some(id) = extract_conflict_id(&out.stderr) {
            warn!("removing conflicting container {id} for {}/{service}", project.rel);
            let rm = cmd::run_allowed("docker", &["rm", "-f", &id], &[], STATUS_TIMEOUT)
                .await
                .map_err(ApiError::Internal)?;
            if rm.success() {
                let retry = self
                    .compose(project, &[verb, service], OP_TIMEOUT)
                    .await
                    .map_err(ApiError::Internal)?;
                if retry.success() {
                    return Ok(retry);
                }
                return Err(ApiError::external(
                    format!("{verb} failed for {}/{service}", project.rel),
                    "docker",
                    &["compose", verb, service],
                    &retry,
                ));
            }
        }

        Err(ApiError::external(
            format!("{verb} failed for {}/{service}", project.rel),
            "docker",
            &["compose", verb, service],
            &out,
        ))
    }

    /// Enter a transient state without invoking the CLI; used by the PTY
    /// multiplexer, which runs the command itself so the user sees output.
    pub fn begin_transition(
        &self,
        project: &ProjectRef,
        service: &str,
        state: TransientState,
    ) -> Result<(), ApiError> {
        self.guard_collision(project)?;
        self.set_transient(project, service, state);
        Ok(())
    }

    /// Schedule the dwell-and-verify that clears a transient entry; the
    /// counterpart to [`Self::begin_transition`].
    pub fn settle_transition(
        self: &Arc<Self>,
        project: &ProjectRef,
        service: &str,
        state: TransientState,
    ) {
        self.spawn_settle(project, service, state);
    }

    /// Container id of a service's running container, via `ps -q`.
    pub async fn container_id(
        &self,
        project: &ProjectRef,
        service: &str,
    ) -> anyhow::Result<Option<String>> {
        let out = self
            .compose(project, &["ps", "-q", service], STATUS_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!("docker compose ps -q failed: {}", out.stderr.trim());
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    /// Recent log lines for a service, bounded by the status timeout.
    pub async fn log_history(
        &self,
        project: &ProjectRef,
        service: &str,
        lines: u32,
    ) -> anyhow::Result<String> {
        let tail = lines.to_string();
        let out = self
            .compose(
                project,
                &["logs", "--tail", &tail, "--no-color", service],
                STATUS_TIMEOUT,
            )
            .await?;
        Ok(out.stdout)
    }

    /// Service names currently reported running for this project.
    pub async fn running_services(&self, project: &ProjectRef) -> anyhow::Result<HashSet<String>> {
        let out = self
            .compose(
                project,
                &["ps", "--services", "--filter", "status=running"],
                STATUS_TIMEOUT,
            )
            .await?;
        if !out.success() {
            anyhow::bail!(
                "docker compose ps failed for {}: {}",
                project.rel,
                out.stderr.trim()
            );
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Live status for one service, transient state taking precedence.
    pub async fn service_status(&self, project: &ProjectRef, service: &str) -> ServiceStatus {
        if let Some(state) = self.transient_for(&project.rel, service) {
            return state.as_status();
        }
        match self.running_services(project).await {
            Ok(running) if running.contains(service) => ServiceStatus::Running,
            Ok(_) => ServiceStatus::Stopped,
            Err(e) => {
                debug!("status query failed for {}: {e:#}", project.rel);
                ServiceStatus::Unknown
            }
        }
    }

    async fn compose(
        &self,
        project: &ProjectRef,
        args: &[&str],
        timeout: Duration,
    ) -> anyhow::Result<CmdOutput> {
        let manifest = self.config.manifest_path(&project.dir);
        let manifest = manifest.to_string_lossy();
        let key = project_key(project.folder_name());
        let envs = [("COMPOSE_PROJECT_NAME", key.as_str())];
        let mut full: Vec<&str> = vec!["compose", "-f", &manifest];
        full.extend_from_slice(args);
        cmd::run_allowed("docker", &full, &envs, timeout).await
    }

    /// After the CLI returns, wait the dwell, re-query, and clear the
    /// transient entry once the expected terminal state is observed;
    /// otherwise clear it on the following poll.
    fn spawn_settle(self: &Arc<Self>, project: &ProjectRef, service: &str, state: TransientState) {
        let driver = Arc::clone(self);
        let project = project.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DWELL).await;
            let settled = match driver.running_services(&project).await {
                Ok(running) => running.contains(&service) == state.expected_running(),
                Err(_) => false,
            };
            if !settled {
                tokio::time::sleep(SETTLE_DWELL).await;
            }
            driver.clear_transient(&project.rel, &service);
        });
    }
}

/// Pull the container id out of a "name already in use" diagnostic.
fn extract_conflict_id(stderr: &str) -> Option<String> {
    if !stderr.contains("already in use") {
        return None;
    }
    let idx = stderr.find("by container")?;
    let rest = stderr[idx + "by container".len()..]
        .trim_start()
        .trim_start_matches('"');
    let id: String = rest
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect();
    (!id.is_empty()).then_some(id)
}
