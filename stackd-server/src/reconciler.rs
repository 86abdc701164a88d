//! The reconciliation engine.
//!
//! A tick walks the workspace, takes a census of every host port and static
//! IP across all manifests, rewrites only the entries whose value appears
//! more than once, and emits the derived mapper index. Projects are always
//! processed in lexicographic order and the census is frozen before any fix
//! is applied, so a stable workspace is bit-identical across ticks and two
//! consecutive runs never oscillate.
//!
//! Ticks never overlap (a periodic tick is dropped while one runs) and are
//! skipped entirely while a PTY session is attached, because rewriting a
//! manifest under an interactive session can churn containers on some CLI
//! versions.

use crate::config::ServerConfig;
use crate::discovery::{self, ProjectRef};
use crate::lifecycle::{project_key, LifecycleDriver};
use crate::mapper_store::MapperStore;
use crate::status;
use crate::terminals::ActiveTerminals;
use anyhow::Result;
use stackd_core::alloc;
use stackd_core::compose::ComposeFile;
use stackd_core::mapper::{MapperIndex, MapperProject, MapperService};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Tick was a no-op because a PTY session is active.
    pub skipped_active_terminals: bool,
    /// Tick was dropped because the previous one is still running.
    pub dropped_overlapping: bool,
    pub projects: usize,
    /// Manifests rewritten this tick.
    pub writes: usize,
    pub mapper_written: bool,
    /// Per-project problems; the tick continued past these.
    pub errors: Vec<String>,
    /// The mapper itself could not be written; single-run mode treats
    /// this as fatal.
    pub fatal: Option<String>,
}

/// Census of allocations across the whole workspace, frozen before any fix.
#[derive(Debug, Default)]
struct Census {
    port_counts: HashMap<u16, u32>,
    used_ports: HashSet<u16>,
    ip_counts: HashMap<(String, Ipv4Addr), u32>,
    used_ips: HashMap<String, HashSet<Ipv4Addr>>,
}

impl Census {
    fn take(projects: &[(ProjectRef, ComposeFile)]) -> Self {
        let mut census = Self::default();
        for (_, compose) in projects {
            for (_, service) in &compose.services {
                for port in &service.ports {
                    if let Some(host) = port.host {
                        *census.port_counts.entry(host).or_insert(0) += 1;
                        census.used_ports.insert(host);
                    }
                }
                for (network, attachment) in &service.networks {
                    if let Some(ip) = attachment.ipv4_address {
                        *census
                            .ip_counts
                            .entry((network.clone(), ip))
                            .or_insert(0) += 1;
                        census
                            .used_ips
                            .entry(network.clone())
                            .or_default()
                            .insert(ip);
                    }
                }
            }
        }
        census
    }
}

pub struct Reconciler {
    config: Arc<ServerConfig>,
    terminals: Arc<ActiveTerminals>,
    mapper: Arc<MapperStore>,
    lifecycle: Arc<LifecycleDriver>,
    /// Single-flight gate; periodic ticks try, on-demand ticks wait.
    gate: Mutex<()>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        terminals: Arc<ActiveTerminals>,
        mapper: Arc<MapperStore>,
        lifecycle: Arc<LifecycleDriver>,
    ) -> Self {
        Self {
            config,
            terminals,
            mapper,
            lifecycle,
            gate: Mutex::new(()),
        }
    }

    /// Periodic entry point: drops the tick when one is already running.
    pub async fn tick_periodic(&self) -> ReconcileOutcome {
        if self.terminals.active() > 0 {
            debug!("reconcile skipped: active terminal sessions");
            return ReconcileOutcome {
                skipped_active_terminals: true,
                ..ReconcileOutcome::default()
            };
        }
        let Ok(_guard) = self.gate.try_lock() else {
            debug!("reconcile dropped: previous tick still running");
            return ReconcileOutcome {
                dropped_overlapping: true,
                ..ReconcileOutcome::default()
            };
        };
        self.run_locked().await
    }

    /// On-demand entry point used after user-driven writes; waits for a
    /// running tick instead of dropping.
    pub async fn tick_now(&self) -> ReconcileOutcome {
        if self.terminals.active() > 0 {
            return ReconcileOutcome {
                skipped_active_terminals: true,
                ..ReconcileOutcome::default()
            };
        }
        let _guard = self.gate.lock().await;
        self.run_locked().await
    }

    pub fn spawn_interval(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reconciler.config.reconcile_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let outcome = reconciler.tick_periodic().await;
                for error in &outcome.errors {
                    warn!("reconcile: {error}");
                }
                if outcome.writes > 0 {
                    info!(
                        "reconcile rewrote {} manifest(s) across {} project(s)",
                        outcome.writes, outcome.projects
                    );
                }
            }
        })
    }

    async fn run_locked(&self) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        // Discover, sorted; parse failures exclude a project for this tick.
        let refs = discovery::discover(&self.config);
        let mut projects: Vec<(ProjectRef, ComposeFile)> = Vec::new();
        for project in refs {
            let manifest = self.config.manifest_path(&project.dir);
            match ComposeFile::load(&manifest) {
                Ok(compose) => projects.push((project, compose)),
                Err(e) => {
                    outcome
                        .errors
                        .push(format!("{}: {e:#}", project.rel));
                }
            }
        }
        outcome.projects = projects.len();

        self.detect_name_collisions(&projects);

        // Pass one: census, frozen before any mutation.
        let mut census = Census::take(&projects);

        // Pass two: fix duplicates in sorted order; singletons untouched.
        for (project, compose) in &mut projects {
            Self::fix_ports(project, compose, &mut census);
            Self::fix_ips(project, compose, &mut census);
        }

        // Conditional write-back; a failure drops the project from the
        // mapper but never aborts the tick.
        let mut kept: Vec<(ProjectRef, ComposeFile)> = Vec::new();
        for (project, compose) in projects {
            match compose
                .serialize(&self.config.default_network)
                .and_then(|text| {
                    stackd_utils::fs::write_if_changed(&compose.path, text.as_bytes())
                }) {
                Ok(wrote) => {
                    if wrote {
                        outcome.writes += 1;
                        debug!("rewrote {}", project.rel);
                    }
                    kept.push((project, compose));
                }
                Err(e) => outcome.errors.push(format!("{}: {e:#}", project.rel)),
            }
        }

        // Emit the mapper for everything that survived.
        let index = self.build_index(&kept).await;
        match self.mapper.replace(index).await {
            Ok(wrote) => outcome.mapper_written = wrote,
            Err(e) => outcome.fatal = Some(format!("mapper: {e:#}")),
        }

        outcome
    }

    /// Two folders that collapse to the same compose project-name override
    /// would drive each other's containers; flag them so lifecycle refuses.
    fn detect_name_collisions(&self, projects: &[(ProjectRef, ComposeFile)]) {
        let mut by_key: HashMap<String, Vec<String>> = HashMap::new();
        for (project, _) in projects {
            by_key
                .entry(project_key(project.folder_name()))
                .or_default()
                .push(project.rel.clone());
        }
        let collided: HashSet<String> = by_key
            .into_values()
            .filter(|rels| rels.len() > 1)
            .flatten()
            .collect();
        if !collided.is_empty() {
            warn!("project name collisions: {collided:?}");
        }
        self.lifecycle.set_collisions(collided);
    }

    fn fix_ports(project: &ProjectRef, compose: &mut ComposeFile, census: &mut Census) {
        for (name, service) in &mut compose.services {
            for port in &mut service.ports {
                let Some(host) = port.host else { continue };
                let count = census.port_counts.get(&host).copied().unwrap_or(0);
                if count <= 1 {
                    continue;
                }
                let fresh = alloc::next_host_port(&census.used_ports);
                info!(
                    "{}/{name}: host port {host} duplicated, reassigning to {fresh}",
                    project.rel
                );
                if let Some(c) = census.port_counts.get_mut(&host) {
                    *c -= 1;
                }
                census.port_counts.insert(fresh, 1);
                census.used_ports.insert(fresh);
                port.host = Some(fresh);
            }
        }
    }

    fn fix_ips(project: &ProjectRef, compose: &mut ComposeFile, census: &mut Census) {
        for (name, service) in &mut compose.services {
            for (network, attachment) in &mut service.networks {
                let Some(ip) = attachment.ipv4_address else {
                    continue;
                };
                let key = (network.clone(), ip);
                let count = census.ip_counts.get(&key).copied().unwrap_or(0);
                if count <= 1 {
                    continue;
                }
                let used = census.used_ips.entry(network.clone()).or_default();
                // Reallocate inside the /24 the duplicate already lives in.
                let Some(fresh) = alloc::next_ipv4(ip, used) else {
                    warn!(
                        "{}/{name}: subnet of {ip} exhausted, leaving duplicate in place",
                        project.rel
                    );
                    continue;
                };
                info!(
                    "{}/{name}: {network} address {ip} duplicated, reassigning to {fresh}",
                    project.rel
                );
                if let Some(c) = census.ip_counts.get_mut(&key) {
                    *c -= 1;
                }
                census.ip_counts.insert((network.clone(), fresh), 1);
                used.insert(fresh);
                attachment.ipv4_address = Some(fresh);
            }
        }
    }

    async fn build_index(&self, projects: &[(ProjectRef, ComposeFile)]) -> MapperIndex {
        // Live status per project, queried concurrently; failures degrade
        // to unknown rather than failing the tick.
        let running: Vec<Option<HashSet<String>>> = futures_util::future::join_all(
            projects
                .iter()
                .map(|(project, _)| self.lifecycle.running_services(project)),
        )
        .await
        .into_iter()
        .map(Result::ok)
        .collect();

        let mut index = MapperIndex::default();
        for ((project, compose), running) in projects.iter().zip(running) {
            let mut services = BTreeMap::new();
            for (name, service) in &compose.services {
                let live = running.as_ref().map(|set| set.contains(name));
                services.insert(
                    name.clone(),
                    MapperService {
                        image: service.image.clone(),
                        restart: service.restart.as_str().map(str::to_string),
                        ports: service.ports.iter().map(ToString::to_string).collect(),
                        volumes: service
                            .volumes
                            .iter()
                            .filter_map(display_volume)
                            .collect(),
                        environment: service
                            .environment
                            .iter()
                            .map(stackd_core::compose::EnvEntry::to_line)
                            .collect(),
                        networks: service
                            .networks
                            .iter()
                            .map(|(n, a)| (n.clone(), a.ipv4_address))
                            .collect(),
                        status: status::merge(None, live),
                    },
                );
            }
            index.projects.insert(
                project.rel.clone(),
                MapperProject {
                    manifest_file: self.config.compose_file.clone(),
                    services,
                },
            );
        }

        status::overlay_transient(&mut index, &self.lifecycle);
        index
    }
}

fn display_volume(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        other => serde_json::to_string(other).ok(),
    }
}

impl Reconciler {
    /// Host ports currently assigned anywhere in the workspace. Used by
    /// apply/add to allocate ports for new services.
    #[must_use]
    pub fn used_host_ports(projects: &[(ProjectRef, ComposeFile)]) -> HashSet<u16> {
        Census::take(projects).used_ports
    }

    /// Load every discoverable project, skipping unparseable manifests.
    #[must_use]
    pub fn load_workspace(config: &ServerConfig) -> Vec<(ProjectRef, ComposeFile)> {
        discovery::discover(config)
            .into_iter()
            .filter_map(|project| {
                let manifest = config.manifest_path(&project.dir);
                match ComposeFile::load(&manifest) {
                    Ok(compose) => Some((project, compose)),
                    Err(e) => {
                        warn!("{}: {e:#}", project.rel);
                        None
                    }
                }
            })
            .collect()
    }
}
