//! The derived project/service index served to clients.
//!
//! Rebuilt from the manifests on every reconcile; clients never write it.
//! Keys are project paths relative to the workspace root so the index never
//! leaks absolute host paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Live state of a service as seen by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Restarting,
    Stopping,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    /// Network name -> optional static IPv4.
    #[serde(default)]
    pub networks: BTreeMap<String, Option<Ipv4Addr>>,
    #[serde(default)]
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapperProject {
    pub manifest_file: String,
    #[serde(default)]
    pub services: BTreeMap<String, MapperService>,
}

/// The whole index: relative project path -> project record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapperIndex {
    #[serde(flatten)]
    pub projects: BTreeMap<String, MapperProject>,
}

impl MapperIndex {
    /// Reverse index used by log attribution: static IPv4 -> project path.
    #[must_use]
    pub fn ip_index(&self) -> BTreeMap<Ipv4Addr, String> {
        let mut out = BTreeMap::new();
        for (path, project) in &self.projects {
            for svc in project.services.values() {
                for ip in svc.networks.values().flatten() {
                    out.entry(*ip).or_insert_with(|| path.clone());
                }
            }
        }
        out
    }

    /// First static IPv4 attached to the given service, if any.
    #[must_use]
    pub fn service_ip(&self, project: &str, service: &str) -> Option<Ipv4Addr> {
        self.projects
            .get(project)?
            .services
            .get(service)?
            .networks
            .values()
            .flatten()
            .next()
            .copied()
    }
}
