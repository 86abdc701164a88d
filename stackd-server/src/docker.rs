//! Docker daemon passthrough for networks and images.
//!
//! Lifecycle goes through the compose CLI; these endpoints talk to the
//! daemon socket directly because network IPAM details and image metadata
//! are not reachable through compose.

use crate::config::ServerConfig;
use crate::error::ApiError;
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::models::{Ipam, IpamConfig};
use bollard::Docker;
use futures_util::TryStreamExt;
use serde::Serialize;
use stackd_core::alloc;
use stackd_core::mapper::MapperIndex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// Networks docker manages itself; we refuse to edit them.
const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

#[derive(Debug, Clone, Serialize)]
pub struct NetworkContainerInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub name: String,
    pub id: String,
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub containers: Vec<NetworkContainerInfo>,
    pub builtin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

/// Thin wrapper around the daemon connection; absent when the socket was
/// unreachable at startup, in which case every call fails cleanly.
#[derive(Clone)]
pub struct DockerGateway {
    client: Option<Arc<Docker>>,
}

fn daemon_error(op: &str, detail: impl ToString) -> ApiError {
    ApiError::External {
        error: format!("docker {op} failed"),
        stdout: String::new(),
        stderr: detail.to_string(),
        cmd: "docker".to_string(),
        args: vec![op.to_string()],
    }
}

impl DockerGateway {
    /// Connect with local defaults; a missing daemon downgrades the
    /// gateway instead of failing startup.
    #[must_use]
    pub fn connect() -> Self {
        let client = match Docker::connect_with_local_defaults() {
            Ok(docker) => Some(Arc::new(docker)),
            Err(e) => {
                warn!("failed to connect to Docker: {e}. Network and image endpoints disabled.");
                None
            }
        };
        Self { client }
    }

    #[cfg(test)]
    #[must_use]
    pub fn disconnected() -> Self {
        Self { client: None }
    }

    fn client(&self) -> Result<&Arc<Docker>, ApiError> {
        self.client
            .as_ref()
            .ok_or_else(|| daemon_error("connect", "Docker is not available"))
    }

    /// All networks, enriched with IPAM and attached containers via
    /// per-network inspect.
    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>, ApiError> {
        let client = self.client()?;
        let networks = client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| daemon_error("network ls", e))?;

        let mut out = Vec::new();
        for network in networks {
            let Some(name) = network.name else { continue };
            let inspected = client
                .inspect_network(
                    &name,
                    Some(InspectNetworkOptions::<String> {
                        verbose: true,
                        ..Default::default()
                    }),
                )
                .await
                .unwrap_or_default();

            let ipam_config = inspected
                .ipam
                .as_ref()
                .and_then(|ipam| ipam.config.as_ref())
                .and_then(|configs| configs.first());

            out.push(NetworkInfo {
                builtin: BUILTIN_NETWORKS.contains(&name.as_str()),
                id: network.id.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
                subnet: ipam_config.and_then(|c| c.subnet.clone()),
                gateway: ipam_config.and_then(|c| c.gateway.clone()),
                containers: inspected
                    .containers
                    .unwrap_or_default()
                    .into_values()
                    .map(|c| NetworkContainerInfo {
                        name: c.name.unwrap_or_default(),
                        ipv4: c.ipv4_address,
                    })
                    .collect(),
                name,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Next free IPv4 inside the network's subnet, considering both the
    /// mapper's static assignments and live container addresses.
    pub async fn next_ip(
        &self,
        config: &ServerConfig,
        index: &MapperIndex,
        network: &str,
    ) -> Result<Ipv4Addr, ApiError> {
        let mut used: std::collections::HashSet<Ipv4Addr> = index
            .projects
            .values()
            .flat_map(|p| p.services.values())
            .flat_map(|s| s.networks.iter())
            .filter(|(name, _)| name.as_str() == network)
            .filter_map(|(_, ip)| *ip)
            .collect();

        let mut base = config.subnet_base;
        if let Ok(client) = self.client() {
            if let Ok(inspected) = client
                .inspect_network(
                    network,
                    Some(InspectNetworkOptions::<String> {
                        verbose: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                if let Some(subnet) = inspected
                    .ipam
                    .as_ref()
                    .and_then(|ipam| ipam.config.as_ref())
                    .and_then(|configs| configs.first())
                    .and_then(|c| c.subnet.as_deref())
                {
                    if let Some(ip) = subnet.split('/').next().and_then(|s| s.parse().ok()) {
                        base = ip;
                    }
                }
                for container in inspected.containers.unwrap_or_default().into_values() {
                    if let Some(ip) = container
                        .ipv4_address
                        .as_deref()
                        .and_then(|a| a.split('/').next())
                        .and_then(|a| a.parse().ok())
                    {
                        used.insert(ip);
                    }
                }
            }
        }

        alloc::next_ipv4(base, &used)
            .ok_or_else(|| ApiError::Conflict(format!("subnet of '{network}' is exhausted")))
    }

    pub async fn create_network(
        &self,
        name: &str,
        subnet: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<(), ApiError> {
        if BUILTIN_NETWORKS.contains(&name) {
            return Err(ApiError::Conflict(format!("'{name}' is a builtin network")));
        }
        let client = self.client()?;
        let ipam = subnet.map(|subnet| Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![IpamConfig {
                subnet: Some(subnet.to_string()),
                gateway: gateway.map(str::to_string),
                ..Default::default()
            }]),
            ..Default::default()
        });
        client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ipam: ipam.unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| daemon_error("network create", e))?;
        info!("created network {name}");
        Ok(())
    }

    pub async fn delete_network(&self, name: &str) -> Result<(), ApiError> {
        if BUILTIN_NETWORKS.contains(&name) {
            return Err(ApiError::Conflict(format!(
                "'{name}' is a builtin network and cannot be removed"
            )));
        }
        let client = self.client()?;
        client
            .remove_network(name)
            .await
            .map_err(|e| daemon_error("network rm", e))?;
        info!("removed network {name}");
        Ok(())
    }

    /// Recreate a network with new IPAM settings.
    pub async fn update_network(
        &self,
        name: &str,
        subnet: &str,
        gateway: Option<&str>,
    ) -> Result<(), ApiError> {
        self.delete_network(name).await?;
        self.create_network(name, Some(subnet), gateway).await
    }

    pub async fn list_images(&self) -> Result<Vec<ImageInfo>, ApiError> {
        let client = self.client()?;
        let images = client
            .list_images(None::<ListImagesOptions<String>>)
            .await
            .map_err(|e| daemon_error("image ls", e))?;
        Ok(images
            .into_iter()
            .map(|image| ImageInfo {
                id: image.id,
                tags: image.repo_tags,
                size: image.size,
                created: image.created,
            })
            .collect())
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), ApiError> {
        let client = self.client()?;
        client
            .create_image(
                Some(CreateImageOptions::<String> {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| daemon_error("pull", e))?;
        info!("pulled image {image}");
        Ok(())
    }

    pub async fn delete_image(&self, id: &str) -> Result<(), ApiError> {
        let client = self.client()?;
        client
            .remove_image(id, Some(RemoveImageOptions::default()), None)
            .await
            .map_err(|e| daemon_error("image rm", e))?;
        info!("removed image {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_networks_refused() {
        let gateway = DockerGateway::disconnected();
        assert!(matches!(
            gateway.delete_network("bridge").await,
            Err(ApiError::Conflict(_))
        ));
        assert!(matches!(
            gateway.create_network("host", None, None).await,
            Err(ApiError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_next_ip_from_mapper_without_daemon() {
        use stackd_core::mapper::{MapperProject, MapperService};
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());

        let mut index = MapperIndex::default();
        let mut svc = MapperService::default();
        svc.networks
            .insert("backend".into(), Some("172.28.0.2".parse().unwrap()));
        let mut project = MapperProject::default();
        project.services.insert("web".into(), svc);
        index.projects.insert("apps/foo".into(), project);

        let gateway = DockerGateway::disconnected();
        let ip = gateway.next_ip(&config, &index, "backend").await.unwrap();
        assert_eq!(ip, "172.28.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_gateway_errors_cleanly() {
        let gateway = DockerGateway::disconnected();
        let err = gateway.list_networks().await.unwrap_err();
        assert!(matches!(err, ApiError::External { .. }));
    }
}
