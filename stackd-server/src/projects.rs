//! User-driven project mutations: apply, add-from-template, rename,
//! delete, and the per-project config-file CRUD.
//!
//! All of these write compose files or move directories; the HTTP handlers
//! trigger an immediate reconcile afterwards so the census and mapper catch
//! up before the next periodic tick.

use crate::config::{ServerConfig, CONFIG_DIR, TEMPLATE_PROJECT};
use crate::discovery::ProjectRef;
use crate::error::ApiError;
use crate::reconciler::Reconciler;
use serde::Deserialize;
use stackd_core::alloc;
use stackd_core::compose::{
    is_valid_service_name, ComposeFile, EnvEntry, NetworkAttachment, PortMapping, RestartPolicy,
    Service,
};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

/// Resolve a workspace-relative path to an existing project.
pub fn resolve_project(config: &ServerConfig, rel: &str) -> Result<ProjectRef, ApiError> {
    if rel.trim().is_empty() {
        return Err(ApiError::Validation("project path is required".into()));
    }
    let dir = config
        .project_dir(rel)
        .map_err(|_| ApiError::Validation(format!("invalid project path: {rel}")))?;
    if !config.manifest_path(&dir).is_file() {
        return Err(ApiError::NotFound(format!("project not found: {rel}")));
    }
    let rel = dir
        .strip_prefix(&config.root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| rel.to_string());
    Ok(ProjectRef { dir, rel })
}

#[derive(Debug, Deserialize)]
pub struct ApplyPort {
    pub container: u16,
    #[serde(default)]
    pub host: Option<u16>,
    #[serde(default)]
    pub bind: Option<Ipv4Addr>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApplyNetwork {
    #[serde(default)]
    pub ipv4_address: Option<Ipv4Addr>,
}

/// One service in an apply payload. Ports, volumes, environment and
/// networks are replaced wholesale; image and restart only when present.
#[derive(Debug, Default, Deserialize)]
pub struct ApplyService {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub ports: Vec<ApplyPort>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub networks: BTreeMap<String, ApplyNetwork>,
}

/// Upsert-and-delete the full service map of one project: services missing
/// from the payload are removed, new ones added, existing ones updated.
/// Returns whether the manifest changed on disk.
pub fn apply(
    config: &ServerConfig,
    rel: &str,
    services: &BTreeMap<String, ApplyService>,
) -> Result<bool, ApiError> {
    let project = resolve_project(config, rel)?;
    for name in services.keys() {
        if !is_valid_service_name(name) {
            return Err(ApiError::Validation(format!("invalid service name: {name}")));
        }
    }

    let manifest = config.manifest_path(&project.dir);
    let mut compose = ComposeFile::load(&manifest).map_err(ApiError::Internal)?;

    // Host ports already in use anywhere in the workspace; newly assigned
    // ports join the set so one apply cannot hand out the same port twice.
    let workspace = Reconciler::load_workspace(config);
    let mut used_ports = Reconciler::used_host_ports(&workspace);

    // Deletions first.
    compose.services.retain(|(name, _)| services.contains_key(name));

    for (name, patch) in services {
        let restart = match &patch.restart {
            Some(spelling) => Some(RestartPolicy::from_name(spelling).ok_or_else(|| {
                ApiError::Validation(format!("invalid restart policy: {spelling}"))
            })?),
            None => None,
        };

        let ports = patch
            .ports
            .iter()
            .map(|p| {
                let host = p
                    .host
                    .unwrap_or_else(|| alloc::next_host_port(&used_ports));
                used_ports.insert(host);
                PortMapping {
                    container: p.container,
                    host: Some(host),
                    bind: p.bind,
                }
            })
            .collect::<Vec<_>>();

        let networks: Vec<(String, NetworkAttachment)> = patch
            .networks
            .iter()
            .map(|(network, a)| {
                (
                    network.clone(),
                    NetworkAttachment {
                        ipv4_address: a.ipv4_address,
                        ..NetworkAttachment::default()
                    },
                )
            })
            .collect();

        let volumes: Vec<serde_yaml::Value> = patch
            .volumes
            .iter()
            .map(|v| serde_yaml::Value::String(v.clone()))
            .collect();
        let environment: Vec<EnvEntry> = patch
            .environment
            .iter()
            .map(|e| EnvEntry::from_line(e))
            .collect();

        let position = compose.services.iter().position(|(n, _)| n == name);
        match position {
            Some(i) => {
                let existing = &mut compose.services[i].1;
                if patch.image.is_some() {
                    existing.image = patch.image.clone();
                }
                if let Some(restart) = restart {
                    existing.restart = restart;
                }
                existing.ports = ports;
                existing.volumes = volumes;
                existing.environment = environment;
                existing.networks = networks;
            }
            None => {
                let service = Service {
                    image: patch.image.clone(),
                    restart: restart.unwrap_or_default(),
                    ports,
                    volumes,
                    environment,
                    networks,
                    ..Service::default()
                };
                compose.services.push((name.clone(), service));
            }
        }
    }

    let text = compose
        .serialize(&config.default_network)
        .map_err(ApiError::Internal)?;
    stackd_utils::fs::write_if_changed(&manifest, text.as_bytes()).map_err(ApiError::Internal)
}

fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 50
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Create a new project by copying the template, then hand every host port
/// and static IP in the copy a fresh allocation.
pub fn add_from_template(config: &ServerConfig, name: &str) -> Result<ProjectRef, ApiError> {
    if !is_valid_project_name(name) {
        return Err(ApiError::Validation(format!("invalid project name: {name}")));
    }
    if name == TEMPLATE_PROJECT {
        return Err(ApiError::Conflict("name taken".into()));
    }

    let template = config.root.join(TEMPLATE_PROJECT);
    if !config.manifest_path(&template).is_file() {
        return Err(ApiError::NotFound("template project not found".into()));
    }
    let dest = config.root.join(name);
    if dest.exists() {
        return Err(ApiError::Conflict(format!("Project '{name}' already exists")));
    }

    // Allocations in use everywhere else, before the copy joins the census.
    let workspace = Reconciler::load_workspace(config);
    let mut used_ports = Reconciler::used_host_ports(&workspace);
    let mut used_ips: BTreeMap<String, HashSet<Ipv4Addr>> = BTreeMap::new();
    for (_, compose) in &workspace {
        for (_, service) in &compose.services {
            for (network, attachment) in &service.networks {
                if let Some(ip) = attachment.ipv4_address {
                    used_ips.entry(network.clone()).or_default().insert(ip);
                }
            }
        }
    }

    copy_dir(&template, &dest).map_err(ApiError::Internal)?;
    info!("created project {name} from template");

    let manifest = config.manifest_path(&dest);
    let mut compose = ComposeFile::load(&manifest).map_err(ApiError::Internal)?;
    for (_, service) in &mut compose.services {
        for port in &mut service.ports {
            if port.host.is_some() {
                let fresh = alloc::next_host_port(&used_ports);
                used_ports.insert(fresh);
                port.host = Some(fresh);
            }
        }
        for (network, attachment) in &mut service.networks {
            if let Some(ip) = attachment.ipv4_address {
                let used = used_ips.entry(network.clone()).or_default();
                if let Some(fresh) = alloc::next_ipv4(ip, used) {
                    used.insert(fresh);
                    attachment.ipv4_address = Some(fresh);
                }
            }
        }
    }
    let text = compose
        .serialize(&config.default_network)
        .map_err(ApiError::Internal)?;
    stackd_utils::fs::write_if_changed(&manifest, text.as_bytes()).map_err(ApiError::Internal)?;

    resolve_project(config, name)
}

/// Rename a project directory. Requires all services stopped; the template
/// project is protected.
pub fn rename(
    config: &ServerConfig,
    running: &HashSet<String>,
    rel: &str,
    new_name: &str,
) -> Result<String, ApiError> {
    let project = resolve_project(config, rel)?;
    if project.folder_name() == TEMPLATE_PROJECT {
        return Err(ApiError::Policy("The template project cannot be renamed".into()));
    }
    if !is_valid_project_name(new_name) {
        return Err(ApiError::Validation(format!("invalid project name: {new_name}")));
    }
    if new_name == TEMPLATE_PROJECT {
        return Err(ApiError::Policy("'template' is a reserved name".into()));
    }
    if !running.is_empty() {
        return Err(ApiError::Conflict(
            "Cannot rename project with running services".into(),
        ));
    }

    let dest = project
        .dir
        .parent()
        .map(|p| p.join(new_name))
        .ok_or_else(|| ApiError::Validation("invalid project path".into()))?;
    if dest.exists() {
        return Err(ApiError::Conflict(format!("Project '{new_name}' already exists")));
    }

    std::fs::rename(&project.dir, &dest)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("renaming {rel}: {e}")))?;
    info!("renamed project {rel} -> {new_name}");

    dest.strip_prefix(&config.root)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|e| ApiError::Internal(e.into()))
}

/// Delete a project directory. The caller must echo the folder name, no
/// service may be running, and the template project is protected.
pub fn delete(
    config: &ServerConfig,
    running: &HashSet<String>,
    rel: &str,
    confirm_name: &str,
) -> Result<(), ApiError> {
    let project = resolve_project(config, rel)?;
    if project.folder_name() == TEMPLATE_PROJECT {
        return Err(ApiError::Policy("The template project cannot be deleted".into()));
    }
    if confirm_name != project.folder_name() {
        return Err(ApiError::Validation(
            "Confirmation name does not match the project folder".into(),
        ));
    }
    if !running.is_empty() {
        return Err(ApiError::Conflict(
            "Cannot delete project with running services".into(),
        ));
    }

    std::fs::remove_dir_all(&project.dir)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("deleting {rel}: {e}")))?;
    info!("deleted project {rel}");
    Ok(())
}

fn config_dir_of(config: &ServerConfig, rel: &str) -> Result<(ProjectRef, std::path::PathBuf), ApiError> {
    let project = resolve_project(config, rel)?;
    let dir = project.dir.join(CONFIG_DIR);
    Ok((project, dir))
}

fn checked_filename(file: &str) -> Result<&str, ApiError> {
    if stackd_utils::fs::is_safe_filename(file) {
        Ok(file)
    } else {
        Err(ApiError::Validation(format!("invalid file name: {file}")))
    }
}

/// Files in the project's config directory, sorted.
pub fn list_config_files(config: &ServerConfig, rel: &str) -> Result<Vec<String>, ApiError> {
    let (_, dir) = config_dir_of(config, rel)?;
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Ok(name) = entry.file_name().into_string() {
                    files.push(name);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

pub fn read_config_file(config: &ServerConfig, rel: &str, file: &str) -> Result<String, ApiError> {
    let (_, dir) = config_dir_of(config, rel)?;
    let path = dir.join(checked_filename(file)?);
    std::fs::read_to_string(&path)
        .map_err(|_| ApiError::NotFound(format!("config file not found: {file}")))
}

pub fn save_config_file(
    config: &ServerConfig,
    rel: &str,
    file: &str,
    content: &str,
) -> Result<(), ApiError> {
    let (_, dir) = config_dir_of(config, rel)?;
    let path = dir.join(checked_filename(file)?);
    std::fs::create_dir_all(&dir)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("creating config dir: {e}")))?;
    std::fs::write(&path, content)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("writing {file}: {e}")))?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HELPER_SCRIPTS;

    fn make_project(root: &Path, rel: &str, manifest: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml"), manifest).unwrap();
        for script in HELPER_SCRIPTS {
            std::fs::write(dir.join(script), "#!/bin/sh\n").unwrap();
        }
    }

    const TWO_SERVICES: &str = r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
  db:
    image: postgres:16
"#;

    #[test]
    fn test_apply_deletes_missing_services() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "apps/foo", TWO_SERVICES);

        let mut services = BTreeMap::new();
        services.insert(
            "web".to_string(),
            ApplyService {
                image: Some("nginx:alpine".into()),
                ports: vec![ApplyPort {
                    container: 80,
                    host: Some(8080),
                    bind: None,
                }],
                ..ApplyService::default()
            },
        );
        assert!(apply(&config, "apps/foo", &services).unwrap());

        let compose =
            ComposeFile::load(&tmp.path().join("apps/foo/docker-compose.yml")).unwrap();
        assert!(compose.service("web").is_some());
        assert!(compose.service("db").is_none());
    }

    #[test]
    fn test_apply_assigns_host_port_when_unspecified() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "apps/foo", TWO_SERVICES);

        let mut services = BTreeMap::new();
        services.insert(
            "web".to_string(),
            ApplyService {
                ports: vec![ApplyPort {
                    container: 80,
                    host: None,
                    bind: None,
                }],
                ..ApplyService::default()
            },
        );
        apply(&config, "apps/foo", &services).unwrap();

        let compose =
            ComposeFile::load(&tmp.path().join("apps/foo/docker-compose.yml")).unwrap();
        let port = compose.service("web").unwrap().ports[0];
        assert_eq!(port.host, Some(10000));
    }

    #[test]
    fn test_apply_rejects_bad_service_name() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "apps/foo", TWO_SERVICES);

        let mut services = BTreeMap::new();
        services.insert("bad name!".to_string(), ApplyService::default());
        let err = apply(&config, "apps/foo", &services).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_add_reallocates_ports_and_ips() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(
            tmp.path(),
            "template",
            r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
    networks:
      backend:
        ipv4_address: 172.28.0.5
"#,
        );

        let project = add_from_template(&config, "copy1").unwrap();
        let compose = ComposeFile::load(&config.manifest_path(&project.dir)).unwrap();
        let svc = compose.service("web").unwrap();
        // Template keeps 8080/.5; the copy gets fresh values.
        assert_eq!(svc.ports[0].host, Some(10000));
        assert_eq!(
            svc.networks[0].1.ipv4_address,
            Some("172.28.0.2".parse().unwrap())
        );

        // Second copy continues the sequence.
        let project = add_from_template(&config, "copy2").unwrap();
        let compose = ComposeFile::load(&config.manifest_path(&project.dir)).unwrap();
        let svc = compose.service("web").unwrap();
        assert_eq!(svc.ports[0].host, Some(10001));
        assert_eq!(
            svc.networks[0].1.ipv4_address,
            Some("172.28.0.3".parse().unwrap())
        );
    }

    #[test]
    fn test_template_protection() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "template", TWO_SERVICES);

        let none = HashSet::new();
        assert!(matches!(
            rename(&config, &none, "template", "other"),
            Err(ApiError::Policy(_))
        ));
        assert!(matches!(
            delete(&config, &none, "template", "template"),
            Err(ApiError::Policy(_))
        ));
    }

    #[test]
    fn test_delete_guards() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "apps/foo", TWO_SERVICES);

        // Wrong confirmation string.
        let none = HashSet::new();
        assert!(matches!(
            delete(&config, &none, "apps/foo", "bar"),
            Err(ApiError::Validation(_))
        ));

        // Running services block deletion.
        let running: HashSet<String> = ["web".to_string()].into_iter().collect();
        let err = delete(&config, &running, "apps/foo", "foo").unwrap_err();
        match err {
            ApiError::Conflict(msg) => {
                assert_eq!(msg, "Cannot delete project with running services");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Stopped: deletion succeeds and the directory is gone.
        delete(&config, &none, "apps/foo", "foo").unwrap();
        assert!(!tmp.path().join("apps/foo").exists());
    }

    #[test]
    fn test_config_file_name_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        make_project(tmp.path(), "apps/foo", TWO_SERVICES);

        assert!(matches!(
            read_config_file(&config, "apps/foo", "../secrets"),
            Err(ApiError::Validation(_))
        ));
        save_config_file(&config, "apps/foo", "app.conf", "x=1\n").unwrap();
        assert_eq!(read_config_file(&config, "apps/foo", "app.conf").unwrap(), "x=1\n");
        assert_eq!(
            list_config_files(&config, "apps/foo").unwrap(),
            vec!["app.conf".to_string()]
        );
    }

    #[test]
    fn test_traversal_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_tests(tmp.path());
        assert!(matches!(
            resolve_project(&config, "../../etc"),
            Err(ApiError::Validation(_))
        ));
    }
}
