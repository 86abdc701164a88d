//! Reconciler properties on scratch workspaces: port/IP uniqueness,
//! singleton preservation, idempotence, the networks closure, parse-error
//! isolation, and the terminal skip rule.

use stackd_core::compose::ComposeFile;
use stackd_server::config::{ServerConfig, HELPER_SCRIPTS};
use stackd_server::lifecycle::LifecycleDriver;
use stackd_server::mapper_store::MapperStore;
use stackd_server::reconciler::Reconciler;
use stackd_server::terminals::ActiveTerminals;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config_for(root: &Path) -> ServerConfig {
    ServerConfig {
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

fn build(root: &Path) -> (Arc<Reconciler>, Arc<ActiveTerminals>, Arc<MapperStore>) {
    let config = Arc::new(config_for(root));
    let terminals = Arc::new(ActiveTerminals::default());
    let mapper = Arc::new(MapperStore::open(config.mapper_file.clone()));
    let lifecycle = Arc::new(LifecycleDriver::new(Arc::clone(&config)));
    let reconciler = Arc::new(Reconciler::new(
        config,
        Arc::clone(&terminals),
        Arc::clone(&mapper),
        lifecycle,
    ));
    (reconciler, terminals, mapper)
}

fn make_project(root: &Path, rel: &str, manifest: &str) {
    let dir = root.join(rel);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("docker-compose.yml"), manifest).unwrap();
    for script in HELPER_SCRIPTS {
        std::fs::write(dir.join(script), "#!/bin/sh\n").unwrap();
    }
}

fn host_ports(root: &Path, rel: &str) -> Vec<u16> {
    let compose = ComposeFile::load(&root.join(rel).join("docker-compose.yml")).unwrap();
    compose
        .services
        .iter()
        .flat_map(|(_, s)| s.ports.iter())
        .filter_map(|p| p.host)
        .collect()
}

fn static_ips(root: &Path, rel: &str) -> Vec<Ipv4Addr> {
    let compose = ComposeFile::load(&root.join(rel).join("docker-compose.yml")).unwrap();
    compose
        .services
        .iter()
        .flat_map(|(_, s)| s.networks.iter())
        .filter_map(|(_, a)| a.ipv4_address)
        .collect()
}

const PORT_8080: &str = r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
"#;

#[tokio::test]
async fn test_port_collision_resolved() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(tmp.path(), "a", PORT_8080);
    make_project(tmp.path(), "b", PORT_8080);

    let (reconciler, _, mapper) = build(tmp.path());
    let outcome = reconciler.tick_now().await;
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);

    let ports_a = host_ports(tmp.path(), "a");
    let ports_b = host_ports(tmp.path(), "b");
    // One keeps 8080, the other gets the smallest free port >= 10000.
    let all: HashSet<u16> = ports_a.iter().chain(&ports_b).copied().collect();
    assert_eq!(all, [8080, 10000].into_iter().collect());

    // Both manifests still parse and the mapper carries the new value.
    let index = mapper.snapshot().await;
    let mapped: HashSet<String> = index
        .projects
        .values()
        .flat_map(|p| p.services.values())
        .flat_map(|s| s.ports.iter().cloned())
        .collect();
    assert_eq!(
        mapped,
        ["8080:80".to_string(), "10000:80".to_string()]
            .into_iter()
            .collect()
    );
}

#[tokio::test]
async fn test_ip_collision_resolved() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = r#"
services:
  x:
    image: nginx:alpine
    networks:
      backend:
        ipv4_address: 172.28.0.5
"#;
    make_project(tmp.path(), "a", manifest);
    make_project(tmp.path(), "b", &manifest.replace("  x:", "  y:"));

    let (reconciler, _, _) = build(tmp.path());
    reconciler.tick_now().await;

    let ips: Vec<Ipv4Addr> = static_ips(tmp.path(), "a")
        .into_iter()
        .chain(static_ips(tmp.path(), "b"))
        .collect();
    let unique: HashSet<Ipv4Addr> = ips.iter().copied().collect();
    assert_eq!(unique.len(), 2, "duplicate survived: {ips:?}");
    assert!(unique.contains(&"172.28.0.5".parse().unwrap()));
    // The loser moved inside the same /24.
    assert!(unique.iter().all(|ip| ip.octets()[..3] == [172, 28, 0]));
}

#[tokio::test]
async fn test_singletons_preserved_and_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(
        tmp.path(),
        "solo",
        r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
    networks:
      backend:
        ipv4_address: 172.28.0.9
"#,
    );

    let (reconciler, _, _) = build(tmp.path());
    reconciler.tick_now().await;

    // Unique values are untouched (the file is normalized, not
    // reallocated).
    assert_eq!(host_ports(tmp.path(), "solo"), vec![8080]);
    assert_eq!(
        static_ips(tmp.path(), "solo"),
        vec!["172.28.0.9".parse::<Ipv4Addr>().unwrap()]
    );

    // A second run with no intervening edits writes nothing.
    let before = std::fs::read(tmp.path().join("solo/docker-compose.yml")).unwrap();
    let outcome = reconciler.tick_now().await;
    assert_eq!(outcome.writes, 0);
    let after = std::fs::read(tmp.path().join("solo/docker-compose.yml")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_networks_closure() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(
        tmp.path(),
        "closure",
        r#"
services:
  web:
    image: nginx:alpine
    networks:
      - frontend
networks:
  orphan:
    driver: bridge
"#,
    );

    let (reconciler, _, _) = build(tmp.path());
    reconciler.tick_now().await;

    let compose =
        ComposeFile::load(&tmp.path().join("closure/docker-compose.yml")).unwrap();
    // Referenced network is present at top level, marked external.
    let frontend = compose.networks.get("frontend").expect("frontend inserted");
    assert_eq!(
        frontend.get("external").and_then(serde_yaml::Value::as_bool),
        Some(true)
    );
    // Unreferenced network is pruned.
    assert!(compose.networks.get("orphan").is_none());
}

#[tokio::test]
async fn test_parse_error_excludes_only_that_project() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(tmp.path(), "good", PORT_8080);
    make_project(tmp.path(), "broken", ":: not yaml ::\n\t{");

    let (reconciler, _, mapper) = build(tmp.path());
    let outcome = reconciler.tick_now().await;

    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("broken"));

    let index = mapper.snapshot().await;
    assert!(index.projects.contains_key("good"));
    assert!(!index.projects.contains_key("broken"));
}

#[tokio::test]
async fn test_tick_skipped_while_terminal_active() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(tmp.path(), "a", PORT_8080);
    make_project(tmp.path(), "b", PORT_8080);

    let (reconciler, terminals, _) = build(tmp.path());
    let before_a = std::fs::read(tmp.path().join("a/docker-compose.yml")).unwrap();
    let before_b = std::fs::read(tmp.path().join("b/docker-compose.yml")).unwrap();

    let guard = terminals.acquire();
    let outcome = reconciler.tick_periodic().await;
    assert!(outcome.skipped_active_terminals);
    assert_eq!(outcome.writes, 0);

    // Nothing mutated while the session was attached.
    assert_eq!(
        before_a,
        std::fs::read(tmp.path().join("a/docker-compose.yml")).unwrap()
    );
    assert_eq!(
        before_b,
        std::fs::read(tmp.path().join("b/docker-compose.yml")).unwrap()
    );

    // Session gone: the next tick fixes the collision.
    guard.release();
    let outcome = reconciler.tick_periodic().await;
    assert!(!outcome.skipped_active_terminals);
    assert!(outcome.writes > 0);
}

#[tokio::test]
async fn test_mapper_write_suppressed_when_stable() {
    let tmp = tempfile::tempdir().unwrap();
    make_project(tmp.path(), "solo", PORT_8080);

    let (reconciler, _, _) = build(tmp.path());
    let first = reconciler.tick_now().await;
    assert!(first.mapper_written);
    let second = reconciler.tick_now().await;
    assert!(!second.mapper_written);
}
