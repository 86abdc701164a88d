//! Compose manifest model.
//!
//! Parses a compose YAML document into a typed tree that keeps unrecognized
//! keys verbatim (ordered, via [`serde_yaml::Mapping`]) so round-trips do not
//! lose data. Only the fields the reconciler manipulates (image, restart,
//! ports, volumes, environment, networks) are lifted into typed form.
//!
//! Serialization is canonical: port entries collapse to their string form,
//! bare IPv4 strings under a network key become `{ipv4_address: ...}`, the
//! legacy `version` key is dropped, and the top-level `networks` block is
//! closed over the set of networks the services actually reference.

use anyhow::{bail, Context, Result};
use serde_yaml::{Mapping, Value};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Default manifest filename looked for during discovery.
pub const DEFAULT_MANIFEST: &str = "docker-compose.yml";

const MAX_SERVICE_NAME_LEN: usize = 50;

/// Service names are `[A-Za-z0-9_-]{1,50}`.
#[must_use]
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Container restart policy as understood by compose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Unset,
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl RestartPolicy {
    fn parse(value: &Value) -> Self {
        match value {
            // YAML 1.1 parsers read an unquoted `no` as a boolean; accept
            // both spellings.
            Value::Bool(false) => Self::No,
            Value::String(s) => match s.as_str() {
                "no" => Self::No,
                "always" => Self::Always,
                "unless-stopped" => Self::UnlessStopped,
                s if s.starts_with("on-failure") => Self::OnFailure,
                _ => Self::Unset,
            },
            _ => Self::Unset,
        }
    }

    #[must_use]
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Unset => None,
            Self::No => Some("no"),
            Self::Always => Some("always"),
            Self::OnFailure => Some("on-failure"),
            Self::UnlessStopped => Some("unless-stopped"),
        }
    }

    /// Parse the policy from its compose spelling; empty means unset.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" => Some(Self::Unset),
            "no" => Some(Self::No),
            "always" => Some(Self::Always),
            "on-failure" => Some(Self::OnFailure),
            "unless-stopped" => Some(Self::UnlessStopped),
            _ => None,
        }
    }
}

/// A single `ports:` entry, reduced to its semantic triple.
///
/// Serialized as `"C"`, `"H:C"` or `"B:H:C"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub container: u16,
    pub host: Option<u16>,
    pub bind: Option<Ipv4Addr>,
}

impl PortMapping {
    /// Parse one entry in any of the shapes compose allows. Returns `None`
    /// for entries that cannot be reduced to a valid triple; the caller
    /// drops those on the next write.
    #[must_use]
    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                let container = port_in_range(n.as_u64()?)?;
                Some(Self {
                    container,
                    host: None,
                    bind: None,
                })
            }
            Value::String(s) => Self::parse_str(s),
            Value::Mapping(m) => {
                let container = port_value(m.get("container").or_else(|| m.get("target"))?)?;
                let host = m
                    .get("host")
                    .or_else(|| m.get("published"))
                    .and_then(port_value);
                let bind = m
                    .get("bind")
                    .or_else(|| m.get("host_ip"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                Some(Self {
                    container,
                    host,
                    bind,
                })
            }
            _ => None,
        }
    }

    fn parse_str(s: &str) -> Option<Self> {
        // A trailing protocol ("8080:80/tcp") is dropped on rewrite.
        let s = s.trim();
        let s = s.split('/').next().unwrap_or(s);
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [c] => Some(Self {
                container: port_in_range(c.parse().ok()?)?,
                host: None,
                bind: None,
            }),
            [h, c] => Some(Self {
                container: port_in_range(c.parse().ok()?)?,
                host: Some(port_in_range(h.parse().ok()?)?),
                bind: None,
            }),
            [b, h, c] => Some(Self {
                container: port_in_range(c.parse().ok()?)?,
                host: Some(port_in_range(h.parse().ok()?)?),
                bind: b.parse().ok(),
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.bind, self.host) {
            (Some(bind), Some(host)) => write!(f, "{bind}:{host}:{}", self.container),
            (_, Some(host)) => write!(f, "{host}:{}", self.container),
            _ => write!(f, "{}", self.container),
        }
    }
}

fn port_in_range(n: u64) -> Option<u16> {
    if (1..=65535).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

fn port_value(v: &Value) -> Option<u16> {
    match v {
        Value::Number(n) => port_in_range(n.as_u64()?),
        Value::String(s) => port_in_range(s.trim().parse().ok()?),
        _ => None,
    }
}

/// One `environment:` entry. `value == None` means a pass-through key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub value: Option<String>,
}

impl EnvEntry {
    #[must_use]
    pub fn from_line(s: &str) -> Self {
        match s.split_once('=') {
            Some((k, v)) => Self {
                key: k.to_string(),
                value: Some(v.to_string()),
            },
            None => Self {
                key: s.to_string(),
                value: None,
            },
        }
    }

    #[must_use]
    pub fn to_line(&self) -> String {
        match &self.value {
            Some(v) => format!("{}={v}", self.key),
            None => self.key.clone(),
        }
    }
}

fn parse_environment(value: &Value) -> Vec<EnvEntry> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(EnvEntry::from_line)
            .collect(),
        Value::Mapping(m) => m
            .iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?.to_string();
                let value = match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    Value::Bool(b) => Some(b.to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => return None,
                };
                Some(EnvEntry { key, value })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// A service's membership in a named network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkAttachment {
    pub ipv4_address: Option<Ipv4Addr>,
    /// IPAM keys we do not interpret (aliases, ipv6_address, ...).
    pub extra: Mapping,
}

impl NetworkAttachment {
    fn parse(value: &Value) -> Self {
        match value {
            // A bare IPv4 string is canonicalized into the structured form.
            Value::String(s) => Self {
                ipv4_address: s.trim().parse().ok(),
                extra: Mapping::new(),
            },
            Value::Mapping(m) => {
                let mut ipv4_address = None;
                let mut extra = Mapping::new();
                for (k, v) in m {
                    if k.as_str() == Some("ipv4_address") {
                        ipv4_address = v.as_str().and_then(|s| s.trim().parse().ok());
                    } else {
                        extra.insert(k.clone(), v.clone());
                    }
                }
                Self {
                    ipv4_address,
                    extra,
                }
            }
            _ => Self::default(),
        }
    }

    fn to_value(&self) -> Value {
        if self.ipv4_address.is_none() && self.extra.is_empty() {
            return Value::Null;
        }
        let mut m = Mapping::new();
        if let Some(ip) = self.ipv4_address {
            m.insert("ipv4_address".into(), ip.to_string().into());
        }
        for (k, v) in &self.extra {
            m.insert(k.clone(), v.clone());
        }
        Value::Mapping(m)
    }

    fn is_bare(&self) -> bool {
        self.ipv4_address.is_none() && self.extra.is_empty()
    }
}

/// A single service definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Service {
    pub image: Option<String>,
    pub restart: RestartPolicy,
    pub ports: Vec<PortMapping>,
    /// Volume entries are not semantically manipulated; kept verbatim.
    pub volumes: Vec<Value>,
    pub environment: Vec<EnvEntry>,
    pub networks: Vec<(String, NetworkAttachment)>,
    /// True when the service declared its networks in list form and no
    /// attachment carries attributes, so the list form can be kept.
    pub networks_as_list: bool,
    /// Unrecognized keys, preserved verbatim in order.
    pub extra: Mapping,
}

impl Service {
    fn parse(value: &Value) -> Result<Self> {
        let m = value
            .as_mapping()
            .context("service definition is not a mapping")?;
        let mut svc = Self::default();
        for (k, v) in m {
            let Some(key) = k.as_str() else {
                svc.extra.insert(k.clone(), v.clone());
                continue;
            };
            match key {
                "image" => svc.image = v.as_str().map(str::to_string),
                "restart" => svc.restart = RestartPolicy::parse(v),
                "ports" => {
                    if let Some(items) = v.as_sequence() {
                        svc.ports = items.iter().filter_map(PortMapping::parse).collect();
                    }
                }
                "volumes" => {
                    if let Some(items) = v.as_sequence() {
                        svc.volumes = items.clone();
                    }
                }
                "environment" => svc.environment = parse_environment(v),
                "networks" => match v {
                    Value::Sequence(items) => {
                        svc.networks_as_list = true;
                        svc.networks = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|n| (n.to_string(), NetworkAttachment::default()))
                            .collect();
                    }
                    Value::Mapping(nets) => {
                        svc.networks = nets
                            .iter()
                            .filter_map(|(nk, nv)| {
                                let name = nk.as_str()?.to_string();
                                Some((name, NetworkAttachment::parse(nv)))
                            })
                            .collect();
                    }
                    _ => {}
                },
                _ => {
                    svc.extra.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(svc)
    }

    fn to_value(&self) -> Value {
        let mut m = Mapping::new();
        if let Some(image) = &self.image {
            m.insert("image".into(), image.clone().into());
        }
        if let Some(restart) = self.restart.as_str() {
            m.insert("restart".into(), restart.into());
        }
        if !self.ports.is_empty() {
            let ports: Vec<Value> = self.ports.iter().map(|p| p.to_value()).collect();
            m.insert("ports".into(), Value::Sequence(ports));
        }
        if !self.volumes.is_empty() {
            m.insert("volumes".into(), Value::Sequence(self.volumes.clone()));
        }
        if !self.environment.is_empty() {
            let env: Vec<Value> = self
                .environment
                .iter()
                .map(|e| e.to_line().into())
                .collect();
            m.insert("environment".into(), Value::Sequence(env));
        }
        if !self.networks.is_empty() {
            let all_bare = self.networks.iter().all(|(_, a)| a.is_bare());
            let value = if self.networks_as_list && all_bare {
                Value::Sequence(
                    self.networks
                        .iter()
                        .map(|(n, _)| n.clone().into())
                        .collect(),
                )
            } else {
                let mut nets = Mapping::new();
                for (name, attachment) in &self.networks {
                    nets.insert(name.clone().into(), attachment.to_value());
                }
                Value::Mapping(nets)
            };
            m.insert("networks".into(), value);
        }
        for (k, v) in &self.extra {
            m.insert(k.clone(), v.clone());
        }
        Value::Mapping(m)
    }

    /// Network names this service references, in declaration order.
    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(|(n, _)| n.as_str())
    }
}

/// A parsed compose manifest bound to its file path.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeFile {
    pub path: PathBuf,
    /// Ordered service map; names are unique within a manifest.
    pub services: Vec<(String, Service)>,
    /// The top-level `networks` block, verbatim.
    pub networks: Mapping,
    /// Remaining top-level keys (volumes, x-*, ...), verbatim.
    pub extra: Mapping,
}

impl ComposeFile {
    /// Parse manifest text. The `version` key is dropped here; everything
    /// else is preserved.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let Some(root) = root.as_mapping() else {
            bail!("{}: top level is not a mapping", path.display());
        };

        let mut services = Vec::new();
        let mut networks = Mapping::new();
        let mut extra = Mapping::new();
        for (k, v) in root {
            match k.as_str() {
                Some("version") => {}
                Some("services") => {
                    if let Some(m) = v.as_mapping() {
                        for (name, svc) in m {
                            let Some(name) = name.as_str() else { continue };
                            let svc = Service::parse(svc).with_context(|| {
                                format!("{}: service {name}", path.display())
                            })?;
                            services.push((name.to_string(), svc));
                        }
                    }
                }
                Some("networks") => {
                    if let Some(m) = v.as_mapping() {
                        networks = m.clone();
                    }
                }
                _ => {
                    extra.insert(k.clone(), v.clone());
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            services,
            networks,
            extra,
        })
    }

    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(path, &text)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Network names referenced by any service, in first-reference order.
    #[must_use]
    pub fn referenced_networks(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (_, svc) in &self.services {
            for name in svc.network_names() {
                if !out.iter().any(|n| n == name) {
                    out.push(name.to_string());
                }
            }
        }
        out
    }

    /// Serialize to canonical YAML, applying the top-level `networks`
    /// closure: referenced-but-absent networks are inserted as
    /// `{external: true, name}`, unreferenced ones are pruned except
    /// `default_network`.
    pub fn serialize(&self, default_network: &str) -> Result<String> {
        let referenced = self.referenced_networks();

        let mut networks = Mapping::new();
        for (k, v) in &self.networks {
            let Some(name) = k.as_str() else { continue };
            if referenced.iter().any(|n| n == name) || name == default_network {
                networks.insert(k.clone(), v.clone());
            }
        }
        for name in &referenced {
            if networks.get(name.as_str()).is_none() {
                let mut ext = Mapping::new();
                ext.insert("external".into(), true.into());
                ext.insert("name".into(), name.clone().into());
                networks.insert(name.clone().into(), Value::Mapping(ext));
            }
        }

        let mut svcs = Mapping::new();
        for (name, svc) in &self.services {
            svcs.insert(name.clone().into(), svc.to_value());
        }

        let mut root = Mapping::new();
        root.insert("services".into(), Value::Mapping(svcs));
        if !networks.is_empty() {
            root.insert("networks".into(), Value::Mapping(networks));
        }
        for (k, v) in &self.extra {
            root.insert(k.clone(), v.clone());
        }

        serde_yaml::to_string(&Value::Mapping(root))
            .with_context(|| format!("serializing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ComposeFile {
        ComposeFile::parse(Path::new("/p/docker-compose.yml"), text).unwrap()
    }

    #[test]
    fn test_port_shapes() {
        let file = parse(
            r#"
services:
  web:
    image: nginx:alpine
    ports:
      - "8080:80"
      - "127.0.0.1:9090:90"
      - 7070
      - target: 443
        published: 8443
      - "bogus:entry:too:long"
"#,
        );
        let svc = file.service("web").unwrap();
        assert_eq!(svc.ports.len(), 4);
        assert_eq!(svc.ports[0].host, Some(8080));
        assert_eq!(svc.ports[0].container, 80);
        assert_eq!(svc.ports[1].bind, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(svc.ports[2].host, None);
        assert_eq!(svc.ports[3].host, Some(8443));
    }

    #[test]
    fn test_canonical_port_serialization() {
        let file = parse(
            r#"
services:
  web:
    image: nginx:alpine
    ports:
      - target: 80
        published: 8080
        host_ip: 127.0.0.1
"#,
        );
        let text = file.serialize("default-net").unwrap();
        assert!(text.contains("127.0.0.1:8080:80"), "canonical form: {text}");
    }

    #[test]
    fn test_version_key_dropped() {
        let file = parse("version: \"3.9\"\nservices:\n  web:\n    image: a\n");
        let text = file.serialize("default-net").unwrap();
        assert!(!text.contains("version"));
    }

    #[test]
    fn test_restart_policy_unquoted_no() {
        // Survives whether the parser reads bare `no` as string or bool.
        let file = parse("services:\n  web:\n    image: a\n    restart: no\n");
        assert_eq!(file.service("web").unwrap().restart, RestartPolicy::No);
        let text = file.serialize("default-net").unwrap();
        let reparsed = ComposeFile::parse(Path::new("/p/docker-compose.yml"), &text).unwrap();
        assert_eq!(reparsed.service("web").unwrap().restart, RestartPolicy::No);
    }

    #[test]
    fn test_bare_ip_canonicalized() {
        let file = parse(
            r#"
services:
  web:
    image: a
    networks:
      backend: 172.28.0.5
"#,
        );
        let (_, attachment) = &file.service("web").unwrap().networks[0];
        assert_eq!(attachment.ipv4_address, Some("172.28.0.5".parse().unwrap()));
        let text = file.serialize("default-net").unwrap();
        assert!(text.contains("ipv4_address: 172.28.0.5"), "{text}");
    }

    #[test]
    fn test_networks_closure_insert_and_prune() {
        let file = parse(
            r#"
services:
  web:
    image: a
    networks:
      - frontend
networks:
  stale:
    driver: bridge
  default-net:
    driver: bridge
"#,
        );
        let text = file.serialize("default-net").unwrap();
        let reparsed = ComposeFile::parse(Path::new("/p/docker-compose.yml"), &text).unwrap();
        // referenced-but-absent inserted as external
        let frontend = reparsed.networks.get("frontend").unwrap();
        assert_eq!(frontend.get("external").and_then(Value::as_bool), Some(true));
        assert_eq!(
            frontend.get("name").and_then(Value::as_str),
            Some("frontend")
        );
        // unreferenced pruned, default preserved
        assert!(reparsed.networks.get("stale").is_none());
        assert!(reparsed.networks.get("default-net").is_some());
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let file = parse(
            r#"
services:
  web:
    image: a
    container_name: custom
    depends_on:
      - db
  db:
    image: b
x-meta:
  owner: ops
"#,
        );
        let text = file.serialize("default-net").unwrap();
        let reparsed = ComposeFile::parse(Path::new("/p/docker-compose.yml"), &text).unwrap();
        let web = reparsed.service("web").unwrap();
        assert_eq!(
            web.extra.get("container_name").and_then(Value::as_str),
            Some("custom")
        );
        assert!(web.extra.get("depends_on").is_some());
        assert!(reparsed.extra.get("x-meta").is_some());
    }

    #[test]
    fn test_round_trip_is_stable() {
        let file = parse(
            r#"
services:
  web:
    image: nginx:alpine
    restart: unless-stopped
    ports:
      - "8080:80"
    environment:
      - RAILS_ENV=production
    networks:
      backend:
        ipv4_address: 172.28.0.9
networks:
  backend:
    external: true
    name: backend
"#,
        );
        let once = file.serialize("default-net").unwrap();
        let reparsed = ComposeFile::parse(Path::new("/p/docker-compose.yml"), &once).unwrap();
        let twice = reparsed.serialize("default-net").unwrap();
        assert_eq!(once, twice);
        assert_eq!(file.services, reparsed.services);
    }

    #[test]
    fn test_env_map_form_normalized_to_list() {
        let file = parse(
            "services:\n  web:\n    image: a\n    environment:\n      FOO: bar\n      COUNT: 3\n",
        );
        let env = &file.service("web").unwrap().environment;
        assert_eq!(env[0].to_line(), "FOO=bar");
        assert_eq!(env[1].to_line(), "COUNT=3");
    }

    #[test]
    fn test_service_name_validation() {
        assert!(is_valid_service_name("web-1_a"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("has space"));
        assert!(!is_valid_service_name(&"x".repeat(51)));
    }
}
