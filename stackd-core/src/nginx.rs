//! Minimal structure recovery for nginx-style configuration files.
//!
//! This is deliberately not a full grammar. The tokenizer skips whitespace
//! and comments, reads a directive header up to `{` or `;`, and on `{`
//! finds the matching `}` by depth counting, recursing into the body. That
//! is enough to lift upstreams, servers and locations out of a live config
//! without understanding every directive nginx knows about.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub name: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Body of the location block, verbatim.
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub listen: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_certificate_key: Option<String>,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NginxConfig {
    pub upstreams: Vec<Upstream>,
    pub servers: Vec<Server>,
}

enum Item {
    Directive(String),
    Block { header: String, body: String },
}

/// Split a config fragment into directives and brace-delimited blocks.
fn scan(src: &str) -> Vec<Item> {
    let bytes = src.as_bytes();
    let mut items = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != b'{' && bytes[i] != b';' && bytes[i] != b'#' {
                    i += 1;
                }
                let header = src[start..i].trim().to_string();
                if i >= bytes.len() || bytes[i] == b'#' {
                    if !header.is_empty() {
                        items.push(Item::Directive(header));
                    }
                    continue;
                }
                if bytes[i] == b';' {
                    i += 1;
                    if !header.is_empty() {
                        items.push(Item::Directive(header));
                    }
                    continue;
                }
                // Opening brace: find the matching close by depth.
                let body_start = i + 1;
                let mut depth = 1usize;
                let mut j = body_start;
                while j < bytes.len() && depth > 0 {
                    match bytes[j] {
                        b'{' => depth += 1,
                        b'}' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                let body_end = if depth == 0 { j - 1 } else { bytes.len() };
                items.push(Item::Block {
                    header,
                    body: src[body_start..body_end].to_string(),
                });
                i = j;
            }
        }
    }
    items
}

fn directive_arg(directive: &str, name: &str) -> Option<String> {
    let rest = directive.strip_prefix(name)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().to_string())
}

fn parse_upstream(header: &str, body: &str) -> Option<Upstream> {
    let name = header.split_whitespace().nth(1)?.to_string();
    let servers = scan(body)
        .into_iter()
        .filter_map(|item| match item {
            Item::Directive(d) => directive_arg(&d, "server"),
            Item::Block { .. } => None,
        })
        .collect();
    Some(Upstream { name, servers })
}

fn parse_server(body: &str) -> Server {
    let mut server = Server::default();
    for item in scan(body) {
        match item {
            Item::Directive(d) => {
                if let Some(arg) = directive_arg(&d, "listen") {
                    server.listen.push(arg);
                } else if let Some(arg) = directive_arg(&d, "server_name") {
                    server.server_name = Some(arg);
                } else if let Some(arg) = directive_arg(&d, "ssl_certificate_key") {
                    server.ssl_certificate_key = Some(arg);
                } else if let Some(arg) = directive_arg(&d, "ssl_certificate") {
                    server.ssl_certificate = Some(arg);
                }
            }
            Item::Block { header, body } => {
                if let Some(path) = directive_arg(&header, "location") {
                    server.locations.push(parse_location(&path, &body));
                }
            }
        }
    }
    server
}

fn parse_location(path: &str, body: &str) -> Location {
    let mut location = Location {
        location: path.to_string(),
        raw: body.trim().to_string(),
        ..Location::default()
    };
    for item in scan(body) {
        if let Item::Directive(d) = item {
            if let Some(arg) = directive_arg(&d, "proxy_pass") {
                location.proxy_pass = Some(arg);
            } else if let Some(arg) = directive_arg(&d, "return") {
                location.redirect = Some(arg);
            }
        }
    }
    location
}

/// Recover upstreams and servers from a config fragment. Blocks named
/// `http` are descended into so both full configs and conf.d snippets work.
#[must_use]
pub fn parse(src: &str) -> NginxConfig {
    let mut config = NginxConfig::default();
    collect(&scan(src), &mut config);
    config
}

fn collect(items: &[Item], config: &mut NginxConfig) {
    for item in items {
        if let Item::Block { header, body } = item {
            let keyword = header.split_whitespace().next().unwrap_or("");
            match keyword {
                "upstream" => {
                    if let Some(upstream) = parse_upstream(header, body) {
                        config.upstreams.push(upstream);
                    }
                }
                "server" => config.servers.push(parse_server(body)),
                "http" => collect(&scan(body), config),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
upstream app_backend {
    server 172.28.0.5:8080;
    server 172.28.0.6:8080 backup;
}

server {
    listen 80;
    listen 443 ssl;
    server_name app.example.com;
    ssl_certificate /etc/ssl/app.pem;
    ssl_certificate_key /etc/ssl/app.key;

    location / {
        proxy_pass http://app_backend;
        proxy_set_header Host $host;
    }

    location /old {
        return 301 https://app.example.com/new;
    }
}
"#;

    #[test]
    fn test_parse_upstream() {
        let config = parse(SAMPLE);
        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].name, "app_backend");
        assert_eq!(
            config.upstreams[0].servers,
            vec!["172.28.0.5:8080", "172.28.0.6:8080 backup"]
        );
    }

    #[test]
    fn test_parse_server_and_locations() {
        let config = parse(SAMPLE);
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.listen, vec!["80", "443 ssl"]);
        assert_eq!(server.server_name.as_deref(), Some("app.example.com"));
        assert_eq!(server.ssl_certificate.as_deref(), Some("/etc/ssl/app.pem"));
        assert_eq!(
            server.ssl_certificate_key.as_deref(),
            Some("/etc/ssl/app.key")
        );
        assert_eq!(server.locations.len(), 2);
        assert_eq!(
            server.locations[0].proxy_pass.as_deref(),
            Some("http://app_backend")
        );
        assert!(server.locations[0].raw.contains("proxy_set_header"));
        assert_eq!(
            server.locations[1].redirect.as_deref(),
            Some("301 https://app.example.com/new")
        );
    }

    #[test]
    fn test_http_wrapper_descended() {
        let wrapped = format!("http {{\n{SAMPLE}\n}}");
        let config = parse(&wrapped);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.upstreams.len(), 1);
    }

    #[test]
    fn test_comments_and_unbalanced_input() {
        let src = "# comment only\nserver {\n listen 80; # inline\n";
        let config = parse(src);
        // Unterminated block still yields the server with what was seen.
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].listen, vec!["80"]);
    }
}
