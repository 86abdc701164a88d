//! Per-project request counters from the proxy access logs.
//!
//! Lines are attributed to a project through the mapper's static-IP index;
//! anything that cannot be attributed is dropped.

use crate::config::ServerConfig;
use chrono::Local;
use serde::Serialize;
use stackd_core::access_log::{self, StatsRange};
use stackd_core::mapper::MapperIndex;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Project name -> one counter per bucket.
    pub services: BTreeMap<String, Vec<u64>>,
    pub labels: Vec<String>,
}

/// Read the configured access logs and bucket request counts per project
/// over the given range.
pub async fn compute(
    config: &ServerConfig,
    index: &MapperIndex,
    range: StatsRange,
) -> StatsResponse {
    let end = Local::now();
    let ip_index = index.ip_index();
    let mut services: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    let buckets = range.bucket_count();

    for log_path in &config.access_logs {
        let text = match tokio::fs::read_to_string(log_path).await {
            Ok(text) => text,
            Err(e) => {
                debug!("skipping access log {}: {e}", log_path.display());
                continue;
            }
        };
        for line in text.lines() {
            let Some(record) = access_log::parse_line(line) else {
                continue;
            };
            let Some(ts) = record.timestamp else { continue };
            let Some(bucket) = range.bucket_index(end, ts) else {
                continue;
            };
            let Some(ip) = record.upstream_ip() else {
                continue;
            };
            let Some(project) = ip_index.get(&ip) else {
                continue;
            };
            let name = project.rsplit('/').next().unwrap_or(project).to_string();
            services
                .entry(name)
                .or_insert_with(|| vec![0; buckets])[bucket] += 1;
        }
    }

    StatsResponse {
        services,
        labels: range.labels(end),
    }
}
