//! Persistence for the derived project index.
//!
//! The store is the single writer of the mapper file. Writes are suppressed
//! when the serialized form is unchanged, so stable workspaces do not touch
//! disk on every tick.

use anyhow::{Context, Result};
use stackd_core::mapper::MapperIndex;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
pub struct MapperStore {
    path: PathBuf,
    current: RwLock<MapperIndex>,
}

impl MapperStore {
    /// Open the store, loading the previous index if one is on disk.
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let current = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub async fn snapshot(&self) -> MapperIndex {
        self.current.read().await.clone()
    }

    /// Replace the index, writing it out only when the serialization
    /// changed. Returns whether a write happened.
    pub async fn replace(&self, index: MapperIndex) -> Result<bool> {
        let mut text = serde_json::to_string_pretty(&index).context("serializing mapper")?;
        text.push('\n');
        let wrote = stackd_utils::fs::write_if_changed(&self.path, text.as_bytes())?;
        if wrote {
            debug!("mapper updated: {}", self.path.display());
        }
        *self.current.write().await = index;
        Ok(wrote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackd_core::mapper::{MapperProject, MapperService};

    #[tokio::test]
    async fn test_replace_suppresses_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MapperStore::open(tmp.path().join("mapper.json"));

        let mut index = MapperIndex::default();
        let mut project = MapperProject {
            manifest_file: "docker-compose.yml".into(),
            ..MapperProject::default()
        };
        project
            .services
            .insert("web".into(), MapperService::default());
        index.projects.insert("apps/foo".into(), project);

        assert!(store.replace(index.clone()).await.unwrap());
        assert!(!store.replace(index.clone()).await.unwrap());

        // Reopening picks the persisted index back up.
        let reopened = MapperStore::open(tmp.path().join("mapper.json"));
        assert_eq!(reopened.snapshot().await, index);
    }
}
