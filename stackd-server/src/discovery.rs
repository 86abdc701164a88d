//! Project discovery: walk the workspace and pick out directories that
//! look like compose projects.

use crate::config::{ServerConfig, HELPER_SCRIPTS};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const PRUNED_DIRS: [&str; 4] = ["node_modules", ".git", ".hg", ".svn"];

/// A discovered project: absolute directory plus its workspace-relative
/// path (the external identifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub dir: PathBuf,
    pub rel: String,
}

impl ProjectRef {
    /// Last path component; used for template protection and the compose
    /// project-name override.
    #[must_use]
    pub fn folder_name(&self) -> &str {
        self.rel.rsplit('/').next().unwrap_or(&self.rel)
    }
}

fn is_project_dir(dir: &Path, compose_file: &str) -> bool {
    dir.join(compose_file).is_file()
        && HELPER_SCRIPTS
            .iter()
            .all(|script| dir.join(script).is_file())
}

/// Walk the workspace and return all project directories, sorted by
/// relative path for deterministic downstream ordering.
#[must_use]
pub fn discover(config: &ServerConfig) -> Vec<ProjectRef> {
    let mut projects: Vec<ProjectRef> = WalkDir::new(&config.root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .is_none_or(|name| !PRUNED_DIRS.contains(&name))
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| is_project_dir(entry.path(), &config.compose_file))
        .filter_map(|entry| {
            let rel = entry
                .path()
                .strip_prefix(&config.root)
                .ok()?
                .to_str()?
                .to_string();
            if rel.is_empty() {
                return None;
            }
            Some(ProjectRef {
                dir: entry.path().to_path_buf(),
                rel,
            })
        })
        .collect();
    projects.sort_by(|a, b| a.rel.cmp(&b.rel));
    projects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_project(root: &Path, rel: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        for script in HELPER_SCRIPTS {
            std::fs::write(dir.join(script), "#!/bin/sh\n").unwrap();
        }
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        make_project(root, "apps/zeta");
        make_project(root, "apps/alpha");
        make_project(root, "node_modules/ignored");

        // Missing scripts: not a project.
        let partial = root.join("apps/partial");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("docker-compose.yml"), "services: {}\n").unwrap();

        let found = discover(&ServerConfig::for_tests(root));
        let rels: Vec<&str> = found.iter().map(|p| p.rel.as_str()).collect();
        assert_eq!(rels, vec!["apps/alpha", "apps/zeta"]);
        assert_eq!(found[0].folder_name(), "alpha");
    }
}
