//! Save-with-rollback: when the config test (or reload) fails, the live
//! file is restored byte-for-byte and no backup is left behind.

use async_trait::async_trait;
use stackd_server::proxy_editor::{ProxyControl, ProxyEditor, SaveError};
use std::path::Path;
use std::sync::Arc;

struct ScriptedControl {
    test_ok: bool,
    reload_ok: bool,
}

#[async_trait]
impl ProxyControl for ScriptedControl {
    async fn test(&self, _path: &Path) -> Result<(), String> {
        if self.test_ok {
            Ok(())
        } else {
            Err("nginx: [emerg] unexpected end of file".to_string())
        }
    }

    async fn reload(&self) -> Result<(), String> {
        if self.reload_ok {
            Ok(())
        } else {
            Err("signal process started".to_string())
        }
    }
}

const LIVE: &str = "server {\n    listen 80;\n}\n";

fn backups_in(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(".bak"))
        .collect()
}

#[tokio::test]
async fn test_failed_test_restores_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("stackd.conf");
    std::fs::write(&live, LIVE).unwrap();

    let editor = ProxyEditor::new(
        live.clone(),
        Arc::new(ScriptedControl {
            test_ok: false,
            reload_ok: true,
        }),
    );

    match editor.save("server { broken").await {
        Err(SaveError::RolledBack(failure)) => {
            assert_eq!(failure.phase, "test");
            assert!(failure.stderr.contains("emerg"));
        }
        other => panic!("expected test rollback, got {other:?}"),
    }

    assert_eq!(std::fs::read_to_string(&live).unwrap(), LIVE);
    assert!(backups_in(tmp.path()).is_empty(), "backup left behind");
}

#[tokio::test]
async fn test_failed_reload_restores_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("stackd.conf");
    std::fs::write(&live, LIVE).unwrap();

    let editor = ProxyEditor::new(
        live.clone(),
        Arc::new(ScriptedControl {
            test_ok: true,
            reload_ok: false,
        }),
    );

    match editor.save("server {\n    listen 8081;\n}\n").await {
        Err(SaveError::RolledBack(failure)) => assert_eq!(failure.phase, "reload"),
        other => panic!("expected reload rollback, got {other:?}"),
    }
    assert_eq!(std::fs::read_to_string(&live).unwrap(), LIVE);
    assert!(backups_in(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_successful_save_replaces_and_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("stackd.conf");
    std::fs::write(&live, LIVE).unwrap();

    let editor = ProxyEditor::new(
        live.clone(),
        Arc::new(ScriptedControl {
            test_ok: true,
            reload_ok: true,
        }),
    );

    let updated = "server {\n    listen 8081;\n}\n";
    editor.save(updated).await.unwrap();
    assert_eq!(std::fs::read_to_string(&live).unwrap(), updated);
    assert!(backups_in(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_save_without_prior_config() {
    let tmp = tempfile::tempdir().unwrap();
    let live = tmp.path().join("stackd.conf");

    // Failure with no pre-existing file: the written file is removed again.
    let editor = ProxyEditor::new(
        live.clone(),
        Arc::new(ScriptedControl {
            test_ok: false,
            reload_ok: true,
        }),
    );
    assert!(editor.save("bogus {").await.is_err());
    assert!(!live.exists());

    // Success with no pre-existing file just writes it.
    let editor = ProxyEditor::new(
        live.clone(),
        Arc::new(ScriptedControl {
            test_ok: true,
            reload_ok: true,
        }),
    );
    editor.save(LIVE).await.unwrap();
    assert_eq!(std::fs::read_to_string(&live).unwrap(), LIVE);
}
