//! Layered configuration loading

use tempfile::TempDir;
use turium::config::{global_config_path, ConfigLoader};
use turium::error::BlockError;

use super::test_utils::with_xdg_env;

fn write(path: &std::path::Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn test_defaults_without_files() {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();
    let config = with_xdg_env(&temp, || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(config.resolver.wait_ms, 5000);
    assert_eq!(config.resolver.poll_interval_ms, 100);
    assert_eq!(config.sandbox.default_timeout_ms, 20000);
    assert_eq!(config.sandbox.preload_fetch_timeout_ms, 10000);
    assert_eq!(config.relay.timeout_ms, 30000);
    assert!(config.storage.token_store_path.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_workspace_overrides_global() {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("ws");
    let config = with_xdg_env(&temp, || {
        let global = global_config_path().unwrap();
        assert!(global.starts_with(temp.path()));
        write(
            &global,
            "[resolver]\nwait_ms = 8000\n\n[relay]\ntimeout_ms = 1500\n",
        );
        write(
            &workspace.join("config").join("config.toml"),
            "[resolver]\nwait_ms = 750\n\n[logging]\nlevel = \"debug\"\n",
        );
        write(
            &workspace.join("config").join("development.toml"),
            "[sandbox]\ndefault_timeout_ms = 4000\n",
        );
        ConfigLoader::load(&workspace).unwrap()
    });
    assert_eq!(config.resolver.wait_ms, 750);
    assert_eq!(config.relay.timeout_ms, 1500);
    assert_eq!(config.sandbox.default_timeout_ms, 4000);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_explicit_file_and_validation() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("turium.toml");
    write(
        &file,
        "[storage]\ntoken_store_path = \"memory\"\n\n[relay]\ntimeout_ms = 250\n",
    );
    let config = ConfigLoader::load_from_file(&file).unwrap();
    assert_eq!(config.relay.timeout_ms, 250);
    assert_eq!(
        config.storage.token_store_path.as_deref(),
        Some(std::path::Path::new("memory"))
    );

    let invalid = temp.path().join("invalid.toml");
    write(&invalid, "[resolver]\npoll_interval_ms = 0\n");
    let err = ConfigLoader::load_from_file(&invalid).unwrap_err();
    assert!(matches!(err, BlockError::Config(ref msg) if msg.contains("poll_interval_ms")));

    let missing = ConfigLoader::load_from_file(&temp.path().join("nope.toml")).unwrap_err();
    assert!(missing.to_string().contains("Config file not found"));
}
