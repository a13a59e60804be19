//! Tests for multi-format configuration loading
//!
//! Exercises every supported format with a model-declaration shaped document,
//! plus environment substitution and prefixed overrides.

use super::*;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, Deserialize, PartialEq)]
struct TestDeclaration {
    registry: RegistrySection,
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct RegistrySection {
    capacity_mb: u64,
    load_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ModelEntry {
    id: String,
    family: String,
    endpoint: Option<String>,
}

fn create_test_file(dir: &TempDir, filename: &str, content: &str) -> PathBuf {
    let path = dir.path().join(filename);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format("relay.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("relay.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("relay.toml").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("relay.json").unwrap(), FileFormat::Json);
    assert_eq!(detect_format("relay.ini").unwrap(), FileFormat::Ini);
    assert_eq!(detect_format("relay.ron").unwrap(), FileFormat::Ron);
    assert_eq!(detect_format("relay.json5").unwrap(), FileFormat::Json5);
    assert!(matches!(
        detect_format("relay.txt"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
    assert!(detect_format("relay").is_err());
}

#[test]
fn test_yaml_toml_json_load_same_declaration() {
    let temp_dir = TempDir::new().unwrap();

    let yaml = r#"
registry:
  capacity_mb: 8192
models:
  - id: m1
    family: local
  - id: m2
    family: remote_http
    endpoint: http://localhost:11434
"#;
    let toml = r#"
[registry]
capacity_mb = 8192

[[models]]
id = "m1"
family = "local"

[[models]]
id = "m2"
family = "remote_http"
endpoint = "http://localhost:11434"
"#;
    let json = r#"{
  "registry": { "capacity_mb": 8192 },
  "models": [
    { "id": "m1", "family": "local" },
    { "id": "m2", "family": "remote_http", "endpoint": "http://localhost:11434" }
  ]
}"#;

    let mut loaded = Vec::new();
    for (name, content) in [("r.yaml", yaml), ("r.toml", toml), ("r.json", json)] {
        let path = create_test_file(&temp_dir, name, content);
        let decl: TestDeclaration = load_config(path.to_str().unwrap()).unwrap();
        loaded.push(decl);
    }

    for decl in &loaded {
        assert_eq!(decl.registry.capacity_mb, 8192);
        assert_eq!(decl.models.len(), 2);
        assert_eq!(decl.models[1].endpoint.as_deref(), Some("http://localhost:11434"));
    }
    assert_eq!(loaded[0], loaded[1]);
    assert_eq!(loaded[1], loaded[2]);
}

#[test]
fn test_from_str_ron_and_json5() {
    let ron = r#"(
    registry: (capacity_mb: 1024, load_timeout_secs: 30),
    models: [],
)"#;
    let decl: TestDeclaration = from_str(ron, FileFormat::Ron).unwrap();
    assert_eq!(decl.registry.capacity_mb, 1024);
    assert_eq!(decl.registry.load_timeout_secs, Some(30));

    let json5 = r#"{
  // comments are allowed
  registry: { capacity_mb: 2048, },
}"#;
    let decl: TestDeclaration = from_str(json5, FileFormat::Json5).unwrap();
    assert_eq!(decl.registry.capacity_mb, 2048);
    assert!(decl.models.is_empty());
}

#[test]
fn test_env_var_substitution_braced_and_bare() {
    unsafe {
        std::env::set_var("RELAY_CFG_TEST_HOST", "gpu-box");
        std::env::set_var("RELAY_CFG_TEST_PORT", "11434");
    }

    let out = substitute_env_vars("http://${RELAY_CFG_TEST_HOST}:$RELAY_CFG_TEST_PORT/v1").unwrap();
    assert_eq!(out, "http://gpu-box:11434/v1");

    unsafe {
        std::env::remove_var("RELAY_CFG_TEST_HOST");
        std::env::remove_var("RELAY_CFG_TEST_PORT");
    }
}

#[test]
fn test_missing_env_var_preserved() {
    let out = substitute_env_vars("key: ${RELAY_CFG_TEST_DEFINITELY_UNSET}").unwrap();
    assert_eq!(out, "key: ${RELAY_CFG_TEST_DEFINITELY_UNSET}");
}

#[test]
fn test_substitution_inside_loaded_file() {
    unsafe {
        std::env::set_var("RELAY_CFG_TEST_ENDPOINT", "http://10.0.0.5:8000");
    }
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(
        &temp_dir,
        "relay.yaml",
        r#"
registry:
  capacity_mb: 512
models:
  - id: remote
    family: remote_http
    endpoint: ${RELAY_CFG_TEST_ENDPOINT}
"#,
    );
    let decl: TestDeclaration = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(decl.models[0].endpoint.as_deref(), Some("http://10.0.0.5:8000"));
    unsafe {
        std::env::remove_var("RELAY_CFG_TEST_ENDPOINT");
    }
}

#[test]
fn test_env_override_with_prefix() {
    unsafe {
        std::env::set_var("RELAYCFGTEST_REGISTRY__CAPACITY_MB", "777");
    }
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(
        &temp_dir,
        "relay.toml",
        "[registry]\ncapacity_mb = 100\n",
    );
    let decl: TestDeclaration = load_with_env(path.to_str().unwrap(), "RELAYCFGTEST").unwrap();
    assert_eq!(decl.registry.capacity_mb, 777);
    unsafe {
        std::env::remove_var("RELAYCFGTEST_REGISTRY__CAPACITY_MB");
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let result: ConfigResult<TestDeclaration> = load_config("/nonexistent/relay.toml");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_type_mismatch_is_serialization_error() {
    let bad = r#"{ "registry": { "capacity_mb": "lots" } }"#;
    let result: ConfigResult<TestDeclaration> = from_str(bad, FileFormat::Json);
    assert!(matches!(result, Err(ConfigError::Serialization(_))));
}
