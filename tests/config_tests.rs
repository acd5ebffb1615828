//! Integration test suite for the config module
//!
//! Tests the configuration submodules working together:
//! - loader: Layered JSON documents, `clear` overrides, `cache` provenance
//! - options: `key:sub=value` overrides with type coercion
//! - paths: Glob expansion
//! - template: Checkpoint path templates
//! - shipped defaults: `config/defaults.json` drives checkpoint naming

use babyseg::config::loader::merge;
use babyseg::config::paths::{expand_glob, glob_files};
use babyseg::config::template::{format_template, Field};
use babyseg::config::{Config, ConfigLoader};
use babyseg::error::{ConfigError, ErrorKind};
use babyseg::state::CheckpointNaming;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_json(dir: &Path, name: &str, value: Value) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {}", other),
    }
}

// ============================================================================
// LAYERED LOADING TESTS
// ============================================================================

#[test]
fn test_defaults_then_files() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = TempDir::new()?;
    let defaults = write_json(
        tempdir.path(),
        "defaults.json",
        json!({"training": {"resume": true, "init": null}, "eval": {"divisor": 16}}),
    );
    let base = write_json(
        tempdir.path(),
        "base.json",
        json!({"training": {"resume": false}, "model": "babyseg.nn.GroupNet"}),
    );
    let tweak = write_json(
        tempdir.path(),
        "tweak.json",
        json!({"eval": {"clear": true, "divisor": 32}}),
    );

    let config = ConfigLoader::with_defaults(&defaults).load(&[&base, &tweak])?;

    assert_eq!(config.lookup(&["training", "resume"])?, &json!(false));
    assert_eq!(config.lookup(&["training", "init"])?, &Value::Null);
    assert_eq!(config.get("eval"), Some(&json!({"divisor": 32})));
    assert_eq!(config.name()?, "base");
    assert_eq!(config.lookup(&["cache", "names"])?, &json!(["base", "tweak"]));
    assert_eq!(
        config.lookup(&["cache", "files"])?,
        &json!([base.to_string_lossy(), tweak.to_string_lossy()])
    );
    Ok(())
}

#[test]
fn test_later_files_override_scalars_and_lists() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = TempDir::new()?;
    let a = write_json(tempdir.path(), "a.json", json!({"x": {"y": [1, 2, 3]}, "z": {"w": 1}}));
    let b = write_json(tempdir.path(), "b.json", json!({"x": {"y": [4]}, "z": 5}));

    let config = ConfigLoader::without_defaults().load(&[a, b])?;
    assert_eq!(config.lookup(&["x", "y"])?, &json!([4]));
    assert_eq!(config.get("z"), Some(&json!(5)));
    Ok(())
}

#[test]
fn test_non_object_document_is_format_error() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = TempDir::new()?;
    let path = write_json(tempdir.path(), "list.json", json!([1, 2]));

    match ConfigLoader::without_defaults().load(&[path]) {
        Err(e @ ConfigError::Format(_)) => assert_eq!(e.kind(), ErrorKind::Format),
        Err(e) => return Err(format!("Expected Format error, got: {}", e).into()),
        Ok(_) => return Err("Expected error loading a list document".into()),
    }
    Ok(())
}

#[test]
fn test_missing_file_returns_not_found() {
    let result = ConfigLoader::without_defaults()
        .load(&["/tmp/nonexistent_babyseg_config_definitely_does_not_exist.json"]);
    match result {
        Err(ConfigError::FileNotFound(_)) => {}
        other => panic!("Expected FileNotFound, got {:?}", other),
    }
}

#[test]
fn test_invalid_json_returns_error() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = TempDir::new()?;
    let path = tempdir.path().join("broken.json");
    fs::write(&path, "{ this is not valid json }")?;

    let err = ConfigLoader::without_defaults().load(&[path]).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidJson(_)));
    assert_eq!(err.kind(), ErrorKind::Format);
    Ok(())
}

// ============================================================================
// MERGE PROPERTIES
// ============================================================================

#[test]
fn test_clear_marker_never_persists() {
    let mut old = object(json!({"a": {"b": 1, "c": {"d": 2}}}));
    merge(&mut old, object(json!({"a": {"c": {"clear": true, "e": 3}}})));
    assert_eq!(Value::Object(old), json!({"a": {"b": 1, "c": {"e": 3}}}));

    let mut old = object(json!({"a": {"b": 1}}));
    merge(&mut old, object(json!({"a": {"clear": false, "c": 2}})));
    assert_eq!(Value::Object(old), json!({"a": {"b": 1, "c": 2}}));
}

#[test]
fn test_clear_marker_removed_from_inserted_subtrees() {
    let mut old = object(json!({"a": {"b": 1}}));
    merge(
        &mut old,
        object(json!({
            "new": {"x": {"clear": true, "y": {"clear": 0, "z": 1}}},
            "a": {"clear": true, "c": {"clear": true, "d": 2}}
        })),
    );
    assert_eq!(
        Value::Object(old),
        json!({
            "new": {"x": {"y": {"z": 1}}},
            "a": {"c": {"d": 2}}
        })
    );
}

// ============================================================================
// OPTION OVERRIDES
// ============================================================================

#[test]
fn test_apply_options_coerces_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::try_from(json!({"training": {"resume": true}, "eval": {}}))?;
    config.apply_options(&[
        "training:resume=12",
        "eval:orientation=RAS",
        "eval:spacing=0.8",
        "debug=false",
    ])?;

    assert_eq!(config.lookup(&["training", "resume"])?, &json!(12));
    assert_eq!(config.lookup(&["eval", "orientation"])?, &json!("RAS"));
    assert_eq!(config.lookup(&["eval", "spacing"])?, &json!(0.8));
    assert_eq!(config.get("debug"), Some(&json!(false)));
    Ok(())
}

#[test]
fn test_apply_options_errors() {
    let mut config = Config::try_from(json!({"training": {"resume": true}})).unwrap();

    let err = config.apply_options(&["missing:key=1"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lookup);

    let err = config.apply_options(&["training:resume"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);

    let err = config.apply_options(&["a=b=c"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

// ============================================================================
// PATHS AND TEMPLATES
// ============================================================================

#[test]
fn test_glob_expansion_sorted() -> Result<(), Box<dyn std::error::Error>> {
    let tempdir = TempDir::new()?;
    for name in ["run.00010.ckpt", "run.00002.ckpt", "other.00001.ckpt", "run.txt"] {
        fs::write(tempdir.path().join(name), b"")?;
    }

    let files = glob_files(tempdir.path(), "run.*.ckpt")?;
    let names: Vec<_> = files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["run.00002.ckpt", "run.00010.ckpt"]);

    let expanded = expand_glob(tempdir.path().join("*.ckpt"))?;
    assert_eq!(expanded.len(), 3);
    assert!(glob_files(&tempdir.path().join("missing"), "*")?.is_empty());
    Ok(())
}

#[test]
fn test_template_formatting() -> Result<(), Box<dyn std::error::Error>> {
    let out = format_template(
        "{name}.{epoch:05d}.ckpt",
        &[("name", Field::Str("run")), ("epoch", Field::Int(42))],
    )?;
    assert_eq!(out, "run.00042.ckpt");

    let err = format_template("{missing}", &[("name", Field::Str("run"))]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    Ok(())
}

// ============================================================================
// SHIPPED DEFAULTS
// ============================================================================

#[test]
fn test_shipped_defaults_are_usable() -> Result<(), Box<dyn std::error::Error>> {
    let defaults = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/defaults.json");
    let tempdir = TempDir::new()?;
    let experiment = write_json(tempdir.path(), "babyseg.test.json", json!({}));

    let config = ConfigLoader::with_defaults(defaults).load(&[experiment])?;
    let naming = CheckpointNaming::from_config(&config)?;
    let path = naming.path(30)?;
    assert_eq!(path, Path::new("checkpoints").join("babyseg.test.00030.ckpt"));
    assert_eq!(naming.epoch(&path)?, 30);
    assert_eq!(naming.settings().period, 10);
    Ok(())
}
