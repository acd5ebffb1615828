//! Configuration module for segmentation experiments.
//!
//! Settings live in layered JSON documents that are merged into a single
//! `Config` tree. The tree is read-only after loading except for explicit
//! option overrides.
//!
//! # Module Structure
//!
//! - `loader`: Reads documents, merges them, and records provenance under `cache`
//! - `options`: Applies `key:sub=value` overrides with type coercion
//! - `paths`: Qualifies relative paths against `BABYSEG_HOME` and expands globs
//! - `template`: Formats `{name}`/`{epoch}` style path templates
//!
//! # Configuration Flow
//!
//! 1. `ConfigLoader` reads the defaults document, if any
//! 2. Each experiment file is merged on top, honouring `clear`
//! 3. `cache.name` identifies the experiment for checkpoint naming
//! 4. Command-line options override individual entries
//! 5. Consumers read typed sections with `Config::section`

pub mod loader;
pub mod options;
pub mod paths;
pub mod template;

pub use loader::{ConfigLoader, DEFAULTS};
pub use paths::qualify_path;

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;

/// Merged settings tree.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Config(Map<String, Value>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Top-level entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Walk nested objects, failing on the first missing key.
    pub fn lookup(&self, keys: &[&str]) -> Result<&Value, ConfigError> {
        let (first, rest) = keys
            .split_first()
            .ok_or_else(|| ConfigError::MissingKey(String::new()))?;
        let mut value = self
            .0
            .get(*first)
            .ok_or_else(|| ConfigError::MissingKey(first.to_string()))?;

        for (depth, key) in rest.iter().enumerate() {
            value = value
                .as_object()
                .and_then(|map| map.get(*key))
                .ok_or_else(|| ConfigError::MissingKey(keys[..depth + 2].join(":")))?;
        }
        Ok(value)
    }

    /// Deserialize a top-level section into a typed struct.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.lookup(&[key])?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ConfigError::Format(format!("section \"{}\" is malformed: {}", key, e))
        })
    }

    /// Experiment name recorded by the loader under `cache.name`.
    pub fn name(&self) -> Result<&str, ConfigError> {
        self.lookup(&["cache", "name"])?
            .as_str()
            .ok_or_else(|| ConfigError::Format("cache:name is not a string".to_string()))
    }

    /// Apply `key:sub=value` overrides.
    pub fn apply_options<S: AsRef<str>>(&mut self, options: &[S]) -> Result<(), ConfigError> {
        options::apply_options(&mut self.0, options)
    }

    /// Pretty JSON rendering for logs and the command line.
    pub fn to_pretty_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }
}

impl From<Map<String, Value>> for Config {
    fn from(map: Map<String, Value>) -> Self {
        Config(map)
    }
}

impl From<Config> for Value {
    fn from(config: Config) -> Self {
        Value::Object(config.0)
    }
}

impl TryFrom<Value> for Config {
    type Error = ConfigError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Config(map)),
            _ => Err(ConfigError::Format(
                "configuration must be a JSON object".to_string(),
            )),
        }
    }
}

/// Load files on top of the default document.
pub fn load<P: AsRef<Path>>(files: &[P]) -> Result<Config, ConfigError> {
    ConfigLoader::new().load(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Config {
        Config::try_from(json!({
            "cache": {"name": "babyseg.v1"},
            "checkpoint": {"period": 5, "folder": "checkpoints"},
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_nested() {
        let config = sample();
        assert_eq!(config.lookup(&["checkpoint", "period"]).unwrap(), &json!(5));
    }

    #[test]
    fn test_lookup_missing_reports_path() {
        let config = sample();
        let err = config.lookup(&["checkpoint", "regex"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref k) if k == "checkpoint:regex"));
    }

    #[test]
    fn test_name() {
        assert_eq!(sample().name().unwrap(), "babyseg.v1");
        assert!(Config::new().name().is_err());
    }

    #[test]
    fn test_section() {
        #[derive(serde::Deserialize)]
        struct Section {
            period: u64,
        }
        let section: Section = sample().section("checkpoint").unwrap();
        assert_eq!(section.period, 5);
        assert!(sample().section::<Section>("cache").is_err());
    }

    #[test]
    fn test_try_from_rejects_non_object() {
        assert!(Config::try_from(json!([1, 2])).is_err());
    }
}
