//! Config file loader and layered merging.
//!
//! Documents are read successively. Later entries override earlier ones
//! unless both are objects, in which case they are merged recursively. An
//! incoming object carrying a truthy `clear` key replaces the prior entry
//! wholesale instead.

use crate::config::paths::qualify_path;
use crate::config::Config;
use crate::error::ConfigError;
use log::{debug, info};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Default configuration, relative to the working directory or `BABYSEG_HOME`.
pub const DEFAULTS: &str = "config/defaults.json";

/// Key that requests replacement instead of recursive merging.
const CLEAR_KEY: &str = "clear";

/// Read a JSON document that must contain an object.
pub fn read_document(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::Format(format!(
            "file \"{}\" does not specify an object",
            path.display()
        ))),
    }
}

/// JSON truthiness: `null`, `false`, zero, and empty containers are falsy.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |x| x != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Merge `new` into `old` in place.
///
/// The `clear` key of an incoming object is always consumed, at every depth.
/// A falsy `clear` leaves the object to be merged like any other.
pub fn merge(old: &mut Map<String, Value>, new: Map<String, Value>) {
    for (key, value) in new {
        let mut incoming = match value {
            Value::Object(map) => map,
            other => {
                old.insert(key, other);
                continue;
            }
        };

        let clear = is_truthy(incoming.remove(CLEAR_KEY).as_ref());
        let recurse = !clear && old.get(&key).map_or(false, Value::is_object);
        if recurse {
            if let Some(Value::Object(prior)) = old.get_mut(&key) {
                merge(prior, incoming);
            }
        } else {
            if clear {
                info!("cleared configuration entry \"{}\"", key);
            }
            let mut fresh = Map::new();
            merge(&mut fresh, incoming);
            old.insert(key, Value::Object(fresh));
        }
    }
}

/// Successive JSON loader with an optional defaults document.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    defaults: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        ConfigLoader {
            defaults: Some(PathBuf::from(DEFAULTS)),
        }
    }
}

impl ConfigLoader {
    /// Loader that reads `DEFAULTS` first.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that reads only the files passed to `load`.
    pub fn without_defaults() -> Self {
        ConfigLoader { defaults: None }
    }

    /// Loader reading a custom defaults document first.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        ConfigLoader {
            defaults: Some(path.into()),
        }
    }

    pub fn defaults(&self) -> Option<&Path> {
        self.defaults.as_deref()
    }

    /// Load defaults, then fold each file into the result.
    ///
    /// Records the files read under `cache`: `name` (first stem, kept if
    /// already present), `names` (all stems), and `files` (paths as given).
    pub fn load<P: AsRef<Path>>(&self, files: &[P]) -> Result<Config, ConfigError> {
        let mut out = Map::new();
        if let Some(defaults) = &self.defaults {
            debug!("loading default configuration from \"{}\"", defaults.display());
            out = read_document(&qualify_path(defaults))?;
        }

        let mut names = Vec::with_capacity(files.len());
        for file in files {
            let path = qualify_path(file.as_ref());
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            names.push(Value::String(stem));
            merge(&mut out, read_document(&path)?);
        }

        if !names.is_empty() {
            let cache = out
                .entry("cache")
                .or_insert_with(|| Value::Object(Map::new()));
            if !cache.is_object() {
                *cache = Value::Object(Map::new());
            }
            if let Value::Object(cache) = cache {
                cache
                    .entry("name")
                    .or_insert_with(|| names[0].clone());
                cache.insert("names".to_string(), Value::Array(names));
                let literal = files
                    .iter()
                    .map(|f| Value::String(f.as_ref().to_string_lossy().into_owned()))
                    .collect();
                cache.insert("files".to_string(), Value::Array(literal));
            }

            let shown: Vec<_> = files.iter().map(|f| f.as_ref().display().to_string()).collect();
            info!("loaded configuration from {:?}", shown);
        }

        Ok(Config::from(out))
    }
}
