//! Checkpoint lifecycle for training and inference.
//!
//! A `CheckpointStore` decides how an experiment starts (fresh, from an
//! initial state, or resumed from a saved epoch), restores component state
//! from gzip-compressed JSON documents, and writes one document per saved
//! epoch together with a provenance record.
//!
//! # Module Structure
//!
//! - `naming`: Epoch/path conversion and filtered listing
//! - `env`: Memoized provenance record (`EnvContext`)

pub mod env;
pub mod naming;

pub use env::EnvContext;
pub use naming::{CheckpointNaming, CheckpointSettings, EpochFilter};

use crate::config::Config;
use crate::error::{CheckpointError, ConfigError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Anything whose state round-trips through a checkpoint.
pub trait Stateful {
    fn state_dict(&self) -> Value;
    fn load_state_dict(&mut self, state: &Value) -> Result<(), CheckpointError>;
}

impl<T: Stateful + ?Sized> Stateful for Box<T> {
    fn state_dict(&self) -> Value {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: &Value) -> Result<(), CheckpointError> {
        (**self).load_state_dict(state)
    }
}

/// How an experiment started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeState {
    /// No state was loaded
    Fresh,
    /// Fresh start from `training.init`
    Initialized(PathBuf),
    /// Resumed from the latest checkpoint
    ResumedLatest { epoch: u64, path: PathBuf },
    /// Resumed from the checkpoint of a requested epoch
    ResumedAt { epoch: u64, path: PathBuf },
}

impl ResumeState {
    /// Epoch the experiment continues from.
    pub fn epoch(&self) -> u64 {
        match self {
            ResumeState::Fresh | ResumeState::Initialized(_) => 0,
            ResumeState::ResumedLatest { epoch, .. } | ResumeState::ResumedAt { epoch, .. } => {
                *epoch
            }
        }
    }

    /// Document state is restored from, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResumeState::Fresh => None,
            ResumeState::Initialized(path)
            | ResumeState::ResumedLatest { path, .. }
            | ResumeState::ResumedAt { path, .. } => Some(path),
        }
    }
}

/// Read a checkpoint document.
pub fn read_checkpoint(path: &Path) -> Result<Map<String, Value>, CheckpointError> {
    let file = File::open(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CheckpointError::Format(format!(
            "checkpoint \"{}\" is not a JSON object",
            path.display()
        ))),
    }
}

/// Write a checkpoint document, creating the parent folder.
pub fn write_checkpoint(path: &Path, document: &Map<String, Value>) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    serde_json::to_writer(&mut encoder, document)?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Restore components from their entries in a checkpoint document.
pub fn restore(path: &Path, components: &mut [(&str, &mut dyn Stateful)]) -> Result<(), CheckpointError> {
    let document = read_checkpoint(path)?;
    for (name, component) in components.iter_mut() {
        let state = document
            .get(*name)
            .ok_or_else(|| CheckpointError::MissingComponent {
                path: path.to_path_buf(),
                component: name.to_string(),
            })?;
        component.load_state_dict(state)?;
    }
    let names: Vec<&str> = components.iter().map(|(name, _)| *name).collect();
    info!("restored {:?} from {}", names, path.display());
    Ok(())
}

/// Checkpoint lifecycle bound to one configuration.
#[derive(Debug)]
pub struct CheckpointStore {
    config: Config,
    naming: CheckpointNaming,
    env: EnvContext,
}

impl CheckpointStore {
    pub fn from_config(config: &Config) -> Result<Self, CheckpointError> {
        Ok(CheckpointStore {
            naming: CheckpointNaming::from_config(config)?,
            config: config.clone(),
            env: EnvContext::new(),
        })
    }

    /// Replace the provenance context, e.g. with `EnvContext::lenient()`.
    pub fn with_env(mut self, env: EnvContext) -> Self {
        self.env = env;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn naming(&self) -> &CheckpointNaming {
        &self.naming
    }

    pub fn env(&self) -> &EnvContext {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut EnvContext {
        &mut self.env
    }

    pub fn path(&self, epoch: u64) -> Result<PathBuf, CheckpointError> {
        self.naming.path(epoch)
    }

    pub fn epoch(&self, path: &Path) -> Result<u64, CheckpointError> {
        self.naming.epoch(path)
    }

    pub fn list(&self, filter: EpochFilter) -> Result<Vec<PathBuf>, CheckpointError> {
        self.naming.list(filter)
    }

    fn init_path(&self) -> Result<Option<PathBuf>, CheckpointError> {
        match self.config.lookup(&["training", "init"]) {
            Ok(Value::String(s)) if !s.is_empty() => Ok(Some(PathBuf::from(s))),
            Ok(Value::Null) | Err(ConfigError::MissingKey(_)) => Ok(None),
            Ok(Value::String(_)) => Ok(None),
            Ok(other) => Err(CheckpointError::Format(format!(
                "training:init {} is not a path",
                other
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide the starting state without loading anything.
    pub fn plan(&self) -> Result<ResumeState, CheckpointError> {
        let resume = self.config.lookup(&["training", "resume"])?;
        let init = self.init_path()?;
        let checkpoints = self.naming.existing()?;
        debug!("resume {} with {} checkpoints", resume, checkpoints.len());

        if checkpoints.is_empty() || resume == &Value::Bool(false) {
            return Ok(match init {
                Some(path) => ResumeState::Initialized(path),
                None => ResumeState::Fresh,
            });
        }

        match resume {
            Value::Bool(_) => {
                let (path, epoch) = self.naming.latest()?;
                Ok(ResumeState::ResumedLatest { epoch, path })
            }
            Value::Number(n) if n.is_u64() => {
                let epoch = n.as_u64().unwrap_or_default();
                Ok(ResumeState::ResumedAt {
                    epoch,
                    path: self.naming.path(epoch)?,
                })
            }
            other => Err(CheckpointError::InvalidResume(other.to_string())),
        }
    }

    /// Initialize components according to the resume settings.
    pub fn load(&self, components: &mut [(&str, &mut dyn Stateful)]) -> Result<ResumeState, CheckpointError> {
        let state = self.plan()?;
        match state.path() {
            Some(path) => restore(path, components)?,
            None => info!("starting fresh without initial state"),
        }
        Ok(state)
    }

    /// Save component states and provenance for `epoch`.
    ///
    /// Writes only when `force` is set or `epoch` is a multiple of the
    /// configured period, and returns the written path.
    pub fn save(
        &self,
        epoch: i64,
        components: &[(&str, &dyn Stateful)],
        force: bool,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let epoch = u64::try_from(epoch).map_err(|_| CheckpointError::NegativeEpoch(epoch))?;
        let period = self.naming.settings().period;
        if period == 0 {
            return Err(CheckpointError::Format(
                "checkpoint:period must be positive".to_string(),
            ));
        }
        if !force && epoch % period != 0 {
            return Ok(None);
        }

        let mut document = Map::new();
        for (name, component) in components {
            document.insert(name.to_string(), component.state_dict());
        }
        document.insert("env".to_string(), self.env.collect(&self.config)?.clone());

        let path = self.naming.path(epoch)?;
        write_checkpoint(&path, &document)?;
        let names: Vec<&str> = components.iter().map(|(name, _)| *name).collect();
        info!("saved {:?} to {}", names, path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Counter(i64);

    impl Stateful for Counter {
        fn state_dict(&self) -> Value {
            json!(self.0)
        }

        fn load_state_dict(&mut self, state: &Value) -> Result<(), CheckpointError> {
            self.0 = state
                .as_i64()
                .ok_or_else(|| CheckpointError::State("counter must be an integer".into()))?;
            Ok(())
        }
    }

    #[test]
    fn test_resume_state_accessors() {
        assert_eq!(ResumeState::Fresh.epoch(), 0);
        assert!(ResumeState::Fresh.path().is_none());
        let state = ResumeState::ResumedAt {
            epoch: 7,
            path: PathBuf::from("a.ckpt"),
        };
        assert_eq!(state.epoch(), 7);
        assert_eq!(state.path(), Some(Path::new("a.ckpt")));
    }

    #[test]
    fn test_document_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("doc.ckpt");
        let mut doc = Map::new();
        doc.insert("model".into(), json!({"w": [1.0, 2.0]}));
        write_checkpoint(&path, &doc).unwrap();
        assert_eq!(read_checkpoint(&path).unwrap(), doc);
    }

    #[test]
    fn test_restore_missing_component() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.ckpt");
        let mut doc = Map::new();
        doc.insert("model".into(), json!(3));
        write_checkpoint(&path, &doc).unwrap();

        let mut model = Counter::default();
        restore(&path, &mut [("model", &mut model)]).unwrap();
        assert_eq!(model.0, 3);

        let mut optim = Counter::default();
        let err = restore(&path, &mut [("optim", &mut optim)]).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingComponent { .. }));
    }

    #[test]
    fn test_read_missing_checkpoint() {
        let err = read_checkpoint(Path::new("/nonexistent/doc.ckpt")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
