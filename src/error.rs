//! Unified error type hierarchy for BabySeg
//!
//! Provides structured error handling with ConfigError, BuildError,
//! CheckpointError, EnvError, ModelError, DataError, EvalError, and AppError. Every
//! domain error reports an `ErrorKind` so callers can branch on the category
//! (malformed input, missing key, wrong entity type, missing files, range)
//! without matching individual variants.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse error category shared by all BabySeg errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed document, option string, name, or setting
    Format,
    /// Missing key, component, or unregistered entity
    Lookup,
    /// Resolved entity cannot be called or constructed
    Type,
    /// No files matching a pattern or filter
    NotFound,
    /// Value outside its permitted range
    Range,
    /// Underlying filesystem failure
    Io,
}

/// Configuration file parsing and option errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed configuration: {0}")]
    Format(String),

    #[error("Configuration key not found: {0}")]
    MissingKey(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::FileNotFound(_) => ErrorKind::NotFound,
            ConfigError::InvalidJson(_) | ConfigError::Format(_) => ErrorKind::Format,
            ConfigError::MissingKey(_) => ErrorKind::Lookup,
            ConfigError::IoError(_) => ErrorKind::Io,
        }
    }
}

/// Entity registry and object construction errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Entity name \"{0}\" does not specify a module")]
    InvalidName(String),

    #[error("Malformed entity specification: {0}")]
    InvalidSpec(String),

    #[error("Unregistered module \"{module}\" for entity \"{entity}\"")]
    UnknownModule { module: String, entity: String },

    #[error("Unregistered entity \"{entity}\" in module \"{module}\"")]
    UnknownEntity { module: String, entity: String },

    #[error("Entity \"{0}\" is not callable")]
    NotCallable(String),

    #[error("Entity \"{0}\" is already registered")]
    Duplicate(String),

    #[error("Invalid arguments for \"{entity}\": {reason}")]
    InvalidArguments { entity: String, reason: String },
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::InvalidName(_)
            | BuildError::InvalidSpec(_)
            | BuildError::Duplicate(_)
            | BuildError::InvalidArguments { .. } => ErrorKind::Format,
            BuildError::UnknownModule { .. } | BuildError::UnknownEntity { .. } => {
                ErrorKind::Lookup
            }
            BuildError::NotCallable(_) => ErrorKind::Type,
        }
    }
}

/// Execution environment provenance errors.
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Uncommitted change in repository \"{}\"", .0.display())]
    UncommittedChange(PathBuf),

    #[error("Repository setting malformed: {0}")]
    Format(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
}

impl EnvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnvError::UncommittedChange(_) | EnvError::Format(_) => ErrorKind::Format,
            EnvError::Git(_) => ErrorKind::Io,
        }
    }
}

/// Checkpoint listing, naming, loading, and saving errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("No checkpoints found: {0}")]
    NotFound(String),

    #[error("Epoch {0} is not a non-negative integer")]
    NegativeEpoch(i64),

    #[error("Resume value {0} is not of type bool or int")]
    InvalidResume(String),

    #[error("Malformed checkpoint setting: {0}")]
    Format(String),

    #[error("Checkpoint \"{}\" has no entry for component \"{component}\"", .path.display())]
    MissingComponent { path: PathBuf, component: String },

    #[error("Pattern \"{pattern}\" does not match checkpoint path \"{path}\"")]
    EpochNotMatched { path: String, pattern: String },

    #[error("Invalid checkpoint pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Component state rejected: {0}")]
    State(String),

    #[error("Failed to read checkpoint {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provenance error: {0}")]
    Env(#[from] EnvError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CheckpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::NotFound(_) => ErrorKind::NotFound,
            CheckpointError::NegativeEpoch(_) => ErrorKind::Range,
            CheckpointError::InvalidResume(_)
            | CheckpointError::Format(_)
            | CheckpointError::InvalidPattern(_)
            | CheckpointError::State(_)
            | CheckpointError::Json(_) => ErrorKind::Format,
            CheckpointError::MissingComponent { .. } | CheckpointError::EpochNotMatched { .. } => {
                ErrorKind::Lookup
            }
            CheckpointError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            CheckpointError::Read { .. } | CheckpointError::Io(_) => ErrorKind::Io,
            CheckpointError::Config(e) => e.kind(),
            CheckpointError::Env(e) => e.kind(),
        }
    }
}

/// Model construction and weight restoration errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Config(e) => e.kind(),
            ModelError::Build(e) => e.kind(),
            ModelError::Checkpoint(e) => e.kind(),
        }
    }
}

/// Dataset, sharding, and parallel loading errors.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Malformed dataset input: {0}")]
    Format(String),

    #[error("Sample key not found: {0}")]
    MissingKey(String),

    #[error("No files found: {0}")]
    NotFound(String),

    #[error("Failed to load \"{}\": {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    #[error("Invalid JSON in dataset file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error during data operations: {0}")]
    IoError(#[from] io::Error),
}

impl DataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::Format(_) | DataError::InvalidJson(_) => ErrorKind::Format,
            DataError::MissingKey(_) => ErrorKind::Lookup,
            DataError::NotFound(_) => ErrorKind::NotFound,
            DataError::Load { .. } | DataError::IoError(_) => ErrorKind::Io,
        }
    }
}

/// Label remapping, metric, and segmentation planning errors.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("No integer type spans {min} to {max}")]
    NoDtype { min: i64, max: i64 },

    #[error("Malformed evaluation input: {0}")]
    Format(String),

    #[error("Device \"{0}\" is unavailable")]
    DeviceUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Provenance error: {0}")]
    Env(#[from] EnvError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error during evaluation: {0}")]
    IoError(#[from] io::Error),
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::NoDtype { .. } => ErrorKind::Range,
            EvalError::Format(_) | EvalError::InvalidJson(_) => ErrorKind::Format,
            EvalError::DeviceUnavailable(_) => ErrorKind::NotFound,
            EvalError::Config(e) => e.kind(),
            EvalError::Checkpoint(e) => e.kind(),
            EvalError::Model(e) => e.kind(),
            EvalError::Env(e) => e.kind(),
            EvalError::Data(e) => e.kind(),
            EvalError::IoError(_) => ErrorKind::Io,
        }
    }
}

/// Global error type for BabySeg entry points
///
/// Provides unified error categorization and user-facing messages for the
/// command-line wrappers, which print the message and exit nonzero.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Invalid command-line input (e.g., no outputs requested)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(e) => e.kind(),
            AppError::Build(e) => e.kind(),
            AppError::Checkpoint(e) => e.kind(),
            AppError::Model(e) => e.kind(),
            AppError::Data(e) => e.kind(),
            AppError::Eval(e) => e.kind(),
            AppError::InvalidInput(_) => ErrorKind::Format,
        }
    }

    /// Get a user-facing error message suitable for terminal display
    pub fn user_message(&self) -> String {
        match self {
            AppError::Config(e) => format!("Could not load configuration: {}", e),
            AppError::Build(e) => format!("Could not build model: {}", e),
            AppError::Checkpoint(e) => format!("Checkpoint error: {}", e),
            AppError::Model(e) => format!("Could not load model: {}", e),
            AppError::Data(e) => format!("Data error: {}", e),
            AppError::Eval(e) => format!("Segmentation error: {}", e),
            AppError::InvalidInput(msg) => format!("Invalid input: {}", msg),
        }
    }
}

/// Top-level result type for operations that may fail.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound("/etc/config.json".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration file not found: /etc/config.json"
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_build_error_kinds() {
        assert_eq!(BuildError::InvalidName("Foo".into()).kind(), ErrorKind::Format);
        assert_eq!(BuildError::NotCallable("a.b".into()).kind(), ErrorKind::Type);
        let err = BuildError::UnknownEntity {
            module: "babyseg.nn".into(),
            entity: "Missing".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Lookup);
        assert_eq!(
            err.to_string(),
            "Unregistered entity \"Missing\" in module \"babyseg.nn\""
        );
    }

    #[test]
    fn test_checkpoint_error_kinds() {
        assert_eq!(CheckpointError::NegativeEpoch(-1).kind(), ErrorKind::Range);
        assert_eq!(
            CheckpointError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        let nested = CheckpointError::Config(ConfigError::MissingKey("training".into()));
        assert_eq!(nested.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn test_app_error_user_message() {
        let err = AppError::InvalidInput("no outputs requested".into());
        assert_eq!(err.user_message(), "Invalid input: no outputs requested");
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err("test error".into());
        assert!(result.is_err());
    }
}
