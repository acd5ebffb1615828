//! BabySeg core library
//!
//! Configuration, model construction and checkpoint lifecycle for infant
//! brain MRI segmentation. Tensor arithmetic and image I/O live outside this
//! crate; everything that decides *what* to run and *which state* to run it
//! with lives here.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **config**: Layered JSON configuration with `clear` overrides and options
//! - **builder**: Registry-based object construction from declarative specs
//! - **state**: Checkpoint naming, resume logic, and provenance records
//! - **nn**: Model components and weight loading
//! - **data**: Dataset samples, worker sharding, and label-map loading
//! - **eval**: Label remapping, dtype selection, and Dice scoring
//! - **segment**: Segmentation requests and resolved plans
//! - **log_collector**: `log` backend with stderr echo and file persistence

// Core foundational modules
pub mod error;

pub mod builder;
pub mod config;
pub mod state;

pub mod nn;

pub mod data;
pub mod eval;
pub mod segment;

// Decoupled logging backend
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    AppError, BuildError, CheckpointError, ConfigError, DataError, EnvError, ErrorKind, EvalError,
    ModelError, Result,
};

pub use builder::{Args, Built, Registry, Target};
pub use config::{Config, ConfigLoader};
pub use log_collector::{LogCollector, LogLine};
pub use nn::{load_model, Component, ModelInit};
pub use segment::{SegmentRequest, SegmentationPlan};
pub use state::{CheckpointStore, EnvContext, EpochFilter, ResumeState, Stateful};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
