//! Segmentation requests and the plan resolved from them.
//!
//! Image decoding and resampling happen outside this crate. A plan pins down
//! everything else inference needs: the model and the checkpoint its weights
//! came from, the conformed geometry, the outputs, and the device.

use crate::config::Config;
use crate::error::EvalError;
use crate::eval::{EvalSettings, OneHotLookup, Spacing};
use crate::nn::{load_model, ModelInit};
use crate::state::CheckpointNaming;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Smallest conformed extent along any axis.
pub const MIN_EXTENT: u64 = 128;
/// Largest conformed extent along any axis.
pub const MAX_EXTENT: u64 = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(Option<usize>),
}

impl FromStr for Device {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(None)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(|index| Device::Cuda(Some(index)))
                .ok_or_else(|| EvalError::Format(format!("unknown device \"{}\"", s))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(None) => write!(f, "cuda"),
            Device::Cuda(Some(index)) => write!(f, "cuda:{}", index),
        }
    }
}

/// Select a device and fail if it is unavailable.
///
/// Only the CPU is available to this build.
pub fn select_device(name: &str) -> Result<Device, EvalError> {
    info!("selecting device \"{}\"", name);
    let device: Device = name.parse()?;
    match device {
        Device::Cpu => {
            info!("confirmed availability of {}", device);
            Ok(device)
        }
        Device::Cuda(_) => Err(EvalError::DeviceUnavailable(device.to_string())),
    }
}

/// Round each extent up to a multiple of `divisor`, then clamp to the supported range.
pub fn conform_shape(shape: &[u64], divisor: u64) -> Result<Vec<u64>, EvalError> {
    if divisor == 0 {
        return Err(EvalError::Format("eval:divisor must be positive".to_string()));
    }
    Ok(shape
        .iter()
        .map(|&n| {
            let rounded = n.min(MAX_EXTENT).div_ceil(divisor) * divisor;
            rounded.clamp(MIN_EXTENT, MAX_EXTENT)
        })
        .collect())
}

/// Inputs and outputs of one segmentation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    /// Lead image first; the rest are conformed to it
    pub images: Vec<PathBuf>,
    pub checkpoint: ModelInit,
    pub out_seg: Option<PathBuf>,
    pub out_prob: Option<PathBuf>,
    pub out_lead: Option<PathBuf>,
    pub device: String,
    pub threads: Option<usize>,
    /// Lead image extent after cropping, when already known
    pub lead_shape: Option<Vec<u64>>,
}

impl Default for SegmentRequest {
    fn default() -> Self {
        SegmentRequest {
            images: Vec::new(),
            checkpoint: ModelInit::Latest,
            out_seg: None,
            out_prob: None,
            out_lead: None,
            device: "cpu".to_string(),
            threads: None,
            lead_shape: None,
        }
    }
}

impl SegmentRequest {
    pub fn new(images: Vec<PathBuf>) -> Self {
        SegmentRequest {
            images,
            ..Default::default()
        }
    }

    /// Requested outputs by kind.
    pub fn outputs(&self) -> BTreeMap<String, PathBuf> {
        [
            ("seg", &self.out_seg),
            ("prob", &self.out_prob),
            ("lead", &self.out_lead),
        ]
        .into_iter()
        .filter_map(|(kind, path)| path.clone().map(|p| (kind.to_string(), p)))
        .collect()
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.images.is_empty() {
            return Err(EvalError::Format("received no input images".to_string()));
        }
        if self.outputs().is_empty() {
            return Err(EvalError::Format("received no output file paths".to_string()));
        }
        if self.threads == Some(0) {
            return Err(EvalError::Format("thread count must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lead(&self) -> Option<&Path> {
        self.images.first().map(PathBuf::as_path)
    }
}

/// Everything resolved before running inference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationPlan {
    pub method: String,
    pub images: Vec<PathBuf>,
    pub model: String,
    pub parameters: usize,
    pub checkpoint: Option<PathBuf>,
    pub epoch: Option<u64>,
    pub orientation: String,
    pub spacing: Spacing,
    pub divisor: u64,
    pub conformed_shape: Option<Vec<u64>>,
    /// Labels of the output channels, when a label map is requested
    pub labels: Option<Vec<u8>>,
    pub outputs: BTreeMap<String, PathBuf>,
    pub device: String,
    pub threads: Option<usize>,
}

impl SegmentationPlan {
    /// Resolve configuration, device, and model weights for `request`.
    pub fn resolve(config: &Config, request: &SegmentRequest) -> Result<Self, EvalError> {
        request.validate()?;
        info!("received inputs {:?}", request.images);

        let device = select_device(&request.device)?;
        let settings = EvalSettings::from_config(config)?;
        let loaded = load_model(config, &request.checkpoint, "model")?;

        // Explicit paths need not follow the experiment's naming scheme.
        let epoch = match &loaded.checkpoint {
            Some(path) => CheckpointNaming::from_config(config)
                .and_then(|naming| naming.epoch(path))
                .map_err(|e| debug!("no epoch for checkpoint: {}", e))
                .ok(),
            None => None,
        };

        let labels = match request.out_seg {
            Some(_) => Some(OneHotLookup::from_config(config)?.labels().to_vec()),
            None => None,
        };

        let conformed_shape = match &request.lead_shape {
            Some(shape) => {
                let conformed = conform_shape(shape, settings.divisor)?;
                info!("reshaped lead image to {:?}", conformed);
                Some(conformed)
            }
            None => None,
        };

        Ok(SegmentationPlan {
            method: config.name()?.to_string(),
            images: request.images.clone(),
            model: loaded.model.entity().to_string(),
            parameters: loaded.model.num_parameters(),
            checkpoint: loaded.checkpoint,
            epoch,
            orientation: settings.orientation,
            spacing: settings.spacing,
            divisor: settings.divisor,
            conformed_shape,
            labels,
            outputs: request.outputs(),
            device: device.to_string(),
            threads: request.threads,
        })
    }
}
