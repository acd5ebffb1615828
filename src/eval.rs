//! Label remapping, overlap metrics, and metric records.

use crate::config::template::{format_template, Field};
use crate::config::Config;
use crate::data::Sample;
use crate::error::{ConfigError, EvalError};
use crate::state::{CheckpointNaming, EnvContext};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Voxel spacing in millimeters, shared by all axes or given per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Spacing {
    Isotropic(f64),
    PerAxis(Vec<f64>),
}

/// The `eval` configuration section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvalSettings {
    /// Conformed shapes are multiples of this
    pub divisor: u64,
    /// Axis codes such as `LIA`
    pub orientation: String,
    pub spacing: Spacing,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub save_name: Option<String>,
}

impl EvalSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.section("eval")
    }
}

/// Integer types label maps are written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelDType {
    U8,
    I16,
    U16,
    I32,
}

impl LabelDType {
    /// Candidates from narrowest to widest.
    pub const CANDIDATES: [LabelDType; 4] = [
        LabelDType::U8,
        LabelDType::I16,
        LabelDType::U16,
        LabelDType::I32,
    ];

    pub fn min(self) -> i64 {
        match self {
            LabelDType::U8 | LabelDType::U16 => 0,
            LabelDType::I16 => i16::MIN as i64,
            LabelDType::I32 => i32::MIN as i64,
        }
    }

    pub fn max(self) -> i64 {
        match self {
            LabelDType::U8 => u8::MAX as i64,
            LabelDType::I16 => i16::MAX as i64,
            LabelDType::U16 => u16::MAX as i64,
            LabelDType::I32 => i32::MAX as i64,
        }
    }
}

impl fmt::Display for LabelDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabelDType::U8 => "uint8",
            LabelDType::I16 => "int16",
            LabelDType::U16 => "uint16",
            LabelDType::I32 => "int32",
        };
        f.write_str(name)
    }
}

/// Narrowest integer type spanning all values.
pub fn select_dtype(values: &[i64]) -> Result<LabelDType, EvalError> {
    let (min, max) = match (values.iter().min(), values.iter().max()) {
        (Some(&min), Some(&max)) => (min, max),
        _ => return Err(EvalError::Format("no data to select a type for".to_string())),
    };
    debug!("input data spans {} to {} range", min, max);

    LabelDType::CANDIDATES
        .into_iter()
        .find(|t| t.min() <= min && max <= t.max())
        .ok_or(EvalError::NoDtype { min, max })
}

fn label(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_json(path: &Path) -> Result<Value, EvalError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Remapped voxels and the type they fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Remapped {
    pub labels: Vec<i64>,
    pub dtype: LabelDType,
}

/// Mapping from input to output labels; other labels pass through.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelMapping(BTreeMap<i64, i64>);

impl LabelMapping {
    pub fn new(mapping: BTreeMap<i64, i64>) -> Self {
        LabelMapping(mapping)
    }

    /// JSON object `{"old": new}`.
    pub fn from_value(value: &Value) -> Result<Self, EvalError> {
        let object = value
            .as_object()
            .ok_or_else(|| EvalError::Format("label mapping must be a JSON object".to_string()))?;

        let mut mapping = BTreeMap::new();
        for (old, new) in object {
            let old: i64 = old
                .trim()
                .parse()
                .map_err(|_| EvalError::Format(format!("label \"{}\" is not an integer", old)))?;
            let new = label(new)
                .ok_or_else(|| EvalError::Format(format!("label {} is not an integer", new)))?;
            if old < 0 || new < 0 {
                return Err(EvalError::Format(format!("negative label in {} -> {}", old, new)));
            }
            mapping.insert(old, new);
        }
        debug!("using mapping {:?}", mapping);
        Ok(LabelMapping(mapping))
    }

    pub fn load(path: &Path) -> Result<Self, EvalError> {
        info!("loading label mapping from \"{}\"", path.display());
        Self::from_value(&read_json(path)?)
    }

    pub fn get(&self, old: i64) -> Option<i64> {
        self.0.get(&old).copied()
    }

    /// Lookup table covering every mapped label and `max_label`.
    pub fn lut(&self, max_label: i64) -> Vec<i64> {
        let top = self.0.keys().next_back().copied().unwrap_or(0).max(max_label);
        let mut lut: Vec<i64> = (0..=top).collect();
        for (&old, &new) in &self.0 {
            lut[old as usize] = new;
        }
        lut
    }

    /// Recode a label map and select its output type.
    pub fn apply(&self, labels: &[i64]) -> Result<Remapped, EvalError> {
        if let Some(&negative) = labels.iter().find(|&&l| l < 0) {
            return Err(EvalError::Format(format!("cannot remap negative label {}", negative)));
        }

        let lut = self.lut(labels.iter().copied().max().unwrap_or(0));
        debug!("constructed LUT of {} entries", lut.len());
        let labels: Vec<i64> = labels.iter().map(|&l| lut[l as usize]).collect();
        let dtype = select_dtype(&labels)?;
        info!("selected output data type {}", dtype);
        Ok(Remapped { labels, dtype })
    }
}

/// Labels of the model's output channels, in channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneHotLookup(Vec<u8>);

impl OneHotLookup {
    pub fn new(labels: Vec<u8>) -> Self {
        OneHotLookup(labels)
    }

    /// JSON list of labels.
    pub fn from_value(value: &Value) -> Result<Self, EvalError> {
        let items = value
            .as_array()
            .ok_or_else(|| EvalError::Format("one-hot labels must be a JSON list".to_string()))?;
        items
            .iter()
            .map(|item| {
                label(item)
                    .and_then(|l| u8::try_from(l).ok())
                    .ok_or_else(|| EvalError::Format(format!("label {} does not fit uint8", item)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(OneHotLookup)
    }

    pub fn load(path: &Path) -> Result<Self, EvalError> {
        debug!("remapping one-hot to labels using \"{}\"", path.display());
        Self::from_value(&read_json(path)?)
    }

    /// Lookup named by `synthesis.kwargs.optimize`.
    pub fn from_config(config: &Config) -> Result<Self, EvalError> {
        let path = config
            .lookup(&["synthesis", "kwargs", "optimize"])?
            .as_str()
            .ok_or_else(|| EvalError::Format("synthesis:kwargs:optimize is not a path".to_string()))?;
        Self::load(Path::new(path))
    }

    pub fn labels(&self) -> &[u8] {
        &self.0
    }

    /// Label of the most probable channel at each voxel.
    ///
    /// `probabilities` holds one slice per channel, all of equal length.
    pub fn argmax<P: AsRef<[f32]>>(&self, probabilities: &[P]) -> Result<Vec<u8>, EvalError> {
        let first = probabilities
            .first()
            .ok_or_else(|| EvalError::Format("no channels".to_string()))?;
        if probabilities.len() > self.0.len() {
            return Err(EvalError::Format(format!(
                "{} channels but {} labels",
                probabilities.len(),
                self.0.len()
            )));
        }
        let voxels = first.as_ref().len();
        if probabilities.iter().any(|c| c.as_ref().len() != voxels) {
            return Err(EvalError::Format("channels differ in size".to_string()));
        }

        let out = (0..voxels)
            .map(|v| {
                let mut best = 0;
                for (c, channel) in probabilities.iter().enumerate().skip(1) {
                    if channel.as_ref()[v] > probabilities[best].as_ref()[v] {
                        best = c;
                    }
                }
                self.0[best]
            })
            .collect();
        Ok(out)
    }
}

/// Dice overlap per label: `2 |T ∩ P| / (|T| + |P|)`, zero when both are empty.
pub fn dice(truth: &[i64], pred: &[i64], labels: &[i64]) -> Result<Vec<f64>, EvalError> {
    if truth.len() != pred.len() {
        return Err(EvalError::Format(format!(
            "label maps differ in size: {} and {}",
            truth.len(),
            pred.len()
        )));
    }

    let scores = labels
        .iter()
        .map(|&label| {
            let (mut both, mut t, mut p) = (0usize, 0usize, 0usize);
            for (&a, &b) in truth.iter().zip(pred) {
                let (in_t, in_p) = (a == label, b == label);
                t += in_t as usize;
                p += in_p as usize;
                both += (in_t && in_p) as usize;
            }
            let total = t + p;
            if total == 0 {
                0.0
            } else {
                2.0 * both as f64 / total as f64
            }
        })
        .collect();
    Ok(scores)
}

/// Label names from a JSON object `{"label": "name"}`, sorted by label.
pub fn load_label_names(path: &Path) -> Result<Vec<(i64, String)>, EvalError> {
    let value = read_json(path)?;
    let object = value
        .as_object()
        .ok_or_else(|| EvalError::Format("label names must be a JSON object".to_string()))?;

    let mut names = object
        .iter()
        .map(|(k, v)| {
            let id: i64 = k
                .trim()
                .parse()
                .map_err(|_| EvalError::Format(format!("label \"{}\" is not an integer", k)))?;
            let name = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok((id, name))
        })
        .collect::<Result<Vec<_>, EvalError>>()?;
    names.sort_by_key(|(id, _)| *id);
    Ok(names)
}

fn round(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// Metric record for one sample: name, age, and Dice per named label.
pub fn score_sample(
    sample: &Sample,
    truth: &[i64],
    pred: &[i64],
    labels: &[(i64, String)],
    decimals: u32,
) -> Result<Map<String, Value>, EvalError> {
    let ids: Vec<i64> = labels.iter().map(|(id, _)| *id).collect();
    let scores = dice(truth, pred, &ids)?;

    let age = sample.age()?;
    let mut record = Map::new();
    record.insert("sample".to_string(), json!(sample.name()));
    record.insert("age".to_string(), json!(age));
    for ((_, name), score) in labels.iter().zip(scores) {
        record.insert(format!("Dice-{}", name), json!(round(score, decimals)));
    }
    Ok(record)
}

/// Write a metrics record with provenance to `eval.save_name`.
pub fn save_metrics(
    config: &Config,
    env: &EnvContext,
    split: &Path,
    labels: &str,
    metrics: Value,
) -> Result<PathBuf, EvalError> {
    let split = split
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let method = config.name()?;

    let checkpoint = match config.lookup(&["eval", "checkpoint"]) {
        Ok(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Ok(Value::Number(n)) => Some(n.to_string()),
        Ok(_) | Err(ConfigError::MissingKey(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let epoch = match &checkpoint {
        Some(path) => Some(CheckpointNaming::from_config(config)?.epoch(Path::new(path))?),
        None => None,
    };

    let mut record = Map::new();
    record.insert("split".to_string(), json!(split));
    record.insert("labels".to_string(), json!(labels));
    record.insert("method".to_string(), json!(method));
    record.insert("checkpoint".to_string(), json!(checkpoint));
    record.insert("epoch".to_string(), json!(epoch));
    record.insert("metrics".to_string(), metrics);
    if let Value::Object(provenance) = env.collect(config)? {
        record.extend(provenance.clone());
    }

    let template = config
        .lookup(&["eval", "save_name"])?
        .as_str()
        .ok_or_else(|| EvalError::Format("eval:save_name is not a string".to_string()))?;
    let path = PathBuf::from(format_template(
        template,
        &[
            ("split", Field::Str(&split)),
            ("labels", Field::Str(labels)),
            ("method", Field::Str(method)),
        ],
    )?);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    info!("saved metrics to \"{}\"", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_dtype_values() {
        let expected = [
            (0, LabelDType::U8),
            (-1, LabelDType::I16),
            (1 << 15, LabelDType::U16),
            (1 << 16, LabelDType::I32),
        ];
        for (value, dtype) in expected {
            assert_eq!(select_dtype(&[value]).unwrap(), dtype);
        }
    }

    #[test]
    fn test_select_dtype_long() {
        let err = select_dtype(&[1 << 32]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Range);
        assert!(select_dtype(&[]).is_err());
    }

    #[test]
    fn test_select_dtype_spans_range() {
        assert_eq!(select_dtype(&[-1, 40000]).unwrap(), LabelDType::I32);
        assert_eq!(select_dtype(&[0, 255]).unwrap(), LabelDType::U8);
    }

    #[test]
    fn test_label_mapping_keeps_unmapped() {
        let mapping = LabelMapping::from_value(&json!({"2": 20, "5": "1"})).unwrap();
        let out = mapping.apply(&[0, 2, 3, 5, 300]).unwrap();
        assert_eq!(out.labels, vec![0, 20, 3, 1, 300]);
        assert_eq!(out.dtype, LabelDType::I16);
        assert_eq!(mapping.lut(1).len(), 6);
    }

    #[test]
    fn test_label_mapping_rejects_bad_input() {
        assert!(LabelMapping::from_value(&json!([1, 2])).is_err());
        assert!(LabelMapping::from_value(&json!({"a": 1})).is_err());
        let mapping = LabelMapping::default();
        assert!(mapping.apply(&[-3]).is_err());
    }

    #[test]
    fn test_one_hot_argmax() {
        let lookup = OneHotLookup::from_value(&json!([0, 4, 7])).unwrap();
        let probs = vec![
            vec![0.7f32, 0.1, 0.2],
            vec![0.2, 0.8, 0.2],
            vec![0.1, 0.1, 0.6],
        ];
        assert_eq!(lookup.argmax(&probs).unwrap(), vec![0, 4, 7]);
        assert!(OneHotLookup::from_value(&json!([256])).is_err());
        assert!(OneHotLookup::new(vec![1]).argmax(&probs).is_err());
    }

    #[test]
    fn test_dice() {
        let truth = [0, 1, 1, 2, 2, 2];
        let pred = [0, 1, 2, 2, 2, 1];
        let scores = dice(&truth, &pred, &[0, 1, 2, 9]).unwrap();
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[1], 0.5);
        assert!((scores[2] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(scores[3], 0.0);
        assert!(dice(&truth, &pred[..2], &[0]).is_err());
    }

    #[test]
    fn test_round() {
        assert_eq!(round(0.123456, 3), 0.123);
        assert_eq!(round(2.0 / 3.0, 5), 0.66667);
    }
}
