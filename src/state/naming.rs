//! Checkpoint artifact naming: epoch to path, path to epoch, and listing.

use crate::config::paths::glob_files;
use crate::config::template::{format_template, Field};
use crate::config::Config;
use crate::error::{CheckpointError, ErrorKind};
use log::debug;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// The `checkpoint` configuration section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointSettings {
    /// Directory holding the artifacts
    pub folder: PathBuf,
    /// File name template with `{name}` and `{epoch}`
    pub path: String,
    /// File name glob template with `{name}`
    pub glob: String,
    /// Pattern with a named group `epoch`
    pub regex: String,
    /// Save cadence in epochs
    pub period: u64,
}

/// Which epochs `list` keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochFilter {
    #[default]
    All,
    Exact(u64),
    /// Inclusive bounds; `step` is the minimum distance between retained epochs.
    Range {
        min: Option<u64>,
        max: Option<u64>,
        step: Option<u64>,
    },
}

impl EpochFilter {
    pub fn range(min: u64, max: u64) -> Self {
        EpochFilter::Range {
            min: Some(min),
            max: Some(max),
            step: None,
        }
    }

    pub fn stepped(min: u64, max: u64, step: u64) -> Self {
        EpochFilter::Range {
            min: Some(min),
            max: Some(max),
            step: Some(step),
        }
    }

    fn bounds(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        match *self {
            EpochFilter::All => (None, None, None),
            EpochFilter::Exact(e) => (Some(e), Some(e), None),
            EpochFilter::Range { min, max, step } => (min, max, step),
        }
    }

    /// Indices of retained epochs, in order.
    pub fn retain(&self, epochs: &[u64]) -> Vec<usize> {
        let (min, max, step) = self.bounds();
        let mut kept = Vec::new();
        let mut last: Option<u64> = None;
        for (i, &epoch) in epochs.iter().enumerate() {
            if min.map_or(false, |m| epoch < m) || max.map_or(false, |m| epoch > m) {
                continue;
            }
            if let (Some(step), Some(prev)) = (step, last) {
                if epoch < prev.saturating_add(step) {
                    continue;
                }
            }
            kept.push(i);
            last = Some(epoch);
        }
        kept
    }
}

impl fmt::Display for EpochFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u64>| v.map_or("None".to_string(), |v| v.to_string());
        match self {
            EpochFilter::All => write!(f, "(None, None, None)"),
            EpochFilter::Exact(e) => write!(f, "{}", e),
            EpochFilter::Range { min, max, step } => {
                write!(f, "({}, {}, {})", show(*min), show(*max), show(*step))
            }
        }
    }
}

/// Naming scheme for one experiment's checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointNaming {
    name: String,
    settings: CheckpointSettings,
    regex: Regex,
}

impl CheckpointNaming {
    pub fn new(name: impl Into<String>, settings: CheckpointSettings) -> Result<Self, CheckpointError> {
        let regex = Regex::new(&settings.regex)?;
        if !regex.capture_names().flatten().any(|n| n == "epoch") {
            return Err(CheckpointError::Format(format!(
                "pattern \"{}\" has no named group \"epoch\"",
                settings.regex
            )));
        }
        Ok(CheckpointNaming {
            name: name.into(),
            settings,
            regex,
        })
    }

    /// Experiment name from `cache.name` and the `checkpoint` section.
    pub fn from_config(config: &Config) -> Result<Self, CheckpointError> {
        let settings: CheckpointSettings = config.section("checkpoint")?;
        Self::new(config.name()?, settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Checkpoint path for `epoch`.
    pub fn path(&self, epoch: u64) -> Result<PathBuf, CheckpointError> {
        let file = format_template(
            &self.settings.path,
            &[("name", Field::Str(&self.name)), ("epoch", Field::Int(epoch))],
        )?;
        Ok(self.settings.folder.join(file))
    }

    /// Epoch encoded in a checkpoint path.
    pub fn epoch(&self, path: &Path) -> Result<u64, CheckpointError> {
        let text = path.to_string_lossy();
        self.regex
            .captures(&text)
            .and_then(|caps| caps.name("epoch"))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| CheckpointError::EpochNotMatched {
                path: text.to_string(),
                pattern: self.settings.regex.clone(),
            })
    }

    /// Checkpoint paths sorted by epoch, filtered by epoch.
    pub fn list(&self, filter: EpochFilter) -> Result<Vec<PathBuf>, CheckpointError> {
        let pattern = format_template(&self.settings.glob, &[("name", Field::Str(&self.name))])?;
        let files = glob_files(&self.settings.folder, &pattern)?;
        debug!(
            "found {} files matching \"{}\" in \"{}\"",
            files.len(),
            pattern,
            self.settings.folder.display()
        );
        if files.is_empty() {
            return Err(CheckpointError::NotFound(format!(
                "no checkpoints for \"{}\"",
                self.name
            )));
        }

        let mut found = files
            .into_iter()
            .map(|f| self.epoch(&f).map(|e| (e, f)))
            .collect::<Result<Vec<_>, _>>()?;
        found.sort();

        let epochs: Vec<u64> = found.iter().map(|(e, _)| *e).collect();
        let kept = filter.retain(&epochs);
        if kept.is_empty() {
            return Err(CheckpointError::NotFound(format!(
                "no checkpoints in epoch range {}",
                filter
            )));
        }

        Ok(kept.into_iter().map(|i| found[i].1.clone()).collect())
    }

    /// Existing checkpoints, or an empty list when there are none.
    pub fn existing(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        match self.list(EpochFilter::All) {
            Ok(files) => Ok(files),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Checkpoint with the highest epoch.
    pub fn latest(&self) -> Result<(PathBuf, u64), CheckpointError> {
        self.list(EpochFilter::All)?
            .into_iter()
            .map(|path| self.epoch(&path).map(|epoch| (path, epoch)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .max_by_key(|(_, epoch)| *epoch)
            .ok_or_else(|| CheckpointError::NotFound(format!("no checkpoints for \"{}\"", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn settings(folder: &Path) -> CheckpointSettings {
        CheckpointSettings {
            folder: folder.to_path_buf(),
            path: "{name}.{epoch:05d}.ckpt".to_string(),
            glob: "{name}.*.ckpt".to_string(),
            regex: r"\.(?P<epoch>\d+)\.ckpt$".to_string(),
            period: 5,
        }
    }

    fn naming_with(epochs: &[u64]) -> (TempDir, CheckpointNaming) {
        let temp_dir = TempDir::new().unwrap();
        let naming = CheckpointNaming::new("run", settings(temp_dir.path())).unwrap();
        for &e in epochs {
            fs::write(naming.path(e).unwrap(), b"").unwrap();
        }
        (temp_dir, naming)
    }

    fn epochs_of(naming: &CheckpointNaming, files: &[PathBuf]) -> Vec<u64> {
        files.iter().map(|f| naming.epoch(f).unwrap()).collect()
    }

    #[test]
    fn test_path_and_epoch() {
        let (dir, naming) = naming_with(&[]);
        let path = naming.path(12).unwrap();
        assert_eq!(path, dir.path().join("run.00012.ckpt"));
        assert_eq!(naming.epoch(&path).unwrap(), 12);
    }

    #[test]
    fn test_epoch_mismatch() {
        let (_dir, naming) = naming_with(&[]);
        let err = naming.epoch(Path::new("run.final.ckpt")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lookup);
    }

    #[test]
    fn test_regex_requires_epoch_group() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = settings(temp_dir.path());
        s.regex = r"\d+".to_string();
        assert!(matches!(
            CheckpointNaming::new("run", s),
            Err(CheckpointError::Format(_))
        ));
    }

    #[test]
    fn test_list_empty_is_not_found() {
        let (_dir, naming) = naming_with(&[]);
        let err = naming.list(EpochFilter::All).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(naming.existing().unwrap().is_empty());
    }

    #[test]
    fn test_list_filters() {
        let (_dir, naming) = naming_with(&[0, 5, 10, 15]);

        let all = naming.list(EpochFilter::All).unwrap();
        assert_eq!(epochs_of(&naming, &all), vec![0, 5, 10, 15]);

        let range = naming.list(EpochFilter::range(5, 12)).unwrap();
        assert_eq!(epochs_of(&naming, &range), vec![5, 10]);

        let stepped = naming.list(EpochFilter::stepped(0, 15, 10)).unwrap();
        assert_eq!(epochs_of(&naming, &stepped), vec![0, 10]);

        let exact = naming.list(EpochFilter::Exact(15)).unwrap();
        assert_eq!(epochs_of(&naming, &exact), vec![15]);

        let err = naming.list(EpochFilter::range(16, 20)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_list_ignores_other_experiments() {
        let (dir, naming) = naming_with(&[5]);
        fs::write(dir.path().join("other.00010.ckpt"), b"").unwrap();
        let (path, epoch) = naming.latest().unwrap();
        assert_eq!(epoch, 5);
        assert_eq!(path, naming.path(5).unwrap());
    }

    #[test]
    fn test_unpadded_epochs_sorted_numerically() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = settings(temp_dir.path());
        s.path = "{name}.{epoch}.ckpt".to_string();
        let naming = CheckpointNaming::new("run", s).unwrap();
        for e in [10, 5, 100, 0] {
            fs::write(naming.path(e).unwrap(), b"").unwrap();
        }

        let all = naming.list(EpochFilter::All).unwrap();
        assert_eq!(epochs_of(&naming, &all), vec![0, 5, 10, 100]);

        let stepped = naming.list(EpochFilter::stepped(5, 15, 5)).unwrap();
        assert_eq!(epochs_of(&naming, &stepped), vec![5, 10]);

        let (path, epoch) = naming.latest().unwrap();
        assert_eq!(epoch, 100);
        assert_eq!(path, temp_dir.path().join("run.100.ckpt"));
    }

    #[test]
    fn test_latest_past_padding_width() {
        let (_dir, naming) = naming_with(&[99_995, 100_000]);
        assert_eq!(naming.latest().unwrap().1, 100_000);
    }

    #[test]
    fn test_open_ended_range() {
        let filter = EpochFilter::Range {
            min: Some(6),
            max: None,
            step: None,
        };
        assert_eq!(filter.retain(&[0, 5, 10, 15]), vec![2, 3]);
        assert_eq!(filter.to_string(), "(6, None, None)");
    }
}
