//! Dataset samples, array-job sharding, and parallel label map loading.

use crate::config::paths::expand_glob;
use crate::error::DataError;
use crossbeam_channel::{bounded, unbounded};
use log::{debug, info};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

/// Label set whose map is named in the dataset file.
pub const NATIVE_LABELS: &str = "baby";

/// One dataset entry.
///
/// Entries are JSON objects with a `folder`, a `labels` file name, a list of
/// `images` types, each type mapped to its file name, an `age` and its `unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    data: Map<String, Value>,
    folder: PathBuf,
}

impl Sample {
    pub fn new(data: Map<String, Value>) -> Result<Self, DataError> {
        let folder = match data.get("folder") {
            Some(Value::String(s)) => PathBuf::from(s),
            Some(_) => return Err(DataError::Format("sample folder is not a string".to_string())),
            None => return Err(DataError::MissingKey("folder".to_string())),
        };
        Ok(Sample { data, folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn string(&self, key: &str) -> Result<&str, DataError> {
        self.data
            .get(key)
            .ok_or_else(|| DataError::MissingKey(key.to_string()))?
            .as_str()
            .ok_or_else(|| DataError::Format(format!("sample entry \"{}\" is not a string", key)))
    }

    /// Whether the sample has an entry for an image type.
    pub fn has(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn image(&self, name: &str) -> Result<PathBuf, DataError> {
        Ok(self.folder.join(self.string(name)?))
    }

    pub fn image_types(&self) -> Result<Vec<String>, DataError> {
        let images = self
            .data
            .get("images")
            .ok_or_else(|| DataError::MissingKey("images".to_string()))?;
        serde_json::from_value(images.clone())
            .map_err(|e| DataError::Format(format!("sample images: {}", e)))
    }

    /// Label map of a label set; only the native set is named in the entry.
    pub fn label_map(&self, labels: &str) -> Result<PathBuf, DataError> {
        if labels == NATIVE_LABELS {
            return Ok(self.folder.join(self.string("labels")?));
        }
        Ok(self.folder.join(format!("labels.{}.nii.gz", labels)))
    }

    /// Identifier, falling back to the folder name.
    pub fn name(&self) -> String {
        match self.data.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => self
                .folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn age(&self) -> Result<f64, DataError> {
        self.data
            .get("age")
            .ok_or_else(|| DataError::MissingKey("age".to_string()))?
            .as_f64()
            .ok_or_else(|| DataError::Format("sample age is not a number".to_string()))
    }

    pub fn unit(&self) -> Result<&str, DataError> {
        self.string("unit")
    }

    /// Output path of a method, creating the method folder.
    pub fn output(&self, method: &str, labels: &str) -> Result<PathBuf, DataError> {
        let dir = self.folder.join(method);
        if let Err(e) = fs::create_dir(&dir) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }
        Ok(dir.join(format!("{}.nii.gz", labels)))
    }

    /// Remove everything a method wrote for this sample.
    pub fn purge(&self, method: &str) -> Result<(), DataError> {
        if method.is_empty() {
            return Err(DataError::Format("method name is empty".to_string()));
        }

        let dir = self.folder.join(method);
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                fs::remove_file(entry?.path())?;
            }
        }
        if let Err(e) = fs::remove_dir(&dir) {
            debug!("kept folder {}: {}", dir.display(), e);
        }

        info!("purged {} artifacts for sample \"{}\"", method, self);
        Ok(())
    }

    /// Ensure the sample images and the method inputs are the same set.
    pub fn validate_inputs<S: AsRef<str>>(&self, inputs: &[S]) -> Result<(), DataError> {
        info!("validating sample \"{}\"", self);
        if inputs.is_empty() {
            return Ok(());
        }

        let inputs: Vec<&str> = inputs.iter().map(AsRef::as_ref).collect();
        let images = self.image_types()?;
        if images.iter().any(|t| !inputs.contains(&t.as_str())) {
            return Err(DataError::Format(format!("image not among inputs {:?}", inputs)));
        }
        if inputs.iter().any(|t| !images.iter().any(|i| i == t)) {
            return Err(DataError::Format(format!("input not among images {:?}", images)));
        }
        Ok(())
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Read samples from dataset split files, keeping those with every image type in `which`.
pub fn read_samples<P: AsRef<Path>>(files: &[P], which: &[&str]) -> Result<Vec<Sample>, DataError> {
    let mut samples = Vec::new();
    for file in files {
        let file = file.as_ref();
        let text = fs::read_to_string(file).map_err(|e| DataError::Load {
            path: file.to_path_buf(),
            reason: e.to_string(),
        })?;
        let entries: Vec<Map<String, Value>> = serde_json::from_str(&text)?;
        for entry in entries {
            samples.push(Sample::new(entry)?);
        }
    }
    info!("found {} samples in {} files", samples.len(), files.len());

    if !which.is_empty() {
        samples.retain(|s| which.iter().all(|t| s.has(t)));
        info!("kept {} samples that have {:?}", samples.len(), which);
    }
    Ok(samples)
}

/// Position of this process in a job array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerShard {
    /// 1-based worker index
    pub id: usize,
    pub count: usize,
}

impl Default for WorkerShard {
    fn default() -> Self {
        WorkerShard { id: 1, count: 1 }
    }
}

impl WorkerShard {
    pub fn new(id: usize, count: usize) -> Result<Self, DataError> {
        if count == 0 || id == 0 || id > count {
            return Err(DataError::Format(format!(
                "worker {} of {} is out of range",
                id, count
            )));
        }
        Ok(WorkerShard { id, count })
    }

    /// Read `SLURM_ARRAY_TASK_ID` and `SLURM_ARRAY_TASK_COUNT`, defaulting to a single worker.
    pub fn from_env() -> Result<Self, DataError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, DataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Result<usize, DataError> {
            match lookup(key) {
                Some(v) => v.trim().parse().map_err(|_| {
                    DataError::Format(format!("environment variable \"{}\" is not a count", key))
                }),
                None => Ok(1),
            }
        };

        for key in ["SLURM_ARRAY_TASK_MIN", "SLURM_ARRAY_TASK_STEP"] {
            if read(key)? != 1 {
                return Err(DataError::Format(format!(
                    "environment variable \"{}\" is not 1",
                    key
                )));
            }
        }

        let shard = Self::new(read("SLURM_ARRAY_TASK_ID")?, read("SLURM_ARRAY_TASK_COUNT")?)?;
        info!("identifying as worker {} of {}", shard.id, shard.count);
        Ok(shard)
    }

    pub fn keeps(&self, index: usize) -> bool {
        index % self.count == self.id - 1
    }

    /// Items at this worker's positions.
    pub fn shard<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let kept: Vec<T> = items
            .into_iter()
            .enumerate()
            .filter(|(i, _)| self.keeps(*i))
            .map(|(_, item)| item)
            .collect();
        info!("retaining {} samples for worker {}", kept.len(), self.id);
        kept
    }

    /// Run `work` on this worker's shard, in order.
    pub fn map<T, R, F>(&self, items: impl IntoIterator<Item = T>, mut work: F) -> Vec<R>
    where
        F: FnMut(T) -> R,
    {
        let items = self.shard(items);
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (i, item) in items.into_iter().enumerate() {
            let start = Instant::now();
            results.push(work(item));
            info!(
                "finished sample {} of {} in {:.1} sec",
                i + 1,
                total,
                start.elapsed().as_secs_f64()
            );
        }
        results
    }
}

/// Shard from the environment and map `work` over this worker's items.
pub fn shard_map<T, R, F>(items: impl IntoIterator<Item = T>, work: F) -> Result<Vec<R>, DataError>
where
    F: FnMut(T) -> R,
{
    Ok(WorkerShard::from_env()?.map(items, work))
}

/// Label maps and the union of their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMaps {
    /// Sorted unique labels across all maps
    pub labels: Vec<i64>,
    pub maps: Vec<Vec<i64>>,
    pub files: Vec<PathBuf>,
}

/// Expand glob patterns and read the matching label maps on a worker pool.
///
/// `reader` decodes one file into voxel labels; maps must have equal size.
pub fn load_label_maps<P, F>(patterns: &[P], threads: Option<usize>, reader: F) -> Result<LabelMaps, DataError>
where
    P: AsRef<Path>,
    F: Fn(&Path) -> Result<Vec<i64>, DataError> + Sync,
{
    let mut files = BTreeSet::new();
    for pattern in patterns {
        files.extend(expand_glob(pattern)?);
    }
    let files: Vec<PathBuf> = files.into_iter().collect();
    if files.is_empty() {
        let shown: Vec<_> = patterns.iter().map(|p| p.as_ref().display().to_string()).collect();
        return Err(DataError::NotFound(format!(
            "patterns {:?} yield no label maps",
            shown
        )));
    }

    let threads = threads.unwrap_or_else(num_cpus::get).clamp(1, files.len());
    debug!("loading {} label maps with {} threads", files.len(), threads);

    let mut loaded: Vec<(usize, Result<Vec<i64>, DataError>)> = thread::scope(|scope| {
        let (job_tx, job_rx) = bounded::<(usize, &Path)>(threads);
        let (result_tx, result_rx) = unbounded();
        for _ in 0..threads {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let reader = &reader;
            scope.spawn(move || {
                for (index, path) in job_rx.iter() {
                    if result_tx.send((index, reader(path))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (index, path) in files.iter().enumerate() {
            if job_tx.send((index, path.as_path())).is_err() {
                break;
            }
        }
        drop(job_tx);
        result_rx.iter().collect()
    });
    loaded.sort_by_key(|(index, _)| *index);

    let mut labels = BTreeSet::new();
    let mut maps: Vec<Vec<i64>> = Vec::with_capacity(loaded.len());
    for (index, result) in loaded {
        let map = result?;
        if let Some(first) = maps.first().map(Vec::len) {
            if map.len() != first {
                return Err(DataError::Format(format!(
                    "label map \"{}\" has {} voxels, expected {}",
                    files[index].display(),
                    map.len(),
                    first
                )));
            }
        }
        labels.extend(map.iter().copied());
        maps.push(map);
    }

    Ok(LabelMaps {
        labels: labels.into_iter().collect(),
        maps,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample(folder: &Path) -> Sample {
        let entry = json!({
            "folder": folder.to_string_lossy(),
            "labels": "labels.nii.gz",
            "images": ["t1w", "t2w"],
            "t1w": "t1w.nii.gz",
            "t2w": "t2w.nii.gz",
            "age": 1.5,
            "unit": "months",
        });
        match entry {
            Value::Object(map) => Sample::new(map).unwrap(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sample_paths() {
        let s = sample(Path::new("/data/sub-01"));
        assert!(s.has("t1w"));
        assert!(!s.has("flair"));
        assert_eq!(s.image("t2w").unwrap(), PathBuf::from("/data/sub-01/t2w.nii.gz"));
        assert_eq!(
            s.label_map(NATIVE_LABELS).unwrap(),
            PathBuf::from("/data/sub-01/labels.nii.gz")
        );
        assert_eq!(
            s.label_map("aseg").unwrap(),
            PathBuf::from("/data/sub-01/labels.aseg.nii.gz")
        );
        assert_eq!(s.name(), "sub-01");
        assert_eq!(s.age().unwrap(), 1.5);
        assert_eq!(s.unit().unwrap(), "months");
    }

    #[test]
    fn test_sample_requires_folder() {
        assert!(matches!(Sample::new(Map::new()), Err(DataError::MissingKey(_))));
    }

    #[test]
    fn test_output_and_purge() {
        let temp_dir = TempDir::new().unwrap();
        let s = sample(temp_dir.path());
        let out = s.output("babyseg", "aseg").unwrap();
        assert_eq!(out, temp_dir.path().join("babyseg").join("aseg.nii.gz"));
        fs::write(&out, b"x").unwrap();
        assert_eq!(s.output("babyseg", "aseg").unwrap(), out);

        s.purge("babyseg").unwrap();
        assert!(!temp_dir.path().join("babyseg").exists());
        assert!(s.purge("").is_err());
    }

    #[test]
    fn test_validate_inputs() {
        let s = sample(Path::new("/data/sub-01"));
        assert!(s.validate_inputs::<&str>(&[]).is_ok());
        assert!(s.validate_inputs(&["t2w", "t1w"]).is_ok());
        assert!(s.validate_inputs(&["t1w"]).is_err());
        assert!(s.validate_inputs(&["t1w", "t2w", "flair"]).is_err());
    }

    #[test]
    fn test_read_samples_filter() {
        let temp_dir = TempDir::new().unwrap();
        let split = temp_dir.path().join("split.json");
        fs::write(
            &split,
            json!([
                {"folder": "a", "images": ["t1w"], "t1w": "t1w.nii.gz"},
                {"folder": "b", "images": ["t2w"], "t2w": "t2w.nii.gz"},
            ])
            .to_string(),
        )
        .unwrap();

        assert_eq!(read_samples(&[&split], &[]).unwrap().len(), 2);
        let kept = read_samples(&[&split], &["t2w"]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name(), "b");
    }

    #[test]
    fn test_worker_shard() {
        let vars: HashMap<&str, &str> =
            [("SLURM_ARRAY_TASK_ID", "2"), ("SLURM_ARRAY_TASK_COUNT", "3")].into();
        let shard = WorkerShard::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(shard.shard(0..8), vec![1, 4, 7]);
        assert_eq!(shard.map(0..8, |i| i * 10), vec![10, 40, 70]);

        let single = WorkerShard::from_lookup(|_| None).unwrap();
        assert_eq!(single, WorkerShard::default());
        assert_eq!(single.shard(0..3), vec![0, 1, 2]);
    }

    #[test]
    fn test_worker_shard_rejects_stepped_arrays() {
        let result = WorkerShard::from_lookup(|k| {
            (k == "SLURM_ARRAY_TASK_STEP").then(|| "2".to_string())
        });
        assert!(matches!(result, Err(DataError::Format(_))));
        assert!(WorkerShard::new(4, 3).is_err());
    }

    #[test]
    fn test_load_label_maps() {
        let temp_dir = TempDir::new().unwrap();
        for (name, labels) in [("a.lab", "0 3 3"), ("b.lab", "0 2 7"), ("c.txt", "9 9 9")] {
            fs::write(temp_dir.path().join(name), labels).unwrap();
        }
        let read = |path: &Path| -> Result<Vec<i64>, DataError> {
            let text = fs::read_to_string(path)?;
            text.split_whitespace()
                .map(|t| t.parse().map_err(|_| DataError::Format(t.to_string())))
                .collect()
        };

        let pattern = temp_dir.path().join("*.lab");
        let result = load_label_maps(&[&pattern], Some(2), read).unwrap();
        assert_eq!(result.labels, vec![0, 2, 3, 7]);
        assert_eq!(result.maps, vec![vec![0, 3, 3], vec![0, 2, 7]]);

        let missing = temp_dir.path().join("*.nii.gz");
        let err = load_label_maps(&[&missing], None, read).unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));
    }
}
