//! Execution environment provenance stored alongside checkpoints and metrics.
//!
//! The record is collected once per `EnvContext` and reused until
//! `invalidate` is called. Repositories listed under the `repositories`
//! configuration key contribute their `HEAD` commit; a repository with
//! uncommitted changes in its pathspec is rejected unless the context is
//! lenient.

use crate::config::Config;
use crate::error::EnvError;
use chrono::Local;
use git2::{Repository, StatusOptions};
use log::{debug, warn};
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use sysinfo::System;

/// Memoized provenance record.
#[derive(Debug)]
pub struct EnvContext {
    strict: bool,
    record: OnceCell<Value>,
}

impl Default for EnvContext {
    fn default() -> Self {
        EnvContext {
            strict: true,
            record: OnceCell::new(),
        }
    }
}

impl EnvContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip dirty repositories with a warning instead of failing.
    pub fn lenient() -> Self {
        EnvContext {
            strict: false,
            record: OnceCell::new(),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_cached(&self) -> bool {
        self.record.get().is_some()
    }

    /// Collect the record on first use, then return the cached copy.
    pub fn collect(&self, config: &Config) -> Result<&Value, EnvError> {
        self.record.get_or_try_init(|| collect_env(config, self.strict))
    }

    /// Drop the cached record so the next `collect` starts over.
    pub fn invalidate(&mut self) {
        if self.record.take().is_some() {
            debug!("provenance record invalidated");
        }
    }
}

fn collect_env(config: &Config, strict: bool) -> Result<Value, EnvError> {
    let environ: Map<String, Value> = std::env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                Value::String(v.to_string_lossy().into_owned()),
            )
        })
        .collect();

    let record = json!({
        "version": crate::VERSION,
        "argv": std::env::args_os()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
        "hostname": System::host_name(),
        "os": System::long_os_version(),
        "kernel": System::kernel_version(),
        "date": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        "uptime": System::uptime(),
        "git-rev-parse": repository_hashes(config, strict)?,
        "environ": environ,
        "packages": {"babyseg": crate::VERSION},
    });
    debug!("collected provenance record");
    Ok(record)
}

/// `HEAD` commits of the configured repositories.
fn repository_hashes(config: &Config, strict: bool) -> Result<Map<String, Value>, EnvError> {
    let mut hashes = Map::new();
    let repositories = match config.get("repositories") {
        None | Some(Value::Null) => return Ok(hashes),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(EnvError::Format(
                "repositories must map paths to pathspec lists".to_string(),
            ))
        }
    };

    for (repo, spec) in repositories {
        let pathspec = parse_pathspec(repo, spec)?;
        match git_hash(&expand_home(repo), &pathspec) {
            Ok(hash) => {
                hashes.insert(repo.clone(), Value::String(hash));
            }
            Err(e @ EnvError::UncommittedChange(_)) if !strict => {
                warn!("{}", e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(hashes)
}

fn parse_pathspec(repo: &str, spec: &Value) -> Result<Vec<String>, EnvError> {
    let malformed = || EnvError::Format(format!("pathspec for \"{}\" must be a list of strings", repo));
    match spec {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(malformed))
            .collect(),
        _ => Err(malformed()),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Commit hash of `HEAD`, refusing repositories with changes under `pathspec`.
pub fn git_hash(path: &Path, pathspec: &[String]) -> Result<String, EnvError> {
    let repo = Repository::discover(path)?;

    let mut options = StatusOptions::new();
    options.include_untracked(true).include_ignored(false);
    for spec in pathspec {
        options.pathspec(spec);
    }
    if !repo.statuses(Some(&mut options))?.is_empty() {
        return Err(EnvError::UncommittedChange(path.to_path_buf()));
    }

    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;
    use tempfile::TempDir;

    fn committed_repo() -> (TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("model.json"), "{}").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("model.json")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("babyseg", "babyseg@localhost").unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        (temp_dir, oid.to_string())
    }

    fn config_for(dir: &Path) -> Config {
        let mut repositories = Map::new();
        repositories.insert(dir.to_string_lossy().into_owned(), json!([]));
        Config::try_from(json!({ "repositories": repositories })).unwrap()
    }

    #[test]
    fn test_clean_repository_hash() {
        let (dir, oid) = committed_repo();
        assert_eq!(git_hash(dir.path(), &[]).unwrap(), oid);

        let env = EnvContext::new();
        let record = env.collect(&config_for(dir.path())).unwrap();
        let key = dir.path().to_string_lossy().into_owned();
        assert_eq!(record["git-rev-parse"][key.as_str()], json!(oid));
        assert_eq!(record["packages"]["babyseg"], json!(crate::VERSION));
    }

    #[test]
    fn test_dirty_repository_strict_and_lenient() {
        let (dir, _) = committed_repo();
        fs::write(dir.path().join("model.json"), "{\"changed\": true}").unwrap();
        let config = config_for(dir.path());

        let err = EnvContext::new().collect(&config).unwrap_err();
        assert!(matches!(err, EnvError::UncommittedChange(_)));

        let lenient = EnvContext::lenient();
        let record = lenient.collect(&config).unwrap();
        assert_eq!(record["git-rev-parse"], json!({}));
    }

    #[test]
    fn test_pathspec_limits_status() {
        let (dir, oid) = committed_repo();
        fs::write(dir.path().join("notes.txt"), "scratch").unwrap();
        assert_eq!(git_hash(dir.path(), &["model.json".to_string()]).unwrap(), oid);
        assert!(git_hash(dir.path(), &[]).is_err());
    }

    #[test]
    fn test_memoized_until_invalidated() {
        let mut env = EnvContext::new();
        let config = Config::new();
        assert!(!env.is_cached());
        let first = env.collect(&config).unwrap().clone();
        assert!(env.is_cached());
        assert_eq!(env.collect(&config).unwrap(), &first);
        env.invalidate();
        assert!(!env.is_cached());
    }

    #[test]
    fn test_malformed_repositories() {
        let config = Config::try_from(json!({"repositories": ["."]})).unwrap();
        assert!(matches!(
            EnvContext::new().collect(&config),
            Err(EnvError::Format(_))
        ));
    }
}
