//! Path qualification against `BABYSEG_HOME` and file-name globbing.

use log::{debug, info, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming the installation directory.
pub const HOME_VAR: &str = "BABYSEG_HOME";

/// Installation directory from `BABYSEG_HOME`, if set and non-empty.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os(HOME_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Interpret relative paths against `BABYSEG_HOME` for portability.
///
/// Absolute paths and relative paths that exist are returned unchanged. A
/// nonexistent relative path is prefixed with `BABYSEG_HOME` when it is set.
pub fn qualify_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        debug!("not qualifying absolute path \"{}\"", path.display());
        return path.to_path_buf();
    }

    if path.exists() {
        debug!("not qualifying existing relative path \"{}\"", path.display());
        return path.to_path_buf();
    }

    info!("encountered nonexistent relative path \"{}\"", path.display());
    match home_dir() {
        Some(home) => {
            info!("qualifying path by prepending {}=\"{}\"", HOME_VAR, home.display());
            home.join(path)
        }
        None => {
            warn!("not qualifying path because {} unset", HOME_VAR);
            path.to_path_buf()
        }
    }
}

/// Translate a file-name glob (`*`, `?`, `[...]`, `[!...]`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if c == '\\' || c == '[' {
                        class.push('\\');
                    }
                    class.push(c);
                }
                if closed && !class.is_empty() && class != "^" {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    // Unterminated class: match the text literally.
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(&class));
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Files in `folder` whose names match the glob `pattern`, sorted ascending.
///
/// A missing folder yields an empty list.
pub fn glob_files(folder: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
    let regex = glob_to_regex(pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matched = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| regex.is_match(n));
        if matched {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Expand a path whose final component may contain glob wildcards.
pub fn expand_glob(pattern: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let pattern = pattern.as_ref();
    let name = match pattern.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return Ok(Vec::new()),
    };

    let folder = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    glob_files(&folder, name)
}
