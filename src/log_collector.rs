//! Decoupled logging pipeline for command-line tools.
//!
//! Every record is echoed to stderr as `LEVEL: message`. When a log file is
//! configured, records are also handed to a background writer thread over an
//! unbounded channel, so slow disks never stall training or inference.
//!
//! # Architecture
//!
//! ```text
//! log::info!() ...
//!     |
//! [LogCollector] (stderr echo, non-blocking send)
//!     | (crossbeam channel)
//!     v
//! [DiskPersister thread]
//!     |
//! <log file> "[YYYY-mm-dd HH:MM:SS.mmm] LEVEL target: message"
//! ```

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Internal log line or flush marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log record detached from its borrowed arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        LogLine {
            level,
            target: target.into(),
            message: message.into(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }

    /// Short form printed to the terminal.
    pub fn console(&self) -> String {
        format!("{}: {}", self.level, self.message)
    }

    /// Timestamped form persisted to disk.
    pub fn persisted(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.timestamp, self.level, self.target, self.message
        )
    }
}

/// Map a `-v` count to a level: warnings by default, then info, then debug.
pub fn verbosity_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Logger echoing to stderr and optionally persisting to a file.
#[derive(Clone)]
pub struct LogCollector {
    level: LevelFilter,
    echo: bool,
    tx: Option<Sender<LogMessage>>,
    path: Option<PathBuf>,
}

impl LogCollector {
    /// Create a collector; with `file`, spawn the writer thread.
    pub fn new(level: LevelFilter, file: Option<&Path>) -> io::Result<Self> {
        let (tx, path) = match file {
            Some(path) => (Some(spawn_persister(open_log_file(path)?)), Some(path.to_path_buf())),
            None => (None, None),
        };
        Ok(LogCollector {
            level,
            echo: true,
            tx,
            path,
        })
    }

    /// Disable the stderr echo, keeping only file persistence.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue a line for persistence. Never blocks.
    pub fn persist(&self, line: LogLine) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LogMessage::Line(line));
        }
    }

    /// Block until every line queued before this call is on disk.
    pub fn wait_for_empty(&self) -> Result<(), String> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        tx.send(LogMessage::Flush(done_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        done_rx
            .recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = LogLine::new(record.level(), record.target(), record.args().to_string());
        if self.echo {
            eprintln!("{}", line.console());
        }
        self.persist(line);
    }

    fn flush(&self) {
        let _ = self.wait_for_empty();
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn spawn_persister(file: File) -> Sender<LogMessage> {
    let (tx, rx) = unbounded::<LogMessage>();
    std::thread::spawn(move || {
        let mut writer = BufWriter::new(file);
        while let Ok(msg) = rx.recv() {
            match msg {
                LogMessage::Line(line) => {
                    let _ = writeln!(writer, "{}", line.persisted());
                }
                LogMessage::Flush(done) => {
                    let _ = writer.flush();
                    let _ = done.send(());
                }
            }
        }
        let _ = writer.flush();
    });
    tx
}

/// Install a global `LogCollector` and return a handle for flushing.
pub fn init(verbosity: u8, file: Option<&Path>) -> Result<LogCollector, InitError> {
    let collector = LogCollector::new(verbosity_level(verbosity), file)?;
    log::set_boxed_logger(Box::new(collector.clone()))?;
    log::set_max_level(collector.level());
    Ok(collector)
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Could not open log file: {0}")]
    Io(#[from] io::Error),

    #[error("A logger is already installed: {0}")]
    AlreadySet(#[from] SetLoggerError),
}
