//! Per-segment structured log sink (Section 4.3).
//!
//! Every record is masked through `secrets::mask` before it reaches
//! either backend, so the file backend never contains an unmasked
//! secret. The file handle is opened when the logger is created and
//! released when the logger is dropped, regardless of how the segment
//! ended.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;

use crate::config::Verbosity;
use crate::secrets;
use crate::types::SegmentStatus;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// Whether a record of this severity is visible at a given console
    /// verbosity level (Section 4.3: console output respects verbosity).
    fn visible_at(self, verbosity: Verbosity) -> bool {
        match verbosity {
            Verbosity::Quiet => self >= Self::Error,
            Verbosity::Normal => self >= Self::Info,
            Verbosity::Verbose => self >= Self::Debug,
            Verbosity::Debug => true,
        }
    }
}

/// Structured per-segment sink with a console backend and a file backend
/// at `logRoot/<segmentName>.log`. Both are fed the same masked lines.
#[derive(Debug)]
pub struct SegmentLogger {
    segment_name: String,
    verbosity: Verbosity,
    file: Mutex<File>,
    file_path: PathBuf,
}

impl SegmentLogger {
    /// Open (truncating) `logRoot/<segmentName>.log` for this segment.
    pub fn open(log_root: &Path, segment_name: &str, verbosity: Verbosity) -> Result<Self, LogError> {
        fs::create_dir_all(log_root).map_err(|source| LogError::Open {
            path: log_root.to_path_buf(),
            source,
        })?;
        let file_path = log_root.join(format!("{segment_name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&file_path)
            .map_err(|source| LogError::Open {
                path: file_path.clone(),
                source,
            })?;
        Ok(Self {
            segment_name: segment_name.to_string(),
            verbosity,
            file: Mutex::new(file),
            file_path,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn record(&self, severity: Severity, message: &str) {
        let masked = secrets::mask(message);
        let timestamp = Utc::now().format("%H:%M:%S%.3f");
        let line = format!("[{timestamp}] [{}] {} {masked}", self.segment_name, severity.as_str());

        if severity.visible_at(self.verbosity) {
            println!("{line}");
        }

        if let Ok(mut file) = self.file.lock() {
            if let Err(source) = writeln!(file, "{line}") {
                eprintln!(
                    "{}",
                    LogError::Write {
                        path: self.file_path.clone(),
                        source,
                    }
                );
            }
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.record(Severity::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.record(Severity::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.record(Severity::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.record(Severity::Error, message.as_ref());
    }

    /// Convenience entry: log the command about to be launched.
    pub fn log_command(&self, command: &str, args: &[String]) {
        self.info(format!("$ {command} {}", args.join(" ")));
    }

    /// Convenience entry: forward one line of captured stdout/stderr.
    pub fn log_output(&self, line: &str) {
        self.info(line);
    }

    /// Convenience entry: record the terminal status and duration.
    pub fn log_completion(&self, status: &SegmentStatus, duration_ms: i64) {
        self.info(format!(
            "completed with status={} in {duration_ms}ms",
            status.as_str()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn writes_masked_lines_to_file() {
        let _guard = TEST_LOCK.lock().unwrap();
        secrets::reset();
        secrets::register("sk-abcd1234", Some("API_KEY"));

        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "build", Verbosity::Quiet).unwrap();
        logger.info("token=sk-abcd1234");

        let contents = fs::read_to_string(logger.file_path()).unwrap();
        assert!(contents.contains("[build] INFO token=[API_KEY:***]"));
        assert!(!contents.contains("sk-abcd1234"));
    }

    #[test]
    fn file_backend_is_append_only_within_a_ride_but_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let logger = SegmentLogger::open(dir.path(), "build", Verbosity::Quiet).unwrap();
            logger.info("first run");
        }
        let logger = SegmentLogger::open(dir.path(), "build", Verbosity::Quiet).unwrap();
        logger.info("second run");
        let contents = fs::read_to_string(logger.file_path()).unwrap();
        assert!(!contents.contains("first run"));
        assert!(contents.contains("second run"));
    }

    #[test]
    fn log_completion_includes_status_and_duration() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "build", Verbosity::Quiet).unwrap();
        logger.log_completion(&SegmentStatus::Success, 42);
        let contents = fs::read_to_string(logger.file_path()).unwrap();
        assert!(contents.contains("status=success"));
        assert!(contents.contains("42ms"));
    }

    #[test]
    fn severity_visibility_respects_verbosity() {
        assert!(Severity::Error.visible_at(Verbosity::Quiet));
        assert!(!Severity::Info.visible_at(Verbosity::Quiet));
        assert!(Severity::Debug.visible_at(Verbosity::Debug));
        assert!(!Severity::Debug.visible_at(Verbosity::Normal));
    }

    #[test]
    fn log_command_formats_program_and_args() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "build", Verbosity::Quiet).unwrap();
        logger.log_command("echo", &["hello".to_string(), "world".to_string()]);
        let contents = fs::read_to_string(logger.file_path()).unwrap();
        assert!(contents.contains("$ echo hello world"));
    }
}
