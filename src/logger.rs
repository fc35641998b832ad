use anyhow::Result;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    pub fn parse(s: &str) -> Option<Level> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" | "warning" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

/// Fire-and-forget log sink. Implementations swallow their own I/O errors.
pub trait Logger: Send + Sync {
    fn log(&self, _level: Level, _args: fmt::Arguments<'_>) {}

    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }
    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }
    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    fn copy_done(&self, src: &Path, dst: &Path, bytes: u64) {
        self.log(
            Level::Info,
            format_args!("COPY src={} dst={} bytes={}", src.display(), dst.display(), bytes),
        );
    }
    fn done(&self, synced: u64, failed: u64, seconds: f64) {
        self.log(
            Level::Info,
            format_args!("DONE synced={synced} failed={failed} seconds={seconds:.3}"),
        );
    }
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => { $logger.error(format_args!($($arg)+)) };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => { $logger.warn(format_args!($($arg)+)) };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => { $logger.info(format_args!($($arg)+)) };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => { $logger.debug(format_args!($($arg)+)) };
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct StderrLogger {
    min_level: Level,
}

impl StderrLogger {
    pub fn new(min_level: Level) -> Self {
        Self { min_level }
    }
}

impl Logger for StderrLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if level <= self.min_level {
            eprintln!("[{}] {} {}", level.tag(), Utc::now().to_rfc3339(), args);
        }
    }
}

struct LogFile {
    file: File,
    written: u64,
}

/// Appends to a log file, mirrors to stderr, rotates past `rotate_bytes`.
pub struct TextLogger {
    path: PathBuf,
    rotate_bytes: u64,
    min_level: Level,
    mirror_stderr: bool,
    state: Mutex<LogFile>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P, rotate_bytes: u64, min_level: Level) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            rotate_bytes,
            min_level,
            mirror_stderr: true,
            state: Mutex::new(LogFile { file, written }),
        })
    }

    pub fn quiet(mut self) -> Self {
        self.mirror_stderr = false;
        self
    }

    fn rotated_name(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "filesync".to_string());
        let stamp = Local::now().format("%Y%m%d%H%M%S%3f");
        let mut candidate = self.path.with_file_name(format!("{stem}_{stamp}.log"));
        // Rotations within the same millisecond get a counter suffix
        let mut n = 1u32;
        while candidate.exists() {
            candidate = self.path.with_file_name(format!("{stem}_{stamp}_{n}.log"));
            n += 1;
        }
        candidate
    }

    fn rotate(&self, state: &mut LogFile) {
        if std::fs::rename(&self.path, self.rotated_name()).is_err() {
            return;
        }
        if let Ok(f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            state.file = f;
            state.written = 0;
        }
    }

    fn line(&self, s: &str) {
        let mut state = self.state.lock();
        if self.rotate_bytes > 0 && state.written >= self.rotate_bytes {
            self.rotate(&mut state);
        }
        if writeln!(state.file, "{}", s).is_ok() {
            state.written += s.len() as u64 + 1;
        }
    }
}

impl Logger for TextLogger {
    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if level > self.min_level {
            return;
        }
        let line = format!("[{}] {} {}", level.tag(), Utc::now().to_rfc3339(), args);
        if self.mirror_stderr {
            eprintln!("{}", line);
        }
        self.line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_parse_and_order() {
        assert_eq!(Level::parse("INFO"), Some(Level::Info));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("loud"), None);
        assert!(Level::Error < Level::Debug);
    }

    #[test]
    fn test_text_logger_filters_and_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/filesync.log");
        let logger = TextLogger::new(&path, 0, Level::Info).unwrap().quiet();
        log_info!(logger, "synced {} files", 3);
        log_debug!(logger, "hidden {}", 1);
        log_error!(logger, "failed: {}", "a.txt");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[INFO]"));
        assert!(text.contains("synced 3 files"));
        assert!(text.contains("[ERROR]"));
        assert!(!text.contains("hidden"));
    }

    #[test]
    fn test_text_logger_rotates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filesync.log");
        let logger = TextLogger::new(&path, 16, Level::Info).unwrap().quiet();
        log_info!(logger, "first line that is long enough");
        log_info!(logger, "second");

        let rotated: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("filesync_"))
            .collect();
        assert_eq!(rotated.len(), 1);
        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("second"));
        assert!(!current.contains("first line"));
    }

    #[test]
    fn test_rapid_rotations_keep_every_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("filesync.log");
        let logger = TextLogger::new(&path, 1, Level::Info).unwrap().quiet();
        log_info!(logger, "one");
        log_info!(logger, "two");
        log_info!(logger, "three");

        let mut rotated: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("filesync_"))
            .collect();
        rotated.sort();
        assert_eq!(rotated.len(), 2, "{:?}", rotated);

        let kept: String = rotated
            .iter()
            .map(|n| std::fs::read_to_string(tmp.path().join(n)).unwrap())
            .collect();
        assert!(kept.contains("one"));
        assert!(kept.contains("two"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("three"));
    }
}
