use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub use tracing::Level;

const LOG_FILE_NAME: &str = "switchscan.log";
const MAX_LOG_BYTES: u64 = 1_000_000;
const MAX_ARCHIVES: usize = 5;

/// Destination for log lines. Components never reach a sink directly; they
/// hold a [`Logger`] handed to them at construction.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, component: &str, message: &str);
}

#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    component: &'static str,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            component: "switchscan",
        }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Same sink, different component label.
    pub fn scoped(&self, component: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            component,
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.sink.write(Level::DEBUG, self.component, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.write(Level::INFO, self.component, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.sink.write(Level::WARN, self.component, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.sink.write(Level::ERROR, self.component, message.as_ref());
    }
}

/// Forwards to `tracing`; whatever subscriber the binary installed decides
/// where lines end up.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, level: Level, component: &str, message: &str) {
        match level {
            Level::ERROR => tracing::error!(component, "{message}"),
            Level::WARN => tracing::warn!(component, "{message}"),
            Level::INFO => tracing::info!(component, "{message}"),
            Level::DEBUG => tracing::debug!(component, "{message}"),
            _ => tracing::trace!(component, "{message}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _level: Level, _component: &str, _message: &str) {}
}

/// Captures lines in memory. Used by tests to assert on what was logged.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write(&self, level: Level, component: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, format!("[{component}] {message}")));
        }
    }
}

/// Appends to `<dir>/switchscan.log`, rotating it into timestamped archives
/// once it passes `MAX_LOG_BYTES` at open time.
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
    min_level: Level,
}

impl FileSink {
    pub fn open(log_dir: &Path, min_level: Level) -> Result<Self, std::io::Error> {
        fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(LOG_FILE_NAME);
        rotate_if_needed(&log_path, log_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            file: Mutex::new(file),
            min_level,
        })
    }
}

impl LogSink for FileSink {
    fn write(&self, level: Level, component: &str, message: &str) {
        // tracing orders levels by verbosity: ERROR < WARN < INFO < DEBUG.
        if level > self.min_level {
            return;
        }
        let Ok(mut file) = self.file.lock() else {
            return;
        };

        let ts = now_secs();
        let line = format!("[{ts}] [{level}] [{component}] {message}\n");
        let _ = file.write_all(line.as_bytes());
        let _ = file.flush();
    }
}

/// Fans one line out to several sinks.
pub struct TeeSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for TeeSink {
    fn write(&self, level: Level, component: &str, message: &str) {
        for sink in &self.sinks {
            sink.write(level, component, message);
        }
    }
}

pub fn logs_dir() -> PathBuf {
    crate::config::stable_app_data_dir().join("logs")
}

pub fn parse_level(input: &str) -> Option<Level> {
    match input.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn rotate_if_needed(log_path: &Path, log_dir: &Path) -> Result<(), std::io::Error> {
    let meta = match fs::metadata(log_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if meta.len() < MAX_LOG_BYTES {
        return Ok(());
    }

    let stamp = now_secs();
    let archived = log_dir.join(format!("switchscan-{stamp}.log"));
    fs::rename(log_path, archived)?;
    prune_old_archives(log_dir)?;
    Ok(())
}

fn prune_old_archives(log_dir: &Path) -> Result<(), std::io::Error> {
    let mut archives = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("switchscan-") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    archives.sort();
    while archives.len() > MAX_ARCHIVES {
        let oldest = archives.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_dir_uses_stable_app_data_layout() {
        let dir = logs_dir();
        assert!(dir
            .to_string_lossy()
            .to_ascii_lowercase()
            .contains("switchscan"));
    }

    #[test]
    fn scoped_logger_labels_lines_with_component() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::new(sink.clone()).scoped("cache");
        logger.warn("scan failed");
        assert!(sink.contains(Level::WARN, "[cache] scan failed"));
    }

    #[test]
    fn file_sink_filters_below_min_level_and_rotates_large_logs() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("switchscan-logs-{unique}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(LOG_FILE_NAME), vec![b'x'; MAX_LOG_BYTES as usize]).unwrap();

        let sink = FileSink::open(&dir, Level::INFO).unwrap();
        sink.write(Level::DEBUG, "test", "hidden");
        sink.write(Level::WARN, "test", "shown");

        let current = fs::read_to_string(dir.join(LOG_FILE_NAME)).unwrap();
        assert!(current.contains("shown"));
        assert!(!current.contains("hidden"));
        let archives = fs::read_dir(&dir).unwrap().count();
        assert_eq!(archives, 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("Warning"), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}
