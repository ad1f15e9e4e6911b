//! Ambient structured logging for the bridge runtime: a crossbeam-channel
//! backed queue with its own consumer thread and colored stderr output,
//! rather than routing through the `log` crate facade — this crate owns its
//! whole logging pipeline instead of delegating to a generic facade.
//!
//! Scoped to the events this runtime actually emits: loop lifecycle,
//! scheduling, cancellation, shutdown.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Off => "OFF",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Info,
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            Self::Trace => "\x1b[90m",
            Self::Debug => "\x1b[36m",
            Self::Info => "\x1b[32m",
            Self::Warn => "\x1b[33m",
            Self::Error => "\x1b[31m",
            Self::Off => "",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: f64,
    pub level: LogLevel,
    pub synchronizer: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, synchronizer: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            level,
            synchronizer: Some(synchronizer.to_string()),
            message: message.into(),
        }
    }

    fn format_colored(&self) -> String {
        let reset = "\x1b[0m";
        let dim = "\x1b[2m";
        let color = self.level.color_code();
        let ts = format_timestamp(self.timestamp);
        let sync = self
            .synchronizer
            .as_deref()
            .map(|s| format!(" {dim}[{s}]{reset}"))
            .unwrap_or_default();
        format!(
            "{dim}{ts}{reset} {color}{:<5}{reset}{sync} {}",
            self.level.as_str(),
            self.message,
        )
    }
}

fn format_timestamp(ts: f64) -> String {
    use chrono::{DateTime, TimeZone, Utc};
    let secs = ts as i64;
    let micros = ((ts - secs as f64) * 1_000_000.0) as u32;
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(secs, micros * 1_000)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub queue_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            queue_size: 2_000,
        }
    }
}

static LOG_QUEUE: RwLock<Option<LogQueueInner>> = RwLock::new(None);

struct LogQueueInner {
    sender: Sender<LogEntry>,
    config: Arc<RwLock<LogConfig>>,
    running: Arc<AtomicBool>,
}

pub struct LogQueue;

impl LogQueue {
    /// Initialize (or re-initialize) the global log queue. Idempotent: a
    /// second call replaces the previous consumer.
    pub fn ensure_started() {
        if LOG_QUEUE.read().is_some() {
            return;
        }
        let guard = LOG_QUEUE.write();
        if guard.is_some() {
            return;
        }
        drop(guard);
        Self::start(LogConfig::default());
    }

    fn start(config: LogConfig) {
        let queue_size = config.queue_size;
        let (sender, receiver) = bounded::<LogEntry>(queue_size);
        let running = Arc::new(AtomicBool::new(true));
        let cfg = Arc::new(RwLock::new(config));

        let inner = LogQueueInner {
            sender,
            config: cfg.clone(),
            running: running.clone(),
        };

        *LOG_QUEUE.write() = Some(inner);

        std::thread::Builder::new()
            .name("aiobridge-logger".into())
            .spawn(move || log_consumer(receiver, cfg, running))
            .expect("failed to spawn aiobridge logger thread");
    }

    pub fn set_level(level: LogLevel) {
        Self::ensure_started();
        let guard = LOG_QUEUE.read();
        if let Some(inner) = guard.as_ref() {
            inner.config.write().level = level;
        }
    }
}

#[inline]
pub fn log(level: LogLevel, synchronizer: &str, message: impl Into<String>) {
    LogQueue::ensure_started();
    let guard = LOG_QUEUE.read();
    if let Some(inner) = guard.as_ref() {
        let cfg = inner.config.read();
        if level < cfg.level {
            return;
        }
        drop(cfg);
        let _ = inner.sender.try_send(LogEntry::new(level, synchronizer, message));
    }
}

fn log_consumer(receiver: Receiver<LogEntry>, config: Arc<RwLock<LogConfig>>, running: Arc<AtomicBool>) {
    use std::io::Write;
    let stderr = std::io::stderr();

    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(entry) => {
                let cfg = config.read();
                if entry.level >= cfg.level {
                    let line = entry.format_colored();
                    let mut handle = stderr.lock();
                    let _ = writeln!(handle, "{line}");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    for entry in receiver.try_iter() {
        let cfg = config.read();
        if entry.level >= cfg.level {
            eprintln!("{}", entry.format_colored());
        }
    }
}

macro_rules! log_info {
    ($sync:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Info, $sync, format!($($arg)*))
    };
}
macro_rules! log_warn {
    ($sync:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Warn, $sync, format!($($arg)*))
    };
}
macro_rules! log_error {
    ($sync:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Error, $sync, format!($($arg)*))
    };
}
macro_rules! log_debug {
    ($sync:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Debug, $sync, format!($($arg)*))
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
