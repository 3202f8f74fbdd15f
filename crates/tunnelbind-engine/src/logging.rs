//! Process-wide logging callback
//!
//! Engines report `{level, target, message}` events here. Only one callback is
//! active at a time; installing a new one replaces the previous one and
//! installing `None` removes it.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Severity of an engine log event, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unknown log level {other:?} (expected trace|debug|info|warn|error)"
            )),
        }
    }
}

/// Receives `(level, target, message)` for every event at or above the
/// registered level
pub type LogCallback = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

struct Registration {
    callback: LogCallback,
    level: LogLevel,
}

static CALLBACK: RwLock<Option<Registration>> = RwLock::new(None);

/// Install `callback` for events at or above `level`, or remove the current
/// callback when `callback` is `None`.
pub fn set_callback(callback: Option<LogCallback>, level: LogLevel) {
    let mut slot = CALLBACK.write().unwrap_or_else(|e| e.into_inner());
    *slot = callback.map(|callback| Registration { callback, level });
}

/// Remove the current callback, if any
pub fn clear_callback() {
    set_callback(None, LogLevel::default());
}

/// Whether a callback is currently installed
pub fn has_callback() -> bool {
    CALLBACK
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .is_some()
}

/// Deliver an event to the installed callback, if it accepts `level`
pub fn emit(level: LogLevel, target: &str, message: &str) {
    let callback = {
        let slot = CALLBACK.read().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(reg) if level >= reg.level => reg.callback.clone(),
            _ => return,
        }
    };
    // Invoke outside the lock so the callback may re-register itself.
    callback(level, target, message);
}
