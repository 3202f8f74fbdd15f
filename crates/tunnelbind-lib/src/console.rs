use std::sync::Arc;
use tunnelbind_bridge::lifecycle;
use tunnelbind_engine::{Engine, LogCallback, LogLevel};

use crate::engine::engine;
use crate::Result;

/// Print engine events at or above `level` to stdout, or stop printing them
/// with `None`. Replaces any previously installed logging callback.
///
/// Loads the process-wide engine if it is not loaded yet.
pub fn console_log(level: Option<LogLevel>) -> Result<()> {
    console_log_with(&engine()?, level);
    Ok(())
}

/// [`console_log`] against a specific engine. Interrupt cleanup removes the
/// callback through the same engine.
pub fn console_log_with(engine: &Arc<dyn Engine>, level: Option<LogLevel>) {
    match level {
        Some(level) => {
            let callback: LogCallback = Arc::new(|level: LogLevel, target: &str, message: &str| {
                println!("{}", format_line(level, target, message));
            });
            engine.logging_callback(Some(callback), level);
        }
        None => engine.logging_callback(None, LogLevel::default()),
    }
    lifecycle::global().set_logging_engine(engine.clone());
}

fn format_line(level: LogLevel, target: &str, message: &str) -> String {
    format!("{} {} - {}", level, target, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelbind_embedded::EmbeddedEngine;
    use tunnelbind_engine::logging;

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line(LogLevel::Warn, "tunnelbind_embedded::tunnel", "no target"),
            "WARN tunnelbind_embedded::tunnel - no target"
        );
    }

    #[test]
    fn test_install_and_remove() {
        let engine: Arc<dyn Engine> = Arc::new(EmbeddedEngine::new("test"));
        console_log_with(&engine, Some(LogLevel::Debug));
        assert!(logging::has_callback());
        console_log_with(&engine, None);
        assert!(!logging::has_callback());
    }
}
