use log::{Level, LevelFilter};
use std::sync::Arc;

/// Initialise the process-wide `env_logger` backend.
///
/// Call once at startup. `RUST_LOG` still wins over `level` so individual
/// targets can be tuned without touching the configuration.
pub fn setup_logger(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Flush buffered log output before the process exits.
pub fn flush_logger() {
    log::logger().flush();
}

/// Named log sink handed to each component at construction.
///
/// All records go through the `log` facade under the sink's target, so
/// filtering per component works with plain `RUST_LOG=emt::tracker=debug`.
#[derive(Debug, Clone)]
pub struct LogSink {
    target: Arc<str>,
}

impl LogSink {
    pub fn new(target: &str) -> Self {
        Self {
            target: Arc::from(target),
        }
    }

    /// Derive a sink for a sub-component, e.g. `emt` -> `emt::tracker`.
    pub fn child(&self, name: &str) -> Self {
        Self::new(&format!("{}::{}", self.target, name))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, message: impl AsRef<str>) {
        log::log!(target: self.target(), level, "{}", message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Level::Error, message);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("emt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_target() {
        let sink = LogSink::new("emt");
        assert_eq!(sink.child("tracker").target(), "emt::tracker");
        assert_eq!(sink.child("tracker").child("rapl").target(), "emt::tracker::rapl");
    }
}
