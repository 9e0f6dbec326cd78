use std::sync::{Mutex, PoisonError};

use crate::log::{log_level::LogLevel, log_sink::LogSink};

/// Keeps every line in memory. Lets tests assert that a diagnostic was
/// logged instead of raised.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(_, line)| line.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, msg: &str, _target: &'static str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, msg.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink_warn;

    #[test]
    fn captures_lines_from_macros() {
        let sink = MemoryLogSink::new();
        sink_warn!(sink, "dropped exchange {}", 7);
        assert!(sink.contains("dropped exchange 7"));
        assert_eq!(sink.lines()[0].0, LogLevel::Warn);
    }
}
