use std::sync::mpsc;

use crate::log::{self, log_level::LogLevel, log_msg::LogMsg, log_sink::LogSink};

/// Cloneable sink that enqueues onto the logger's bounded channel.
///
/// Never blocks: when the queue is full the line is dropped. This is the
/// `LogSink` handed to the call core and the signaling threads.
#[derive(Clone)]
pub struct LoggerHandle {
    pub(super) tx: mpsc::SyncSender<LogMsg>,
    pub(super) min_level: LogLevel,
}

impl LogSink for LoggerHandle {
    #[inline]
    fn log(&self, level: LogLevel, msg: &str, target: &'static str) {
        let _ = self.try_log(level, msg, target);
    }
}

impl LoggerHandle {
    /// Enqueues one line stamped with the current time. Lines below the
    /// handle's minimum level are discarded without touching the queue.
    ///
    /// # Errors
    /// - `TrySendError::Full` when the queue is at capacity.
    /// - `TrySendError::Disconnected` when the writer thread is gone.
    pub fn try_log<S: Into<String>>(
        &self,
        level: LogLevel,
        text: S,
        target: &'static str,
    ) -> Result<(), mpsc::TrySendError<LogMsg>> {
        if level < self.min_level {
            return Ok(());
        }
        self.tx
            .try_send(LogMsg::new(level, text, target, log::now_millis()))
    }
}
