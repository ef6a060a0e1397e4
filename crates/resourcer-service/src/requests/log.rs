use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;

/// How a [`RequestHandler`](super::RequestHandler) reports what it is doing.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Keep recent lines in memory and emit them when a request fails for good.
    Buffer,
    /// Emit every line immediately.
    Direct,
    /// Do not log.
    #[default]
    None,
}

/// Logs a line to the `log` of a handler's shared state.
macro_rules! request_log {
    ($shared:expr, $($arg:tt)+) => {
        $shared.log.log(format_args!($($arg)+))
    };
}

const BUFFER_CAPACITY: usize = 1000;

/// The per-handler log.
#[derive(Debug)]
pub(crate) struct RequestLog {
    name: String,
    mode: LogMode,
    buffer: Mutex<VecDeque<String>>,
}

impl RequestLog {
    pub fn new(name: impl Into<String>, mode: LogMode) -> Self {
        Self {
            name: name.into(),
            mode,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn log(&self, args: fmt::Arguments<'_>) {
        match self.mode {
            LogMode::None => {}
            LogMode::Direct => tracing::debug!(handler = %self.name, "{}", args),
            LogMode::Buffer => {
                let line = format!(
                    "{} {}",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    args
                );
                let mut buffer = self.buffer.lock().unwrap();
                if buffer.len() == BUFFER_CAPACITY {
                    buffer.pop_front();
                }
                buffer.push_back(line);
            }
        }
    }

    /// Emits the buffered lines at warn level, e.g. after a request failed for good.
    pub fn flush(&self, reason: &str) {
        if self.mode != LogMode::Buffer {
            return;
        }
        let lines = self.lines();
        tracing::warn!(
            handler = %self.name,
            lines = lines.len(),
            "{reason}\n{}",
            lines.join("\n")
        );
    }

    pub fn lines(&self) -> Vec<String> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }
}
