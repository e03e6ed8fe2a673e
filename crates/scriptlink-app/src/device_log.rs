//! Per-device log sink
//!
//! Every attached device gets one bounded buffer of the lines it logged. Lines
//! are also forwarded to `tracing` under [`DEVICE_LOG_TARGET`] so they land in
//! the rolling log file.

use std::collections::VecDeque;

use scriptlink_core::logging::DEVICE_LOG_TARGET;

#[derive(Debug, Clone)]
pub struct DeviceLog {
    label: String,
    lines: VecDeque<String>,
    capacity: usize,
}

impl DeviceLog {
    /// Open a sink for `label`, starting with the connection header
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let label = label.into();
        let mut log = Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            label,
        };
        let header = format!("Device connected: {}", log.label);
        log.append(header);
        log
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append one line, dropping the oldest once full
    pub fn append(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: DEVICE_LOG_TARGET, device = %self.label, "{}", line);
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
