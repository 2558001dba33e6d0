//! User-facing activity log

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Failure category attached to warning and error entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    ResolutionFailure,
    ExecutorUnreachable,
    PrivilegeDenied,
    PartialApplyFailure,
    HostsWriteFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub kind: Option<FailureKind>,
}

/// Bounded log; the oldest entry is evicted once full. Every entry is also
/// emitted through `tracing`.
#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>, kind: Option<FailureKind>) {
        let message = message.into();
        match (level, kind) {
            (LogLevel::Error, Some(kind)) => error!(?kind, "{}", message),
            (LogLevel::Error, None) => error!("{}", message),
            (LogLevel::Warning, Some(kind)) => warn!(?kind, "{}", message),
            (LogLevel::Warning, None) => warn!("{}", message),
            (LogLevel::Info | LogLevel::Success, _) => info!("{}", message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            kind,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message, None);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Success, message, None);
    }

    pub fn warning(&mut self, message: impl Into<String>, kind: Option<FailureKind>) {
        self.push(LogLevel::Warning, message, kind);
    }

    pub fn error(&mut self, message: impl Into<String>, kind: Option<FailureKind>) {
        self.push(LogLevel::Error, message, kind);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}
