//! Error sink: user-facing messages out of the core. The core never renders them.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    /// Only shown when the host enables debug output.
    DebugWarning,
    Notice,
    Success,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::DebugWarning => "debug",
            Severity::Notice => "notice",
            Severity::Success => "success",
        })
    }
}

pub trait ErrorSink: Send + Sync {
    fn push(&self, severity: Severity, message: String);
}

impl dyn ErrorSink {
    pub fn error(&self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into());
    }

    pub fn debug_warn(&self, message: impl Into<String>) {
        self.push(Severity::DebugWarning, message.into());
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.push(Severity::Notice, message.into());
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(Severity::Success, message.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub severity: Severity,
    pub message: String,
}

/// Queue-backed sink drained by the host each tick.
#[derive(Default)]
pub struct ErrorQueues {
    reports: Mutex<VecDeque<Report>>,
    show_debug: bool,
}

impl ErrorQueues {
    pub fn new(show_debug: bool) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            show_debug,
        }
    }

    pub fn drain(&self) -> Vec<Report> {
        self.reports.lock().drain(..).collect()
    }

    /// Reports of one severity currently queued.
    pub fn count(&self, severity: Severity) -> usize {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.severity == severity)
            .count()
    }
}

impl ErrorSink for ErrorQueues {
    fn push(&self, severity: Severity, message: String) {
        if severity == Severity::DebugWarning && !self.show_debug {
            tracing::debug!("{message}");
            return;
        }
        self.reports.lock().push_back(Report { severity, message });
    }
}
