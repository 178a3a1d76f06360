//! Bounded operation log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entries kept in the persisted log.
pub const OPERATION_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured operation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub scope: String,
    pub action: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        scope: impl Into<String>,
        action: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            level,
            scope: scope.into(),
            action: action.into(),
            outcome: outcome.into(),
            host_id: None,
            trace_id: None,
            event_id: None,
            tool_id: None,
            detail: None,
        }
    }

    pub fn host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn tool(mut self, tool_id: Option<&str>) -> Self {
        self.tool_id = tool_id.map(str::to_string);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fixed-capacity log; the oldest entry is evicted on each push when full.
///
/// Iteration order is oldest to newest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LogEntry>", into = "Vec<LogEntry>")]
pub struct OperationLog {
    buf: VecDeque<LogEntry>,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self {
            buf: VecDeque::with_capacity(OPERATION_LOG_CAPACITY),
        }
    }
}

impl OperationLog {
    /// Push an entry, evicting the oldest entry when at capacity.
    pub fn push(&mut self, entry: LogEntry) {
        if self.buf.len() == OPERATION_LOG_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.buf.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.buf.back()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl From<Vec<LogEntry>> for OperationLog {
    fn from(entries: Vec<LogEntry>) -> Self {
        let mut log = OperationLog::default();
        // Keep only the newest entries of an oversized persisted log.
        let skip = entries.len().saturating_sub(OPERATION_LOG_CAPACITY);
        for entry in entries.into_iter().skip(skip) {
            log.push(entry);
        }
        log
    }
}

impl From<OperationLog> for Vec<LogEntry> {
    fn from(log: OperationLog) -> Self {
        log.buf.into_iter().collect()
    }
}
