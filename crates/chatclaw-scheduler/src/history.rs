//! Dispatch history — in-memory ring buffer of recent activations.
//! Lightweight: no persistence. Surfaces failures to whoever is watching.

use std::collections::VecDeque;
use std::sync::Mutex;

use chatclaw_core::error::ChatClawError;
use chatclaw_core::types::ActivationOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How many records the log keeps.
pub const HISTORY_CAPACITY: usize = 100;

/// How one dispatch ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed { outcome: ActivationOutcome },
    Failed { error: String },
    TimedOut { after_ms: u64 },
    Cancelled,
    Panicked { message: String },
    /// Finished after a newer generation took over; result discarded.
    Stale,
}

impl DispatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Failed { .. } | DispatchOutcome::TimedOut { .. } | DispatchOutcome::Panicked { .. }
        )
    }
}

impl From<ChatClawError> for DispatchOutcome {
    fn from(e: ChatClawError) -> Self {
        match e {
            ChatClawError::Cancelled => DispatchOutcome::Cancelled,
            ChatClawError::Timeout(after) => DispatchOutcome::TimedOut {
                after_ms: after.as_millis() as u64,
            },
            other => DispatchOutcome::Failed { error: other.to_string() },
        }
    }
}

/// One finished dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub stream_id: String,
    pub generation: u64,
    pub outcome: DispatchOutcome,
    pub forced: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Ring buffer of recent dispatch records.
pub struct DispatchLog {
    records: Mutex<VecDeque<DispatchRecord>>,
    capacity: usize,
}

impl DispatchLog {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record a finished dispatch, evicting the oldest past capacity.
    pub fn record(&self, record: DispatchRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// Newest-last copy of the whole buffer.
    pub fn history(&self) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// The most recent `n` records for one stream, newest first.
    pub fn for_stream(&self, stream_id: &str, n: usize) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .filter(|r| r.stream_id == stream_id)
            .take(n)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DispatchLog {
    fn default() -> Self {
        Self::new()
    }
}
