//! Observability snapshots for monitoring collaborators.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::EngineStats;
use crate::state::DispatchState;

/// Statistics for a single stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub state: DispatchState,
    pub active: bool,
    pub unread_count: u32,
    pub interruption_count: u32,
    pub pending_generation: Option<u64>,
    /// Time until the pending trigger fires.
    pub due_in_ms: Option<u64>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub secs_since_last_dispatch: Option<f64>,
    pub total_messages: u64,
    pub total_dispatches: u64,
    pub total_failures: u64,
    pub total_interruptions: u64,
}

/// Aggregate statistics across all streams.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub idle: usize,
    pub scheduled: usize,
    pub executing: usize,
    pub total_unread: u64,
    pub total_messages: u64,
    pub total_dispatches: u64,
    pub total_failures: u64,
    pub total_interruptions: u64,
    /// Completions discarded because a newer generation had taken over.
    pub stale_completions: u64,
    pub pending_triggers: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub engine: EngineStats,
}

impl DispatcherStats {
    /// Fold per-stream snapshots into the aggregate.
    pub(crate) fn accumulate(&mut self, stream: &StreamStats) {
        self.total_streams += 1;
        if stream.active {
            self.active_streams += 1;
        }
        match stream.state {
            DispatchState::Idle => self.idle += 1,
            DispatchState::Scheduled => self.scheduled += 1,
            DispatchState::Executing => self.executing += 1,
        }
        self.total_unread += u64::from(stream.unread_count);
        self.total_messages += stream.total_messages;
        self.total_dispatches += stream.total_dispatches;
        self.total_failures += stream.total_failures;
        self.total_interruptions += stream.total_interruptions;
    }
}
