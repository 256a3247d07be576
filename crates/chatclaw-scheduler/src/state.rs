//! Per-stream dispatch state.
//!
//! One record per stream, mutated only by the dispatcher while it holds that
//! stream's lock. Nothing here touches the timer registry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::interval::ActivitySignals;
use crate::stats::StreamStats;

/// Where a stream is in its dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// No trigger pending, nothing running.
    Idle,
    /// Exactly one trigger waits in the registry.
    Scheduled,
    /// An activation is running; no trigger is registered.
    Executing,
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchState::Idle => write!(f, "idle"),
            DispatchState::Scheduled => write!(f, "scheduled"),
            DispatchState::Executing => write!(f, "executing"),
        }
    }
}

/// The activation currently running for a stream.
#[derive(Debug, Clone)]
pub struct Execution {
    pub generation: u64,
    /// Cancellation request sent to the activator.
    pub cancel: CancellationToken,
    /// Fired by the execution unit as soon as the activator returns.
    pub finished: CancellationToken,
    /// Unread messages the activator could see when it started.
    pub consumed_unread: u32,
    pub forced: bool,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
}

/// Mutable dispatch record for one stream.
#[derive(Debug)]
pub struct StreamDispatchState {
    pub stream_id: String,
    pub state: DispatchState,
    /// Messages since the last completed dispatch.
    pub unread_count: u32,
    /// Interruptions in the current cycle; reset when a dispatch completes.
    pub interruption_count: u32,
    /// Generation of the registered trigger while `Scheduled`.
    pub pending_generation: Option<u64>,
    pub last_dispatch_at: Option<Instant>,
    pub last_dispatch_wall: Option<DateTime<Utc>>,
    pub last_activity_at: Instant,
    pub created_at: Instant,
    /// Inactive streams count messages but are never scheduled.
    pub active: bool,
    pub total_messages: u64,
    pub total_dispatches: u64,
    pub total_failures: u64,
    pub total_interruptions: u64,
    execution: Option<Execution>,
}

impl StreamDispatchState {
    pub fn new(stream_id: &str, now: Instant) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            state: DispatchState::Idle,
            unread_count: 0,
            interruption_count: 0,
            pending_generation: None,
            last_dispatch_at: None,
            last_dispatch_wall: None,
            last_activity_at: now,
            created_at: now,
            active: true,
            total_messages: 0,
            total_dispatches: 0,
            total_failures: 0,
            total_interruptions: 0,
            execution: None,
        }
    }

    /// Count one incoming message.
    pub fn record_message(&mut self, now: Instant) {
        self.unread_count = self.unread_count.saturating_add(1);
        self.total_messages += 1;
        self.last_activity_at = now;
    }

    /// Time since the last dispatch; a stream that never dispatched counts from creation.
    pub fn since_last_dispatch(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_dispatch_at.unwrap_or(self.created_at))
    }

    pub fn signals(&self, now: Instant) -> ActivitySignals {
        ActivitySignals {
            unread_count: self.unread_count,
            since_last_dispatch: self.since_last_dispatch(now),
        }
    }

    /// A trigger with `generation` was just registered.
    pub fn mark_scheduled(&mut self, generation: u64) {
        self.state = DispatchState::Scheduled;
        self.pending_generation = Some(generation);
    }

    /// Back to idle with nothing pending or running.
    pub fn mark_idle(&mut self) {
        self.state = DispatchState::Idle;
        self.pending_generation = None;
        self.execution = None;
    }

    /// Whether `generation` is the trigger this stream is waiting for.
    pub fn is_pending(&self, generation: u64) -> bool {
        self.state == DispatchState::Scheduled && self.pending_generation == Some(generation)
    }

    /// Scheduled -> Executing. Returns the new execution handle.
    pub fn begin_execution(&mut self, generation: u64, forced: bool, now: Instant) -> Execution {
        let execution = Execution {
            generation,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            consumed_unread: self.unread_count,
            forced,
            started_at: now,
            started_wall: Utc::now(),
        };
        self.state = DispatchState::Executing;
        self.pending_generation = None;
        self.total_dispatches += 1;
        self.last_activity_at = now;
        self.execution = Some(execution.clone());
        execution
    }

    pub fn execution(&self) -> Option<&Execution> {
        self.execution.as_ref()
    }

    /// Whether `generation` is the execution currently owning this stream.
    pub fn is_current_execution(&self, generation: u64) -> bool {
        self.state == DispatchState::Executing
            && self.execution.as_ref().is_some_and(|e| e.generation == generation)
    }

    /// Close out the current execution: reset the cycle counters and drop
    /// the unread messages the activator consumed. Leaves the state `Idle`.
    pub fn complete_execution(&mut self, failed: bool, now: Instant) -> Option<Execution> {
        let execution = self.execution.take()?;
        self.unread_count = self.unread_count.saturating_sub(execution.consumed_unread);
        self.interruption_count = 0;
        self.last_dispatch_at = Some(now);
        self.last_dispatch_wall = Some(Utc::now());
        self.last_activity_at = now;
        if failed {
            self.total_failures += 1;
        }
        self.state = DispatchState::Idle;
        self.pending_generation = None;
        Some(execution)
    }

    /// Abandon the current execution after an interruption. Its eventual result is stale.
    pub fn abandon_execution(&mut self) -> Option<Execution> {
        let execution = self.execution.take()?;
        execution.cancel.cancel();
        self.state = DispatchState::Idle;
        Some(execution)
    }

    pub fn record_interruption(&mut self) {
        self.interruption_count += 1;
        self.total_interruptions += 1;
    }

    /// Idle, nothing unread, and untouched for at least `max_idle`.
    pub fn is_stale(&self, now: Instant, max_idle: Duration) -> bool {
        self.state == DispatchState::Idle
            && self.unread_count == 0
            && now.saturating_duration_since(self.last_activity_at) >= max_idle
    }

    /// Observability snapshot. `due_in` is the time left on the registered trigger, if any.
    pub fn stats(&self, now: Instant, due_in: Option<Duration>) -> StreamStats {
        StreamStats {
            stream_id: self.stream_id.clone(),
            state: self.state,
            active: self.active,
            unread_count: self.unread_count,
            interruption_count: self.interruption_count,
            pending_generation: self.pending_generation,
            due_in_ms: due_in.map(|left| left.as_millis() as u64),
            last_dispatch_at: self.last_dispatch_wall,
            secs_since_last_dispatch: self
                .last_dispatch_at
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            total_messages: self.total_messages,
            total_dispatches: self.total_dispatches,
            total_failures: self.total_failures,
            total_interruptions: self.total_interruptions,
        }
    }
}
