//! Stream Dispatcher — turns message arrivals and trigger fires into timer registry operations.
//!
//! ## Per-stream cycle
//! ```text
//! message ──► Idle ──schedule──► Scheduled ──trigger fires──► Executing ──done──► Idle
//!               ▲                  │  ▲                          │   │
//!               │      interrupt:  └──┘ cancel + re-register     │   └─► Scheduled (follow-up)
//!               └──────────── interrupt: cancel in-flight, new generation
//! ```
//!
//! Each stream's state sits behind its own async mutex, so messages for one
//! stream are applied in arrival order while streams never wait on each other.
//! The lock is never held across an activation call.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatclaw_core::config::ChatClawConfig;
use chatclaw_core::error::{ChatClawError, Result};
use chatclaw_core::traits::Activator;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{SchedulerEngine, panic_message};
use crate::history::{DispatchLog, DispatchOutcome, DispatchRecord};
use crate::interruption::{InterruptTarget, InterruptionPolicy};
use crate::interval::{IntervalDecision, IntervalPolicy};
use crate::state::{DispatchState, Execution, StreamDispatchState};
use crate::stats::{DispatcherStats, StreamStats};
use crate::trigger::Trigger;

type StreamHandle = Arc<StreamSlot>;

/// One stream's state plus the last stats snapshot taken under its lock.
struct StreamSlot {
    state: tokio::sync::Mutex<StreamDispatchState>,
    snapshot: Mutex<Option<StreamStats>>,
}

impl StreamSlot {
    fn new(stream_id: &str, now: Instant) -> Self {
        Self {
            state: tokio::sync::Mutex::new(StreamDispatchState::new(stream_id, now)),
            snapshot: Mutex::new(None),
        }
    }

    fn publish(&self, stats: StreamStats) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(stats);
    }

    fn cached(&self) -> Option<StreamStats> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Background idle-stream cleanup task.
struct Janitor {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The per-stream dispatch policy layer on top of [`SchedulerEngine`].
pub struct StreamDispatcher {
    engine: Arc<SchedulerEngine>,
    activator: Arc<dyn Activator>,
    interval: IntervalPolicy,
    interruption: InterruptionPolicy,
    execution_timeout: Duration,
    interrupt_ack_timeout: Duration,
    stream_idle_ttl: Duration,
    streams: Mutex<HashMap<String, StreamHandle>>,
    next_generation: AtomicU64,
    stale_completions: AtomicU64,
    log: DispatchLog,
    started_at: DateTime<Utc>,
    janitor: Mutex<Option<Janitor>>,
}

impl StreamDispatcher {
    /// Create a dispatcher over an existing engine. `config` should already be validated.
    pub fn new(config: &ChatClawConfig, engine: Arc<SchedulerEngine>, activator: Arc<dyn Activator>) -> Self {
        Self {
            engine,
            activator,
            interval: IntervalPolicy::from_config(&config.dispatch, &config.energy),
            interruption: InterruptionPolicy::from_config(&config.interruption),
            execution_timeout: config.scheduler.execution_timeout(),
            interrupt_ack_timeout: config.scheduler.interrupt_ack_timeout(),
            stream_idle_ttl: config.scheduler.stream_idle_ttl(),
            streams: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            log: DispatchLog::new(),
            started_at: Utc::now(),
            janitor: Mutex::new(None),
        }
    }

    /// Validate `config`, build a fresh engine, and wrap everything in an `Arc`.
    pub fn from_config(config: &ChatClawConfig, activator: Arc<dyn Activator>) -> Result<Arc<Self>> {
        config.validate()?;
        let engine = Arc::new(SchedulerEngine::new(config.scheduler.tick_interval()));
        Ok(Arc::new(Self::new(config, engine, activator)))
    }

    pub fn with_interval_policy(mut self, policy: IntervalPolicy) -> Self {
        self.interval = policy;
        self
    }

    pub fn with_interruption_policy(mut self, policy: InterruptionPolicy) -> Self {
        self.interruption = policy;
        self
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    pub fn history(&self) -> &DispatchLog {
        &self.log
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Start the engine with this dispatcher as its trigger handler, plus the idle-stream janitor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.engine.start(move |trigger| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(dispatcher) => dispatcher.on_trigger_due(trigger).await,
                    None => Ok(()),
                }
            }
        })?;

        let shutdown = CancellationToken::new();
        let every = (self.stream_idle_ttl / 4).max(Duration::from_secs(1));
        let task = tokio::spawn(janitor_loop(Arc::downgrade(self), every, shutdown.clone()));
        *self.janitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(Janitor { shutdown, task });

        tracing::info!(
            "🚦 Stream dispatcher started (activator: {}, base interval {:?})",
            self.activator.name(),
            self.interval.base_interval
        );
        Ok(())
    }

    /// Stop the engine and janitor and ask in-flight activations to cancel.
    pub async fn stop(&self) {
        self.engine.stop().await;

        let janitor = self.janitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Janitor { shutdown, task }) = janitor {
            shutdown.cancel();
            task.await.ok();
        }

        for handle in self.handles() {
            let state = handle.state.lock().await;
            if let Some(execution) = state.execution() {
                execution.cancel.cancel();
            }
        }
        tracing::info!("🛑 Stream dispatcher stopped");
    }

    // ─── Inbound: message arrival ───────────────────────────

    /// A message was appended to `stream_id`'s context. Returns the stream's resulting state.
    pub async fn on_message_received(&self, stream_id: &str) -> DispatchState {
        let handle = self.stream(stream_id);
        let mut state = handle.state.lock().await;
        let now = Instant::now();
        state.record_message(now);

        if !state.active {
            tracing::debug!("💤 [{}] inactive, message counted only", stream_id);
            return state.state;
        }

        match state.state {
            DispatchState::Idle => self.schedule(&mut state, now),
            DispatchState::Scheduled => self.on_message_while_scheduled(&mut state, now),
            DispatchState::Executing => self.on_message_while_executing(&handle, &mut state).await,
        }
        state.state
    }

    fn on_message_while_scheduled(&self, state: &mut StreamDispatchState, now: Instant) {
        if self
            .interruption
            .should_interrupt(InterruptTarget::Scheduled, state.interruption_count)
        {
            self.engine.cancel(&state.stream_id);
            state.record_interruption();
            tracing::debug!(
                "✂️ [{}] pending trigger interrupted ({}/{})",
                state.stream_id,
                state.interruption_count,
                self.interruption.max_limit
            );
            self.schedule(state, now);
            return;
        }

        // Not interrupting, but a backlog can still pull the trigger forward
        // to the moment the forced condition holds.
        let decision = self.interval.compute(&state.signals(now));
        if decision.forced {
            let sooner = self
                .engine
                .registry()
                .get(&state.stream_id)
                .is_none_or(|t| now + decision.delay < t.due_at);
            if sooner {
                self.register_next(state, now, decision);
            }
        }
    }

    async fn on_message_while_executing(&self, slot: &StreamSlot, state: &mut StreamDispatchState) {
        if !self
            .interruption
            .should_interrupt(InterruptTarget::Executing, state.interruption_count)
        {
            return;
        }
        let Some(execution) = state.abandon_execution() else {
            return;
        };
        state.record_interruption();
        tracing::info!(
            "✂️ [{}] interrupting in-flight activation (gen {})",
            state.stream_id,
            execution.generation
        );

        // The execution unit fires `finished` before it takes this stream's lock,
        // so waiting here while holding the lock cannot deadlock. Stats readers
        // get the published snapshot meanwhile.
        slot.publish(self.snapshot_of(state, Instant::now()));
        if tokio::time::timeout(self.interrupt_ack_timeout, execution.finished.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(
                "⚠️ [{}] activation gen {} did not acknowledge cancellation within {:?}, result will be discarded",
                state.stream_id,
                execution.generation,
                self.interrupt_ack_timeout
            );
        }
        self.schedule(state, Instant::now());
    }

    // ─── Trigger fire ───────────────────────────────────────

    /// Run one dispatch for a fired trigger. Called by the engine, one task per trigger.
    pub async fn on_trigger_due(&self, trigger: Trigger) -> Result<()> {
        let Some(handle) = self.existing(&trigger.stream_id) else {
            tracing::debug!("🗑️ Trigger for unknown stream {} dropped", trigger.stream_id);
            return Ok(());
        };

        let execution = {
            let mut state = handle.state.lock().await;
            if !state.is_pending(trigger.generation) {
                tracing::debug!(
                    "🗑️ [{}] stale trigger gen {} dropped",
                    trigger.stream_id,
                    trigger.generation
                );
                return Ok(());
            }
            state.begin_execution(trigger.generation, trigger.forced, Instant::now())
        };

        tracing::debug!(
            "▶️ [{}] dispatch gen {} ({} unread{})",
            trigger.stream_id,
            execution.generation,
            execution.consumed_unread,
            if execution.forced { ", forced" } else { "" }
        );

        let outcome = self.run_activation(&trigger.stream_id, &execution).await;
        execution.finished.cancel();

        let mut state = handle.state.lock().await;
        let now = Instant::now();
        let duration = now.saturating_duration_since(execution.started_at);

        if !state.is_current_execution(execution.generation) {
            self.stale_completions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "🗑️ [{}] discarding stale completion of gen {} ({:?})",
                trigger.stream_id,
                execution.generation,
                outcome
            );
            self.record(&execution, &trigger.stream_id, DispatchOutcome::Stale, duration);
            return Ok(());
        }

        state.complete_execution(outcome.is_failure(), now);
        match &outcome {
            DispatchOutcome::Completed { .. } => {
                tracing::debug!("✅ [{}] dispatch gen {} done in {:?}", trigger.stream_id, execution.generation, duration);
            }
            DispatchOutcome::Cancelled => {
                tracing::debug!("⏹️ [{}] dispatch gen {} cancelled", trigger.stream_id, execution.generation);
            }
            failure => {
                tracing::warn!("⚠️ [{}] dispatch gen {} failed: {:?}", trigger.stream_id, execution.generation, failure);
            }
        }
        self.record(&execution, &trigger.stream_id, outcome, duration);

        if state.active
            && let Some(decision) = self.interval.follow_up(&state.signals(now))
        {
            self.register_next(&mut state, now, decision);
        }
        Ok(())
    }

    /// Call the activator under the execution timeout, catching panics.
    async fn run_activation(&self, stream_id: &str, execution: &Execution) -> DispatchOutcome {
        let call = AssertUnwindSafe(self.activator.activate(stream_id, execution.cancel.clone())).catch_unwind();
        match tokio::time::timeout(self.execution_timeout, call).await {
            Err(_) => {
                execution.cancel.cancel();
                ChatClawError::Timeout(self.execution_timeout).into()
            }
            Ok(Err(panic)) => DispatchOutcome::Panicked {
                message: panic_message(&*panic),
            },
            Ok(Ok(Ok(outcome))) => DispatchOutcome::Completed { outcome },
            Ok(Ok(Err(e))) => e.into(),
        }
    }

    fn record(&self, execution: &Execution, stream_id: &str, outcome: DispatchOutcome, duration: Duration) {
        self.log.record(DispatchRecord {
            stream_id: stream_id.to_string(),
            generation: execution.generation,
            outcome,
            forced: execution.forced,
            started_at: execution.started_wall,
            duration_ms: duration.as_millis() as u64,
        });
    }

    // ─── Scheduling ─────────────────────────────────────────

    /// Compute the interval from current activity and register a fresh trigger.
    fn schedule(&self, state: &mut StreamDispatchState, now: Instant) {
        let decision = self.interval.compute(&state.signals(now));
        self.register_next(state, now, decision);
    }

    fn register_next(&self, state: &mut StreamDispatchState, now: Instant, decision: IntervalDecision) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut trigger = Trigger::after(&state.stream_id, now, decision.delay, generation);
        if decision.forced {
            trigger = trigger.forced();
        }
        self.engine.register(trigger);
        state.mark_scheduled(generation);
        tracing::debug!(
            "📅 [{}] gen {} due in {:?} (energy {:.2}, unread {}{})",
            state.stream_id,
            generation,
            decision.delay,
            decision.energy,
            state.unread_count,
            if decision.forced { ", forced" } else { "" }
        );
    }

    // ─── Stream lifecycle ───────────────────────────────────

    /// Stop scheduling a stream: drop its pending trigger and cancel any running activation.
    pub async fn deactivate_stream(&self, stream_id: &str) -> bool {
        let Some(handle) = self.existing(stream_id) else {
            return false;
        };
        let mut state = handle.state.lock().await;
        self.clear_stream(&mut state);
        state.active = false;
        tracing::info!("💤 Stream deactivated: {}", stream_id);
        true
    }

    /// Resume scheduling a stream; schedules at once if messages are waiting.
    pub async fn activate_stream(&self, stream_id: &str) -> bool {
        let Some(handle) = self.existing(stream_id) else {
            return false;
        };
        let mut state = handle.state.lock().await;
        state.active = true;
        if state.state == DispatchState::Idle && state.unread_count > 0 {
            self.schedule(&mut state, Instant::now());
        }
        tracing::info!("▶️ Stream activated: {}", stream_id);
        true
    }

    /// Tear a stream down entirely.
    pub async fn remove_stream(&self, stream_id: &str) -> bool {
        let handle = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream_id);
        let Some(handle) = handle else {
            return false;
        };
        let mut state = handle.state.lock().await;
        self.clear_stream(&mut state);
        state.active = false;
        tracing::info!("🗑️ Stream removed: {}", stream_id);
        true
    }

    fn clear_stream(&self, state: &mut StreamDispatchState) {
        if let Some(generation) = state.pending_generation {
            self.engine.registry().cancel_generation(&state.stream_id, generation);
        }
        if let Some(execution) = state.abandon_execution() {
            tracing::debug!("⏹️ [{}] cancelling in-flight gen {}", state.stream_id, execution.generation);
        }
        state.mark_idle();
    }

    /// Drop idle streams with nothing unread and no activity for `max_idle`.
    /// Streams that are locked or referenced elsewhere are left for the next pass.
    pub fn cleanup_inactive_streams(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, handle| {
                let stale = Arc::strong_count(handle) == 1
                    && handle.state.try_lock().is_ok_and(|s| s.is_stale(now, max_idle));
                if stale {
                    removed.push(id.clone());
                }
                !stale
            });
        for id in &removed {
            tracing::info!("🧹 Cleaned up inactive stream: {}", id);
        }
        removed
    }

    // ─── Observability ──────────────────────────────────────

    pub async fn stream_stats(&self, stream_id: &str) -> Option<StreamStats> {
        let handle = self.existing(stream_id)?;
        Some(self.read_stats(&handle, Instant::now()).await)
    }

    pub async fn all_stream_stats(&self) -> Vec<StreamStats> {
        let now = Instant::now();
        let mut out = Vec::new();
        for handle in self.handles() {
            out.push(self.read_stats(&handle, now).await);
        }
        out.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        out
    }

    pub async fn stats(&self) -> DispatcherStats {
        let mut stats = DispatcherStats {
            total_streams: 0,
            active_streams: 0,
            idle: 0,
            scheduled: 0,
            executing: 0,
            total_unread: 0,
            total_messages: 0,
            total_dispatches: 0,
            total_failures: 0,
            total_interruptions: 0,
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            pending_triggers: self.engine.registry().len(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            engine: self.engine.stats(),
        };
        for stream in self.all_stream_stats().await {
            stats.accumulate(&stream);
        }
        stats
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    // ─── Internals ──────────────────────────────────────────

    fn snapshot_of(&self, state: &StreamDispatchState, now: Instant) -> StreamStats {
        let due_in = self
            .engine
            .registry()
            .get(&state.stream_id)
            .map(|t| t.remaining(now));
        state.stats(now, due_in)
    }

    /// Fresh stats when the stream is free, otherwise the last published snapshot.
    /// Only a stream that has never been read waits for its lock.
    async fn read_stats(&self, slot: &StreamSlot, now: Instant) -> StreamStats {
        if let Ok(state) = slot.state.try_lock() {
            let stats = self.snapshot_of(&state, now);
            slot.publish(stats.clone());
            return stats;
        }
        if let Some(stats) = slot.cached() {
            return stats;
        }
        let state = slot.state.lock().await;
        self.snapshot_of(&state, now)
    }

    fn stream(&self, stream_id: &str) -> StreamHandle {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("🆕 Stream created: {}", stream_id);
                Arc::new(StreamSlot::new(stream_id, Instant::now()))
            })
            .clone()
    }

    fn existing(&self, stream_id: &str) -> Option<StreamHandle> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }

    fn handles(&self) -> Vec<StreamHandle> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

async fn janitor_loop(dispatcher: std::sync::Weak<StreamDispatcher>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        let ttl = dispatcher.stream_idle_ttl;
        dispatcher.cleanup_inactive_streams(ttl);
    }
}
