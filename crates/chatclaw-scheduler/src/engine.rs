//! Scheduler Engine — the generic loop that scans the timer registry and fires due triggers.
//! Uses tokio::interval for zero-overhead ticking (sleeps between scans).
//!
//! Every due trigger runs as its own tokio task, so a slow activation on one
//! stream never delays another stream's trigger. Errors and panics are caught
//! at the task boundary and counted; they never reach the loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatclaw_core::error::{ChatClawError, Result};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::TimerRegistry;
use crate::trigger::Trigger;

/// Loop and execution counters.
#[derive(Debug, Default)]
struct EngineCounters {
    ticks: AtomicU64,
    fired: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    in_flight: AtomicU64,
}

/// Snapshot of engine activity.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub tick_interval_ms: u64,
    pub ticks: u64,
    pub fired: u64,
    pub failed: u64,
    pub panicked: u64,
    pub in_flight: u64,
    pub pending: usize,
    /// Time until the earliest pending trigger fires.
    pub next_due_in_ms: Option<u64>,
}

/// Running loop: its shutdown token and task handle.
struct LoopHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The scheduler engine — owns the timer registry and drives the scan loop.
///
/// Constructed explicitly and passed around by `Arc`, so tests can run any
/// number of independent engines.
pub struct SchedulerEngine {
    registry: Arc<TimerRegistry>,
    tick_interval: Duration,
    counters: Arc<EngineCounters>,
    running: Mutex<Option<LoopHandle>>,
}

impl SchedulerEngine {
    /// Create an engine that scans every `tick_interval`.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            registry: Arc::new(TimerRegistry::new()),
            tick_interval,
            counters: Arc::new(EngineCounters::default()),
            running: Mutex::new(None),
        }
    }

    /// The shared timer registry.
    pub fn registry(&self) -> &Arc<TimerRegistry> {
        &self.registry
    }

    /// Insert or replace the trigger for its stream.
    pub fn register(&self, trigger: Trigger) -> Option<Trigger> {
        self.registry.register(trigger)
    }

    /// Insert-only variant; fails if the stream already has a live trigger.
    pub fn register_new(&self, trigger: Trigger) -> Result<()> {
        self.registry.insert(trigger)
    }

    /// Remove the trigger for `stream_id`; `false` if there was none.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.registry.cancel(stream_id)
    }

    /// Remove and return every trigger due at `now`.
    pub fn tick(&self, now: Instant) -> Vec<Trigger> {
        self.registry.tick(now)
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Start the scan loop as a background task. `on_due` runs once per fired trigger.
    pub fn start<F, Fut>(&self, on_due: F) -> Result<()>
    where
        F: Fn(Trigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return Err(ChatClawError::Scheduler("engine already running".into()));
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.registry.clone(),
            self.tick_interval,
            on_due,
            shutdown.clone(),
            self.counters.clone(),
        ));
        *running = Some(LoopHandle { shutdown, task });
        Ok(())
    }

    /// Stop the scan loop and wait for it to exit. Returns `false` if it was not running.
    ///
    /// Executions already in flight are not cancelled here.
    pub async fn stop(&self) -> bool {
        let handle = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(LoopHandle { shutdown, task }) = handle else {
            return false;
        };
        shutdown.cancel();
        if let Err(e) = task.await {
            tracing::error!("❌ Scheduler loop ended abnormally: {e}");
        }
        true
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.is_running(),
            tick_interval_ms: self.tick_interval.as_millis() as u64,
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            fired: self.counters.fired.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            pending: self.registry.len(),
            next_due_in_ms: self
                .registry
                .next_due()
                .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64),
        }
    }
}

/// The scan loop. Runs until `shutdown` fires.
async fn run_loop<F, Fut>(
    registry: Arc<TimerRegistry>,
    tick_interval: Duration,
    on_due: F,
    shutdown: CancellationToken,
    counters: Arc<EngineCounters>,
) where
    F: Fn(Trigger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tracing::info!(
        "⏰ Scheduler started (scan every {}ms)",
        tick_interval.as_millis()
    );

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        counters.ticks.fetch_add(1, Ordering::Relaxed);
        let due = registry.tick(Instant::now());
        for trigger in due {
            tracing::debug!("🔔 Trigger fired: {} (gen {})", trigger.stream_id, trigger.generation);
            counters.fired.fetch_add(1, Ordering::Relaxed);
            let label = format!("{}#{}", trigger.stream_id, trigger.generation);
            spawn_execution(label, on_due(trigger), counters.clone());
        }
    }

    tracing::info!("⏹️ Scheduler stopped");
}

/// Run one execution unit, isolating its failure from the loop and its siblings.
fn spawn_execution<Fut>(label: String, fut: Fut, counters: Arc<EngineCounters>)
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    counters.in_flight.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("⚠️ Execution {label} failed: {e}");
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!("💥 Execution {label} panicked: {}", panic_message(&*panic));
            }
        }
        counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    });
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
