//! # ChatClaw Scheduler
//!
//! Decides *when* each conversation stream gets a response.
//!
//! ## Architecture
//! ```text
//! on_message_received(stream)
//!   └── StreamDispatcher ── InterruptionPolicy / IntervalPolicy
//!         └── TimerRegistry (one trigger per stream)
//!               └── SchedulerEngine (tokio interval scan)
//!                     └── one task per due trigger → on_trigger_due → Activator
//! ```
//!
//! Everything is in memory. Nothing survives a restart.

pub mod dispatcher;
pub mod engine;
pub mod history;
pub mod interruption;
pub mod interval;
pub mod registry;
pub mod state;
pub mod stats;
pub mod trigger;

pub use dispatcher::StreamDispatcher;
pub use engine::{EngineStats, SchedulerEngine};
pub use history::{DispatchLog, DispatchOutcome, DispatchRecord};
pub use interruption::{InterruptTarget, InterruptionPolicy};
pub use interval::{ActivityEnergy, ActivitySignals, EnergyModel, IntervalDecision, IntervalPolicy};
pub use registry::TimerRegistry;
pub use state::{DispatchState, StreamDispatchState};
pub use stats::{DispatcherStats, StreamStats};
pub use trigger::Trigger;
