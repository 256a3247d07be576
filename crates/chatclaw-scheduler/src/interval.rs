//! Interval policy — how long a stream waits before its next trigger.
//!
//! `delay = base_interval / energy`, clamped to `[min_interval, max_interval]`.
//! Energy comes from a pluggable [`EnergyModel`]; more activity means more
//! energy and a shorter wait. The forced-dispatch override bypasses the
//! formula entirely once a backlog has built up for long enough.

use std::sync::Arc;
use std::time::Duration;

use chatclaw_core::config::{DispatchConfig, EnergyConfig};

/// Activity signals for one stream at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySignals {
    /// Messages received since the last dispatch.
    pub unread_count: u32,
    /// Time since the last dispatch, or since the stream appeared if it never dispatched.
    pub since_last_dispatch: Duration,
}

/// Maps activity to an energy score. Must return at least 1.0 and be
/// monotone non-decreasing in both signals.
pub trait EnergyModel: Send + Sync {
    fn energy(&self, signals: &ActivitySignals, base_interval: Duration) -> f64;
}

/// Default model: linear in unread backlog plus a bounded staleness bonus.
#[derive(Debug, Clone)]
pub struct ActivityEnergy {
    pub unread_weight: f64,
    pub staleness_weight: f64,
    pub max_energy: f64,
}

impl ActivityEnergy {
    pub fn from_config(config: &EnergyConfig) -> Self {
        Self {
            unread_weight: config.unread_weight,
            staleness_weight: config.staleness_weight,
            max_energy: config.max_energy,
        }
    }
}

impl Default for ActivityEnergy {
    fn default() -> Self {
        Self::from_config(&EnergyConfig::default())
    }
}

impl EnergyModel for ActivityEnergy {
    fn energy(&self, signals: &ActivitySignals, base_interval: Duration) -> f64 {
        let backlog = signals.unread_count.saturating_sub(1) as f64;
        let staleness = if base_interval.is_zero() {
            1.0
        } else {
            (signals.since_last_dispatch.as_secs_f64() / base_interval.as_secs_f64()).min(1.0)
        };
        let energy = 1.0 + self.unread_weight * backlog + self.staleness_weight * staleness;
        energy.clamp(1.0, self.max_energy.max(1.0))
    }
}

/// Result of one interval computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalDecision {
    pub delay: Duration,
    /// Set when the forced-dispatch override produced this decision.
    pub forced: bool,
    pub energy: f64,
}

/// Interval policy built from the `[dispatch]` and `[energy]` config sections.
#[derive(Clone)]
pub struct IntervalPolicy {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub force_dispatch_unread_threshold: u32,
    pub force_dispatch_min_interval: Duration,
    pub idle_follow_up_interval: Option<Duration>,
    energy: Arc<dyn EnergyModel>,
}

impl IntervalPolicy {
    pub fn from_config(dispatch: &DispatchConfig, energy: &EnergyConfig) -> Self {
        Self {
            base_interval: Duration::from_secs_f64(dispatch.distribution_interval),
            min_interval: Duration::from_secs_f64(dispatch.min_interval),
            max_interval: Duration::from_secs_f64(dispatch.max_interval),
            force_dispatch_unread_threshold: dispatch.force_dispatch_unread_threshold,
            force_dispatch_min_interval: Duration::from_secs_f64(dispatch.force_dispatch_min_interval),
            idle_follow_up_interval: dispatch.idle_follow_up_interval.map(Duration::from_secs_f64),
            energy: Arc::new(ActivityEnergy::from_config(energy)),
        }
    }

    /// Swap in a different energy model.
    pub fn with_energy_model(mut self, model: Arc<dyn EnergyModel>) -> Self {
        self.energy = model;
        self
    }

    pub fn energy(&self, signals: &ActivitySignals) -> f64 {
        self.energy.energy(signals, self.base_interval).max(1.0)
    }

    /// Energy-scaled delay, ignoring the forced-dispatch override.
    pub fn smooth_delay(&self, signals: &ActivitySignals) -> Duration {
        let energy = self.energy(signals);
        let delay = Duration::from_secs_f64(self.base_interval.as_secs_f64() / energy);
        delay.max(self.min_interval).min(self.max_interval)
    }

    /// Time until a backlog at the threshold may force a dispatch.
    /// `None` below the threshold, zero once the minimum interval has passed.
    pub fn until_forced(&self, signals: &ActivitySignals) -> Option<Duration> {
        (signals.unread_count >= self.force_dispatch_unread_threshold)
            .then(|| self.force_dispatch_min_interval.saturating_sub(signals.since_last_dispatch))
    }

    /// Delay before the next trigger. Once the backlog reaches the threshold the
    /// delay never runs past the moment the forced condition becomes true.
    pub fn compute(&self, signals: &ActivitySignals) -> IntervalDecision {
        let energy = self.energy(signals);
        let smooth = self.smooth_delay(signals);
        match self.until_forced(signals) {
            Some(wait) if wait <= smooth => IntervalDecision {
                delay: wait,
                forced: true,
                energy,
            },
            _ => IntervalDecision {
                delay: smooth,
                forced: false,
                energy,
            },
        }
    }

    /// Follow-up decision after a completed dispatch. `None` means go idle.
    pub fn follow_up(&self, signals: &ActivitySignals) -> Option<IntervalDecision> {
        if signals.unread_count > 0 {
            return Some(self.compute(signals));
        }
        self.idle_follow_up_interval.map(|delay| IntervalDecision {
            delay,
            forced: false,
            energy: self.energy(signals),
        })
    }
}

impl std::fmt::Debug for IntervalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalPolicy")
            .field("base_interval", &self.base_interval)
            .field("min_interval", &self.min_interval)
            .field("max_interval", &self.max_interval)
            .field("force_dispatch_unread_threshold", &self.force_dispatch_unread_threshold)
            .field("force_dispatch_min_interval", &self.force_dispatch_min_interval)
            .field("idle_follow_up_interval", &self.idle_follow_up_interval)
            .finish_non_exhaustive()
    }
}
