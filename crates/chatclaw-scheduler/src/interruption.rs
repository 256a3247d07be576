//! Interruption policy — whether a new message may cancel and replace a stream's trigger.

use std::sync::Mutex;

use chatclaw_core::config::InterruptionConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What the interruption would cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptTarget {
    /// A trigger still waiting in the registry.
    Scheduled,
    /// An activation that is already running.
    Executing,
}

/// Interruption gates plus a weighted random draw.
pub struct InterruptionPolicy {
    pub enabled: bool,
    pub allow_reply_interruption: bool,
    pub max_limit: u32,
    pub probability: f64,
    rng: Mutex<StdRng>,
}

impl InterruptionPolicy {
    pub fn from_config(config: &InterruptionConfig) -> Self {
        Self {
            enabled: config.interruption_enabled,
            allow_reply_interruption: config.allow_reply_interruption,
            max_limit: config.interruption_max_limit,
            probability: config.interruption_probability.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reseed the random gate, for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// The deterministic gates: master switch, reply interruption, per-cycle cap.
    pub fn is_permitted(&self, target: InterruptTarget, interruption_count: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if target == InterruptTarget::Executing && !self.allow_reply_interruption {
            return false;
        }
        interruption_count < self.max_limit
    }

    /// Pure decision given a uniform `roll` in `[0, 1)`.
    pub fn decide(&self, target: InterruptTarget, interruption_count: u32, roll: f64) -> bool {
        self.is_permitted(target, interruption_count) && roll < self.probability
    }

    /// Full decision, drawing the roll from the policy's RNG.
    pub fn should_interrupt(&self, target: InterruptTarget, interruption_count: u32) -> bool {
        if !self.is_permitted(target, interruption_count) {
            return false;
        }
        let roll: f64 = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0.0..1.0);
        self.decide(target, interruption_count, roll)
    }
}

impl std::fmt::Debug for InterruptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptionPolicy")
            .field("enabled", &self.enabled)
            .field("allow_reply_interruption", &self.allow_reply_interruption)
            .field("max_limit", &self.max_limit)
            .field("probability", &self.probability)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: bool, allow_reply: bool, max: u32, probability: f64) -> InterruptionPolicy {
        InterruptionPolicy::from_config(&InterruptionConfig {
            interruption_enabled: enabled,
            allow_reply_interruption: allow_reply,
            interruption_max_limit: max,
            interruption_probability: probability,
        })
        .with_seed(42)
    }

    #[test]
    fn test_disabled_never_interrupts() {
        let p = policy(false, true, 10, 1.0);
        assert!(!p.should_interrupt(InterruptTarget::Scheduled, 0));
        assert!(!p.decide(InterruptTarget::Executing, 0, 0.0));
    }

    #[test]
    fn test_reply_interruption_gate() {
        let p = policy(true, false, 3, 1.0);
        assert!(p.should_interrupt(InterruptTarget::Scheduled, 0));
        assert!(!p.should_interrupt(InterruptTarget::Executing, 0));

        let p = policy(true, true, 3, 1.0);
        assert!(p.should_interrupt(InterruptTarget::Executing, 0));
    }

    #[test]
    fn test_cap_reached() {
        let p = policy(true, true, 2, 1.0);
        assert!(p.should_interrupt(InterruptTarget::Scheduled, 1));
        assert!(!p.should_interrupt(InterruptTarget::Scheduled, 2));
        assert!(!p.should_interrupt(InterruptTarget::Scheduled, 7));
    }

    #[test]
    fn test_decide_uses_roll() {
        let p = policy(true, true, 3, 0.25);
        assert!(p.decide(InterruptTarget::Scheduled, 0, 0.1));
        assert!(!p.decide(InterruptTarget::Scheduled, 0, 0.25));
        assert!(!p.decide(InterruptTarget::Scheduled, 0, 0.9));
    }

    #[test]
    fn test_zero_probability_never_fires() {
        let p = policy(true, true, 100, 0.0);
        assert!((0..200).all(|_| !p.should_interrupt(InterruptTarget::Scheduled, 0)));
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let a = policy(true, true, 100, 0.5);
        let b = policy(true, true, 100, 0.5);
        let seq_a: Vec<bool> = (0..64).map(|_| a.should_interrupt(InterruptTarget::Scheduled, 0)).collect();
        let seq_b: Vec<bool> = (0..64).map(|_| b.should_interrupt(InterruptTarget::Scheduled, 0)).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().any(|x| *x) && seq_a.iter().any(|x| !*x));
    }
}
