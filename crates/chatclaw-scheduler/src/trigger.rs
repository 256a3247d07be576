//! Trigger definitions — the atomic schedulable unit.

use std::time::Duration;

use tokio::time::Instant;

/// A pending point in time at which a stream's activation should fire.
///
/// Owned by the [`TimerRegistry`](crate::registry::TimerRegistry) while pending,
/// handed to an execution unit when it fires, then dropped. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Owning stream; also the registry key.
    pub stream_id: String,
    /// When the trigger becomes due.
    pub due_at: Instant,
    /// When the trigger was created.
    pub created_at: Instant,
    /// Monotonic counter used to reject stale triggers and completions.
    pub generation: u64,
    /// Whether the forced-dispatch override set `due_at`.
    pub forced: bool,
}

impl Trigger {
    /// Create a trigger due at an absolute instant.
    pub fn at(stream_id: &str, due_at: Instant, generation: u64) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            due_at,
            created_at: Instant::now(),
            generation,
            forced: false,
        }
    }

    /// Create a trigger due `delay` after `now`.
    pub fn after(stream_id: &str, now: Instant, delay: Duration, generation: u64) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            due_at: now + delay,
            created_at: now,
            generation,
            forced: false,
        }
    }

    /// Mark this trigger as produced by a forced dispatch.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Check whether this trigger should fire at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.due_at <= now
    }

    /// Time left until due (zero once due).
    pub fn remaining(&self, now: Instant) -> Duration {
        self.due_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_sets_due() {
        let now = Instant::now();
        let t = Trigger::after("s1", now, Duration::from_secs(5), 1);
        assert_eq!(t.due_at, now + Duration::from_secs(5));
        assert!(!t.is_due(now));
        assert!(t.is_due(now + Duration::from_secs(5)));
        assert_eq!(t.remaining(now), Duration::from_secs(5));
        assert_eq!(t.remaining(now + Duration::from_secs(9)), Duration::ZERO);
    }

    #[test]
    fn test_forced_flag() {
        let now = Instant::now();
        let t = Trigger::at("s1", now, 7).forced();
        assert!(t.forced);
        assert!(t.is_due(now));
        assert_eq!(t.generation, 7);
    }
}
