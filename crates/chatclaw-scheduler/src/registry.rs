//! Timer registry — the set of pending triggers, at most one per stream.
//!
//! The only state shared across streams. Every operation is one short
//! critical section under a synchronous lock: no I/O, no `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chatclaw_core::error::{ChatClawError, Result};
use tokio::time::Instant;

use crate::trigger::Trigger;

/// Pending triggers keyed by stream id.
#[derive(Default)]
pub struct TimerRegistry {
    triggers: Mutex<HashMap<String, Trigger>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Trigger>> {
        // No code panics while holding this lock, so a poisoned map is still consistent.
        self.triggers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the trigger for its stream. Returns the replaced trigger, if any.
    pub fn register(&self, trigger: Trigger) -> Option<Trigger> {
        let replaced = self.lock().insert(trigger.stream_id.clone(), trigger);
        if let Some(old) = &replaced {
            tracing::trace!("♻️ Trigger replaced: {} (gen {})", old.stream_id, old.generation);
        }
        replaced
    }

    /// Insert only if no trigger is pending for the stream.
    pub fn insert(&self, trigger: Trigger) -> Result<()> {
        let mut triggers = self.lock();
        if triggers.contains_key(&trigger.stream_id) {
            return Err(ChatClawError::DuplicateTrigger(trigger.stream_id));
        }
        triggers.insert(trigger.stream_id.clone(), trigger);
        Ok(())
    }

    /// Remove the trigger for `stream_id`. Returns whether one was removed.
    pub fn cancel(&self, stream_id: &str) -> bool {
        self.lock().remove(stream_id).is_some()
    }

    /// Remove the trigger only if it still carries `generation`.
    pub fn cancel_generation(&self, stream_id: &str, generation: u64) -> bool {
        let mut triggers = self.lock();
        match triggers.get(stream_id) {
            Some(t) if t.generation == generation => triggers.remove(stream_id).is_some(),
            _ => false,
        }
    }

    /// Atomically remove and return every trigger due at `now`, earliest first.
    pub fn tick(&self, now: Instant) -> Vec<Trigger> {
        let mut due: Vec<Trigger> = {
            let mut triggers = self.lock();
            let keys: Vec<String> = triggers
                .iter()
                .filter(|(_, t)| t.is_due(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| triggers.remove(k)).collect()
        };
        due.sort_by_key(|t| t.due_at);
        due
    }

    /// Snapshot of the pending trigger for `stream_id`.
    pub fn get(&self, stream_id: &str) -> Option<Trigger> {
        self.lock().get(stream_id).cloned()
    }

    /// Earliest pending due time.
    pub fn next_due(&self) -> Option<Instant> {
        self.lock().values().map(|t| t.due_at).min()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_register_upserts_one_per_stream() {
        let reg = TimerRegistry::new();
        let now = Instant::now();
        assert!(reg.register(Trigger::after("s1", now, Duration::from_secs(10), 1)).is_none());
        let old = reg.register(Trigger::after("s1", now, Duration::from_secs(2), 2));
        assert_eq!(old.map(|t| t.generation), Some(1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("s1").map(|t| t.generation), Some(2));
    }

    #[test]
    fn test_insert_only_rejects_duplicate() {
        let reg = TimerRegistry::new();
        let now = Instant::now();
        reg.insert(Trigger::at("s1", now, 1)).unwrap();
        let err = reg.insert(Trigger::at("s1", now, 2)).unwrap_err();
        assert!(matches!(err, ChatClawError::DuplicateTrigger(id) if id == "s1"));
        assert_eq!(reg.get("s1").map(|t| t.generation), Some(1));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let reg = TimerRegistry::new();
        reg.register(Trigger::at("s1", Instant::now(), 1));
        assert!(reg.cancel("s1"));
        assert!(!reg.cancel("s1"));
        assert!(!reg.cancel("never-registered"));
    }

    #[test]
    fn test_cancel_generation_ignores_newer() {
        let reg = TimerRegistry::new();
        reg.register(Trigger::at("s1", Instant::now(), 2));
        assert!(!reg.cancel_generation("s1", 1));
        assert!(reg.get("s1").is_some());
        assert!(reg.cancel_generation("s1", 2));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_tick_pops_only_due() {
        let reg = TimerRegistry::new();
        let now = Instant::now();
        reg.register(Trigger::after("late", now, Duration::from_secs(30), 1));
        reg.register(Trigger::after("b", now, Duration::from_secs(2), 2));
        reg.register(Trigger::after("a", now, Duration::from_secs(1), 3));

        let due = reg.tick(now + Duration::from_secs(5));
        let ids: Vec<&str> = due.iter().map(|t| t.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(reg.len(), 1);
        assert!(reg.tick(now + Duration::from_secs(5)).is_empty());
        assert_eq!(reg.next_due(), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_concurrent_register_and_tick() {
        let reg = Arc::new(TimerRegistry::new());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let id = format!("s{}", i % 16);
                        reg.register(Trigger::at(&id, now, w * 1000 + i));
                        if i % 3 == 0 {
                            reg.tick(now);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Never more than one trigger per stream key.
        assert!(reg.len() <= 16);
        let drained = reg.tick(now);
        let mut ids: Vec<_> = drained.iter().map(|t| t.stream_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), drained.len());
    }
}
