use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Active,
    Completed,
    Failed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_FAILED: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("a response is already streaming for conversation {conversation_id}")]
pub struct LeaseHeld {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LeaseKey {
    user_id: String,
    conversation_id: String,
}

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    token: Uuid,
    acquired_at: Instant,
}

/// Grants at most one in-flight stream per (user, conversation).
///
/// A lease that outlives `ttl` is considered abandoned and may be taken over.
#[derive(Debug)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<LeaseKey, LeaseEntry>>,
    ttl: Option<Duration>,
}

impl LeaseRegistry {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            leases: Mutex::new(HashMap::new()),
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
        })
    }

    /// Claims the stream slot for one conversation.
    ///
    /// # Errors
    /// Returns [`LeaseHeld`] while another unexpired lease exists for the key.
    pub fn try_acquire(
        self: &Arc<Self>,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<StreamLease, LeaseHeld> {
        let key = LeaseKey {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        };
        let held = || LeaseHeld {
            conversation_id: conversation_id.to_string(),
        };

        let Ok(mut guard) = self.leases.lock() else {
            warn!(conversation_id, "lease registry poisoned");
            return Err(held());
        };

        if let Some(existing) = guard.get(&key) {
            let expired = self
                .ttl
                .is_some_and(|ttl| existing.acquired_at.elapsed() >= ttl);
            if !expired {
                counter!("slipstream_lease_conflicts_total").increment(1);
                return Err(held());
            }
            counter!("slipstream_lease_takeovers_total").increment(1);
            debug!(user_id, conversation_id, "taking over expired stream lease");
        }

        let entry = LeaseEntry {
            token: Uuid::new_v4(),
            acquired_at: Instant::now(),
        };
        guard.insert(key.clone(), entry);

        Ok(StreamLease {
            registry: Arc::clone(self),
            key,
            token: entry.token,
            acquired_at: entry.acquired_at,
            state: AtomicU8::new(STATE_ACTIVE),
        })
    }

    #[must_use]
    pub fn is_held(&self, user_id: &str, conversation_id: &str) -> bool {
        let key = LeaseKey {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        };
        self.leases
            .lock()
            .is_ok_and(|guard| guard.contains_key(&key))
    }

    fn release(&self, key: &LeaseKey, token: Uuid) {
        if let Ok(mut guard) = self.leases.lock() {
            // A takeover may have replaced this lease; only remove our own.
            if guard.get(key).is_some_and(|entry| entry.token == token) {
                guard.remove(key);
            }
        }
    }
}

/// RAII handle for a stream slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct StreamLease {
    registry: Arc<LeaseRegistry>,
    key: LeaseKey,
    token: Uuid,
    acquired_at: Instant,
    state: AtomicU8,
}

impl StreamLease {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.key.conversation_id
    }

    pub fn mark_completed(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_COMPLETED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn mark_failed(&self) {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_FAILED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    #[must_use]
    pub fn outcome(&self) -> LeaseOutcome {
        match self.state.load(Ordering::SeqCst) {
            STATE_COMPLETED => LeaseOutcome::Completed,
            STATE_FAILED => LeaseOutcome::Failed,
            _ => LeaseOutcome::Active,
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let held_ms = self.acquired_at.elapsed().as_secs_f64() * 1000.0;
        histogram!("slipstream_lease_hold_ms").record(held_ms);
        debug!(
            conversation_id = %self.key.conversation_id,
            outcome = ?self.outcome(),
            held_ms,
            "stream lease released"
        );
        self.registry.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_conflicts_until_release() {
        let registry = LeaseRegistry::new(None);
        let lease = registry.try_acquire("u1", "c1").unwrap();

        let conflict = registry.try_acquire("u1", "c1").unwrap_err();
        assert_eq!(conflict.conversation_id, "c1");

        drop(lease);
        assert!(!registry.is_held("u1", "c1"));
        assert!(registry.try_acquire("u1", "c1").is_ok());
    }

    #[test]
    fn keys_are_scoped_per_user_and_conversation() {
        let registry = LeaseRegistry::new(None);
        let _a = registry.try_acquire("u1", "c1").unwrap();
        let _b = registry.try_acquire("u1", "c2").unwrap();
        let _c = registry.try_acquire("u2", "c1").unwrap();
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let registry = LeaseRegistry::new(Some(Duration::from_millis(10)));
        let stale = registry.try_acquire("u1", "c1").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let fresh = registry.try_acquire("u1", "c1").unwrap();
        // The stale guard must not evict its replacement.
        drop(stale);
        assert!(registry.is_held("u1", "c1"));
        drop(fresh);
        assert!(!registry.is_held("u1", "c1"));
    }

    #[test]
    fn outcome_is_set_once() {
        let registry = LeaseRegistry::new(None);
        let lease = registry.try_acquire("u1", "c1").unwrap();
        assert_eq!(lease.outcome(), LeaseOutcome::Active);
        lease.mark_failed();
        lease.mark_completed();
        assert_eq!(lease.outcome(), LeaseOutcome::Failed);
    }
}
