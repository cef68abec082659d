//! Confirmation store
//!
//! Short-TTL, single-use token registry that suspends a pipeline between the
//! inventory phase and fulfillment. `consume` is a linearizable test-and-set
//! under one mutex: for any (session, token) pair, exactly one caller ever
//! receives the entry. Expired or consumed entries behave as absent.

use crate::domain::PipelineState;
use crate::inventory::ReplacementSuggestion;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ConfirmationEntry {
    pub session_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub pending_state: PipelineState,
    pub replacement_info: Option<ReplacementSuggestion>,
    pub consumed: bool,
    expires_at: Instant,
}

impl ConfirmationEntry {
    fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct ConfirmationStore {
    entries: Mutex<HashMap<String, ConfirmationEntry>>,
    ttl: Duration,
}

impl Default for ConfirmationStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ConfirmationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Check in a pending pipeline state and return its token. Any prior
    /// pending entry for the session is overwritten. The stored snapshot has
    /// the confirmation flag forced off.
    pub fn create(
        &self,
        session_id: &str,
        pending_state: &PipelineState,
        replacement_info: Option<ReplacementSuggestion>,
    ) -> String {
        let token = generate_token();
        let entry = ConfirmationEntry {
            session_id: session_id.to_string(),
            token: token.clone(),
            created_at: Utc::now(),
            pending_state: pending_state.confirmation_snapshot(),
            replacement_info,
            consumed: false,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .lock()
            .expect("confirmation store poisoned")
            .insert(session_id.to_string(), entry);
        tracing::info!(session_id, "confirmation gate opened");
        token
    }

    /// Current unexpired, unconsumed entry for the session.
    pub fn get_pending(&self, session_id: &str) -> Option<ConfirmationEntry> {
        let entries = self.entries.lock().expect("confirmation store poisoned");
        let now = Instant::now();
        entries
            .get(session_id)
            .filter(|e| !e.consumed && !e.expired(now))
            .cloned()
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.get_pending(session_id).is_some()
    }

    /// Atomic test-and-set. Returns the entry iff it exists, the token
    /// matches, it has not expired and has not been consumed; marks it
    /// consumed in the same critical section.
    pub fn consume(&self, session_id: &str, token: &str) -> Option<ConfirmationEntry> {
        let mut entries = self.entries.lock().expect("confirmation store poisoned");
        let now = Instant::now();
        let entry = entries.get_mut(session_id)?;
        if entry.consumed || entry.expired(now) || entry.token != token {
            return None;
        }
        entry.consumed = true;
        tracing::info!(session_id, "confirmation consumed");
        Some(entry.clone())
    }

    /// Remove any pending entry for the session.
    pub fn cancel(&self, session_id: &str) {
        if self
            .entries
            .lock()
            .expect("confirmation store poisoned")
            .remove(session_id)
            .is_some()
        {
            tracing::info!(session_id, "confirmation cancelled");
        }
    }

    /// Evict expired entries. Consumption checks expiry itself, so running
    /// the sweeper more or less often never changes consume semantics.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("confirmation store poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        before - entries.len()
    }

    /// Background eviction loop.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "expired confirmations evicted");
                }
            }
        })
    }
}

/// 256-bit random token, hex-encoded.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(session: &str) -> PipelineState {
        let mut s = PipelineState::new(session);
        s.confirmation_confirmed = true; // must never survive the snapshot
        s
    }

    #[test]
    fn consume_is_single_use() {
        let store = ConfirmationStore::default();
        let token = store.create("s1", &state("s1"), None);

        let first = store.consume("s1", &token);
        assert!(first.is_some());
        assert!(!first.unwrap().pending_state.confirmation_confirmed);

        assert!(store.consume("s1", &token).is_none());
        assert!(!store.is_pending("s1"));
    }

    #[test]
    fn token_mismatch_returns_none_and_keeps_entry() {
        let store = ConfirmationStore::default();
        let token = store.create("s1", &state("s1"), None);

        assert!(store.consume("s1", "bogus").is_none());
        assert!(store.is_pending("s1"));
        assert!(store.consume("s1", &token).is_some());
    }

    #[test]
    fn expired_entries_are_absent() {
        let store = ConfirmationStore::new(Duration::from_millis(10));
        let token = store.create("s1", &state("s1"), None);
        std::thread::sleep(Duration::from_millis(30));

        assert!(!store.is_pending("s1"));
        assert!(store.consume("s1", &token).is_none());
    }

    #[test]
    fn create_overwrites_prior_entry() {
        let store = ConfirmationStore::default();
        let old = store.create("s1", &state("s1"), None);
        let new = store.create("s1", &state("s1"), None);
        assert_ne!(old, new);
        assert!(store.consume("s1", &old).is_none());
        assert!(store.consume("s1", &new).is_some());
    }

    #[test]
    fn concurrent_consume_admits_exactly_one() {
        let store = Arc::new(ConfirmationStore::default());
        let token = store.create("s1", &state("s1"), None);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                store.consume("s1", &token).is_some()
            }));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn sweeper_does_not_touch_live_entries() {
        let store = ConfirmationStore::default();
        let token = store.create("s1", &state("s1"), None);
        assert_eq!(store.sweep(), 0);
        assert!(store.consume("s1", &token).is_some());
    }
}
