//! Process-wide registry of cache keys that are currently being populated.
//!
//! The first miss for a key becomes the leader and owns a [`Completion`];
//! later misses for the same key get a receiver on the leader's outcome
//! instead of starting another fetch.  The entry is removed only after the
//! artifact has been published (or the attempt failed), so a key is never
//! both absent from the registry and half-written on disk in atomic mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::key::CacheKey;

/// Final result of a populate attempt, as seen by waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// The artifact was written to the cache.
    Stored { bytes: u64 },
    /// Another writer published the artifact first; nothing was fetched.
    AlreadyCached,
    /// The attempt ended without publishing.
    Failed { kind: &'static str, message: String },
}

impl PopulateOutcome {
    #[cfg(test)]
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. } | Self::AlreadyCached)
    }
}

pub type OutcomeReceiver = watch::Receiver<Option<PopulateOutcome>>;

type Entries = HashMap<CacheKey, watch::Sender<Option<PopulateOutcome>>>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    entries: Arc<Mutex<Entries>>,
}

/// Result of [`InFlight::claim`].
#[derive(Debug)]
pub enum Claim {
    /// No populate was running; the caller must run one and finish it.
    Leader(Completion),
    /// A populate is already running; the receiver yields its outcome.
    Follower(OutcomeReceiver),
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // A panic while holding the lock cannot leave the map inconsistent:
        // every critical section is a single insert, remove or lookup.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` as in flight, or join the populate already running.
    pub fn claim(&self, key: &CacheKey) -> Claim {
        let mut entries = self.lock();
        if let Some(tx) = entries.get(key) {
            return Claim::Follower(tx.subscribe());
        }
        let (tx, _rx) = watch::channel(None);
        entries.insert(key.clone(), tx.clone());
        Claim::Leader(Completion {
            key: Some(key.clone()),
            registry: Some(self.clone()),
            tx,
        })
    }

    /// A completion that is not registered, for runs without single-flight.
    pub fn untracked() -> Completion {
        let (tx, _rx) = watch::channel(None);
        Completion {
            key: None,
            registry: None,
            tx,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &CacheKey) {
        self.lock().remove(key);
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Leader-side handle for an in-flight populate.
///
/// Dropping it without calling [`finish`](Self::finish) (panic, task abort)
/// still removes the registry entry; waiters then observe a closed channel.
#[derive(Debug)]
pub struct Completion {
    key: Option<CacheKey>,
    registry: Option<InFlight>,
    tx: watch::Sender<Option<PopulateOutcome>>,
}

impl Completion {
    pub fn subscribe(&self) -> OutcomeReceiver {
        self.tx.subscribe()
    }

    /// Deregister the key, then publish `outcome` to every waiter.
    pub fn finish(mut self, outcome: PopulateOutcome) {
        self.release();
        self.tx.send_replace(Some(outcome));
    }

    fn release(&mut self) {
        if let (Some(key), Some(registry)) = (self.key.take(), self.registry.as_ref()) {
            registry.release(&key);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wait for the outcome published on `rx`.
#[cfg(test)]
pub async fn wait_for_outcome(mut rx: OutcomeReceiver) -> PopulateOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(PopulateOutcome::Failed {
            kind: "abandoned",
            message: "populate ended without an outcome".into(),
        }),
        Err(_) => PopulateOutcome::Failed {
            kind: "abandoned",
            message: "populate ended without an outcome".into(),
        },
    }
}
