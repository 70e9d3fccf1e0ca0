//! The Mutex Manager: named, host-wide logical resources that at
//! most one plugin phase may hold at a time, with deadlock-free whole-set
//! acquisition in a fixed global order.
//!
//! A single state map guarded by a mutex, with a `Notify` standing in for
//! a condition variable: acquirers that cannot claim their whole name set
//! atomically wait for a broadcast on release rather than polling.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{EngineError, Result};

#[derive(Debug)]
struct State {
    held: HashSet<String>,
}

/// Central manager, shared by handle across the orchestrator.
#[derive(Debug, Clone)]
pub struct MutexManager {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

/// RAII handle on a held set. Dropping without calling `release` leaks the
/// reservation (by design — callers must release explicitly so the phase
/// machine can log the release point); `phase_machine` always matches every
/// `acquire` with a `release` on phase exit.
#[derive(Debug)]
#[must_use = "a held mutex set must be released"]
pub struct Reservation {
    manager: MutexManager,
    names: BTreeSet<String>,
    released: bool,
}

impl Reservation {
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub async fn release(mut self) {
        self.manager.release_inner(&self.names).await;
        self.released = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                "mutex reservation for {:?} dropped without explicit release",
                self.names
            );
        }
    }
}

impl MutexManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                held: HashSet::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Blocks until every name in `names` is free, then marks the whole set
    /// held atomically, in sorted order.
    pub async fn acquire(&self, names: BTreeSet<String>) -> Reservation {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if names.iter().all(|n| !state.held.contains(n)) {
                    for n in &names {
                        state.held.insert(n.clone());
                    }
                    debug!("acquired mutex set {:?}", names);
                    return Reservation {
                        manager: self.clone(),
                        names,
                        released: false,
                    };
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant with a deadline; fails with
    /// `EngineError::MutexTimeout` on expiry.
    pub async fn try_acquire(
        &self,
        names: BTreeSet<String>,
        deadline: Duration,
    ) -> Result<Reservation> {
        let start = Instant::now();
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if names.iter().all(|n| !state.held.contains(n)) {
                    for n in &names {
                        state.held.insert(n.clone());
                    }
                    return Ok(Reservation {
                        manager: self.clone(),
                        names,
                        released: false,
                    });
                }
            }
            let remaining = deadline.checked_sub(start.elapsed());
            match remaining {
                Some(remaining) if remaining > Duration::ZERO => {
                    let _ = tokio::time::timeout(remaining, notified).await;
                }
                _ => return Err(EngineError::MutexTimeout(names.into_iter().collect())),
            }
        }
    }

    /// True if none of `names` are currently held — used by the scheduler as
    /// an advisory signal for the `dependencies` heuristic, not
    /// a correctness condition.
    pub async fn all_free(&self, names: &BTreeSet<String>) -> bool {
        let state = self.state.lock().await;
        names.iter().all(|n| !state.held.contains(n))
    }

    async fn release_inner(&self, names: &BTreeSet<String>) {
        {
            let mut state = self.state.lock().await;
            for n in names {
                state.held.remove(n);
            }
        }
        debug!("released mutex set {:?}", names);
        self.notify.notify_waiters();
    }
}

impl Default for MutexManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn disjoint_sets_acquire_concurrently() {
        let mgr = MutexManager::new();
        let a = mgr.acquire(set(&["apt"])).await;
        let b = mgr.acquire(set(&["dpkg"])).await;
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn overlapping_sets_serialize() {
        let mgr = MutexManager::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mgr2 = mgr.clone();
        let order2 = order.clone();
        let first = tokio::spawn(async move {
            let r = mgr2.acquire(set(&["apt"])).await;
            order2.lock().await.push("first-acquired");
            tokio::time::sleep(Duration::from_millis(50)).await;
            r.release().await;
            order2.lock().await.push("first-released");
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let mgr3 = mgr.clone();
        let order3 = order.clone();
        let second = tokio::spawn(async move {
            let r = mgr3.acquire(set(&["apt"])).await;
            order3.lock().await.push("second-acquired");
            r.release().await;
        });

        first.await.unwrap();
        second.await.unwrap();

        let log = order.lock().await.clone();
        assert_eq!(
            log,
            vec!["first-acquired", "first-released", "second-acquired"]
        );
    }

    #[tokio::test]
    async fn try_acquire_times_out_on_contention() {
        let mgr = MutexManager::new();
        let held = mgr.acquire(set(&["network"])).await;
        let err = mgr
            .try_acquire(set(&["network"]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MutexTimeout(_)));
        held.release().await;
    }
}
