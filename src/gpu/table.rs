// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Per-GPU priority/lock state machine.
//!
//! At most one domain holds the lock at a time. A holder is granted a lease;
//! when the lease expires under contention, or the holder is outranked by a
//! higher-priority domain, the holder is expected to pause its worker and
//! release. An uncontended holder has its lease renewed silently.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ContentionError, Domain, GpuId, LeaseConfig};

// Base priorities; elevation lifts ratings above everything on one table so
// that the training switcheroo can kick in on the default training GPU.
const PRIORITY_RATINGS: u8 = 1;
const PRIORITY_SELF_PLAY: u8 = 2;
const PRIORITY_TRAINING: u8 = 3;
const PRIORITY_RATINGS_ELEVATED: u8 = 4;

#[derive(Debug)]
struct TableState {
    active: [bool; 3],
    priority: [u8; 3],
    lock_holder: Option<Domain>,
    lease_expiry: Option<Instant>,
}

impl TableState {
    fn new() -> Self {
        let mut priority = [0u8; 3];
        priority[Domain::Training.index()] = PRIORITY_TRAINING;
        priority[Domain::SelfPlay.index()] = PRIORITY_SELF_PLAY;
        priority[Domain::Ratings.index()] = PRIORITY_RATINGS;
        Self {
            active: [false; 3],
            priority,
            lock_holder: None,
            lease_expiry: None,
        }
    }

    /// Whether `domain` outranks every *other* active domain on this table.
    ///
    /// `domain` itself does not need to be active; the training switcheroo
    /// probes tables the training domain has not been activated on yet.
    fn has_highest_priority(&self, domain: Domain) -> bool {
        let p = self.priority[domain.index()];
        Domain::ALL.iter().all(|&other| {
            if other == domain || !self.active[other.index()] {
                return true;
            }
            let q = self.priority[other.index()];
            p > q || (p == q && domain.tie_break_rank() > other.tie_break_rank())
        })
    }

    /// Whether any other domain is active on this table.
    fn contended(&self, domain: Domain) -> bool {
        Domain::ALL
            .iter()
            .any(|&other| other != domain && self.active[other.index()])
    }
}

/// Priority/lock table for one `(host, device)` pair.
pub struct GpuContentionTable {
    gpu_id: GpuId,
    leases: LeaseConfig,
    state: Mutex<TableState>,
    notify: Notify,
}

impl GpuContentionTable {
    pub fn new(gpu_id: GpuId, leases: LeaseConfig) -> Arc<Self> {
        Arc::new(Self {
            gpu_id,
            leases,
            state: Mutex::new(TableState::new()),
            notify: Notify::new(),
        })
    }

    pub fn gpu_id(&self) -> &GpuId {
        &self.gpu_id
    }

    pub fn activate(&self, domain: Domain) {
        let mut state = self.state.lock();
        if !state.active[domain.index()] {
            tracing::debug!(gpu = %self.gpu_id, %domain, "activating domain");
            state.active[domain.index()] = true;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Deactivate the domain, releasing its lock if held. Wakes all waiters.
    pub fn deactivate(&self, domain: Domain) {
        let mut state = self.state.lock();
        state.active[domain.index()] = false;
        if state.lock_holder == Some(domain) {
            state.lock_holder = None;
            state.lease_expiry = None;
        }
        drop(state);
        tracing::debug!(gpu = %self.gpu_id, %domain, "deactivated domain");
        self.notify.notify_waiters();
    }

    pub fn active(&self, domain: Domain) -> bool {
        self.state.lock().active[domain.index()]
    }

    pub fn has_highest_priority(&self, domain: Domain) -> bool {
        self.state.lock().has_highest_priority(domain)
    }

    pub fn lock_holder(&self) -> Option<Domain> {
        self.state.lock().lock_holder
    }

    /// Block until `domain` is the highest-priority active domain and the
    /// lock is free, then take the lock with a fresh lease.
    ///
    /// Returns false if the domain is deactivated while waiting.
    pub async fn acquire_lock(&self, domain: Domain) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if !state.active[domain.index()] {
                    return false;
                }
                if state.lock_holder.is_none() && state.has_highest_priority(domain) {
                    state.lock_holder = Some(domain);
                    state.lease_expiry =
                        Some(Instant::now() + self.leases.slice_for(domain));
                    tracing::debug!(gpu = %self.gpu_id, %domain, "lock acquired");
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Release the lock. It is an error to release a lock not held.
    pub fn release_lock(&self, domain: Domain) -> Result<(), ContentionError> {
        let mut state = self.state.lock();
        if state.lock_holder != Some(domain) {
            return Err(ContentionError::NotLockHolder {
                domain,
                gpu: self.gpu_id.clone(),
            });
        }
        state.lock_holder = None;
        state.lease_expiry = None;
        drop(state);
        tracing::debug!(gpu = %self.gpu_id, %domain, "lock released");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Block until the holder's lease runs out under contention, or the
    /// holder loses highest priority.
    ///
    /// Returns true when the caller should yield (pause its worker and
    /// release the lock); false when the domain was deactivated, in which
    /// case the lock has already been dropped by [`deactivate`].
    ///
    /// [`deactivate`]: GpuContentionTable::deactivate
    pub async fn wait_for_lock_expiry(&self, domain: Domain) -> bool {
        loop {
            let notified = self.notify.notified();
            let deadline = {
                let state = self.state.lock();
                if !state.active[domain.index()] {
                    return false;
                }
                if !state.has_highest_priority(domain) {
                    return true;
                }
                state.lease_expiry.unwrap_or_else(Instant::now)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let mut state = self.state.lock();
                    if !state.active[domain.index()] {
                        return false;
                    }
                    if !state.has_highest_priority(domain) || state.contended(domain) {
                        return true;
                    }
                    // Sole contender: renew silently instead of churning the
                    // pause/unpause handshake.
                    state.lease_expiry =
                        Some(Instant::now() + self.leases.slice_for(domain));
                }
                _ = notified => {}
            }
        }
    }

    /// Lift ratings priority above every other domain on this table.
    /// Idempotent. The at-most-one-table-elevated invariant is enforced by
    /// the contention manager.
    pub fn prioritize_ratings(&self) {
        let mut state = self.state.lock();
        state.priority[Domain::Ratings.index()] = PRIORITY_RATINGS_ELEVATED;
        drop(state);
        tracing::debug!(gpu = %self.gpu_id, "ratings priority elevated");
        self.notify.notify_waiters();
    }

    pub fn deprioritize_ratings(&self) {
        let mut state = self.state.lock();
        state.priority[Domain::Ratings.index()] = PRIORITY_RATINGS;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn ratings_prioritized(&self) -> bool {
        self.state.lock().priority[Domain::Ratings.index()] == PRIORITY_RATINGS_ELEVATED
    }
}

impl std::fmt::Debug for GpuContentionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GpuContentionTable")
            .field("gpu_id", &self.gpu_id)
            .field("active", &state.active)
            .field("priority", &state.priority)
            .field("lock_holder", &state.lock_holder)
            .finish()
    }
}
