//! Run lease
//!
//! Exclusive, expiring claim on a named batch job, kept in the store so
//! that every engine instance sharing the store sees it. Acquisition is a
//! compare-and-swap on the lease record; an expired lease may be taken
//! over, and only the holder can release. A long batch keeps its lease
//! alive through a [`LeaseKeeper`].

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{CompensationStore, RunLease, StoreError, StoreResult, MAX_CAS_RETRIES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    Acquired(RunLease),
    /// Someone else holds an unexpired lease
    Held(RunLease),
}

/// Try to take the lease `name` for `ttl_secs`
///
/// Re-acquiring a lease already held by `holder` renews it.
pub async fn acquire(
    store: &dyn CompensationStore,
    name: &str,
    holder: &str,
    now: u64,
    ttl_secs: u64,
) -> StoreResult<LeaseAcquisition> {
    for _ in 0..MAX_CAS_RETRIES {
        let current = store.get_lease(name).await?;
        if let Some(existing) = &current {
            if existing.holder != holder && !existing.is_expired(now) {
                return Ok(LeaseAcquisition::Held(existing.clone()));
            }
            if existing.holder != holder {
                warn!(
                    "Taking over expired lease {} from {} (expired at {})",
                    name, existing.holder, existing.expires_at
                );
            }
        }

        let lease = RunLease {
            name: name.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.saturating_add(ttl_secs),
        };
        match store.compare_and_swap_lease(name, current.as_ref(), Some(&lease)).await {
            Ok(()) => {
                debug!("Lease {} acquired by {} until {}", name, holder, lease.expires_at);
                return Ok(LeaseAcquisition::Acquired(lease));
            }
            Err(StoreError::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Contention {
        key: format!("lease {}", name),
        attempts: MAX_CAS_RETRIES,
    })
}

/// Release a lease we hold
///
/// Returns `false` if the record no longer matches, i.e. the lease expired
/// and was taken over.
pub async fn release(store: &dyn CompensationStore, lease: &RunLease) -> StoreResult<bool> {
    match store.compare_and_swap_lease(&lease.name, Some(lease), None).await {
        Ok(()) => {
            debug!("Lease {} released by {}", lease.name, lease.holder);
            Ok(true)
        }
        Err(StoreError::Conflict(_)) => {
            warn!("Lease {} was no longer held by {} at release", lease.name, lease.holder);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Extend a lease we hold to `now + ttl_secs`
///
/// `None` if the record no longer matches `lease`, i.e. it was taken over.
pub async fn renew(
    store: &dyn CompensationStore,
    lease: &RunLease,
    now: u64,
    ttl_secs: u64,
) -> StoreResult<Option<RunLease>> {
    let renewed = RunLease {
        expires_at: now.saturating_add(ttl_secs),
        ..lease.clone()
    };
    match store.compare_and_swap_lease(&lease.name, Some(lease), Some(&renewed)).await {
        Ok(()) => {
            debug!("Lease {} renewed by {} until {}", lease.name, lease.holder, renewed.expires_at);
            Ok(Some(renewed))
        }
        Err(StoreError::Conflict(_)) => {
            warn!("Lease {} was taken from {} before renewal", lease.name, lease.holder);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Holds an acquired lease for the duration of a batch
pub struct LeaseKeeper {
    store: Arc<dyn CompensationStore>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    current: Mutex<RunLease>,
}

impl LeaseKeeper {
    pub fn new(store: Arc<dyn CompensationStore>, clock: Arc<dyn Clock>, lease: RunLease, ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            ttl_secs,
            current: Mutex::new(lease),
        }
    }

    /// The lease as last written by this keeper
    pub fn lease(&self) -> RunLease {
        self.current.lock().clone()
    }

    /// Renew once less than half the ttl remains
    ///
    /// Returns `false` when the lease has been lost to another holder.
    pub async fn keep_alive(&self) -> StoreResult<bool> {
        let lease = self.lease();
        let now = self.clock.now();
        if lease.expires_at.saturating_sub(now) > self.ttl_secs / 2 {
            return Ok(true);
        }
        match renew(self.store.as_ref(), &lease, now, self.ttl_secs).await? {
            Some(renewed) => {
                *self.current.lock() = renewed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn release(&self) -> StoreResult<bool> {
        let lease = self.lease();
        release(self.store.as_ref(), &lease).await
    }
}
