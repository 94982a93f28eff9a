//! Lease-style resource locks.
//!
//! Locks are advisory rows in the store keyed by an arbitrary resource
//! string ("port:8080", "file:migrations/", ...). Acquisition is
//! non-blocking: a caller either gets the lease or is told who holds it
//! and until when. Every lease expires; a holder that wants to keep a
//! resource re-acquires before the TTL runs out. Expired leases are
//! reclaimed by the next contender, with a warning, since reclaim implies
//! the previous holder died without releasing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::Store;
use crate::{mlog, mlog_debug, mlog_warn, Error, Result};

/// A held (or observed) lease on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(resource_key: &str, holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            resource_key: resource_key.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        }
    }

    /// A lease past its expiry is stale and may be reclaimed by anyone.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// Outcome of a non-blocking acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired(Lock),
    Busy {
        holder_id: String,
        expires_at: DateTime<Utc>,
    },
}

pub struct LockManager {
    store: Arc<Store>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Try to take the lease on `resource_key` for `holder_id`.
    ///
    /// Never blocks. The same holder re-acquiring an unexpired lease
    /// renews it (fresh TTL). A stale foreign lease is reclaimed, logged
    /// at warn, and the acquire proceeds.
    pub fn acquire(&self, resource_key: &str, holder_id: &str) -> Result<Acquire> {
        let now = Utc::now();
        if let Some(existing) = self.store.get_lock(resource_key)? {
            if existing.holder_id == holder_id && !existing.is_stale(now) {
                // Renewal: replace our own row with a fresh expiry.
                self.store.delete_lock(resource_key, holder_id)?;
            } else if existing.is_stale(now) {
                if self.store.delete_stale_lock(resource_key, now)? {
                    mlog_warn!(
                        "Reclaimed stale lock {} from {} (expired {})",
                        resource_key,
                        existing.holder_id,
                        existing.expires_at.to_rfc3339()
                    );
                }
            } else {
                mlog_debug!(
                    "Lock {} busy: held by {} until {}",
                    resource_key,
                    existing.holder_id,
                    existing.expires_at.to_rfc3339()
                );
                return Ok(Acquire::Busy {
                    holder_id: existing.holder_id,
                    expires_at: existing.expires_at,
                });
            }
        }

        let lock = Lock::new(resource_key, holder_id, self.ttl);
        if self.store.insert_lock(&lock)? {
            mlog!(
                "Lock acquired: {} by {} until {}",
                resource_key,
                holder_id,
                lock.expires_at.to_rfc3339()
            );
            return Ok(Acquire::Acquired(lock));
        }

        // Someone slipped in between our check and the insert.
        match self.store.get_lock(resource_key)? {
            Some(raced) => Ok(Acquire::Busy {
                holder_id: raced.holder_id,
                expires_at: raced.expires_at,
            }),
            // Raced row already released again; report busy with ourselves
            // absent rather than looping.
            None => Ok(Acquire::Busy {
                holder_id: String::new(),
                expires_at: now,
            }),
        }
    }

    /// Acquire or fail with `Error::LockBusy`. For call sites that treat
    /// contention as an error rather than a branch.
    pub fn acquire_or_err(&self, resource_key: &str, holder_id: &str) -> Result<Lock> {
        match self.acquire(resource_key, holder_id)? {
            Acquire::Acquired(lock) => Ok(lock),
            Acquire::Busy {
                holder_id,
                expires_at,
            } => Err(Error::LockBusy {
                resource_key: resource_key.to_string(),
                holder_id,
                expires_at,
            }),
        }
    }

    /// Release a lease held by `holder_id`. Releasing a lease that was
    /// already reclaimed (or never held) is a no-op; the caller's cleanup
    /// path should not fail over it.
    pub fn release(&self, resource_key: &str, holder_id: &str) -> Result<()> {
        if self.store.delete_lock(resource_key, holder_id)? {
            mlog_debug!("Lock released: {} by {}", resource_key, holder_id);
        } else {
            mlog_warn!(
                "Release of {} by {} matched no lease (expired or reclaimed)",
                resource_key,
                holder_id
            );
        }
        Ok(())
    }

    /// Force-release a lease regardless of holder. Operator command only.
    pub fn force_release(&self, resource_key: &str) -> Result<bool> {
        match self.store.get_lock(resource_key)? {
            Some(lock) => {
                self.store.delete_lock(resource_key, &lock.holder_id)?;
                mlog_warn!(
                    "Force-released lock {} held by {}",
                    resource_key,
                    lock.holder_id
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list(&self) -> Result<Vec<Lock>> {
        self.store.list_locks()
    }
}
