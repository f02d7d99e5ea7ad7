//! Lock store abstraction
//!
//! A single capability trait covers every storage backend; implementations
//! are selected at construction time. The in-memory backend lives in this
//! crate, the SQL backend in `leasehold-persistence`.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leasehold_common::{LockInfo, LockRecord, LockResult, PendingLockRequest};

/// Transactional lock operations over a shared record store.
///
/// Every mutating operation is atomic with respect to concurrent callers:
/// two requesters must never both observe "unheld" for the same resource.
/// Violating that is a correctness bug, not a recoverable error.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically acquire `resource` for `requester` if it is unheld or the
    /// current hold has gone stale. Returns the new record on success, `None`
    /// when the resource is validly held by someone else.
    ///
    /// `expiry_offset = None` grants a lease that only an explicit release
    /// frees; the sweep never reclaims it.
    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<Option<LockRecord>>;

    /// Push the expiry forward. Succeeds only while `requester` still holds
    /// the resource and the hold is not stale.
    async fn extend(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<bool>;

    /// Clear the hold. Succeeds only while `requester` still holds the
    /// resource.
    async fn release(&self, resource: &str, requester: &str) -> LockResult<bool>;

    /// Read-only projection of the resource's current state
    async fn get(&self, resource: &str) -> LockResult<Option<LockInfo>>;

    /// Register a waiter for a held resource. Enqueueing the same
    /// resource/requester pair again refreshes the existing entry.
    async fn enqueue_pending(&self, request: PendingLockRequest) -> LockResult<()>;

    /// Drop a waiter entry, if present. Called on success, timeout, and
    /// cancellation so entries never linger.
    async fn remove_pending(&self, resource: &str, requester: &str) -> LockResult<()>;

    /// Reclaim stale holds and drop timed-out pending requests, re-checking
    /// staleness under the same atomic primitives as the foreground path.
    /// Returns the resources freed by this pass so waiters can be woken.
    async fn sweep(&self, now: DateTime<Utc>) -> LockResult<Vec<String>>;

    /// Administrative wipe of all records and pending requests. Intended for
    /// test harnesses only.
    async fn clear_all(&self) -> LockResult<()>;
}
