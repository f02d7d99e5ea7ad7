//! Lock record data model

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lock record as persisted by a lock store.
///
/// At most one non-expired owner exists per resource at any instant; the
/// store's atomic acquire operation enforces this invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The protected resource name (unique key)
    pub resource: String,
    /// Identity of the current holder; `None` = unheld
    pub owner: Option<String>,
    /// When the current hold becomes stale; `None` = held until explicitly
    /// released
    pub expiry_date: Option<DateTime<Utc>>,
    /// When the lock was last successfully acquired
    pub last_lock_date: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Create an unheld record for the given resource
    pub fn unheld(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            owner: None,
            expiry_date: None,
            last_lock_date: None,
        }
    }

    /// Whether the current hold has expired as of `now`.
    ///
    /// A record without an expiry date never goes stale on its own.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry_date, Some(expiry) if expiry < now)
    }

    /// Whether the record is held by anyone as of `now`
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.owner.is_some() && !self.is_stale(now)
    }

    /// Whether `requester` holds the record as of `now`
    pub fn is_held_by(&self, requester: &str, now: DateTime<Utc>) -> bool {
        self.is_held(now) && self.owner.as_deref() == Some(requester)
    }

    /// Mark the record acquired by `requester` with the given lease
    pub fn grant(&mut self, requester: &str, expiry_offset: Option<Duration>, now: DateTime<Utc>) {
        self.owner = Some(requester.to_string());
        self.expiry_date = expiry_offset.map(|offset| now + to_chrono(offset));
        self.last_lock_date = Some(now);
    }

    /// Clear the hold, returning the record to the unheld state
    pub fn clear(&mut self) {
        self.owner = None;
        self.expiry_date = None;
    }
}

/// A queued requester waiting for a held resource to free up.
///
/// Ordered by `requested_at` (FIFO) for wake ordering; grant order is decided
/// by the atomic re-attempt race, not by queue position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLockRequest {
    pub resource: String,
    pub requester: String,
    pub requested_at: DateTime<Utc>,
    /// How long the requester is willing to wait; `None` = until cancelled
    pub timeout: Option<Duration>,
}

impl PendingLockRequest {
    pub fn new(
        resource: impl Into<String>,
        requester: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            resource: resource.into(),
            requester: requester.into(),
            requested_at: Utc::now(),
            timeout,
        }
    }

    /// Whether the request has outlived its own timeout as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.timeout, Some(timeout) if self.requested_at + to_chrono(timeout) < now)
    }
}

/// Read-only projection of a lock's state exposed to callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: String,
    pub owner: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

impl LockInfo {
    pub fn from_record(record: &LockRecord, pending_requests: usize) -> Self {
        Self {
            resource: record.resource.clone(),
            owner: record.owner.clone(),
            expiry_date: record.expiry_date,
            pending_requests,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
