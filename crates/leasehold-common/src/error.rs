//! Error types surfaced by the locking service
//!
//! The three domain variants (`Timeout`, `StaleLock`, `ResourceAlreadyLocked`)
//! are the contract that crosses the provider boundary; callers are expected
//! to catch `Timeout` for backoff/giveup logic and `StaleLock` to abort
//! critical sections safely.

use std::time::Duration;

use crate::model::LockInfo;

/// Convenience alias for lock operation results
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by lock stores and the locking provider
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// A blocking acquire could not obtain the resource within the requested
    /// timeout
    #[error("requester '{requester}' timed out after {timeout:?} waiting for resource '{}' (held by {:?})", info.resource, info.owner)]
    Timeout {
        requester: String,
        timeout: Duration,
        info: LockInfo,
    },

    /// An operation was attempted on a lock no longer held by the caller,
    /// because it expired or was reassigned. Callers must treat this as "you
    /// no longer hold this resource" and abort their critical section.
    #[error("requester '{requester}' no longer holds resource '{resource}' (current owner: {:?})", info.as_ref().and_then(|i| i.owner.as_deref()))]
    StaleLock {
        requester: String,
        resource: String,
        info: Option<LockInfo>,
    },

    /// An operation was attempted by a requester who never held the resource
    #[error("resource '{}' is locked by {:?}, not by requester '{requester}'", info.resource, info.owner)]
    ResourceAlreadyLocked { requester: String, info: LockInfo },

    /// A blocking acquire was cancelled before it could complete.
    /// Distinguishable from `Timeout`.
    #[error("requester '{requester}' cancelled its wait for resource '{resource}'")]
    Cancelled { resource: String, requester: String },

    /// Opaque backend failure (connection loss, deadlock, schema deploy)
    #[error("lock store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl LockError {
    /// Whether this error indicates the caller no longer holds the resource
    pub fn is_stale(&self) -> bool {
        matches!(self, LockError::StaleLock { .. })
    }

    /// The lock info carried by the error, if any
    pub fn lock_info(&self) -> Option<&LockInfo> {
        match self {
            LockError::Timeout { info, .. } | LockError::ResourceAlreadyLocked { info, .. } => {
                Some(info)
            }
            LockError::StaleLock { info, .. } => info.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let info = LockInfo {
            resource: "orders".to_string(),
            owner: Some("node-2".to_string()),
            expiry_date: None,
            pending_requests: 1,
        };

        let timeout = LockError::Timeout {
            requester: "node-1".to_string(),
            timeout: Duration::from_millis(100),
            info: info.clone(),
        };
        assert!(timeout.to_string().contains("node-1"));
        assert!(timeout.to_string().contains("orders"));

        let stale = LockError::StaleLock {
            requester: "node-1".to_string(),
            resource: "orders".to_string(),
            info: Some(info.clone()),
        };
        assert!(stale.is_stale());
        assert_eq!(stale.lock_info(), Some(&info));

        let cancelled = LockError::Cancelled {
            resource: "orders".to_string(),
            requester: "node-1".to_string(),
        };
        assert!(!cancelled.is_stale());
        assert!(cancelled.lock_info().is_none());
    }
}
