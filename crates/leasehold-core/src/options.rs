//! Configuration options for the locking provider and the in-memory store

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// One gibibyte, the default `ProcessMemory` eviction threshold
const GIB: u64 = 1024 * 1024 * 1024;

/// Options governing the locking provider
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LockingOptions {
    /// How often a blocked acquire re-attempts when no release notification
    /// arrives, in milliseconds
    #[validate(range(min = 10))]
    pub request_polling_rate_ms: u64,

    /// Default lease duration granted on acquire, in milliseconds. The holder
    /// must extend before it elapses or the resource becomes stealable.
    #[validate(range(min = 1))]
    pub expiry_offset_ms: u64,

    /// How often the background sweep reclaims stale leases, in milliseconds
    #[validate(range(min = 100))]
    pub cleanup_interval_ms: u64,

    /// Whether releasing an already-stale handle raises `StaleLock` instead
    /// of no-opping. Extend failures always raise regardless of this flag.
    pub throw_on_stale_lock: bool,
}

impl Default for LockingOptions {
    fn default() -> Self {
        Self {
            request_polling_rate_ms: 500,
            expiry_offset_ms: 30000,
            cleanup_interval_ms: 60000,
            throw_on_stale_lock: false,
        }
    }
}

impl LockingOptions {
    pub fn polling_rate(&self) -> Duration {
        Duration::from_millis(self.request_polling_rate_ms)
    }

    pub fn expiry_offset(&self) -> Duration {
        Duration::from_millis(self.expiry_offset_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Eviction policy applied by the in-memory store's cleanup sweep.
///
/// Policies are mutually exclusive and only ever touch *inactive* entries:
/// records that are unheld and have no pending requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Evict inactive entries idle for longer than the configured amount of
    /// milliseconds
    #[default]
    Time,
    /// Cap the number of tracked resources; evict oldest-inactive entries
    /// beyond the cap
    Amount,
    /// Evict every inactive entry on each sweep
    Always,
    /// Evict all inactive entries once process memory exceeds the configured
    /// amount of bytes
    ProcessMemory,
}

impl CleanupPolicy {
    /// Default amount applied when the caller sets a policy without one
    pub fn default_amount(self) -> u64 {
        match self {
            CleanupPolicy::Time => 600000,
            CleanupPolicy::Amount => 1000,
            CleanupPolicy::Always => 0,
            CleanupPolicy::ProcessMemory => GIB,
        }
    }
}

/// Options governing the in-memory lock store
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MemoryStoreOptions {
    /// Which eviction policy the cleanup sweep applies
    pub cleanup_policy: CleanupPolicy,

    /// Policy-specific amount: milliseconds for `Time`, an entry cap for
    /// `Amount`, bytes for `ProcessMemory`, ignored for `Always`. Falls back
    /// to the policy's documented default when unset.
    pub cleanup_amount: Option<u64>,
}

impl MemoryStoreOptions {
    /// The configured amount, or the policy default when none was given
    pub fn effective_cleanup_amount(&self) -> u64 {
        self.cleanup_amount
            .unwrap_or_else(|| self.cleanup_policy.default_amount())
    }
}
