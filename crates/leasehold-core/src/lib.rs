//! Leasehold Core - Lock provider, handles, and the in-memory store
//!
//! This crate provides:
//! - The `LockStore` capability trait abstracting over storage backends
//! - The in-memory backend with configurable eviction policies
//! - The `LockingProvider` coordinator (blocking acquire, notifications,
//!   background cleanup sweep)
//! - Owned `LockHandle` values with extend/release and auto-renewal

pub mod handle;
pub mod options;
pub mod provider;
pub mod store;

// Re-exports for convenience
pub use handle::LockHandle;
pub use options::{CleanupPolicy, LockingOptions, MemoryStoreOptions};
pub use provider::LockingProvider;
pub use store::{LockStore, memory::MemoryLockStore};

// Re-export the shared model and error types
pub use leasehold_common::{LockError, LockInfo, LockRecord, LockResult, PendingLockRequest};
