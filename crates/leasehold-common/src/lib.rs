//! Leasehold Common - Shared types for the Leasehold locking service
//!
//! This crate provides the foundational types used across all Leasehold
//! components:
//! - Lock record, pending request, and lock info model types
//! - Error taxonomy surfaced to callers

pub mod error;
pub mod model;

// Re-exports for convenience
pub use error::{LockError, LockResult};
pub use model::{LockInfo, LockRecord, PendingLockRequest};
