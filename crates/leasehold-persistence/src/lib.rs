//! Leasehold Persistence - SQL-backed lock store
//!
//! This crate provides:
//! - `LockStatements`: a statement builder turning lock operations into
//!   parameterized SQL via `sea_query`, with configurable table names
//! - `SqlLockStore`: the `LockStore` backend executing those statements over
//!   a SeaORM connection (MySQL or PostgreSQL)

pub mod options;
pub mod statements;
pub mod store;

// Re-export sea-orm for convenience
pub use sea_orm;

pub use options::SqlStoreOptions;
pub use statements::LockStatements;
pub use store::SqlLockStore;
