//! Configuration for the SQL lock store

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Options governing the SQL-backed lock store.
///
/// Table names must remain stable once deployed; renaming them is an
/// operator-driven migration, not something this crate performs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SqlStoreOptions {
    /// Table holding lock records
    #[validate(length(min = 1))]
    pub lock_table: String,

    /// Table holding pending lock requests
    #[validate(length(min = 1))]
    pub pending_table: String,

    /// Deploy the schema (create-if-absent) when the store is constructed
    pub deploy_schema: bool,

    /// When true, a failed schema deploy is logged and ignored instead of
    /// aborting startup
    pub ignore_migration_exceptions: bool,
}

impl Default for SqlStoreOptions {
    fn default() -> Self {
        Self {
            lock_table: "lock_record".to_string(),
            pending_table: "lock_pending_request".to_string(),
            deploy_schema: true,
            ignore_migration_exceptions: false,
        }
    }
}
