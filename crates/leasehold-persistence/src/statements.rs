//! SQL statement builder for lock operations
//!
//! Turns each lock operation into a parameterized statement for the
//! configured table names. The conditional UPDATEs are the atomicity
//! mechanism: a compare-and-set committed by the database's row locking,
//! with `rows_affected` as the outcome. No statement ever reads state and
//! writes it back in separate round trips.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{
    Alias, ColumnDef, Cond, DynIden, Expr, Index, IntoIden, OnConflict, Query, Table, ValueTuple,
};
use sea_orm::{DbBackend, DeriveIden, Statement};

use leasehold_common::PendingLockRequest;

use crate::options::SqlStoreOptions;

#[derive(DeriveIden)]
enum LockCol {
    Resource,
    Owner,
    ExpiryDate,
    LastLockDate,
}

#[derive(DeriveIden)]
enum PendingCol {
    Resource,
    Requester,
    RequestedAt,
    TimeoutMs,
}

/// Builds every statement the SQL lock store executes
pub struct LockStatements {
    backend: DbBackend,
    lock_table: DynIden,
    pending_table: DynIden,
}

impl LockStatements {
    pub fn new(backend: DbBackend, options: &SqlStoreOptions) -> Self {
        Self {
            backend,
            lock_table: Alias::new(&options.lock_table).into_iden(),
            pending_table: Alias::new(&options.pending_table).into_iden(),
        }
    }

    /// Create-if-absent DDL for the lock record table
    pub fn create_lock_table(&self) -> Statement {
        let stmt = Table::create()
            .table(self.lock_table.clone())
            .if_not_exists()
            .col(
                ColumnDef::new(LockCol::Resource)
                    .string_len(255)
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(LockCol::Owner).string_len(255).null())
            .col(ColumnDef::new(LockCol::ExpiryDate).timestamp_with_time_zone().null())
            .col(
                ColumnDef::new(LockCol::LastLockDate)
                    .timestamp_with_time_zone()
                    .null(),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Create-if-absent DDL for the pending request table
    pub fn create_pending_table(&self) -> Statement {
        let stmt = Table::create()
            .table(self.pending_table.clone())
            .if_not_exists()
            .col(ColumnDef::new(PendingCol::Resource).string_len(255).not_null())
            .col(ColumnDef::new(PendingCol::Requester).string_len(255).not_null())
            .col(
                ColumnDef::new(PendingCol::RequestedAt)
                    .timestamp_with_time_zone()
                    .not_null(),
            )
            .col(ColumnDef::new(PendingCol::TimeoutMs).big_integer().null())
            .primary_key(
                Index::create()
                    .col(PendingCol::Resource)
                    .col(PendingCol::Requester),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Materialize the row for a resource so the acquire UPDATE always has a
    /// target. The conflict action is a no-op write on the key column, which
    /// both MySQL and PostgreSQL accept.
    pub fn ensure_record(&self, resource: &str) -> Statement {
        let stmt = Query::insert()
            .into_table(self.lock_table.clone())
            .columns([
                LockCol::Resource,
                LockCol::Owner,
                LockCol::ExpiryDate,
                LockCol::LastLockDate,
            ])
            .values_panic([
                resource.into(),
                Option::<String>::None.into(),
                Option::<DateTime<Utc>>::None.into(),
                Option::<DateTime<Utc>>::None.into(),
            ])
            .on_conflict(
                OnConflict::column(LockCol::Resource)
                    .update_column(LockCol::Resource)
                    .to_owned(),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    /// The acquire CAS: takes the row only while it is unheld, stale, or
    /// already held by this requester (a re-acquire renews the lease)
    pub fn acquire(
        &self,
        resource: &str,
        requester: &str,
        expiry_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Statement {
        let stmt = Query::update()
            .table(self.lock_table.clone())
            .value(LockCol::Owner, requester)
            .value(LockCol::ExpiryDate, expiry_date)
            .value(LockCol::LastLockDate, now)
            .cond_where(
                Cond::all()
                    .add(Expr::col(LockCol::Resource).eq(resource))
                    .add(
                        Cond::any()
                            .add(Expr::col(LockCol::Owner).is_null())
                            .add(Expr::col(LockCol::Owner).eq(requester))
                            .add(
                                Cond::all()
                                    .add(Expr::col(LockCol::ExpiryDate).is_not_null())
                                    .add(Expr::col(LockCol::ExpiryDate).lt(now)),
                            ),
                    ),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    /// The extend CAS: pushes the expiry only while the requester's hold is
    /// still valid
    pub fn extend(
        &self,
        resource: &str,
        requester: &str,
        expiry_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Statement {
        let stmt = Query::update()
            .table(self.lock_table.clone())
            .value(LockCol::ExpiryDate, expiry_date)
            .cond_where(self.held_by(resource, requester, now))
            .to_owned();
        self.backend.build(&stmt)
    }

    /// The release CAS: clears the hold only while the requester's hold is
    /// still valid
    pub fn release(&self, resource: &str, requester: &str, now: DateTime<Utc>) -> Statement {
        let stmt = Query::update()
            .table(self.lock_table.clone())
            .value(LockCol::Owner, Option::<String>::None)
            .value(LockCol::ExpiryDate, Option::<DateTime<Utc>>::None)
            .cond_where(self.held_by(resource, requester, now))
            .to_owned();
        self.backend.build(&stmt)
    }

    pub fn select_record(&self, resource: &str) -> Statement {
        let stmt = Query::select()
            .columns([
                LockCol::Resource,
                LockCol::Owner,
                LockCol::ExpiryDate,
                LockCol::LastLockDate,
            ])
            .from(self.lock_table.clone())
            .and_where(Expr::col(LockCol::Resource).eq(resource))
            .to_owned();
        self.backend.build(&stmt)
    }

    pub fn count_pending(&self, resource: &str) -> Statement {
        let stmt = Query::select()
            .expr_as(Expr::col(PendingCol::Requester).count(), Alias::new("pending"))
            .from(self.pending_table.clone())
            .and_where(Expr::col(PendingCol::Resource).eq(resource))
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Upsert a waiter entry; re-enqueueing refreshes the request time
    pub fn enqueue_pending(&self, request: &PendingLockRequest) -> Statement {
        let timeout_ms = request.timeout.map(|timeout| timeout.as_millis() as i64);
        let stmt = Query::insert()
            .into_table(self.pending_table.clone())
            .columns([
                PendingCol::Resource,
                PendingCol::Requester,
                PendingCol::RequestedAt,
                PendingCol::TimeoutMs,
            ])
            .values_panic([
                request.resource.as_str().into(),
                request.requester.as_str().into(),
                request.requested_at.into(),
                timeout_ms.into(),
            ])
            .on_conflict(
                OnConflict::columns([PendingCol::Resource, PendingCol::Requester])
                    .update_columns([PendingCol::RequestedAt, PendingCol::TimeoutMs])
                    .to_owned(),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Delete a batch of waiter entries in one statement; the sweep uses this
    /// instead of one round trip per expired entry
    pub fn remove_pending_batch(&self, pairs: &[(String, String)]) -> Statement {
        let stmt = Query::delete()
            .from_table(self.pending_table.clone())
            .cond_where(
                Expr::tuple([
                    Expr::col(PendingCol::Resource).into(),
                    Expr::col(PendingCol::Requester).into(),
                ])
                .in_tuples(pairs.iter().map(|(resource, requester)| {
                    ValueTuple::Two(resource.as_str().into(), requester.as_str().into())
                })),
            )
            .to_owned();
        self.backend.build(&stmt)
    }

    pub fn remove_pending(&self, resource: &str, requester: &str) -> Statement {
        let stmt = Query::delete()
            .from_table(self.pending_table.clone())
            .and_where(Expr::col(PendingCol::Resource).eq(resource))
            .and_where(Expr::col(PendingCol::Requester).eq(requester))
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Resources whose hold has gone stale as of `now`
    pub fn select_stale_resources(&self, now: DateTime<Utc>) -> Statement {
        let stmt = Query::select()
            .column(LockCol::Resource)
            .from(self.lock_table.clone())
            .cond_where(self.stale(now))
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Clear every stale hold, re-checking staleness inside the statement so
    /// a hold renewed since the scan is left alone
    pub fn reclaim_stale(&self, now: DateTime<Utc>) -> Statement {
        let stmt = Query::update()
            .table(self.lock_table.clone())
            .value(LockCol::Owner, Option::<String>::None)
            .value(LockCol::ExpiryDate, Option::<DateTime<Utc>>::None)
            .cond_where(self.stale(now))
            .to_owned();
        self.backend.build(&stmt)
    }

    /// Pending entries that carry a timeout, for sweep-side expiry checks
    pub fn select_bounded_pending(&self) -> Statement {
        let stmt = Query::select()
            .columns([
                PendingCol::Resource,
                PendingCol::Requester,
                PendingCol::RequestedAt,
                PendingCol::TimeoutMs,
            ])
            .from(self.pending_table.clone())
            .and_where(Expr::col(PendingCol::TimeoutMs).is_not_null())
            .to_owned();
        self.backend.build(&stmt)
    }

    pub fn clear_lock_table(&self) -> Statement {
        let stmt = Query::delete().from_table(self.lock_table.clone()).to_owned();
        self.backend.build(&stmt)
    }

    pub fn clear_pending_table(&self) -> Statement {
        let stmt = Query::delete()
            .from_table(self.pending_table.clone())
            .to_owned();
        self.backend.build(&stmt)
    }

    fn held_by(&self, resource: &str, requester: &str, now: DateTime<Utc>) -> Cond {
        Cond::all()
            .add(Expr::col(LockCol::Resource).eq(resource))
            .add(Expr::col(LockCol::Owner).eq(requester))
            .add(
                Cond::any()
                    .add(Expr::col(LockCol::ExpiryDate).is_null())
                    .add(Expr::col(LockCol::ExpiryDate).gte(now)),
            )
    }

    fn stale(&self, now: DateTime<Utc>) -> Cond {
        Cond::all()
            .add(Expr::col(LockCol::Owner).is_not_null())
            .add(Expr::col(LockCol::ExpiryDate).is_not_null())
            .add(Expr::col(LockCol::ExpiryDate).lt(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(backend: DbBackend) -> LockStatements {
        LockStatements::new(backend, &SqlStoreOptions::default())
    }

    #[test]
    fn test_acquire_is_a_single_conditional_update() {
        let now = Utc::now();
        let stmt = statements(DbBackend::MySql).acquire("orders", "node-1", Some(now), now);

        assert!(stmt.sql.starts_with("UPDATE `lock_record` SET"));
        assert!(stmt.sql.contains("`owner` IS NULL"));
        assert!(stmt.sql.contains("`owner` = ?"));
        assert!(stmt.sql.contains("`expiry_date` < ?"));
    }

    #[test]
    fn test_acquire_builds_for_postgres() {
        let now = Utc::now();
        let stmt = statements(DbBackend::Postgres).acquire("orders", "node-1", Some(now), now);

        assert!(stmt.sql.starts_with("UPDATE \"lock_record\" SET"));
        assert!(stmt.sql.contains("\"owner\" IS NULL"));
    }

    #[test]
    fn test_extend_checks_ownership_and_staleness() {
        let now = Utc::now();
        let stmt = statements(DbBackend::MySql).extend("orders", "node-1", Some(now), now);

        assert!(stmt.sql.starts_with("UPDATE `lock_record` SET `expiry_date`"));
        assert!(stmt.sql.contains("`owner` = ?"));
        assert!(stmt.sql.contains("`expiry_date` IS NULL"));
        assert!(stmt.sql.contains("`expiry_date` >= ?"));
    }

    #[test]
    fn test_release_clears_hold_conditionally() {
        let stmt = statements(DbBackend::MySql).release("orders", "node-1", Utc::now());

        assert!(
            stmt.sql
                .starts_with("UPDATE `lock_record` SET `owner` = ?, `expiry_date` = ?")
        );
        assert!(stmt.sql.contains("`resource` = ?"));
        assert!(stmt.sql.contains("`owner` = ?"));
    }

    #[test]
    fn test_ensure_record_upserts_without_clobbering() {
        let stmt = statements(DbBackend::MySql).ensure_record("orders");
        assert!(stmt.sql.starts_with("INSERT INTO `lock_record`"));
        assert!(stmt.sql.contains("ON DUPLICATE KEY UPDATE"));

        let stmt = statements(DbBackend::Postgres).ensure_record("orders");
        assert!(stmt.sql.contains("ON CONFLICT (\"resource\") DO UPDATE"));
    }

    #[test]
    fn test_remove_pending_batch_is_one_statement() {
        let pairs = vec![
            ("orders".to_string(), "node-1".to_string()),
            ("billing".to_string(), "node-2".to_string()),
        ];
        let stmt = statements(DbBackend::MySql).remove_pending_batch(&pairs);

        assert!(stmt.sql.starts_with("DELETE FROM `lock_pending_request`"));
        assert!(stmt.sql.contains("(`resource`, `requester`) IN"));
        assert_eq!(stmt.values.as_ref().unwrap().iter().count(), 4);
    }

    #[test]
    fn test_reclaim_stale_rechecks_expiry_in_statement() {
        let stmt = statements(DbBackend::MySql).reclaim_stale(Utc::now());

        assert!(stmt.sql.contains("`owner` IS NOT NULL"));
        assert!(stmt.sql.contains("`expiry_date` < ?"));
    }

    #[test]
    fn test_configured_table_names_flow_into_sql() {
        let options = SqlStoreOptions {
            lock_table: "app_locks".to_string(),
            pending_table: "app_lock_waiters".to_string(),
            ..Default::default()
        };
        let statements = LockStatements::new(DbBackend::MySql, &options);

        assert!(statements.select_record("r").sql.contains("`app_locks`"));
        assert!(
            statements
                .count_pending("r")
                .sql
                .contains("`app_lock_waiters`")
        );
        assert!(statements.create_lock_table().sql.contains("`app_locks`"));
    }

    #[test]
    fn test_schema_statements_create_if_absent() {
        let lock = statements(DbBackend::MySql).create_lock_table();
        assert!(lock.sql.contains("CREATE TABLE IF NOT EXISTS `lock_record`"));
        assert!(lock.sql.contains("`resource`"));
        assert!(lock.sql.contains("PRIMARY KEY"));

        let pending = statements(DbBackend::MySql).create_pending_table();
        assert!(
            pending
                .sql
                .contains("CREATE TABLE IF NOT EXISTS `lock_pending_request`")
        );
        assert!(pending.sql.contains("`timeout_ms`"));
    }
}
