//! SQL-backed lock store
//!
//! Wraps a SeaORM `DatabaseConnection` and implements `LockStore` by
//! executing the statements built by [`LockStatements`]. Atomicity rests on
//! the database: every acquire/extend/release is a single conditional UPDATE
//! whose `rows_affected` decides the outcome.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, FromQueryResult, TransactionTrait};
use tracing::{debug, info, warn};
use validator::Validate;

use leasehold_common::{LockError, LockInfo, LockRecord, LockResult, PendingLockRequest};
use leasehold_core::store::LockStore;

use crate::options::SqlStoreOptions;
use crate::statements::LockStatements;

/// Bounded retry for idempotent reads only. Writes that fail transiently are
/// surfaced: silently retrying an ambiguous write could double-acquire.
const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, FromQueryResult)]
struct LockRow {
    resource: String,
    owner: Option<String>,
    expiry_date: Option<DateTime<Utc>>,
    last_lock_date: Option<DateTime<Utc>>,
}

impl From<LockRow> for LockRecord {
    fn from(row: LockRow) -> Self {
        LockRecord {
            resource: row.resource,
            owner: row.owner,
            expiry_date: row.expiry_date,
            last_lock_date: row.last_lock_date,
        }
    }
}

#[derive(Debug, FromQueryResult)]
struct ResourceRow {
    resource: String,
}

#[derive(Debug, FromQueryResult)]
struct PendingRow {
    resource: String,
    requester: String,
    requested_at: DateTime<Utc>,
    timeout_ms: Option<i64>,
}

impl PendingRow {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.timeout_ms,
            Some(timeout) if self.requested_at + chrono::Duration::milliseconds(timeout) < now
        )
    }
}

/// Lock store over a shared SQL database (MySQL or PostgreSQL)
pub struct SqlLockStore {
    db: DatabaseConnection,
    statements: LockStatements,
}

impl SqlLockStore {
    /// Create the store, validating options and deploying the schema unless
    /// configured otherwise
    pub async fn new(db: DatabaseConnection, options: SqlStoreOptions) -> LockResult<Self> {
        options
            .validate()
            .map_err(|e| LockError::Store(anyhow::anyhow!("invalid sql store options: {e}")))?;

        let statements = LockStatements::new(db.get_database_backend(), &options);
        let store = Self { db, statements };

        if options.deploy_schema
            && let Err(e) = store.deploy_schema().await
        {
            if !options.ignore_migration_exceptions {
                return Err(e);
            }
            warn!(error = %e, "lock schema deploy failed, continuing per configuration");
        }
        Ok(store)
    }

    /// Get a reference to the underlying database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn deploy_schema(&self) -> LockResult<()> {
        self.db
            .execute(self.statements.create_lock_table())
            .await
            .map_err(db_err)?;
        self.db
            .execute(self.statements.create_pending_table())
            .await
            .map_err(db_err)?;
        info!("lock schema deployed");
        Ok(())
    }

    /// Administrative wipe scoped to an explicit transaction; commit and
    /// rollback stay with the caller
    pub async fn clear_all_in<C: ConnectionTrait>(&self, conn: &C) -> LockResult<()> {
        conn.execute(self.statements.clear_pending_table())
            .await
            .map_err(db_err)?;
        conn.execute(self.statements.clear_lock_table())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fetch_record<C: ConnectionTrait>(
        &self,
        conn: &C,
        resource: &str,
    ) -> LockResult<Option<LockRecord>> {
        let row = LockRow::find_by_statement(self.statements.select_record(resource))
            .one(conn)
            .await
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn read_info(&self, resource: &str) -> LockResult<Option<LockInfo>> {
        let Some(record) = self.fetch_record(&self.db, resource).await? else {
            return Ok(None);
        };
        let pending = self
            .db
            .query_one(self.statements.count_pending(resource))
            .await
            .map_err(db_err)?
            .map(|row| row.try_get::<i64>("", "pending"))
            .transpose()
            .map_err(db_err)?
            .unwrap_or(0);
        Ok(Some(LockInfo::from_record(&record, pending.max(0) as usize)))
    }
}

#[async_trait]
impl LockStore for SqlLockStore {
    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<Option<LockRecord>> {
        let now = Utc::now();
        let expiry_date = expiry_offset.map(|offset| now + to_chrono(offset));

        let txn = self.db.begin().await.map_err(db_err)?;
        txn.execute(self.statements.ensure_record(resource))
            .await
            .map_err(db_err)?;
        let taken = txn
            .execute(self.statements.acquire(resource, requester, expiry_date, now))
            .await
            .map_err(db_err)?
            .rows_affected()
            == 1;
        let record = if taken {
            let record = self.fetch_record(&txn, resource).await?;
            debug!(resource = %resource, requester = %requester, "lock acquired");
            record
        } else {
            None
        };
        txn.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn extend(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<bool> {
        let now = Utc::now();
        let expiry_date = expiry_offset.map(|offset| now + to_chrono(offset));
        let extended = self
            .db
            .execute(self.statements.extend(resource, requester, expiry_date, now))
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(extended == 1)
    }

    async fn release(&self, resource: &str, requester: &str) -> LockResult<bool> {
        let released = self
            .db
            .execute(self.statements.release(resource, requester, Utc::now()))
            .await
            .map_err(db_err)?
            .rows_affected();
        if released == 1 {
            debug!(resource = %resource, requester = %requester, "lock released");
        }
        Ok(released == 1)
    }

    async fn get(&self, resource: &str) -> LockResult<Option<LockInfo>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.read_info(resource).await {
                Ok(info) => return Ok(info),
                Err(e) if attempt < READ_RETRY_ATTEMPTS => {
                    warn!(
                        resource = %resource,
                        attempt,
                        error = %e,
                        "lock info read failed, retrying"
                    );
                    tokio::time::sleep(READ_RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn enqueue_pending(&self, request: PendingLockRequest) -> LockResult<()> {
        self.db
            .execute(self.statements.enqueue_pending(&request))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_pending(&self, resource: &str, requester: &str) -> LockResult<()> {
        self.db
            .execute(self.statements.remove_pending(resource, requester))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> LockResult<Vec<String>> {
        let stale = ResourceRow::find_by_statement(self.statements.select_stale_resources(now))
            .all(&self.db)
            .await
            .map_err(db_err)?;
        let freed: Vec<String> = stale.into_iter().map(|row| row.resource).collect();

        // The reclaim statement re-checks staleness, so a hold renewed after
        // the select above stays untouched; the worst case is a spurious
        // wake-up for its waiters
        self.db
            .execute(self.statements.reclaim_stale(now))
            .await
            .map_err(db_err)?;

        let bounded = PendingRow::find_by_statement(self.statements.select_bounded_pending())
            .all(&self.db)
            .await
            .map_err(db_err)?;
        let expired: Vec<(String, String)> = bounded
            .into_iter()
            .filter(|row| row.is_expired(now))
            .map(|row| (row.resource, row.requester))
            .collect();
        if !expired.is_empty() {
            self.db
                .execute(self.statements.remove_pending_batch(&expired))
                .await
                .map_err(db_err)?;
        }

        if !freed.is_empty() {
            debug!(reclaimed = freed.len(), "sql store sweep completed");
        }
        Ok(freed)
    }

    async fn clear_all(&self) -> LockResult<()> {
        let txn = self.db.begin().await.map_err(db_err)?;
        self.clear_all_in(&txn).await?;
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: DbErr) -> LockError {
    LockError::Store(e.into())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
