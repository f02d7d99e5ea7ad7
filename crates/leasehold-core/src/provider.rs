//! Locking provider
//!
//! The public-facing coordinator over a `LockStore` backend. Exposes
//! non-blocking and blocking acquisition, raises release notifications so
//! in-process waiters retry promptly instead of only polling, and owns the
//! background sweep that reclaims stale leases.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use leasehold_common::{LockError, LockInfo, LockRecord, LockResult, PendingLockRequest};

use crate::handle::LockHandle;
use crate::options::LockingOptions;
use crate::store::LockStore;

/// State shared between the provider, its handles, and the sweep task
pub(crate) struct ProviderShared {
    pub(crate) store: Arc<dyn LockStore>,
    pub(crate) options: LockingOptions,
    /// Per-resource wake channels fired on every release
    wakeups: DashMap<String, Arc<Notify>>,
    /// Resource -> requester for currently open handles (diagnostics)
    open_handles: DashMap<String, String>,
    pub(crate) shutdown: CancellationToken,
}

impl ProviderShared {
    pub(crate) fn wakeup(&self, resource: &str) -> Arc<Notify> {
        self.wakeups
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every in-process waiter for the resource. Wake order is
    /// best-effort; grant order is whichever waiter wins the atomic
    /// re-attempt race.
    pub(crate) fn notify_released(&self, resource: &str) {
        if let Some(notify) = self.wakeups.get(resource) {
            notify.notify_waiters();
        }
        // Drop the channel once no waiter holds it, so the registry does not
        // grow with every resource name ever contended. A waiter arriving
        // later simply creates a fresh one.
        self.wakeups
            .remove_if(resource, |_, notify| Arc::strong_count(notify) == 1);
    }

    /// Remove a waiter entry without failing the surrounding operation.
    /// The sweep drops orphaned entries anyway.
    pub(crate) async fn drop_pending(&self, resource: &str, requester: &str) {
        if let Err(e) = self.store.remove_pending(resource, requester).await {
            warn!(
                resource = %resource,
                requester = %requester,
                error = %e,
                "failed to remove pending request"
            );
        }
    }

    pub(crate) fn forget_handle(&self, resource: &str, requester: &str) {
        self.open_handles
            .remove_if(resource, |_, holder| holder == requester);
    }
}

/// Coordinator for lock acquisition over an interchangeable store backend.
///
/// Construction spawns the background cleanup sweep, so a tokio runtime must
/// be active. Dropping the provider (or calling [`shutdown`]) stops the sweep
/// and any keep-alive tasks spawned from its handles.
///
/// [`shutdown`]: LockingProvider::shutdown
pub struct LockingProvider {
    shared: Arc<ProviderShared>,
    sweeper: JoinHandle<()>,
}

impl LockingProvider {
    /// Create a provider over `store`, validating `options` and starting the
    /// cleanup sweep
    pub fn new(store: Arc<dyn LockStore>, options: LockingOptions) -> LockResult<Self> {
        options
            .validate()
            .map_err(|e| LockError::Store(anyhow::anyhow!("invalid locking options: {e}")))?;

        let shared = Arc::new(ProviderShared {
            store,
            options,
            wakeups: DashMap::new(),
            open_handles: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        let sweeper = tokio::spawn(run_sweep(shared.clone()));
        info!(
            cleanup_interval_ms = shared.options.cleanup_interval_ms,
            "locking provider started"
        );
        Ok(Self { shared, sweeper })
    }

    /// A process-unique requester identity
    pub fn generate_requester(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    /// Single non-blocking acquisition attempt
    pub async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
    ) -> LockResult<Option<LockHandle>> {
        let record = self
            .shared
            .store
            .try_acquire(resource, requester, Some(self.shared.options.expiry_offset()))
            .await?;
        Ok(record.map(|record| self.new_handle(record)))
    }

    /// Blocking acquisition: retries until the lock is granted, `timeout`
    /// elapses, or `cancel` fires.
    ///
    /// While blocked the caller is registered as a pending request so other
    /// nodes can observe the wait; the entry is removed on every exit path.
    pub async fn acquire(
        &self,
        resource: &str,
        requester: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<LockHandle> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut enqueued = false;

        loop {
            // Register interest in wake-ups before attempting, so a release
            // between the attempt and the await is not missed
            let notify = self.shared.wakeup(resource);
            let notified = notify.notified();

            match self.try_acquire(resource, requester).await {
                Ok(Some(handle)) => {
                    if enqueued {
                        self.shared.drop_pending(resource, requester).await;
                    }
                    return Ok(handle);
                }
                Ok(None) => {}
                Err(e) => {
                    if enqueued {
                        self.shared.drop_pending(resource, requester).await;
                    }
                    return Err(e);
                }
            }

            if !enqueued {
                self.shared
                    .store
                    .enqueue_pending(PendingLockRequest::new(resource, requester, timeout))
                    .await?;
                enqueued = true;
                debug!(resource = %resource, requester = %requester, "waiting for lock");
            }

            let wait_deadline = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.shared.options.polling_rate()) => {}
                _ = cancel.cancelled() => {
                    self.shared.drop_pending(resource, requester).await;
                    return Err(LockError::Cancelled {
                        resource: resource.to_string(),
                        requester: requester.to_string(),
                    });
                }
                _ = wait_deadline => {
                    self.shared.drop_pending(resource, requester).await;
                    let info = self.get_info(resource).await?;
                    return Err(LockError::Timeout {
                        requester: requester.to_string(),
                        // Deadline only fires when a timeout was set
                        timeout: timeout.unwrap_or_default(),
                        info,
                    });
                }
            }
        }
    }

    /// Release a lock by resource and requester, without a handle.
    ///
    /// Intended for recovery paths where the original handle is gone. A
    /// release attempt against a resource validly held by someone else
    /// raises `ResourceAlreadyLocked` identifying the true owner.
    pub async fn release(&self, resource: &str, requester: &str) -> LockResult<()> {
        if self.shared.store.release(resource, requester).await? {
            self.shared.forget_handle(resource, requester);
            self.shared.notify_released(resource);
            return Ok(());
        }

        let now = Utc::now();
        let info = self.shared.store.get(resource).await?;
        if let Some(ref current) = info
            && current.owner.is_some()
            && current.owner.as_deref() != Some(requester)
            && !matches!(current.expiry_date, Some(expiry) if expiry < now)
        {
            return Err(LockError::ResourceAlreadyLocked {
                requester: requester.to_string(),
                info: current.clone(),
            });
        }
        if self.shared.options.throw_on_stale_lock {
            return Err(LockError::StaleLock {
                requester: requester.to_string(),
                resource: resource.to_string(),
                info,
            });
        }
        debug!(resource = %resource, requester = %requester, "ignoring release of stale lock");
        Ok(())
    }

    /// Read-only projection of the resource's state; an untracked resource
    /// reports as unheld with no pending requests
    pub async fn get_info(&self, resource: &str) -> LockResult<LockInfo> {
        Ok(self
            .shared
            .store
            .get(resource)
            .await?
            .unwrap_or_else(|| LockInfo {
                resource: resource.to_string(),
                ..Default::default()
            }))
    }

    /// Number of currently open handles issued by this provider
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.len()
    }

    /// Stop the background sweep and cancel keep-alive tasks
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    fn new_handle(&self, record: LockRecord) -> LockHandle {
        if let Some(ref owner) = record.owner {
            self.shared
                .open_handles
                .insert(record.resource.clone(), owner.clone());
        }
        LockHandle::new(self.shared.clone(), record)
    }
}

impl Drop for LockingProvider {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.sweeper.abort();
    }
}

/// Background cleanup loop: reclaims stale leases through the store's own
/// atomic sweep and wakes waiters for every freed resource
async fn run_sweep(shared: Arc<ProviderShared>) {
    let mut interval = tokio::time::interval(shared.options.cleanup_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {
                match shared.store.sweep(Utc::now()).await {
                    Ok(freed) => {
                        for resource in &freed {
                            shared.notify_released(resource);
                        }
                    }
                    Err(e) => warn!(error = %e, "cleanup sweep failed"),
                }
            }
        }
    }
    debug!("cleanup sweep task stopped");
}
