//! Owned lock handles
//!
//! A [`LockHandle`] represents a currently-held lease. It references its
//! backing record only by resource name and requester identity, never by a
//! pointer into the store, so staleness is always re-checked against the
//! store on extend and release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leasehold_common::{LockError, LockRecord, LockResult};

use crate::provider::ProviderShared;

struct HandleInner {
    provider: Arc<ProviderShared>,
    resource: String,
    requester: String,
    /// Cached expiry, advisory only; the store is the source of truth
    expiry_date: Mutex<Option<DateTime<Utc>>>,
    released: AtomicBool,
    stale: AtomicBool,
}

impl HandleInner {
    async fn extend(&self) -> LockResult<Option<DateTime<Utc>>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LockError::StaleLock {
                requester: self.requester.clone(),
                resource: self.resource.clone(),
                info: None,
            });
        }

        let offset = self.provider.options.expiry_offset();
        let extended = self
            .provider
            .store
            .extend(&self.resource, &self.requester, Some(offset))
            .await?;

        if extended {
            let expiry = Utc::now()
                + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::MAX);
            *self.expiry_date.lock() = Some(expiry);
            return Ok(Some(expiry));
        }

        // The lease expired or was reassigned. This always raises, whatever
        // throw_on_stale_lock says: the caller must abort its critical
        // section, not keep running it.
        self.stale.store(true, Ordering::SeqCst);
        let info = self.provider.store.get(&self.resource).await.ok().flatten();
        Err(LockError::StaleLock {
            requester: self.requester.clone(),
            resource: self.resource.clone(),
            info,
        })
    }

    /// Release the lease. `explicit` distinguishes a caller-invoked release
    /// from disposal on drop; only an explicit release can raise.
    async fn release(&self, explicit: bool) -> LockResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            // Double release is an idempotent no-op
            return Ok(());
        }

        let released = self
            .provider
            .store
            .release(&self.resource, &self.requester)
            .await;
        self.provider.forget_handle(&self.resource, &self.requester);

        match released {
            Ok(true) => {
                self.provider.notify_released(&self.resource);
                Ok(())
            }
            Ok(false) => {
                self.stale.store(true, Ordering::SeqCst);
                if !explicit || !self.provider.options.throw_on_stale_lock {
                    debug!(
                        resource = %self.resource,
                        requester = %self.requester,
                        "ignoring release of stale lock handle"
                    );
                    return Ok(());
                }
                let info = self.provider.store.get(&self.resource).await.ok().flatten();
                Err(LockError::StaleLock {
                    requester: self.requester.clone(),
                    resource: self.resource.clone(),
                    info,
                })
            }
            // The write failed ambiguously; surface it rather than retry.
            // The lease will lapse at its expiry either way.
            Err(e) => Err(e),
        }
    }
}

/// An owned, disposable lease over a resource.
///
/// Dropping the handle releases the lease on a best-effort background task;
/// call [`release`] for a checked release. After the lease goes stale every
/// further use fails fast with [`LockError::StaleLock`].
///
/// [`release`]: LockHandle::release
pub struct LockHandle {
    inner: Arc<HandleInner>,
    keep_alive: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LockHandle {
    pub(crate) fn new(provider: Arc<ProviderShared>, record: LockRecord) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                provider,
                resource: record.resource,
                requester: record.owner.unwrap_or_default(),
                expiry_date: Mutex::new(record.expiry_date),
                released: AtomicBool::new(false),
                stale: AtomicBool::new(false),
            }),
            keep_alive: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    pub fn requester(&self) -> &str {
        &self.inner.requester
    }

    /// The cached expiry as of the last acquire/extend
    pub fn expiry_date(&self) -> Option<DateTime<Utc>> {
        *self.inner.expiry_date.lock()
    }

    /// Whether the lease is known to have lapsed: detected stale by a failed
    /// operation, or past its cached expiry
    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::SeqCst)
            || matches!(*self.inner.expiry_date.lock(), Some(expiry) if expiry < Utc::now())
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Push the expiry forward by the provider's configured lease duration.
    ///
    /// Raises [`LockError::StaleLock`] when the lease is no longer held; the
    /// caller must abort its critical section.
    pub async fn extend(&self) -> LockResult<Option<DateTime<Utc>>> {
        self.inner.extend().await
    }

    /// Explicitly release the lease.
    ///
    /// Idempotent: releasing twice is a no-op. Releasing an already-stale
    /// handle no-ops unless `throw_on_stale_lock` is set. A successful
    /// release never disturbs a newer owner's lease.
    pub async fn release(&self) -> LockResult<()> {
        self.stop_keep_alive();
        self.inner.release(true).await
    }

    /// Spawn a background task renewing the lease at one third of its
    /// duration. The task stops on release, on provider shutdown, or as soon
    /// as a renewal reports the lease stale.
    pub fn keep_alive(&self) {
        let mut guard = self.keep_alive.lock();
        if guard.is_some() || self.is_released() {
            return;
        }

        let inner = self.inner.clone();
        let token = inner.provider.shutdown.child_token();
        let task_token = token.clone();
        let interval = Duration::from_millis((inner.provider.options.expiry_offset_ms / 3).max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the lease was just granted
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match inner.extend().await {
                            Ok(expiry) => {
                                debug!(
                                    resource = %inner.resource,
                                    expiry = ?expiry,
                                    "lease auto-renewed"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    resource = %inner.resource,
                                    requester = %inner.requester,
                                    error = %e,
                                    "lease auto-renewal failed, stopping keep-alive"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        });
        *guard = Some((token, task));
    }

    fn stop_keep_alive(&self) {
        if let Some((token, _)) = self.keep_alive.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop_keep_alive();
        if self.inner.released.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = inner.release(false).await {
                        debug!(
                            resource = %inner.resource,
                            error = %e,
                            "background release on drop failed"
                        );
                    }
                });
            }
            Err(_) => warn!(
                resource = %self.inner.resource,
                "lock handle dropped outside a runtime; lease will lapse at expiry"
            ),
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.inner.resource)
            .field("requester", &self.inner.requester)
            .field("expiry_date", &*self.inner.expiry_date.lock())
            .field("released", &self.is_released())
            .field("stale", &self.is_stale())
            .finish()
    }
}
