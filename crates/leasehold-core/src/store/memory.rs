//! In-memory lock store
//!
//! Backs a single process (or tests) with a DashMap keyed by resource name.
//! Per-resource atomicity comes from the map's entry API: every mutation of a
//! record happens under that key's shard guard, so no read-then-write race
//! window exists between concurrent callers.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use leasehold_common::{LockInfo, LockRecord, LockResult, PendingLockRequest};

use crate::options::{CleanupPolicy, MemoryStoreOptions};
use crate::store::LockStore;

struct MemoryEntry {
    record: LockRecord,
    pending: VecDeque<PendingLockRequest>,
    /// Last acquire/extend/release touching this entry; drives eviction
    last_activity: DateTime<Utc>,
}

impl MemoryEntry {
    fn new(resource: &str, now: DateTime<Utc>) -> Self {
        Self {
            record: LockRecord::unheld(resource),
            pending: VecDeque::new(),
            last_activity: now,
        }
    }

    /// Inactive entries are eviction candidates: unheld and nobody waiting
    fn is_inactive(&self, now: DateTime<Utc>) -> bool {
        !self.record.is_held(now) && self.pending.is_empty()
    }
}

/// DashMap-backed lock store for single-process deployments
pub struct MemoryLockStore {
    entries: DashMap<String, MemoryEntry>,
    options: MemoryStoreOptions,
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new(MemoryStoreOptions::default())
    }
}

impl MemoryLockStore {
    pub fn new(options: MemoryStoreOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
        }
    }

    /// Number of tracked resources, held or not
    pub fn tracked_resources(&self) -> usize {
        self.entries.len()
    }

    /// Apply the configured eviction policy to inactive entries.
    /// Returns how many entries were evicted.
    fn evict(&self, now: DateTime<Utc>) -> usize {
        let amount = self.options.effective_cleanup_amount();

        let victims: Vec<String> = match self.options.cleanup_policy {
            CleanupPolicy::Time => {
                let threshold = chrono::Duration::milliseconds(amount as i64);
                self.entries
                    .iter()
                    .filter(|entry| {
                        entry.is_inactive(now) && entry.last_activity + threshold < now
                    })
                    .map(|entry| entry.key().clone())
                    .collect()
            }
            CleanupPolicy::Amount => {
                let tracked = self.entries.len();
                if tracked <= amount as usize {
                    return 0;
                }
                // Oldest inactive entries go first
                let mut inactive: Vec<(String, DateTime<Utc>)> = self
                    .entries
                    .iter()
                    .filter(|entry| entry.is_inactive(now))
                    .map(|entry| (entry.key().clone(), entry.last_activity))
                    .collect();
                inactive.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                inactive
                    .into_iter()
                    .take(tracked - amount as usize)
                    .map(|(key, _)| key)
                    .collect()
            }
            CleanupPolicy::Always => self
                .entries
                .iter()
                .filter(|entry| entry.is_inactive(now))
                .map(|entry| entry.key().clone())
                .collect(),
            CleanupPolicy::ProcessMemory => {
                if process_memory_bytes().is_none_or(|used| used <= amount) {
                    return 0;
                }
                self.entries
                    .iter()
                    .filter(|entry| entry.is_inactive(now))
                    .map(|entry| entry.key().clone())
                    .collect()
            }
        };

        let mut evicted = 0;
        for key in victims {
            // Re-check under the entry guard: the record may have been
            // re-acquired between the scan and the removal
            if self
                .entries
                .remove_if(&key, |_, entry| entry.is_inactive(now))
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    #[cfg(test)]
    fn set_last_activity(&self, resource: &str, when: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(resource) {
            entry.last_activity = when;
        }
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<Option<LockRecord>> {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(resource.to_string())
            .or_insert_with(|| MemoryEntry::new(resource, now));

        if entry.record.is_held(now) && !entry.record.is_held_by(requester, now) {
            return Ok(None);
        }

        // Unheld, stale, or a re-acquire by the current holder
        entry.record.grant(requester, expiry_offset, now);
        entry.last_activity = now;
        debug!(resource = %resource, requester = %requester, "lock acquired");
        Ok(Some(entry.record.clone()))
    }

    async fn extend(
        &self,
        resource: &str,
        requester: &str,
        expiry_offset: Option<Duration>,
    ) -> LockResult<bool> {
        let now = Utc::now();
        if let Some(mut entry) = self.entries.get_mut(resource)
            && entry.record.is_held_by(requester, now)
        {
            entry.record.grant(requester, expiry_offset, now);
            entry.last_activity = now;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, resource: &str, requester: &str) -> LockResult<bool> {
        let now = Utc::now();
        if let Some(mut entry) = self.entries.get_mut(resource)
            && entry.record.is_held_by(requester, now)
        {
            entry.record.clear();
            entry.last_activity = now;
            debug!(resource = %resource, requester = %requester, "lock released");
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, resource: &str) -> LockResult<Option<LockInfo>> {
        Ok(self
            .entries
            .get(resource)
            .map(|entry| LockInfo::from_record(&entry.record, entry.pending.len())))
    }

    async fn enqueue_pending(&self, request: PendingLockRequest) -> LockResult<()> {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(request.resource.clone())
            .or_insert_with(|| MemoryEntry::new(&request.resource, now));
        entry
            .pending
            .retain(|pending| pending.requester != request.requester);
        entry.pending.push_back(request);
        Ok(())
    }

    async fn remove_pending(&self, resource: &str, requester: &str) -> LockResult<()> {
        if let Some(mut entry) = self.entries.get_mut(resource) {
            entry.pending.retain(|pending| pending.requester != requester);
        }
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> LockResult<Vec<String>> {
        let mut freed = Vec::new();

        for mut entry in self.entries.iter_mut() {
            // Staleness is re-checked here, under the entry guard, so a hold
            // renewed after the sweep started is left alone
            if entry.record.owner.is_some() && entry.record.is_stale(now) {
                entry.record.clear();
                entry.last_activity = now;
                freed.push(entry.key().clone());
            }
            entry.pending.retain(|pending| !pending.is_expired(now));
        }

        let evicted = self.evict(now);
        if !freed.is_empty() || evicted > 0 {
            debug!(
                reclaimed = freed.len(),
                evicted, "memory store sweep completed"
            );
        }
        Ok(freed)
    }

    async fn clear_all(&self) -> LockResult<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Resident set size of the current process, if it can be determined
fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}
