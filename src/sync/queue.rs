//! Dependency retry queue
//!
//! Holds child entities (tasks, members, invitations) that arrived before
//! their parent project. One queue per kind, deduplicated by key. `drain`
//! runs after every project reconciliation and writes whatever has become
//! ready; drains never overlap.

use super::backoff::{retry_on_integrity_violation, BackoffPolicy};
use crate::error::StoreResult;
use crate::events::{EventBus, EventEmitter, SyncEvent};
use crate::models::*;
use crate::store::LocalStore;
use crate::QueueConfig;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// When an entry whose parent never shows up is dropped
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// Drain cycles an entry may wait for its parent
    pub max_drain_attempts: u32,
    /// Maximum time an entry may stay queued
    pub orphan_ttl: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_drain_attempts: 50,
            orphan_ttl: Duration::from_secs(86_400),
        }
    }
}

impl EvictionPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_drain_attempts: config.max_drain_attempts.max(1),
            orphan_ttl: Duration::from_secs(config.orphan_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    entity: T,
    enqueued_at: Instant,
    /// Drain cycles that found the entry not writable
    attempts: u32,
}

#[derive(Debug)]
struct PendingQueue<T> {
    entries: Vec<Entry<T>>,
}

impl<T: SyncEntity> PendingQueue<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add or replace by key; returns true for a new key
    fn enqueue(&mut self, entity: T) -> bool {
        let key = entity.key();
        match self.entries.iter_mut().find(|e| e.entity.key() == key) {
            Some(existing) => {
                existing.entity = entity;
                false
            }
            None => {
                self.entries.push(Entry {
                    entity,
                    enqueued_at: Instant::now(),
                    attempts: 0,
                });
                true
            }
        }
    }

    /// Put back an entry taken by a drain unless a newer copy arrived meanwhile
    fn restore(&mut self, entry: Entry<T>) {
        let key = entry.entity.key();
        if !self.entries.iter().any(|e| e.entity.key() == key) {
            self.entries.push(entry);
        }
    }

    fn retain_keys(&mut self, keys: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keys.contains(&e.entity.key()));
        before - self.entries.len()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.entity.key()).collect()
    }
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries written to the local store
    pub drained: usize,
    /// Entries still waiting for their parent
    pub waiting: usize,
    /// Entries whose write failed and were put back
    pub failed: usize,
    /// Entries dropped by the eviction policy
    pub evicted: usize,
}

/// Per-kind queues of entities deferred for a missing parent project
pub struct DependencyQueue {
    store: Arc<dyn LocalStore>,
    backoff: BackoffPolicy,
    eviction: EvictionPolicy,
    events: EventBus,
    tasks: Mutex<PendingQueue<Task>>,
    members: Mutex<PendingQueue<ProjectMember>>,
    invitations: Mutex<PendingQueue<ProjectInvitation>>,
    drain_lock: Mutex<()>,
}

impl DependencyQueue {
    pub fn new(
        store: Arc<dyn LocalStore>,
        backoff: BackoffPolicy,
        eviction: EvictionPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            backoff,
            eviction,
            events,
            tasks: Mutex::new(PendingQueue::new()),
            members: Mutex::new(PendingQueue::new()),
            invitations: Mutex::new(PendingQueue::new()),
            drain_lock: Mutex::new(()),
        }
    }

    /// Queue deferred entities; returns how many keys were new
    pub async fn enqueue(&self, deferred: Snapshot) -> usize {
        match deferred {
            Snapshot::Tasks(items) => self.enqueue_into(&self.tasks, items).await,
            Snapshot::Members(items) => self.enqueue_into(&self.members, items).await,
            Snapshot::Invitations(items) => self.enqueue_into(&self.invitations, items).await,
            Snapshot::Projects(items) => {
                if !items.is_empty() {
                    warn!(count = items.len(), "Projects have no parent, not queueing");
                }
                0
            }
        }
    }

    async fn enqueue_into<T: SyncEntity>(&self, queue: &Mutex<PendingQueue<T>>, items: Vec<T>) -> usize {
        let mut queue = queue.lock().await;
        let mut added = 0;
        for entity in items {
            let key = entity.key();
            let project_id = entity.parent_project_id().unwrap_or_default().to_string();
            if queue.enqueue(entity) {
                added += 1;
                debug!(kind = %T::KIND, key = %key, project_id = %project_id, "Deferred until parent arrives");
                self.events.emit_deferred(T::KIND, key, project_id);
            }
        }
        added
    }

    /// Drop queued entries of `kind` that are not in `keys`.
    ///
    /// Called with the keys of the latest full snapshot: anything missing
    /// from it no longer exists remotely.
    pub async fn retain(&self, kind: EntityKind, keys: &BTreeSet<String>) -> usize {
        let dropped = match kind {
            EntityKind::Task => self.tasks.lock().await.retain_keys(keys),
            EntityKind::Member => self.members.lock().await.retain_keys(keys),
            EntityKind::Invitation => self.invitations.lock().await.retain_keys(keys),
            EntityKind::Project | EntityKind::User => 0,
        };
        if dropped > 0 {
            debug!(kind = %kind, dropped, "Dropped queued entries gone from remote");
        }
        dropped
    }

    /// Block drains until the guard is dropped.
    ///
    /// A drain writes entries it has already taken off the queue, so a child
    /// snapshot must hold this across its reconcile and `retain` or the
    /// drain can write back an entry that snapshot removed.
    pub(crate) async fn pause_drains(&self) -> MutexGuard<'_, ()> {
        self.drain_lock.lock().await
    }

    /// Write every queued entity whose parent is now present
    pub async fn drain(&self) -> StoreResult<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let parents = self.store.project_ids().await?;

        let mut report = DrainReport::default();
        self.drain_queue(&self.tasks, &parents, &mut report).await;
        self.drain_queue(&self.members, &parents, &mut report).await;
        self.drain_queue(&self.invitations, &parents, &mut report).await;

        if report.drained > 0 || report.evicted > 0 || report.failed > 0 {
            info!(
                drained = report.drained,
                waiting = report.waiting,
                failed = report.failed,
                evicted = report.evicted,
                "Dependency queue drained"
            );
        }
        Ok(report)
    }

    async fn drain_queue<T: SyncEntity>(
        &self,
        queue: &Mutex<PendingQueue<T>>,
        parents: &BTreeSet<String>,
        report: &mut DrainReport,
    ) {
        let taken = std::mem::take(&mut queue.lock().await.entries);
        let mut keep = Vec::new();

        for mut entry in taken {
            let key = entry.entity.key();
            let ready = entry
                .entity
                .parent_project_id()
                .map_or(true, |pid| parents.contains(pid));

            if ready {
                let entity = entry.entity.clone();
                let result = retry_on_integrity_violation(&self.backoff, "queue_drain", || {
                    self.store.apply_remote(T::into_snapshot(vec![entity.clone()]))
                })
                .await;
                match result {
                    Ok(_) => {
                        report.drained += 1;
                        debug!(kind = %T::KIND, key = %key, "Drained deferred entity");
                        self.events.emit(SyncEvent::Drained { kind: T::KIND, key });
                        continue;
                    }
                    Err(err) => {
                        warn!(kind = %T::KIND, key = %key, error = %err, "Deferred write failed, re-queueing");
                        report.failed += 1;
                    }
                }
            }

            entry.attempts += 1;
            if self.should_evict(&entry) {
                report.evicted += 1;
                warn!(
                    kind = %T::KIND,
                    key = %key,
                    attempts = entry.attempts,
                    project_id = entry.entity.parent_project_id().unwrap_or_default(),
                    "Evicting orphaned entity"
                );
                self.events.emit(SyncEvent::Evicted {
                    kind: T::KIND,
                    key,
                    attempts: entry.attempts,
                });
                continue;
            }
            if !ready {
                report.waiting += 1;
            }
            keep.push(entry);
        }

        let mut queue = queue.lock().await;
        for entry in keep {
            queue.restore(entry);
        }
    }

    fn should_evict<T>(&self, entry: &Entry<T>) -> bool {
        entry.attempts >= self.eviction.max_drain_attempts
            || entry.enqueued_at.elapsed() >= self.eviction.orphan_ttl
    }

    /// Empty every queue
    pub async fn clear(&self) {
        self.tasks.lock().await.entries.clear();
        self.members.lock().await.entries.clear();
        self.invitations.lock().await.entries.clear();
        debug!("Dependency queues cleared");
    }

    /// Keys currently queued for `kind`, oldest first
    pub async fn queued_keys(&self, kind: EntityKind) -> Vec<String> {
        match kind {
            EntityKind::Task => self.tasks.lock().await.keys(),
            EntityKind::Member => self.members.lock().await.keys(),
            EntityKind::Invitation => self.invitations.lock().await.keys(),
            EntityKind::Project | EntityKind::User => Vec::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.entries.len()
            + self.members.lock().await.entries.len()
            + self.invitations.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
