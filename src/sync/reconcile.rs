//! Reconciliation engine
//!
//! Applies one full remote snapshot to the local store in a single
//! transaction, hands deferred children to the dependency queue, and drains
//! the queue after every project snapshot. Snapshots of the same kind are
//! applied one at a time, in arrival order, and child snapshots never overlap
//! a queue drain.

use super::backoff::{retry_on_integrity_violation, BackoffPolicy};
use super::queue::DependencyQueue;
use crate::error::SyncResult;
use crate::events::{EventBus, EventEmitter, SyncEvent};
use crate::models::{EntityKind, Snapshot};
use crate::store::{LocalStore, ReconcileReport, ReconcileScope};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    store: Arc<dyn LocalStore>,
    queue: Arc<DependencyQueue>,
    backoff: BackoffPolicy,
    events: EventBus,
    project_lock: Mutex<()>,
    task_lock: Mutex<()>,
    member_lock: Mutex<()>,
    invitation_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<DependencyQueue>,
        backoff: BackoffPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            backoff,
            events,
            project_lock: Mutex::new(()),
            task_lock: Mutex::new(()),
            member_lock: Mutex::new(()),
            invitation_lock: Mutex::new(()),
        }
    }

    fn lock_for(&self, kind: EntityKind) -> &Mutex<()> {
        match kind {
            EntityKind::Project | EntityKind::User => &self.project_lock,
            EntityKind::Task => &self.task_lock,
            EntityKind::Member => &self.member_lock,
            EntityKind::Invitation => &self.invitation_lock,
        }
    }

    /// Apply `snapshot` within `scope`.
    ///
    /// On failure the transaction is rolled back and the snapshot dropped;
    /// the next emission of the same query supersedes it.
    pub async fn apply(&self, snapshot: Snapshot, scope: ReconcileScope) -> SyncResult<ReconcileReport> {
        let kind = snapshot.kind();
        let _guard = self.lock_for(kind).lock().await;
        let keys = snapshot.keys();
        let drains_paused = match kind {
            EntityKind::Project | EntityKind::User => None,
            _ => Some(self.queue.pause_drains().await),
        };

        let result = retry_on_integrity_violation(&self.backoff, "reconcile", || {
            self.store.reconcile(snapshot.clone(), scope.clone())
        })
        .await;

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                error!(kind = %kind, size = keys.len(), error = %err, "Reconciliation rolled back");
                return Err(err.into());
            }
        };

        if report.is_noop() && report.deferred.is_empty() {
            debug!(kind = %kind, unchanged = report.unchanged, "Snapshot already applied");
        } else {
            info!(
                kind = %kind,
                upserted = report.upserted,
                deleted = report.deleted,
                unchanged = report.unchanged,
                kept_local = report.kept_local,
                deferred = report.deferred.len(),
                "Snapshot reconciled"
            );
        }

        self.queue.retain(kind, &keys).await;
        self.queue.enqueue(report.deferred.clone()).await;
        drop(drains_paused);

        self.events.emit(SyncEvent::Reconciled {
            kind,
            upserted: report.upserted,
            deleted: report.deleted,
            deferred: report.deferred.len(),
        });

        if kind == EntityKind::Project {
            if let Err(err) = self.queue.drain().await {
                warn!(error = %err, "Queue drain after project reconciliation failed");
            }
        }

        Ok(report)
    }
}
