//! Listener aggregator
//!
//! Opens one remote subscription per logical query for the signed-in user
//! and feeds every emission to the reconciler. Tracks which entity kinds
//! have delivered a first snapshot and publishes the combined readiness on
//! a `watch` channel.
//!
//! All per-identity state lives in one [`Session`] that is rebuilt on every
//! start; stopping cancels every subscription task and waits for it, so no
//! listener outlives the identity it was opened for.

use super::reconcile::Reconciler;
use super::queue::DependencyQueue;
use crate::error::RemoteError;
use crate::events::{EventBus, EventEmitter, SyncEvent};
use crate::models::*;
use crate::remote::{RemoteQuery, RemoteSource, SnapshotStream};
use crate::store::ReconcileScope;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sync status observed by the UI layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Subscriptions are open but not every kind has delivered a snapshot
    pub loading: bool,
    /// Every tracked kind has delivered at least one snapshot
    pub ready: bool,
    /// Last subscription or reconciliation failure
    pub error: Option<String>,
}

/// Which project subscription an emission came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectSource {
    Owned,
    Member,
}

/// Last snapshot of each project subscription
#[derive(Debug, Default)]
struct ProjectMerge {
    owned: Option<Vec<Project>>,
    member: Option<Vec<Project>>,
}

impl ProjectMerge {
    /// Record an emission; returns the merged set once both sources have emitted
    fn record(&mut self, source: ProjectSource, projects: Vec<Project>) -> Option<Vec<Project>> {
        match source {
            ProjectSource::Owned => self.owned = Some(projects),
            ProjectSource::Member => self.member = Some(projects),
        }
        let (earlier, latest) = match source {
            ProjectSource::Owned => (self.member.as_ref()?, self.owned.as_ref()?),
            ProjectSource::Member => (self.owned.as_ref()?, self.member.as_ref()?),
        };

        let mut merged: BTreeMap<&str, &Project> = BTreeMap::new();
        for project in earlier.iter().chain(latest.iter()) {
            merged.insert(project.id.as_str(), project);
        }
        Some(merged.into_values().cloned().collect())
    }
}

/// Per-identity aggregator state, rebuilt on every start
struct Session {
    user: User,
    reconciler: Arc<Reconciler>,
    events: EventBus,
    status: watch::Sender<SyncState>,
    received: Mutex<BTreeSet<EntityKind>>,
    /// Held across project reconciliation so merged sets apply in order
    projects: Mutex<ProjectMerge>,
}

impl Session {
    fn scope_for(&self, kind: EntityKind) -> ReconcileScope {
        match kind {
            EntityKind::Member => ReconcileScope::ProjectsInSnapshot,
            EntityKind::Invitation => ReconcileScope::InviteeEmail(self.user.email.clone()),
            _ => ReconcileScope::All,
        }
    }

    async fn handle(&self, query: &RemoteQuery, snapshot: Snapshot) {
        if snapshot.kind() != query.kind() {
            warn!(query = %query, got = %snapshot.kind(), "Snapshot kind does not match query");
            return;
        }
        let kind = query.kind();

        let result = match (query, snapshot) {
            (RemoteQuery::ProjectsOwnedBy(_), Snapshot::Projects(projects)) => {
                self.apply_projects(ProjectSource::Owned, projects).await
            }
            (RemoteQuery::ProjectsWithMember(_), Snapshot::Projects(projects)) => {
                self.apply_projects(ProjectSource::Member, projects).await
            }
            (_, snapshot) => Some(
                self.reconciler
                    .apply(snapshot, self.scope_for(kind))
                    .await
                    .map(|_| ()),
            ),
        };

        let Some(result) = result else {
            debug!(query = %query, "Waiting for the other project subscription");
            return;
        };
        if let Err(err) = result {
            self.set_error(format!("{kind} sync failed: {err}"));
        }
        self.mark_received(kind).await;
    }

    /// Reconcile the merged project set; `None` until both sources emitted
    async fn apply_projects(
        &self,
        source: ProjectSource,
        projects: Vec<Project>,
    ) -> Option<crate::error::SyncResult<()>> {
        let mut merge = self.projects.lock().await;
        let merged = merge.record(source, projects)?;
        Some(
            self.reconciler
                .apply(Snapshot::Projects(merged), ReconcileScope::All)
                .await
                .map(|_| ()),
        )
    }

    async fn mark_received(&self, kind: EntityKind) {
        let mut received = self.received.lock().await;
        if !received.insert(kind) {
            return;
        }
        debug!(kind = %kind, "First snapshot received");
        if EntityKind::TRACKED.iter().all(|k| received.contains(k)) {
            self.status.send_modify(|state| {
                state.loading = false;
                state.ready = true;
            });
            info!(user_id = %self.user.id, "Initial sync complete");
            self.events.emit(SyncEvent::Ready);
        }
    }

    fn set_error(&self, message: String) {
        self.status.send_modify(|state| state.error = Some(message));
    }

    fn subscription_failed(&self, query: &RemoteQuery, err: RemoteError) {
        warn!(query = %query, error = %err, "Subscription failed");
        self.events.emit(SyncEvent::SubscriptionFailed {
            query: query.to_string(),
            error: err.to_string(),
        });
        self.set_error(format!("{query}: {err}"));
    }
}

async fn run_subscription(
    session: Arc<Session>,
    query: RemoteQuery,
    mut stream: SnapshotStream,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(query = %query, "Subscription cancelled");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(snapshot)) => session.handle(&query, snapshot).await,
                Some(Err(err)) => {
                    session.subscription_failed(&query, err);
                    break;
                }
                None => {
                    debug!(query = %query, "Subscription closed by remote");
                    break;
                }
            }
        }
    }
}

struct Running {
    user: User,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Fans in every remote query stream for the signed-in user
pub struct ListenerAggregator {
    remote: Arc<dyn RemoteSource>,
    reconciler: Arc<Reconciler>,
    queue: Arc<DependencyQueue>,
    events: EventBus,
    status: watch::Sender<SyncState>,
    running: Mutex<Option<Running>>,
}

impl ListenerAggregator {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        reconciler: Arc<Reconciler>,
        queue: Arc<DependencyQueue>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(SyncState::default());
        Self {
            remote,
            reconciler,
            queue,
            events,
            status,
            running: Mutex::new(None),
        }
    }

    /// Open every subscription for `user`, replacing any running session
    pub async fn start(&self, user: User) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            Self::shutdown(previous).await;
        }
        self.queue.clear().await;
        self.status.send_replace(SyncState {
            loading: true,
            ready: false,
            error: None,
        });

        let session = Arc::new(Session {
            user: user.clone(),
            reconciler: self.reconciler.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            received: Mutex::new(BTreeSet::new()),
            projects: Mutex::new(ProjectMerge::default()),
        });

        let cancel = CancellationToken::new();
        let queries = RemoteQuery::for_user(&user);
        let mut handles = Vec::with_capacity(queries.len());
        for query in queries {
            let stream = self.remote.subscribe(query.clone());
            handles.push(tokio::spawn(run_subscription(
                session.clone(),
                query,
                stream,
                cancel.child_token(),
            )));
        }

        info!(user_id = %user.id, subscriptions = handles.len(), "Listener aggregator started");
        *running = Some(Running {
            user,
            cancel,
            handles,
        });
    }

    /// Cancel every subscription and wait for the tasks to finish
    pub async fn stop(&self) {
        let previous = self.running.lock().await.take();
        if let Some(previous) = previous {
            let user_id = previous.user.id.clone();
            Self::shutdown(previous).await;
            self.queue.clear().await;
            info!(user_id = %user_id, "Listener aggregator stopped");
        }
        self.status.send_replace(SyncState::default());
    }

    /// Restart for the current user; false when not running
    pub async fn restart(&self) -> bool {
        let user = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.user.clone());
        match user {
            Some(user) => {
                self.start(user).await;
                true
            }
            None => false,
        }
    }

    async fn shutdown(running: Running) {
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Subscription task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.status.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.status.subscribe()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.running.lock().await.as_ref().map(|r| r.user.clone())
    }

    /// Number of subscription tasks still running
    pub async fn active_subscriptions(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.handles.iter().filter(|h| !h.is_finished()).count())
    }
}
