//! Sync engine
//!
//! Owns the reconciler, the dependency queue, the listener aggregator and
//! one repository per writable entity type. Follows the identity provider:
//! a new user restarts the aggregator, a sign-out stops it and purges the
//! local cache.

use super::aggregator::{ListenerAggregator, SyncState};
use super::backoff::BackoffPolicy;
use super::queue::{DependencyQueue, DrainReport, EvictionPolicy};
use super::reconcile::Reconciler;
use super::repository::{InvitationRepository, ProjectRepository, SyncReport, TaskRepository};
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::identity::IdentityProvider;
use crate::models::User;
use crate::remote::RemoteSource;
use crate::store::LocalStore;
use crate::Config;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// External collaborators the engine is wired to
pub struct SyncDeps {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteSource>,
    pub identity: Arc<dyn IdentityProvider>,
    pub connectivity: Arc<dyn Connectivity>,
}

pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    identity: Arc<dyn IdentityProvider>,
    events: EventBus,
    queue: Arc<DependencyQueue>,
    aggregator: ListenerAggregator,
    projects: ProjectRepository,
    tasks: TaskRepository,
    invitations: InvitationRepository,
    watcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SyncEngine {
    pub fn new(deps: SyncDeps, config: &Config) -> Self {
        let SyncDeps {
            store,
            remote,
            identity,
            connectivity,
        } = deps;
        let events = EventBus::default();
        let backoff = BackoffPolicy::from_config(&config.retry);

        let queue = Arc::new(DependencyQueue::new(
            store.clone(),
            backoff.clone(),
            EvictionPolicy::from_config(&config.queue),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            queue.clone(),
            backoff,
            events.clone(),
        ));
        let aggregator =
            ListenerAggregator::new(remote.clone(), reconciler, queue.clone(), events.clone());

        Self {
            projects: ProjectRepository::new(
                store.clone(),
                remote.clone(),
                connectivity.clone(),
                events.clone(),
            ),
            tasks: TaskRepository::new(
                store.clone(),
                remote.clone(),
                connectivity.clone(),
                events.clone(),
            ),
            invitations: InvitationRepository::new(
                store.clone(),
                remote,
                connectivity,
                events.clone(),
            ),
            store,
            identity,
            events,
            queue,
            aggregator,
            watcher: Mutex::new(None),
        }
    }

    /// Apply the current identity and follow its changes until shutdown
    pub async fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            debug!("Sync engine already started");
            return;
        }

        let mut rx = self.identity.subscribe();
        let initial = rx.borrow_and_update().clone();
        self.on_identity(initial).await;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("Identity provider dropped");
                            break;
                        }
                        let user = rx.borrow_and_update().clone();
                        engine.on_identity(user).await;
                    }
                }
            }
        });
        *watcher = Some((cancel, handle));
        info!("Sync engine started");
    }

    async fn on_identity(&self, user: Option<User>) {
        let current = self.aggregator.current_user().await;
        match (current, user) {
            (Some(current), Some(user)) if current.id == user.id => {
                if let Err(err) = self.store.save_user(&user).await {
                    error!(user_id = %user.id, error = %err, "Failed to cache user");
                }
            }
            (current, Some(user)) => {
                if let Some(previous) = current {
                    info!(from = %previous.id, to = %user.id, "Signed-in user changed");
                    self.sign_out_local().await;
                }
                if let Err(err) = self.store.save_user(&user).await {
                    error!(user_id = %user.id, error = %err, "Failed to cache user");
                }
                self.aggregator.start(user).await;
            }
            (Some(previous), None) => {
                info!(user_id = %previous.id, "Signed out");
                self.sign_out_local().await;
            }
            (None, None) => {}
        }
    }

    async fn sign_out_local(&self) {
        if let Err(err) = self.sign_out().await {
            error!(error = %err, "Failed to purge local store on sign-out");
        }
    }

    /// Stop syncing and delete every local row
    pub async fn sign_out(&self) -> SyncResult<()> {
        self.aggregator.stop().await;
        self.settle().await;
        self.queue.clear().await;
        self.store.purge_all().await?;
        info!("Local store purged");
        Ok(())
    }

    /// Reopen every subscription for the current user; false when signed out
    pub async fn refresh(&self) -> bool {
        self.aggregator.restart().await
    }

    /// Push pending rows of every type, parents first, then drain the queue.
    /// Fails with [`SyncError::NotSignedIn`] while nobody is signed in.
    pub async fn sync_pending(&self) -> SyncResult<SyncReport> {
        if self.identity.current_user().is_none() {
            return Err(SyncError::NotSignedIn);
        }
        let mut report = self.projects.sync_pending_report().await?;
        report += self.tasks.sync_pending_report().await?;
        report += self.invitations.sync_pending_report().await?;
        self.drain_queue().await?;
        Ok(report)
    }

    pub async fn drain_queue(&self) -> SyncResult<DrainReport> {
        Ok(self.queue.drain().await?)
    }

    /// Wait for background pushes started so far
    pub async fn settle(&self) {
        self.projects.settle().await;
        self.tasks.settle().await;
        self.invitations.settle().await;
    }

    /// Stop following identity and close every subscription
    pub async fn shutdown(&self) {
        if let Some((cancel, handle)) = self.watcher.lock().await.take() {
            cancel.cancel();
            if let Err(err) = handle.await {
                error!(error = %err, "Identity watcher ended abnormally");
            }
        }
        self.aggregator.stop().await;
        self.settle().await;
        info!("Sync engine stopped");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> SyncState {
        self.aggregator.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.aggregator.watch_state()
    }

    /// Wait until the initial sync completes or a failure is surfaced
    pub async fn wait_ready(&self) -> SyncState {
        let mut rx = self.watch_state();
        let state = match rx.wait_for(|s| s.ready || s.error.is_some()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn projects(&self) -> &ProjectRepository {
        &self.projects
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn invitations(&self) -> &InvitationRepository {
        &self.invitations
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DependencyQueue> {
        &self.queue
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.aggregator.active_subscriptions().await
    }
}
