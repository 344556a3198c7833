//! Synchronization core
//!
//! - `repository`: local-first writes with background remote push
//! - `aggregator`: fan-in of remote subscriptions and readiness tracking
//! - `reconcile`: transactional application of full remote snapshots
//! - `queue`: children waiting for their parent project
//! - `backoff`: retry combinator for integrity violations
//! - `engine`: wiring plus identity following
//! - `flusher`: periodic `sync_pending` driver

pub mod aggregator;
pub mod backoff;
pub mod engine;
pub mod flusher;
pub mod queue;
pub mod reconcile;
pub mod repository;

pub use aggregator::{ListenerAggregator, SyncState};
pub use backoff::{retry_on_integrity_violation, BackoffPolicy};
pub use engine::{SyncDeps, SyncEngine};
pub use flusher::BackgroundFlusher;
pub use queue::{DependencyQueue, DrainReport, EvictionPolicy};
pub use reconcile::Reconciler;
pub use repository::{
    Completable, InvitationRepository, ProjectRepository, PushOutcome, RepoEntity, SyncReport,
    TaskRepository, WriteThroughRepository,
};
