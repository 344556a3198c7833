//! Sync event types

use crate::models::EntityKind;
use serde::{Deserialize, Serialize};

/// An observable step of the sync pipeline
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A remote snapshot was applied to the local store
    Reconciled {
        kind: EntityKind,
        upserted: usize,
        deleted: usize,
        deferred: usize,
    },
    /// An entity was parked until its parent project arrives
    Deferred {
        kind: EntityKind,
        key: String,
        project_id: String,
    },
    /// A parked entity was written after its parent arrived
    Drained { kind: EntityKind, key: String },
    /// A parked entity was dropped without ever finding its parent
    Evicted {
        kind: EntityKind,
        key: String,
        attempts: u32,
    },
    /// A local change was acknowledged by the remote
    Pushed { kind: EntityKind, key: String },
    /// A local change could not be pushed
    PushFailed {
        kind: EntityKind,
        key: String,
        error: String,
        terminal: bool,
    },
    /// A remote subscription ended with an error
    SubscriptionFailed { query: String, error: String },
    /// Every entity type has delivered its first snapshot
    Ready,
}

impl SyncEvent {
    /// Short name used in log fields
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reconciled { .. } => "reconciled",
            Self::Deferred { .. } => "deferred",
            Self::Drained { .. } => "drained",
            Self::Evicted { .. } => "evicted",
            Self::Pushed { .. } => "pushed",
            Self::PushFailed { .. } => "push_failed",
            Self::SubscriptionFailed { .. } => "subscription_failed",
            Self::Ready => "ready",
        }
    }

    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            Self::Reconciled { kind, .. }
            | Self::Deferred { kind, .. }
            | Self::Drained { kind, .. }
            | Self::Evicted { kind, .. }
            | Self::Pushed { kind, .. }
            | Self::PushFailed { kind, .. } => Some(*kind),
            Self::SubscriptionFailed { .. } | Self::Ready => None,
        }
    }
}

/// Sink for sync events.
///
/// Emitting never blocks and never fails; consumers hold an
/// `Arc<dyn EventEmitter>` or the concrete [`super::EventBus`].
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SyncEvent);

    fn emit_pushed(&self, kind: EntityKind, key: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(SyncEvent::Pushed {
            kind,
            key: key.into(),
        });
    }

    fn emit_deferred(&self, kind: EntityKind, key: impl Into<String>, project_id: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(SyncEvent::Deferred {
            kind,
            key: key.into(),
            project_id: project_id.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SyncEvent::Drained {
            kind: EntityKind::Task,
            key: "t1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "drained");
        assert_eq!(json["kind"], "task");
        assert_eq!(json["key"], "t1");

        let ready = serde_json::to_value(SyncEvent::Ready).unwrap();
        assert_eq!(ready, serde_json::json!({"event": "ready"}));
    }

    #[test]
    fn test_name_and_kind() {
        let event = SyncEvent::Evicted {
            kind: EntityKind::Member,
            key: "p1:u1".into(),
            attempts: 50,
        };
        assert_eq!(event.name(), "evicted");
        assert_eq!(event.kind(), Some(EntityKind::Member));
        assert_eq!(SyncEvent::Ready.kind(), None);
    }
}
