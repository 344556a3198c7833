//! Sync event system
//!
//! This module provides:
//! - `SyncEvent`: typed events emitted by the reconciler, queue and writers
//! - `EventBus`: broadcast channel for distributing events to observers

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventEmitter, SyncEvent};
