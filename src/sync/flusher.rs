//! Periodic flush of pending local changes
//!
//! The core only exposes `sync_pending`; this driver is what the binary
//! uses to call it on a fixed interval.

use super::engine::SyncEngine;
use crate::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BackgroundFlusher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundFlusher {
    /// Flush every `every`, starting one interval from now
    pub fn spawn(engine: Arc<SyncEngine>, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match engine.sync_pending().await {
                            Ok(report) if report.synced + report.failed + report.retryable > 0 => {
                                info!(
                                    synced = report.synced,
                                    failed = report.failed,
                                    retryable = report.retryable,
                                    "Background flush"
                                );
                            }
                            Ok(_) => debug!("Background flush: nothing pending"),
                            Err(SyncError::NotSignedIn) => debug!("Not signed in, skipping flush"),
                            Err(err) => warn!(error = %err, "Background flush failed"),
                        }
                    }
                }
            }
        });

        info!(interval_secs = every.as_secs(), "Background flusher started");
        Self { cancel, handle }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "Background flusher ended abnormally");
        }
    }
}
