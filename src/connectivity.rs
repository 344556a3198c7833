//! Network availability check consulted before immediate pushes

use std::sync::atomic::{AtomicBool, Ordering};

pub trait Connectivity: Send + Sync {
    fn is_network_available(&self) -> bool;
}

/// Connectivity flag flipped by the host (OS callbacks, tests)
#[derive(Debug)]
pub struct ToggleConnectivity {
    online: AtomicBool,
}

impl ToggleConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            tracing::info!(online, "Connectivity changed");
        }
    }
}

impl Default for ToggleConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ToggleConnectivity {
    fn is_network_available(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
