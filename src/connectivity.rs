//! Connectivity signal shared by the engine and its background loop.
//!
//! The platform reports network changes through `set_platform_online`; the
//! connectivity loop cross-checks with a store probe and the engine marks the
//! store unreachable when a request fails to connect. All three feed one
//! `watch` channel, so observers only wake on actual transitions.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Network status reported by the host platform.
    pub fn set_platform_online(&self, online: bool) {
        self.update(online, "platform");
    }

    /// Result of a reachability probe against the store.
    pub fn observe_probe(&self, reachable: bool) {
        self.update(reachable, "probe");
    }

    /// A store request failed to connect.
    pub(crate) fn mark_unreachable(&self) {
        self.update(false, "request");
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn update(&self, online: bool, source: &'static str) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!(source, "canonical store reachable");
            } else {
                info!(source, "canonical store unreachable; orders will be queued locally");
            }
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
