//! # Network Watcher
//!
//! Tracks online/offline transitions reported by the host environment.
//! Only transitions matter: repeated reports of the same status are ignored,
//! so an `Online` that arrives while already online never reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::SyncEngine;

/// Connectivity as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Last observed connectivity. Starts online.
#[derive(Debug)]
pub struct NetworkWatcher {
    online: AtomicBool,
}

impl Default for NetworkWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkWatcher {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    /// Record a report. Returns true if it changed the observed status.
    pub fn observe(&self, status: NetworkStatus) -> bool {
        let online = status == NetworkStatus::Online;
        self.online.swap(online, Ordering::SeqCst) != online
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Feed connectivity reports from `reports` into `engine` until the sender
/// is dropped.
///
/// Every report is recorded as soon as it arrives. Reconnect backoff runs in
/// a separate task so a later `Offline` stops it at its next retry; at most
/// one backoff task runs at a time.
pub fn spawn_network_watcher(
    engine: Arc<SyncEngine>,
    mut reports: watch::Receiver<NetworkStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut recovery: Option<JoinHandle<bool>> = None;

        let initial = *reports.borrow_and_update();
        apply_report(&engine, initial, &mut recovery);

        while reports.changed().await.is_ok() {
            let status = *reports.borrow_and_update();
            apply_report(&engine, status, &mut recovery);
        }

        if let Some(task) = recovery {
            let _ = task.await;
        }
    })
}

fn apply_report(
    engine: &Arc<SyncEngine>,
    status: NetworkStatus,
    recovery: &mut Option<JoinHandle<bool>>,
) {
    if !engine.record_network_status(status) {
        return;
    }
    // A running backoff picks the new status up at its next retry
    if recovery.as_ref().is_some_and(|task| !task.is_finished()) {
        return;
    }
    let engine = Arc::clone(engine);
    *recovery = Some(tokio::spawn(async move {
        engine.reconnect_with_backoff().await
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transitions_count() {
        let watcher = NetworkWatcher::new();
        assert!(watcher.is_online());
        assert!(!watcher.observe(NetworkStatus::Online));

        assert!(watcher.observe(NetworkStatus::Offline));
        assert!(!watcher.observe(NetworkStatus::Offline));
        assert!(!watcher.is_online());

        assert!(watcher.observe(NetworkStatus::Online));
        assert!(watcher.is_online());
    }
}
