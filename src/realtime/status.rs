//! # Sync Status
//!
//! The engine's single owned status object. UI code only ever sees
//! [`SyncStatus`] snapshots; all mutation goes through [`StatusCell`],
//! which is private to the engine.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::SyncError;

/// Where the engine is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLifecycle {
    /// `initialize` has never succeeded
    #[default]
    Uninitialized,
    /// Initialized; the channel may be connected or not
    Initialized,
    /// `unsubscribe_all` ran. Callbacks are retained and `connect` reopens.
    TornDown,
}

impl EngineLifecycle {
    /// A prior `initialize` still counts after teardown
    pub fn is_initialized(&self) -> bool {
        !matches!(self, EngineLifecycle::Uninitialized)
    }
}

/// Snapshot of the engine's connection state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_connected: bool,
    pub is_initialized: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct StatusState {
    status: SyncStatus,
    lifecycle: EngineLifecycle,
}

/// Owned, lock-protected status
#[derive(Debug, Default)]
pub struct StatusCell {
    state: RwLock<StatusState>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status
    pub fn snapshot(&self) -> SyncStatus {
        self.state
            .read()
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }

    pub fn lifecycle(&self) -> EngineLifecycle {
        self.state
            .read()
            .map(|s| s.lifecycle)
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .map(|s| s.status.is_connected)
            .unwrap_or(false)
    }

    fn update(&self, f: impl FnOnce(&mut StatusState)) {
        if let Ok(mut state) = self.state.write() {
            f(&mut state);
        }
    }

    pub fn set_lifecycle(&self, lifecycle: EngineLifecycle) {
        self.update(|s| {
            s.lifecycle = lifecycle;
            s.status.is_initialized = lifecycle.is_initialized();
        });
    }

    /// Channel opened: connected, error cleared, sync time refreshed.
    ///
    /// `still_current` is checked under the status lock so a concurrent
    /// channel failure cannot be overwritten by a late success.
    pub fn mark_connected_if(&self, still_current: impl FnOnce() -> bool) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if !still_current() {
            return false;
        }
        state.status.is_connected = true;
        state.status.error = None;
        state.status.last_sync_time = Some(Utc::now());
        true
    }

    /// Channel lost. `is_connected` drops in the same update that records
    /// the error, so no reader sees the error while still connected.
    pub fn mark_disconnected(&self, error: Option<&SyncError>) {
        self.update(|s| {
            s.status.is_connected = false;
            if let Some(error) = error {
                s.status.error = Some(error.to_string());
            }
        });
    }

    /// `mark_disconnected` for a failure report, applied only when
    /// `owns_channel` holds under the status lock
    pub fn mark_failed_if(&self, owns_channel: impl FnOnce() -> bool, error: &SyncError) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if !owns_channel() {
            return false;
        }
        state.status.is_connected = false;
        state.status.error = Some(error.to_string());
        true
    }

    /// Record a non-connection error without touching `is_connected`
    pub fn record_error(&self, error: &SyncError) {
        self.update(|s| s.status.error = Some(error.to_string()));
    }

    pub fn touch_sync(&self) {
        self.update(|s| s.status.last_sync_time = Some(Utc::now()));
    }
}
