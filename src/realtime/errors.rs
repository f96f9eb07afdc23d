//! # Sync Errors
//!
//! Error types for the synchronization engine.

use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // ==================
    // Connection Errors
    // ==================
    /// Channel failed to open or dropped
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Reconnect attempt failed
    #[error("Reconnect failed: {0}")]
    ReconnectError(String),

    /// Engine has never been initialized
    #[error("Sync engine not initialized")]
    NotInitialized,

    // ==================
    // Subscription Errors
    // ==================
    /// A topic subscription failed upstream
    #[error("Subscribe to {topic} failed: {message}")]
    SubscribeError { topic: String, message: String },

    /// Subscription handle not registered
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    // ==================
    // Write Errors
    // ==================
    /// Optimistic remote write failed
    #[error("Write to {table}/{row_id} failed: {message}")]
    WriteError {
        table: String,
        row_id: String,
        message: String,
    },

    /// Remote write did not resolve in time
    #[error("Write to {table}/{row_id} timed out after {timeout_ms}ms")]
    WriteTimeout {
        table: String,
        row_id: String,
        timeout_ms: u64,
    },

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable error code for logs and UI indicators
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ConnectionError(_) => "SYNC_CONNECTION_ERROR",
            SyncError::ReconnectError(_) => "SYNC_RECONNECT_ERROR",
            SyncError::NotInitialized => "SYNC_NOT_INITIALIZED",
            SyncError::SubscribeError { .. } => "SYNC_SUBSCRIBE_ERROR",
            SyncError::SubscriptionNotFound(_) => "SYNC_SUBSCRIPTION_NOT_FOUND",
            SyncError::WriteError { .. } => "SYNC_WRITE_ERROR",
            SyncError::WriteTimeout { .. } => "SYNC_WRITE_TIMEOUT",
            SyncError::ConfigError(_) => "SYNC_CONFIG_ERROR",
            SyncError::Internal(_) => "SYNC_INTERNAL_ERROR",
        }
    }

    /// Connection-level errors drive `SyncStatus::error` and reconnection
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionError(_) | SyncError::ReconnectError(_)
        )
    }

    pub(crate) fn lock_poisoned() -> Self {
        SyncError::Internal("Lock poisoned".into())
    }
}
