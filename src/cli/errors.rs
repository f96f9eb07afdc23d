//! CLI-specific error types

use std::io;

use thiserror::Error;

use crate::realtime::SyncError;

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    /// Config file missing, malformed or invalid
    #[error("{0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The engine returned an error or ended in an unexpected state
    #[error("Simulation failed: {0}")]
    Simulation(String),
}

impl CliError {
    /// Stable code printed in error responses
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "SYNC_CLI_CONFIG_ERROR",
            CliError::Io(_) | CliError::Json(_) => "SYNC_CLI_IO_ERROR",
            CliError::Simulation(_) => "SYNC_CLI_SIMULATION_FAILED",
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::ConfigError(msg) => CliError::Config(msg),
            other => CliError::Simulation(format!("{} ({})", other, other.code())),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_mapping() {
        let err: CliError = SyncError::ConfigError("bad".into()).into();
        assert!(matches!(err, CliError::Config(_)));
        assert_eq!(err.code(), "SYNC_CLI_CONFIG_ERROR");

        let err: CliError = SyncError::NotInitialized.into();
        assert_eq!(err.code(), "SYNC_CLI_SIMULATION_FAILED");
        assert!(err.to_string().contains("SYNC_NOT_INITIALIZED"));
    }

    #[test]
    fn test_io_errors_share_a_code() {
        let err: CliError = io::Error::new(io::ErrorKind::BrokenPipe, "closed").into();
        assert_eq!(err.code(), "SYNC_CLI_IO_ERROR");
    }
}
