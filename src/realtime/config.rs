//! Sync Engine Configuration
//!
//! Table/column naming for the storefront schema, write and confirmation
//! timing, and the reconnect backoff policy.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{SyncError, SyncResult};
use crate::observability::Severity;

/// Backoff policy for reconnect attempts driven by regained connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts per connectivity regain (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: 250ms)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay (default: 30s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Scale each delay by a random factor in [0.5, 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before attempt number `attempt` (0-based). The first
    /// attempt runs immediately.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(20);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        let millis = if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
            (base as f64 * factor) as u64
        } else {
            base
        };
        Duration::from_millis(millis)
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Products table (default: "products")
    #[serde(default = "default_products_table")]
    pub products_table: String,

    /// Orders table (default: "orders")
    #[serde(default = "default_orders_table")]
    pub orders_table: String,

    /// Primary key column shared by both tables (default: "id")
    #[serde(default = "default_row_id_column")]
    pub row_id_column: String,

    /// Stock column on products (default: "stock_quantity")
    #[serde(default = "default_stock_column")]
    pub stock_column: String,

    /// Status column on orders (default: "status")
    #[serde(default = "default_status_column")]
    pub status_column: String,

    /// Owning-user column on orders (default: "user_id")
    #[serde(default = "default_order_user_column")]
    pub order_user_column: String,

    /// Bound on a single optimistic remote write (default: 10s)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How far a push event's commit time may precede the write's submission
    /// and still confirm it (default: 5s)
    #[serde(default = "default_confirmation_window_ms")]
    pub confirmation_window_ms: u64,

    /// Confirmed echoes remembered to classify duplicate deliveries (default: 64)
    #[serde(default = "default_recent_confirmation_capacity")]
    pub recent_confirmation_capacity: usize,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Minimum log severity (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_products_table() -> String {
    "products".to_string()
}

fn default_orders_table() -> String {
    "orders".to_string()
}

fn default_row_id_column() -> String {
    "id".to_string()
}

fn default_stock_column() -> String {
    "stock_quantity".to_string()
}

fn default_status_column() -> String {
    "status".to_string()
}

fn default_order_user_column() -> String {
    "user_id".to_string()
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_confirmation_window_ms() -> u64 {
    5_000
}

fn default_recent_confirmation_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            products_table: default_products_table(),
            orders_table: default_orders_table(),
            row_id_column: default_row_id_column(),
            stock_column: default_stock_column(),
            status_column: default_status_column(),
            order_user_column: default_order_user_column(),
            write_timeout_ms: default_write_timeout_ms(),
            confirmation_window_ms: default_confirmation_window_ms(),
            recent_confirmation_capacity: default_recent_confirmation_capacity(),
            reconnect: ReconnectPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON config document
    pub fn from_json(content: &str) -> SyncResult<Self> {
        let config: SyncConfig = serde_json::from_str(content)
            .map_err(|e| SyncError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        let names = [
            ("products_table", &self.products_table),
            ("orders_table", &self.orders_table),
            ("row_id_column", &self.row_id_column),
            ("stock_column", &self.stock_column),
            ("status_column", &self.status_column),
            ("order_user_column", &self.order_user_column),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(SyncError::ConfigError(format!("{} must not be empty", field)));
            }
        }

        if self.products_table == self.orders_table {
            return Err(SyncError::ConfigError(
                "products_table and orders_table must differ".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(SyncError::ConfigError("write_timeout_ms must be > 0".into()));
        }
        if self.recent_confirmation_capacity == 0 {
            return Err(SyncError::ConfigError(
                "recent_confirmation_capacity must be > 0".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SyncError::ConfigError(
                "reconnect.max_attempts must be > 0".into(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(SyncError::ConfigError(
                "reconnect.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        self.severity()?;
        Ok(())
    }

    /// Parsed `log_level`
    pub fn severity(&self) -> SyncResult<Severity> {
        Severity::parse(&self.log_level).ok_or_else(|| {
            SyncError::ConfigError(format!("Unknown log_level: {}", self.log_level))
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn confirmation_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.confirmation_window_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.products_table, "products");
        assert_eq!(config.stock_column, "stock_quantity");
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SyncConfig::from_json(r#"{"write_timeout_ms": 500, "reconnect": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.write_timeout_ms, 500);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.initial_backoff_ms, 250);
        assert_eq!(config.orders_table, "orders");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(SyncConfig::from_json(r#"{"write_timeout_ms": 0}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"stock_column": " "}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"orders_table": "products"}"#).is_err());
        assert!(SyncConfig::from_json(r#"{"log_level": "loud"}"#).is_err());
        assert!(SyncConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"products_table": "catalog_items"}}"#).unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.products_table, "catalog_items");
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncConfig::load(Path::new("/nonexistent/sync.json")).unwrap_err();
        assert!(matches!(err, SyncError::ConfigError(_)));
    }

    #[test]
    fn test_backoff_growth_without_jitter() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = ReconnectPolicy {
            jitter: true,
            initial_backoff_ms: 1000,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(1000));
        }
    }
}
