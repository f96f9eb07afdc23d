//! # Change Events
//!
//! Row-change notifications pushed by the realtime channel, plus the typed
//! projections handed to storefront callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::SyncError;

/// Type of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// New row inserted
    Insert,
    /// Existing row updated
    Update,
    /// Row deleted
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(EventType::Insert),
            "UPDATE" => Ok(EventType::Update),
            "DELETE" => Ok(EventType::Delete),
            other => Err(SyncError::Internal(format!("Unknown event type: {}", other))),
        }
    }
}

/// Where a delivered event came from, relative to this client's pending writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A change made elsewhere (another tab, another client, the admin console)
    #[default]
    Remote,
    /// Server echo of an optimistic write this engine already applied locally
    LocalConfirmation,
}

/// Row change delivered by the realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event type
    pub event_type: EventType,

    /// Schema name (default: "public")
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Table name
    pub table: String,

    /// Primary key of the changed row
    pub row_id: String,

    /// New row values (for INSERT/UPDATE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Value>,

    /// Old row values (for UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Value>,

    /// Server commit time
    pub commit_timestamp: DateTime<Utc>,

    /// Set by the engine during reconciliation, never sent on the wire
    #[serde(skip)]
    pub origin: EventOrigin,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(table: impl Into<String>, row_id: impl Into<String>, values: Value) -> Self {
        Self {
            event_type: EventType::Insert,
            schema: default_schema(),
            table: table.into(),
            row_id: row_id.into(),
            new_values: Some(values),
            old_values: None,
            commit_timestamp: Utc::now(),
            origin: EventOrigin::Remote,
        }
    }

    /// Create an UPDATE event
    pub fn update(
        table: impl Into<String>,
        row_id: impl Into<String>,
        old_values: Value,
        new_values: Value,
    ) -> Self {
        Self {
            event_type: EventType::Update,
            schema: default_schema(),
            table: table.into(),
            row_id: row_id.into(),
            new_values: Some(new_values),
            old_values: Some(old_values),
            commit_timestamp: Utc::now(),
            origin: EventOrigin::Remote,
        }
    }

    /// Create a DELETE event
    pub fn delete(table: impl Into<String>, row_id: impl Into<String>, values: Value) -> Self {
        Self {
            event_type: EventType::Delete,
            schema: default_schema(),
            table: table.into(),
            row_id: row_id.into(),
            new_values: None,
            old_values: Some(values),
            commit_timestamp: Utc::now(),
            origin: EventOrigin::Remote,
        }
    }

    /// Override the commit timestamp
    pub fn at(mut self, commit_timestamp: DateTime<Utc>) -> Self {
        self.commit_timestamp = commit_timestamp;
        self
    }

    /// Value of a column in the new row image
    pub fn new_field(&self, column: &str) -> Option<&Value> {
        self.new_values.as_ref().and_then(|v| v.get(column))
    }

    /// Value of a column in the old row image
    pub fn old_field(&self, column: &str) -> Option<&Value> {
        self.old_values.as_ref().and_then(|v| v.get(column))
    }

    /// Whether `column` is present in the new image and differs from the old one.
    /// Old images that omit the column count as a change.
    pub fn column_changed(&self, column: &str) -> bool {
        match (self.new_field(column), self.old_field(column)) {
            (Some(new), Some(old)) => new != old,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Stock level change for a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockUpdate {
    pub product_id: String,
    pub stock_quantity: i64,
    pub origin: EventOrigin,
}

impl StockUpdate {
    /// Project a product change onto its stock column, if that column changed
    pub fn from_event(event: &ChangeEvent, stock_column: &str) -> Option<Self> {
        if !event.column_changed(stock_column) {
            return None;
        }
        let stock_quantity = event.new_field(stock_column)?.as_i64()?;
        Some(Self {
            product_id: event.row_id.clone(),
            stock_quantity,
            origin: event.origin,
        })
    }
}

/// Status change for an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    pub order_id: String,
    pub status: String,
    pub origin: EventOrigin,
}

impl OrderStatusUpdate {
    /// Project an order change onto its status column, if that column changed
    pub fn from_event(event: &ChangeEvent, status_column: &str) -> Option<Self> {
        if !event.column_changed(status_column) {
            return None;
        }
        let status = event.new_field(status_column)?.as_str()?.to_string();
        Some(Self {
            order_id: event.row_id.clone(),
            status,
            origin: event.origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Insert.to_string(), "INSERT");
        assert_eq!(EventType::Update.to_string(), "UPDATE");
        assert_eq!(EventType::Delete.to_string(), "DELETE");
        assert_eq!("UPDATE".parse::<EventType>().unwrap(), EventType::Update);
        assert!("UPSERT".parse::<EventType>().is_err());
    }

    #[test]
    fn test_update_event() {
        let event = ChangeEvent::update(
            "products",
            "p1",
            json!({"id": "p1", "stock_quantity": 5}),
            json!({"id": "p1", "stock_quantity": 4}),
        );

        assert_eq!(event.event_type, EventType::Update);
        assert_eq!(event.origin, EventOrigin::Remote);
        assert!(event.column_changed("stock_quantity"));
        assert!(!event.column_changed("id"));
    }

    #[test]
    fn test_delete_has_no_new_image() {
        let event = ChangeEvent::delete("orders", "o1", json!({"id": "o1"}));
        assert!(event.new_values.is_none());
        assert!(!event.column_changed("status"));
    }

    #[test]
    fn test_stock_projection() {
        let event = ChangeEvent::update(
            "products",
            "p1",
            json!({"stock_quantity": 5}),
            json!({"stock_quantity": 4, "name": "Mug"}),
        );
        let update = StockUpdate::from_event(&event, "stock_quantity").unwrap();
        assert_eq!(update.product_id, "p1");
        assert_eq!(update.stock_quantity, 4);

        let rename = ChangeEvent::update(
            "products",
            "p1",
            json!({"stock_quantity": 4, "name": "Mug"}),
            json!({"stock_quantity": 4, "name": "Cup"}),
        );
        assert!(StockUpdate::from_event(&rename, "stock_quantity").is_none());
    }

    #[test]
    fn test_order_status_projection() {
        let event = ChangeEvent::insert("orders", "o9", json!({"status": "pending"}));
        let update = OrderStatusUpdate::from_event(&event, "status").unwrap();
        assert_eq!(update.order_id, "o9");
        assert_eq!(update.status, "pending");
    }
}
