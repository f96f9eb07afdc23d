//! # Subscription Registry
//!
//! Maps a `(resource kind, resource id)` key to the ordered callbacks
//! interested in it. Each key owns at most one upstream channel
//! subscription, shared by all of its callbacks.
//!
//! The registry itself never talks to the transport: the engine opens and
//! closes upstream subscriptions and records the outcome here.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::config::SyncConfig;
use super::errors::{SyncError, SyncResult};
use super::event::ChangeEvent;
use super::transport::UpstreamHandle;

/// Callback invoked for every event on a subscribed key
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Kind of resource a UI component can follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// All orders owned by one user
    UserOrders,
    /// Stock of a single product
    ProductStock,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::UserOrders => write!(f, "user_orders"),
            ResourceKind::ProductStock => write!(f, "product_stock"),
        }
    }
}

/// Identifies one logical interest stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub kind: ResourceKind,
    pub resource_id: String,
}

impl SubscriptionKey {
    pub fn new(kind: ResourceKind, resource_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
        }
    }

    pub fn user_orders(user_id: impl Into<String>) -> Self {
        Self::new(ResourceKind::UserOrders, user_id)
    }

    pub fn product_stock(product_id: impl Into<String>) -> Self {
        Self::new(ResourceKind::ProductStock, product_id)
    }

    /// Channel topic this key listens on
    pub fn topic(&self, config: &SyncConfig) -> Topic {
        match self.kind {
            ResourceKind::UserOrders => Topic::table(&config.orders_table).with_filter(
                TopicFilter::Column {
                    column: config.order_user_column.clone(),
                    value: self.resource_id.clone(),
                },
            ),
            ResourceKind::ProductStock => Topic::table(&config.products_table).with_filter(
                TopicFilter::RowId {
                    column: config.row_id_column.clone(),
                    value: self.resource_id.clone(),
                },
            ),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource_id)
    }
}

/// Row filter on a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicFilter {
    /// Match the changed row's primary key
    RowId { column: String, value: String },
    /// Match a column value in the new or old row image
    Column { column: String, value: String },
}

/// Channel topic: a table, optionally narrowed by one equality filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<TopicFilter>,
}

impl Topic {
    /// Whole-table topic in the public schema
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: TopicFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Check if an event belongs to this topic
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.schema != self.schema || event.table != self.table {
            return false;
        }

        match &self.filter {
            None => true,
            Some(TopicFilter::RowId { value, .. }) => &event.row_id == value,
            Some(TopicFilter::Column { column, value }) => {
                let field = event
                    .new_field(column)
                    .or_else(|| event.old_field(column));
                match field {
                    Some(serde_json::Value::String(s)) => s == value,
                    Some(other) => &other.to_string() == value,
                    None => false,
                }
            }
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "realtime:{}:{}", self.schema, self.table)?;
        match &self.filter {
            Some(TopicFilter::RowId { column, value })
            | Some(TopicFilter::Column { column, value }) => {
                write!(f, ":{}=eq.{}", column, value)
            }
            None => Ok(()),
        }
    }
}

/// Opaque handle for one registered callback
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    key: SubscriptionKey,
}

impl SubscriptionHandle {
    /// Key this callback is registered under
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

/// All callbacks for one key and the upstream subscription they share
struct SubscriptionEntry {
    topic: Topic,
    /// Registration order is delivery order
    callbacks: Vec<(u64, EventCallback)>,
    upstream: Option<UpstreamHandle>,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("topic", &self.topic)
            .field("callbacks", &self.callbacks.len())
            .field("upstream", &self.upstream)
            .finish()
    }
}

/// Result of registering a callback
#[derive(Debug)]
pub struct Registration {
    pub handle: SubscriptionHandle,
    /// The key has no upstream subscription yet
    pub needs_upstream: bool,
    pub topic: Topic,
}

/// An entry whose last callback was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedEntry {
    pub key: SubscriptionKey,
    pub upstream: Option<UpstreamHandle>,
}

/// Registry of live subscription entries
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Entries by key
    entries: RwLock<HashMap<SubscriptionKey, SubscriptionEntry>>,

    /// Key by upstream handle, for routing
    by_upstream: RwLock<HashMap<UpstreamHandle, SubscriptionKey>>,

    next_callback_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the entry for `key`, creating the entry if needed
    pub fn register(
        &self,
        key: SubscriptionKey,
        topic: Topic,
        callback: EventCallback,
    ) -> SyncResult<Registration> {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().map_err(|_| SyncError::lock_poisoned())?;

        let entry = entries.entry(key.clone()).or_insert_with(|| SubscriptionEntry {
            topic,
            callbacks: Vec::new(),
            upstream: None,
        });
        entry.callbacks.push((id, callback));

        Ok(Registration {
            handle: SubscriptionHandle { id, key },
            needs_upstream: entry.upstream.is_none(),
            topic: entry.topic.clone(),
        })
    }

    /// Record the upstream subscription for `key`.
    ///
    /// Returns `false` if the entry no longer exists; the caller then owns
    /// `upstream` and must close it.
    pub fn attach_upstream(&self, key: &SubscriptionKey, upstream: UpstreamHandle) -> SyncResult<bool> {
        let mut entries = self.entries.write().map_err(|_| SyncError::lock_poisoned())?;
        let mut by_upstream = self.by_upstream.write().map_err(|_| SyncError::lock_poisoned())?;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        if let Some(previous) = entry.upstream.replace(upstream) {
            by_upstream.remove(&previous);
        }
        by_upstream.insert(upstream, key.clone());
        Ok(true)
    }

    /// Remove one callback. When it was the last one for its key, the entry
    /// is removed and returned so the caller can close its upstream.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> SyncResult<Option<ClosedEntry>> {
        let mut entries = self.entries.write().map_err(|_| SyncError::lock_poisoned())?;

        let Some(entry) = entries.get_mut(&handle.key) else {
            return Err(SyncError::SubscriptionNotFound(handle.key.to_string()));
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|(id, _)| *id != handle.id);
        if entry.callbacks.len() == before {
            return Err(SyncError::SubscriptionNotFound(handle.key.to_string()));
        }
        if !entry.callbacks.is_empty() {
            return Ok(None);
        }

        let upstream = entries.remove(&handle.key).and_then(|e| e.upstream);
        if let Some(upstream) = upstream {
            let mut by_upstream = self.by_upstream.write().map_err(|_| SyncError::lock_poisoned())?;
            by_upstream.remove(&upstream);
        }

        Ok(Some(ClosedEntry {
            key: handle.key.clone(),
            upstream,
        }))
    }

    /// Callbacks for the entry owning `upstream`, in registration order
    pub fn callbacks_for(&self, upstream: &UpstreamHandle) -> Vec<EventCallback> {
        let key = match self.by_upstream.read() {
            Ok(by_upstream) => match by_upstream.get(upstream) {
                Some(key) => key.clone(),
                None => return Vec::new(),
            },
            Err(_) => return Vec::new(),
        };

        self.entries
            .read()
            .ok()
            .and_then(|entries| {
                entries
                    .get(&key)
                    .map(|e| e.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            })
            .unwrap_or_default()
    }

    /// Keys and topics of every live entry, for replay after reconnect
    pub fn live_entries(&self) -> Vec<(SubscriptionKey, Topic)> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, entry)| (key.clone(), entry.topic.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget every upstream handle while keeping the entries and callbacks.
    /// Returns the handles that were attached.
    pub fn detach_all(&self) -> Vec<UpstreamHandle> {
        let mut detached = Vec::new();
        if let Ok(mut entries) = self.entries.write() {
            for entry in entries.values_mut() {
                if let Some(upstream) = entry.upstream.take() {
                    detached.push(upstream);
                }
            }
        }
        if let Ok(mut by_upstream) = self.by_upstream.write() {
            by_upstream.clear();
        }
        detached
    }

    /// Remove every entry. Returns the upstream handles that were attached.
    pub fn drain(&self) -> Vec<UpstreamHandle> {
        let drained: Vec<UpstreamHandle> = match self.entries.write() {
            Ok(mut entries) => entries.drain().filter_map(|(_, e)| e.upstream).collect(),
            Err(_) => Vec::new(),
        };
        if let Ok(mut by_upstream) = self.by_upstream.write() {
            by_upstream.clear();
        }
        drained
    }

    /// Upstream handle currently attached for a key
    pub fn upstream_for(&self, key: &SubscriptionKey) -> Option<UpstreamHandle> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).and_then(|e| e.upstream))
    }

    /// Number of callbacks registered for a key
    pub fn callback_count(&self, key: &SubscriptionKey) -> usize {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).map(|e| e.callbacks.len()))
            .unwrap_or(0)
    }

    /// Number of live entries (distinct keys)
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn noop() -> EventCallback {
        Arc::new(|_| {})
    }

    fn upstream(id: u64) -> UpstreamHandle {
        UpstreamHandle { id, generation: 1 }
    }

    #[test]
    fn test_topic_strings() {
        let config = SyncConfig::default();
        assert_eq!(
            SubscriptionKey::product_stock("p1").topic(&config).to_string(),
            "realtime:public:products:id=eq.p1"
        );
        assert_eq!(
            SubscriptionKey::user_orders("u7").topic(&config).to_string(),
            "realtime:public:orders:user_id=eq.u7"
        );
        assert_eq!(Topic::table("orders").to_string(), "realtime:public:orders");
    }

    #[test]
    fn test_topic_matching() {
        let config = SyncConfig::default();
        let stock = SubscriptionKey::product_stock("p1").topic(&config);
        let orders = SubscriptionKey::user_orders("u7").topic(&config);

        let p1 = ChangeEvent::update("products", "p1", json!({}), json!({"stock_quantity": 3}));
        let p2 = ChangeEvent::update("products", "p2", json!({}), json!({"stock_quantity": 3}));
        assert!(stock.matches(&p1));
        assert!(!stock.matches(&p2));
        assert!(Topic::table("products").matches(&p2));

        let mine = ChangeEvent::insert("orders", "o1", json!({"user_id": "u7"}));
        let theirs = ChangeEvent::insert("orders", "o2", json!({"user_id": "u8"}));
        let deleted = ChangeEvent::delete("orders", "o3", json!({"user_id": "u7"}));
        assert!(orders.matches(&mine));
        assert!(!orders.matches(&theirs));
        assert!(orders.matches(&deleted));
        assert!(!orders.matches(&p1));
    }

    #[test]
    fn test_numeric_column_filter() {
        let topic = Topic::table("orders").with_filter(TopicFilter::Column {
            column: "user_id".into(),
            value: "42".into(),
        });
        let event = ChangeEvent::insert("orders", "o1", json!({"user_id": 42}));
        assert!(topic.matches(&event));
    }

    #[test]
    fn test_register_shares_entry() {
        let registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::product_stock("p1");
        let topic = key.topic(&SyncConfig::default());

        let first = registry.register(key.clone(), topic.clone(), noop()).unwrap();
        assert!(first.needs_upstream);
        registry.attach_upstream(&key, upstream(1)).unwrap();

        let second = registry.register(key.clone(), topic, noop()).unwrap();
        assert!(!second.needs_upstream);
        assert_ne!(first.handle, second.handle);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.callback_count(&key), 2);
    }

    #[test]
    fn test_callbacks_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::user_orders("u1");
        let topic = key.topic(&SyncConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            registry
                .register(key.clone(), topic.clone(), Arc::new(move |_| order.lock().unwrap().push(label)))
                .unwrap();
        }
        registry.attach_upstream(&key, upstream(9)).unwrap();

        let event = ChangeEvent::insert("orders", "o1", json!({"user_id": "u1"}));
        for cb in registry.callbacks_for(&upstream(9)) {
            cb(&event);
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_last_unregister_closes_entry() {
        let registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::product_stock("p1");
        let topic = key.topic(&SyncConfig::default());

        let a = registry.register(key.clone(), topic.clone(), noop()).unwrap().handle;
        let b = registry.register(key.clone(), topic, noop()).unwrap().handle;
        registry.attach_upstream(&key, upstream(3)).unwrap();

        assert_eq!(registry.unregister(&a).unwrap(), None);
        let closed = registry.unregister(&b).unwrap().unwrap();
        assert_eq!(closed.upstream, Some(upstream(3)));
        assert!(registry.is_empty());
        assert!(registry.callbacks_for(&upstream(3)).is_empty());

        assert!(matches!(
            registry.unregister(&b),
            Err(SyncError::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn test_detach_keeps_entries() {
        let registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::product_stock("p1");
        registry
            .register(key.clone(), key.topic(&SyncConfig::default()), noop())
            .unwrap();
        registry.attach_upstream(&key, upstream(5)).unwrap();

        assert_eq!(registry.detach_all(), vec![upstream(5)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.upstream_for(&key), None);
        assert_eq!(registry.live_entries().len(), 1);
    }

    #[test]
    fn test_attach_to_missing_entry() {
        let registry = SubscriptionRegistry::new();
        let key = SubscriptionKey::product_stock("gone");
        assert!(!registry.attach_upstream(&key, upstream(1)).unwrap());
    }

    #[test]
    fn test_drain() {
        let registry = SubscriptionRegistry::new();
        let config = SyncConfig::default();
        for (i, id) in ["p1", "p2", "p3"].iter().enumerate() {
            let key = SubscriptionKey::product_stock(*id);
            registry.register(key.clone(), key.topic(&config), noop()).unwrap();
            if i < 2 {
                registry.attach_upstream(&key, upstream(i as u64)).unwrap();
            }
        }

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
