//! # In-Memory Transport
//!
//! Deterministic transport that keeps rows and subscriptions in process.
//! Events pushed with [`InMemoryTransport::push`] are delivered
//! synchronously to the open channel's listener, once per matching
//! upstream subscription. Used by the test suites and the `simulate`
//! command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tokio::sync::watch;

use super::{
    ChannelHandle, ChannelListener, ChannelMessage, RealtimeTransport, TransportFuture,
    UpstreamHandle,
};
use crate::realtime::errors::SyncError;
use crate::realtime::event::ChangeEvent;
use crate::realtime::subscription::Topic;

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU64,
    closes: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    writes: AtomicU64,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    channel: Option<(ChannelHandle, ChannelListener)>,
    upstreams: Vec<(UpstreamHandle, Topic)>,
    rows: HashMap<(String, String), Map<String, Value>>,
    failing_opens: u32,
    open_failure: String,
    fail_next_subscribe: Option<String>,
    fail_next_write: Option<String>,
    echo_writes: bool,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process realtime transport
pub struct InMemoryTransport {
    state: Mutex<MemoryState>,
    counters: Counters,
    /// `true` while writes are held
    write_gate: watch::Sender<bool>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("counters", &self.counters)
            .field("open", &self.is_open())
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (write_gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(MemoryState::default()),
            counters: Counters::default(),
            write_gate,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    // ==================
    // Fault injection
    // ==================

    /// Fail the next `count` open calls
    pub fn fail_opens(&self, count: u32, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| {
            s.failing_opens = count;
            s.open_failure = message;
        });
    }

    /// Fail the next open call
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.fail_opens(1, message);
    }

    /// Fail the next subscribe call
    pub fn fail_next_subscribe(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.fail_next_subscribe = Some(message));
    }

    /// Fail the next write call
    pub fn fail_next_write(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| s.fail_next_write = Some(message));
    }

    /// Keep writes pending until [`release_writes`](Self::release_writes)
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.write_gate.send_replace(false);
    }

    /// Push an UPDATE event for every successful write
    pub fn set_echo_writes(&self, echo: bool) {
        self.with_state(|s| s.echo_writes = echo);
    }

    // ==================
    // Server-side simulation
    // ==================

    /// Deliver an event to every upstream whose topic matches it.
    /// Returns the number of deliveries.
    pub fn push(&self, event: ChangeEvent) -> usize {
        let targets = self.with_state(|s| {
            let Some((_, listener)) = &s.channel else {
                return None;
            };
            let upstreams: Vec<UpstreamHandle> = s
                .upstreams
                .iter()
                .filter(|(_, topic)| topic.matches(&event))
                .map(|(handle, _)| *handle)
                .collect();
            Some((listener.clone(), upstreams))
        });

        let Some(Some((listener, upstreams))) = targets else {
            return 0;
        };
        for upstream in &upstreams {
            listener(ChannelMessage::Change {
                upstream: *upstream,
                event: event.clone(),
            });
        }
        upstreams.len()
    }

    /// Simulate the transport dropping: the listener receives an error and
    /// every subscription is lost.
    pub fn drop_connection(&self, message: impl Into<String>) {
        let dropped = self
            .with_state(|s| {
                s.upstreams.clear();
                s.channel.take()
            })
            .flatten();
        if let Some((channel, listener)) = dropped {
            listener(ChannelMessage::Error {
                channel,
                message: message.into(),
            });
        }
    }

    /// Simulate the remote side closing the channel
    pub fn close_remote(&self) {
        let closed = self
            .with_state(|s| {
                s.upstreams.clear();
                s.channel.take()
            })
            .flatten();
        if let Some((channel, listener)) = closed {
            listener(ChannelMessage::Closed { channel });
        }
    }

    /// Seed a stored row
    pub fn set_row(&self, table: &str, row_id: &str, values: Value) {
        if let Value::Object(map) = values {
            self.with_state(|s| {
                s.rows.insert((table.to_string(), row_id.to_string()), map);
            });
        }
    }

    /// Stored row, if any
    pub fn row(&self, table: &str, row_id: &str) -> Option<Value> {
        self.with_state(|s| {
            s.rows
                .get(&(table.to_string(), row_id.to_string()))
                .cloned()
                .map(Value::Object)
        })
        .flatten()
    }

    // ==================
    // Inspection
    // ==================

    pub fn open_count(&self) -> u64 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> u64 {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> u64 {
        self.counters.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.counters.writes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.with_state(|s| s.channel.is_some()).unwrap_or(false)
    }

    /// Upstream subscriptions live on the open channel
    pub fn active_subscriptions(&self) -> usize {
        self.with_state(|s| s.upstreams.len()).unwrap_or(0)
    }

    /// Live upstream subscriptions whose topic string equals `topic`
    pub fn subscriptions_for(&self, topic: &str) -> usize {
        self.with_state(|s| {
            s.upstreams
                .iter()
                .filter(|(_, t)| t.to_string() == topic)
                .count()
        })
        .unwrap_or(0)
    }
}

impl RealtimeTransport for InMemoryTransport {
    fn open(&self, generation: u64, listener: ChannelListener) -> TransportFuture<'_, ChannelHandle> {
        Box::pin(async move {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;

            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(SyncError::ConnectionError(state.open_failure.clone()));
            }

            // A new channel replaces any previous one
            state.upstreams.clear();
            let handle = ChannelHandle {
                id: state.next_id(),
                generation,
            };
            state.channel = Some((handle, listener));
            Ok(handle)
        })
    }

    fn close(&self, channel: ChannelHandle) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;
            if matches!(&state.channel, Some((open, _)) if *open == channel) {
                state.channel = None;
                state.upstreams.clear();
            }
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: ChannelHandle,
        topic: &'a Topic,
    ) -> TransportFuture<'a, UpstreamHandle> {
        Box::pin(async move {
            self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;

            if let Some(message) = state.fail_next_subscribe.take() {
                return Err(SyncError::SubscribeError {
                    topic: topic.to_string(),
                    message,
                });
            }
            if !matches!(&state.channel, Some((open, _)) if *open == channel) {
                return Err(SyncError::SubscribeError {
                    topic: topic.to_string(),
                    message: "channel not open".to_string(),
                });
            }

            let handle = UpstreamHandle {
                id: state.next_id(),
                generation: channel.generation,
            };
            state.upstreams.push((handle, topic.clone()));
            Ok(handle)
        })
    }

    fn unsubscribe(&self, upstream: UpstreamHandle) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.counters.unsubscribes.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;
            state.upstreams.retain(|(handle, _)| *handle != upstream);
            Ok(())
        })
    }

    fn write<'a>(
        &'a self,
        table: &'a str,
        row_id: &'a str,
        updates: Value,
    ) -> TransportFuture<'a, Value> {
        Box::pin(async move {
            self.counters.writes.fetch_add(1, Ordering::SeqCst);

            let mut gate = self.write_gate.subscribe();
            if gate.wait_for(|held| !*held).await.is_err() {
                return Err(SyncError::Internal("write gate closed".into()));
            }

            let (row, echo) = {
                let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;

                if let Some(message) = state.fail_next_write.take() {
                    return Err(SyncError::WriteError {
                        table: table.to_string(),
                        row_id: row_id.to_string(),
                        message,
                    });
                }
                let Value::Object(updates) = updates else {
                    return Err(SyncError::WriteError {
                        table: table.to_string(),
                        row_id: row_id.to_string(),
                        message: "updates must be a JSON object".to_string(),
                    });
                };

                let echo_writes = state.echo_writes;
                let stored = state
                    .rows
                    .entry((table.to_string(), row_id.to_string()))
                    .or_default();
                let old = Value::Object(stored.clone());
                stored.extend(updates);
                let new = Value::Object(stored.clone());

                let echo = echo_writes.then(|| ChangeEvent::update(table, row_id, old, new.clone()));
                (new, echo)
            };

            if let Some(event) = echo {
                self.push(event);
            }
            Ok(row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn collecting_listener() -> (ChannelListener, Arc<Mutex<Vec<ChannelMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: ChannelListener = Arc::new(move |msg| sink.lock().unwrap().push(msg));
        (listener, seen)
    }

    #[tokio::test]
    async fn test_open_subscribe_push() {
        let transport = InMemoryTransport::new();
        let (listener, seen) = collecting_listener();

        let channel = transport.open(1, listener).await.unwrap();
        let topic = Topic::table("products");
        let upstream = transport.subscribe(channel, &topic).await.unwrap();
        assert_eq!(upstream.generation, 1);

        let delivered = transport.push(ChangeEvent::insert("products", "p1", json!({})));
        assert_eq!(delivered, 1);
        assert_eq!(transport.push(ChangeEvent::insert("orders", "o1", json!({}))), 0);

        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0], ChannelMessage::Change { upstream: u, .. } if *u == upstream));
    }

    #[tokio::test]
    async fn test_subscribe_requires_open_channel() {
        let transport = InMemoryTransport::new();
        let (listener, _) = collecting_listener();
        let channel = transport.open(1, listener).await.unwrap();
        transport.close(channel).await.unwrap();

        let result = transport.subscribe(channel, &Topic::table("orders")).await;
        assert!(matches!(result, Err(SyncError::SubscribeError { .. })));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let transport = InMemoryTransport::new();
        let (listener, _) = collecting_listener();

        transport.fail_opens(2, "refused");
        assert!(transport.open(1, listener.clone()).await.is_err());
        assert!(transport.open(2, listener.clone()).await.is_err());
        let channel = transport.open(3, listener).await.unwrap();
        assert_eq!(transport.open_count(), 3);

        transport.fail_next_subscribe("denied");
        assert!(transport.subscribe(channel, &Topic::table("orders")).await.is_err());
        assert!(transport.subscribe(channel, &Topic::table("orders")).await.is_ok());

        transport.fail_next_write("rejected");
        assert!(transport.write("orders", "o1", json!({"status": "x"})).await.is_err());
    }

    #[tokio::test]
    async fn test_write_merges_and_echoes() {
        let transport = InMemoryTransport::new();
        let (listener, seen) = collecting_listener();
        let channel = transport.open(1, listener).await.unwrap();
        transport.subscribe(channel, &Topic::table("products")).await.unwrap();

        transport.set_row("products", "p1", json!({"id": "p1", "stock_quantity": 5}));
        transport.set_echo_writes(true);

        let row = transport
            .write("products", "p1", json!({"stock_quantity": 4}))
            .await
            .unwrap();
        assert_eq!(row, json!({"id": "p1", "stock_quantity": 4}));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            ChannelMessage::Change { event, .. } => {
                assert_eq!(event.old_field("stock_quantity"), Some(&json!(5)));
                assert_eq!(event.new_field("stock_quantity"), Some(&json!(4)));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_connection_reports_error() {
        let transport = InMemoryTransport::new();
        let (listener, seen) = collecting_listener();
        let channel = transport.open(4, listener).await.unwrap();
        transport.subscribe(channel, &Topic::table("orders")).await.unwrap();

        transport.drop_connection("socket reset");
        assert_eq!(transport.active_subscriptions(), 0);
        assert!(matches!(
            &seen.lock().unwrap()[0],
            ChannelMessage::Error { channel: c, .. } if c.generation == 4
        ));
    }
}
