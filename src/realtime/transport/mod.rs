//! # Realtime Transport Boundary
//!
//! The managed publish/subscribe channel the engine consumes. The engine
//! owns all retry and reconnect logic; a transport only opens and closes
//! one channel, (un)subscribes topics on it, and performs remote writes.
//!
//! Handles carry the connection generation they were issued under so that
//! events and status reports from a superseded channel can be discarded.

pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::errors::SyncResult;
use super::event::ChangeEvent;
use super::subscription::Topic;

pub use memory::InMemoryTransport;

/// Boxed future returned by transport operations
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send + 'a>>;

/// One open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub generation: u64,
}

/// One topic subscription on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpstreamHandle {
    pub id: u64,
    pub generation: u64,
}

/// Message pushed by the transport into the engine
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// Row change delivered on an upstream subscription
    Change {
        upstream: UpstreamHandle,
        event: ChangeEvent,
    },
    /// Channel-level failure
    Error { channel: ChannelHandle, message: String },
    /// Channel closed by the remote side
    Closed { channel: ChannelHandle },
}

/// Listener registered with `open`; may be called from any task
pub type ChannelListener = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// The realtime channel primitive
pub trait RealtimeTransport: Send + Sync {
    /// Open the channel. Every message for it goes to `listener`.
    fn open(&self, generation: u64, listener: ChannelListener) -> TransportFuture<'_, ChannelHandle>;

    /// Close the channel and every subscription on it
    fn close(&self, channel: ChannelHandle) -> TransportFuture<'_, ()>;

    /// Subscribe to a topic on an open channel
    fn subscribe<'a>(
        &'a self,
        channel: ChannelHandle,
        topic: &'a Topic,
    ) -> TransportFuture<'a, UpstreamHandle>;

    /// Drop a topic subscription
    fn unsubscribe(&self, upstream: UpstreamHandle) -> TransportFuture<'_, ()>;

    /// Apply a partial update to a row; resolves with the stored row
    fn write<'a>(
        &'a self,
        table: &'a str,
        row_id: &'a str,
        updates: Value,
    ) -> TransportFuture<'a, Value>;
}
