//! # Connection Manager
//!
//! Owns the single logical channel to the realtime transport.
//!
//! Every operation that opens, closes or subscribes on the channel runs
//! while holding the [`ConnectionSlot`] gate, so a subscribe issued during a
//! reconnect waits for the reconnect to settle and then targets the new
//! channel.
//!
//! Each open starts a new connection generation. A channel that fails, or
//! that the engine closes, has its generation retired; anything still
//! tagged with a retired generation is stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use super::config::SyncConfig;
use super::errors::{SyncError, SyncResult};
use super::subscription::Topic;
use super::transport::{ChannelHandle, ChannelListener, RealtimeTransport, UpstreamHandle};
use crate::observability::{log_event_with_fields, Event, Logger};

/// Table-wide listener opened with every channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultStream {
    Products,
    Orders,
}

/// State guarded by the connection gate
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    channel: Option<ChannelHandle>,
}

impl ConnectionSlot {
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channel
    }
}

/// Connection Manager
pub struct ConnectionManager {
    transport: Arc<dyn RealtimeTransport>,
    slot: Mutex<ConnectionSlot>,
    generation: AtomicU64,
    default_topics: Vec<(DefaultStream, Topic)>,
    /// Default listener upstreams of the current channel
    default_routes: RwLock<HashMap<UpstreamHandle, DefaultStream>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("generation", &self.generation())
            .field("default_topics", &self.default_topics)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: &SyncConfig) -> Self {
        Self {
            transport,
            slot: Mutex::new(ConnectionSlot::default()),
            generation: AtomicU64::new(0),
            default_topics: vec![
                (DefaultStream::Products, Topic::table(&config.products_table)),
                (DefaultStream::Orders, Topic::table(&config.orders_table)),
            ],
            default_routes: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire the connection gate
    pub async fn lock(&self) -> MutexGuard<'_, ConnectionSlot> {
        self.slot.lock().await
    }

    /// Current connection generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Retire `generation` if it is still current. Returns false when it was
    /// already superseded.
    pub fn retire(&self, generation: u64) -> bool {
        self.generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// True when the slot holds a channel of the current generation
    pub fn is_live(&self, slot: &ConnectionSlot) -> bool {
        slot.channel
            .is_some_and(|channel| self.is_current(channel.generation))
    }

    /// Open a fresh channel, replacing any previous one, and attach the
    /// default table listeners.
    pub async fn open(
        &self,
        slot: &mut ConnectionSlot,
        listener: ChannelListener,
    ) -> SyncResult<ChannelHandle> {
        self.close(slot).await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = self.transport.open(generation, listener).await?;
        slot.channel = Some(channel);

        for (stream, topic) in &self.default_topics {
            match self.transport.subscribe(channel, topic).await {
                Ok(upstream) => {
                    self.default_routes
                        .write()
                        .map_err(|_| SyncError::lock_poisoned())?
                        .insert(upstream, *stream);
                }
                Err(e) => {
                    self.close(slot).await;
                    return Err(SyncError::ConnectionError(format!(
                        "Default listener for {} failed: {}",
                        topic, e
                    )));
                }
            }
        }

        Ok(channel)
    }

    /// Close the current channel, if any. The transport drops every
    /// subscription on it.
    pub async fn close(&self, slot: &mut ConnectionSlot) {
        let Some(channel) = slot.channel.take() else {
            return;
        };
        self.retire(channel.generation);
        self.clear_default_routes();

        let generation = channel.generation.to_string();
        if let Err(e) = self.transport.close(channel).await {
            Logger::warn(
                "CHANNEL_CLOSE_FAILED",
                &[("generation", &generation), ("error", &e.to_string())],
            );
        }
        log_event_with_fields(Event::ChannelClosed, &[("generation", &generation)]);
    }

    /// Subscribe `topic` on the live channel. Returns `None` when no live
    /// channel exists; the caller attaches it on the next open.
    pub async fn subscribe(
        &self,
        slot: &ConnectionSlot,
        topic: &Topic,
    ) -> SyncResult<Option<UpstreamHandle>> {
        match slot.channel {
            Some(channel) if self.is_current(channel.generation) => {
                self.transport.subscribe(channel, topic).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    pub async fn unsubscribe(&self, upstream: UpstreamHandle) -> SyncResult<()> {
        self.transport.unsubscribe(upstream).await
    }

    pub async fn write(&self, table: &str, row_id: &str, updates: Value) -> SyncResult<Value> {
        self.transport.write(table, row_id, updates).await
    }

    /// Default stream an upstream belongs to, if any
    pub fn default_stream(&self, upstream: &UpstreamHandle) -> Option<DefaultStream> {
        self.default_routes
            .read()
            .ok()
            .and_then(|routes| routes.get(upstream).copied())
    }

    pub fn clear_default_routes(&self) {
        if let Ok(mut routes) = self.default_routes.write() {
            routes.clear();
        }
    }
}
