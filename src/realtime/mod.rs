//! # Storefront Realtime Sync
//!
//! Client-side synchronization engine keeping product and order state in
//! step with a backend that pushes row changes over a realtime channel.
//!
//! ## Architecture
//!
//! - **Connection**: one channel per engine, generation-tagged, reopened on
//!   reconnect with every live subscription replayed
//! - **Subscriptions**: one upstream subscription per key, shared by all of
//!   the key's callbacks
//! - **Optimistic writes**: local state first, remote write second, push
//!   echo classified as a confirmation
//! - **Network**: online/offline transitions drive reconnects
//! - **Status**: snapshot-only view for UI code
//!
//! The transport itself sits behind [`RealtimeTransport`].

pub mod callbacks;
pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod event;
pub mod network;
pub mod optimistic;
pub mod status;
pub mod subscription;
pub mod transport;

pub use callbacks::SyncCallbacks;
pub use config::{ReconnectPolicy, SyncConfig};
pub use engine::SyncEngine;
pub use errors::{SyncError, SyncResult};
pub use event::{ChangeEvent, EventOrigin, EventType, OrderStatusUpdate, StockUpdate};
pub use network::{spawn_network_watcher, NetworkStatus, NetworkWatcher};
pub use optimistic::{OptimisticCoordinator, PendingOptimisticWrite, Reconciliation};
pub use status::{EngineLifecycle, SyncStatus};
pub use subscription::{ResourceKind, SubscriptionHandle, SubscriptionKey, Topic, TopicFilter};
pub use transport::{
    ChannelHandle, ChannelListener, ChannelMessage, InMemoryTransport, RealtimeTransport,
    UpstreamHandle,
};
