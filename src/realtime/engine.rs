//! # Sync Engine
//!
//! The public face of the realtime layer. Owns one of each component and
//! wires them together:
//!
//! - [`ConnectionManager`] holds the channel and the connection gate
//! - [`SubscriptionRegistry`] fans events out per key
//! - [`OptimisticCoordinator`] tracks local writes awaiting the server
//! - [`NetworkWatcher`] drives reconnects on regained connectivity
//! - [`StatusCell`] backs `get_sync_status`
//!
//! Transport messages arrive through a listener holding a weak reference
//! to the engine, so dropping the last `Arc<SyncEngine>` stops routing.

use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::callbacks::SyncCallbacks;
use super::config::SyncConfig;
use super::connection::{ConnectionManager, ConnectionSlot, DefaultStream};
use super::errors::{SyncError, SyncResult};
use super::event::{ChangeEvent, OrderStatusUpdate, StockUpdate};
use super::network::{self, NetworkStatus, NetworkWatcher};
use super::optimistic::{OptimisticCoordinator, PendingOptimisticWrite, Reconciliation};
use super::status::{EngineLifecycle, StatusCell, SyncStatus};
use super::subscription::{
    EventCallback, SubscriptionHandle, SubscriptionKey, SubscriptionRegistry, Topic,
};
use super::transport::{
    ChannelHandle, ChannelListener, ChannelMessage, RealtimeTransport, UpstreamHandle,
};
use crate::observability::{
    log_event, log_event_with_fields, trace_event, Event, Logger, MetricsRegistry,
    MetricsSnapshot, ObservationScope,
};

/// Realtime synchronization engine
pub struct SyncEngine {
    this: Weak<SyncEngine>,
    config: SyncConfig,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    optimistic: OptimisticCoordinator,
    network: NetworkWatcher,
    status: StatusCell,
    callbacks: RwLock<SyncCallbacks>,
    metrics: MetricsRegistry,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status.snapshot())
            .field("lifecycle", &self.status.lifecycle())
            .field("subscriptions", &self.registry.len())
            .field("connection", &self.connection)
            .finish()
    }
}

impl SyncEngine {
    /// Build an engine. `config.log_level` becomes the process-wide log
    /// threshold; an unknown level leaves it unchanged.
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: SyncConfig) -> Arc<Self> {
        if let Ok(severity) = config.severity() {
            Logger::set_min_severity(severity);
        }
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            connection: ConnectionManager::new(transport, &config),
            registry: SubscriptionRegistry::new(),
            optimistic: OptimisticCoordinator::new(
                config.confirmation_window(),
                config.recent_confirmation_capacity,
            ),
            network: NetworkWatcher::new(),
            status: StatusCell::new(),
            callbacks: RwLock::new(SyncCallbacks::default()),
            metrics: MetricsRegistry::new(),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ==================
    // Lifecycle
    // ==================

    /// Open the channel and install `callbacks`.
    ///
    /// Only the first successful call opens a channel. Later calls replace
    /// the callbacks and reopen cheaply if the engine is disconnected or
    /// torn down. A failing first call returns the error; it is also
    /// recorded in the status and sent to `on_error`.
    pub async fn initialize(&self, callbacks: SyncCallbacks) -> SyncResult<()> {
        let mut slot = self.connection.lock().await;

        if self.status.lifecycle().is_initialized() {
            drop(slot);
            self.update_callbacks(callbacks);
            self.connect().await;
            return Ok(());
        }

        self.replace_callbacks(callbacks)?;
        log_event(Event::Initialize);

        match self.open_channel(&mut slot).await {
            Ok(()) => {
                self.status.set_lifecycle(EngineLifecycle::Initialized);
                Ok(())
            }
            Err(e) => {
                self.status.mark_disconnected(Some(&e));
                self.notify_error(&e);
                Err(e)
            }
        }
    }

    /// Reopen the channel with the retained callbacks. No-op when connected.
    /// Failures are recorded, not returned.
    pub async fn connect(&self) {
        if !self.status.lifecycle().is_initialized() {
            self.report(&SyncError::NotInitialized);
            return;
        }

        let mut slot = self.connection.lock().await;
        if self.connection.is_live(&slot) && self.status.is_connected() {
            return;
        }

        match self.open_channel(&mut slot).await {
            Ok(()) => self.status.set_lifecycle(EngineLifecycle::Initialized),
            Err(e) => {
                self.status.mark_disconnected(Some(&e));
                self.notify_error(&e);
            }
        }
    }

    /// Tear down the channel handle and reopen it, replaying every live
    /// subscription against the new channel. Failures are recorded as
    /// `ReconnectError`, never returned.
    pub async fn reconnect(&self) {
        if !self.status.lifecycle().is_initialized() {
            self.report(&SyncError::NotInitialized);
            return;
        }

        self.metrics.increment_reconnect_attempts();
        let mut slot = self.connection.lock().await;
        let generation = self.connection.generation().to_string();
        let scope = ObservationScope::with_fields("RECONNECT", &[("generation", &generation)]);

        self.connection.close(&mut slot).await;
        self.registry.detach_all();
        self.status.mark_disconnected(None);

        match self.open_channel(&mut slot).await {
            Ok(()) => {
                self.status.set_lifecycle(EngineLifecycle::Initialized);
                scope.complete();
            }
            Err(e) => {
                let error = SyncError::ReconnectError(e.to_string());
                scope.fail(&e.to_string());
                self.status.mark_disconnected(Some(&error));
                self.notify_error(&error);
            }
        }
    }

    /// Repeat `reconnect` with the configured backoff until connected.
    /// Gives up when attempts run out or the network goes offline again.
    pub async fn reconnect_with_backoff(&self) -> bool {
        if !self.status.lifecycle().is_initialized() {
            self.report(&SyncError::NotInitialized);
            return false;
        }

        let policy = &self.config.reconnect;
        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.network.is_online() {
                return false;
            }
            if self.status.is_connected() {
                return true;
            }

            self.reconnect().await;
            if self.status.is_connected() {
                return true;
            }
        }

        Logger::warn(
            "RECONNECT_EXHAUSTED",
            &[("attempts", &policy.max_attempts.to_string())],
        );
        false
    }

    /// Close every upstream subscription and the channel. The engine keeps
    /// its callbacks and counts as initialized; `connect` reopens it.
    pub async fn unsubscribe_all(&self) {
        let mut slot = self.connection.lock().await;

        for upstream in self.registry.drain() {
            if let Err(e) = self.connection.unsubscribe(upstream).await {
                Logger::warn("UPSTREAM_UNSUBSCRIBE_FAILED", &[("error", &e.to_string())]);
            }
            self.metrics.increment_upstream_unsubscribes();
        }
        self.connection.close(&mut slot).await;
        self.status.mark_disconnected(None);

        if self.status.lifecycle() == EngineLifecycle::Initialized {
            self.status.set_lifecycle(EngineLifecycle::TornDown);
        }
        log_event(Event::Teardown);
    }

    /// Replace the engine callbacks. Key subscriptions are unaffected.
    pub fn update_callbacks(&self, callbacks: SyncCallbacks) {
        if let Err(e) = self.replace_callbacks(callbacks) {
            Logger::error("CALLBACKS_UPDATE_FAILED", &[("error", &e.to_string())]);
            return;
        }
        log_event(Event::CallbacksUpdated);
    }

    fn replace_callbacks(&self, callbacks: SyncCallbacks) -> SyncResult<()> {
        let mut current = self.callbacks.write().map_err(|_| SyncError::lock_poisoned())?;
        *current = callbacks;
        Ok(())
    }

    /// Open a channel and replay live entries onto it
    async fn open_channel(&self, slot: &mut ConnectionSlot) -> SyncResult<()> {
        let channel = self.connection.open(slot, self.listener()).await?;
        self.metrics.increment_channels_opened();

        let connected = self
            .status
            .mark_connected_if(|| self.connection.is_current(channel.generation));
        if !connected {
            return Err(SyncError::ConnectionError(
                "Channel lost while opening".into(),
            ));
        }
        log_event_with_fields(
            Event::ChannelOpened,
            &[("generation", &channel.generation.to_string())],
        );

        for (key, topic) in self.registry.live_entries() {
            if let Err(e) = self.attach(slot, &key, &topic).await {
                log_event_with_fields(
                    Event::SubscribeFailed,
                    &[("key", &key.to_string()), ("error", &e.to_string())],
                );
                self.status.record_error(&e);
                self.notify_error(&e);
            }
        }
        Ok(())
    }

    fn listener(&self) -> ChannelListener {
        let engine = self.this.clone();
        Arc::new(move |message| {
            if let Some(engine) = engine.upgrade() {
                engine.route(message);
            }
        })
    }

    // ==================
    // Status
    // ==================

    /// Snapshot of the current status
    pub fn get_sync_status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn lifecycle(&self) -> EngineLifecycle {
        self.status.lifecycle()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ==================
    // Subscriptions
    // ==================

    /// Follow all orders of one user
    pub async fn subscribe_to_user_orders(
        &self,
        user_id: &str,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(SubscriptionKey::user_orders(user_id), Arc::new(callback))
            .await
    }

    /// Follow the stock of one product
    pub async fn subscribe_to_product_stock(
        &self,
        product_id: &str,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        self.subscribe(SubscriptionKey::product_stock(product_id), Arc::new(callback))
            .await
    }

    /// Register `callback` for `key`. The first callback for a key opens its
    /// upstream subscription; later ones share it. Without a live channel
    /// the entry is kept and attached on the next connect.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        callback: EventCallback,
    ) -> SyncResult<SubscriptionHandle> {
        let slot = self.connection.lock().await;

        let topic = key.topic(&self.config);
        let registration = self.registry.register(key.clone(), topic, callback)?;
        if !registration.needs_upstream {
            return Ok(registration.handle);
        }

        if let Err(e) = self.attach(&slot, &key, &registration.topic).await {
            let _ = self.registry.unregister(&registration.handle);
            log_event_with_fields(
                Event::SubscribeFailed,
                &[("key", &key.to_string()), ("error", &e.to_string())],
            );
            self.notify_error(&e);
            return Err(e);
        }
        Ok(registration.handle)
    }

    /// Remove one callback. The last callback for a key closes its
    /// upstream subscription.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> SyncResult<()> {
        let _slot = self.connection.lock().await;

        let Some(closed) = self.registry.unregister(handle)? else {
            return Ok(());
        };
        if let Some(upstream) = closed.upstream {
            if let Err(e) = self.connection.unsubscribe(upstream).await {
                Logger::warn(
                    "UPSTREAM_UNSUBSCRIBE_FAILED",
                    &[("key", &closed.key.to_string()), ("error", &e.to_string())],
                );
            }
            self.metrics.increment_upstream_unsubscribes();
            log_event_with_fields(
                Event::UpstreamUnsubscribed,
                &[("key", &closed.key.to_string())],
            );
        }
        Ok(())
    }

    /// Open the upstream subscription for a registered key on the live
    /// channel, if there is one
    async fn attach(
        &self,
        slot: &ConnectionSlot,
        key: &SubscriptionKey,
        topic: &Topic,
    ) -> SyncResult<()> {
        let Some(upstream) = self.connection.subscribe(slot, topic).await? else {
            return Ok(());
        };
        self.metrics.increment_upstream_subscribes();

        // Channel lost meanwhile; the entry is replayed on reconnect
        if !self.connection.is_current(upstream.generation) {
            self.release_upstream(upstream).await;
            return Ok(());
        }
        // Entry removed meanwhile
        if !self.registry.attach_upstream(key, upstream)? {
            self.release_upstream(upstream).await;
            return Ok(());
        }

        log_event_with_fields(
            Event::UpstreamSubscribed,
            &[
                ("key", &key.to_string()),
                ("topic", &topic.to_string()),
                ("generation", &upstream.generation.to_string()),
            ],
        );
        Ok(())
    }

    async fn release_upstream(&self, upstream: UpstreamHandle) {
        if self.connection.unsubscribe(upstream).await.is_ok() {
            self.metrics.increment_upstream_unsubscribes();
        }
    }

    /// Number of subscribed keys
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    // ==================
    // Optimistic writes
    // ==================

    /// Apply `updates` locally through `local_update`, then write them to
    /// the backend.
    ///
    /// `local_update` runs before the remote write is issued. A failed or
    /// timed-out write is returned, recorded in the status and sent to
    /// `on_error`; the local change is not rolled back.
    pub async fn optimistic_update<U, F>(
        &self,
        table: &str,
        row_id: &str,
        updates: U,
        local_update: F,
    ) -> SyncResult<()>
    where
        U: Serialize + Send,
        F: FnOnce(&U) + Send,
    {
        let applied = match serde_json::to_value(&updates) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(self.write_failed(table, row_id, "updates must be a JSON object")),
            Err(e) => return Err(self.write_failed(table, row_id, &e.to_string())),
        };

        let begun = self.optimistic.begin(table, row_id, applied.clone())?;
        if let Some(previous) = begun.superseded {
            log_event_with_fields(
                Event::WriteSuperseded,
                &[
                    ("table", table),
                    ("row_id", row_id),
                    ("write_id", &previous.write_id.to_string()),
                ],
            );
        }
        self.metrics.increment_optimistic_writes();
        log_event_with_fields(
            Event::OptimisticApplied,
            &[("table", table), ("row_id", row_id)],
        );

        local_update(&updates);
        drop(updates);

        let timeout = self.config.write_timeout();
        let result = tokio::time::timeout(
            timeout,
            self.connection.write(table, row_id, Value::Object(applied)),
        )
        .await;

        let error = match result {
            Ok(Ok(_)) => {
                self.optimistic.resolve(table, row_id, begun.write_id);
                self.status.touch_sync();
                log_event_with_fields(
                    Event::WriteConfirmed,
                    &[("table", table), ("row_id", row_id)],
                );
                return Ok(());
            }
            Ok(Err(e @ SyncError::WriteError { .. })) => e,
            Ok(Err(e)) => SyncError::WriteError {
                table: table.to_string(),
                row_id: row_id.to_string(),
                message: e.to_string(),
            },
            Err(_) => SyncError::WriteTimeout {
                table: table.to_string(),
                row_id: row_id.to_string(),
                timeout_ms: self.config.write_timeout_ms,
            },
        };
        self.optimistic.settle(table, row_id, begun.write_id);
        self.metrics.increment_write_failures();
        log_event_with_fields(
            Event::WriteFailed,
            &[("table", table), ("row_id", row_id), ("error", &error.to_string())],
        );
        self.status.record_error(&error);
        self.notify_error(&error);
        Err(error)
    }

    fn write_failed(&self, table: &str, row_id: &str, message: &str) -> SyncError {
        let error = SyncError::WriteError {
            table: table.to_string(),
            row_id: row_id.to_string(),
            message: message.to_string(),
        };
        self.metrics.increment_write_failures();
        self.notify_error(&error);
        error
    }

    /// Writes still awaiting their remote result, oldest first
    pub fn pending_writes(&self) -> Vec<PendingOptimisticWrite> {
        self.optimistic.pending()
    }

    // ==================
    // Connectivity
    // ==================

    /// Apply a connectivity report. Going offline only updates the status;
    /// coming back online reconnects an initialized, disconnected engine.
    pub async fn handle_network_status(&self, status: NetworkStatus) {
        if self.record_network_status(status) {
            self.reconnect_with_backoff().await;
        }
    }

    /// Record a connectivity report without reconnecting. Returns true when
    /// the report brought an initialized, disconnected engine back online.
    pub fn record_network_status(&self, status: NetworkStatus) -> bool {
        if !self.network.observe(status) {
            return false;
        }
        self.metrics.increment_network_transitions();

        match status {
            NetworkStatus::Offline => {
                log_event(Event::NetworkOffline);
                self.status.mark_disconnected(None);
                false
            }
            NetworkStatus::Online => {
                log_event(Event::NetworkOnline);
                self.status.lifecycle() == EngineLifecycle::Initialized
                    && !self.status.is_connected()
            }
        }
    }

    /// Run a task feeding `reports` into `handle_network_status`
    pub fn spawn_network_watcher(
        self: &Arc<Self>,
        reports: watch::Receiver<NetworkStatus>,
    ) -> JoinHandle<()> {
        network::spawn_network_watcher(Arc::clone(self), reports)
    }

    // ==================
    // Routing
    // ==================

    /// Handle one transport message
    fn route(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Change { upstream, event } => self.route_change(upstream, event),
            ChannelMessage::Error { channel, message } => {
                self.fail_connection(channel, SyncError::ConnectionError(message))
            }
            ChannelMessage::Closed { channel } => self.fail_connection(
                channel,
                SyncError::ConnectionError("Channel closed by server".into()),
            ),
        }
    }

    fn route_change(&self, upstream: UpstreamHandle, mut event: ChangeEvent) {
        if !self.connection.is_current(upstream.generation) {
            self.metrics.increment_stale_events();
            trace_event(
                Event::StaleEventDropped,
                &[
                    ("generation", &upstream.generation.to_string()),
                    ("table", &event.table),
                    ("row_id", &event.row_id),
                ],
            );
            return;
        }

        let reconciliation = self.optimistic.reconcile(&event);
        event.origin = reconciliation.origin();
        if let Reconciliation::Confirmed(write) = &reconciliation {
            self.metrics.increment_push_confirmations();
            log_event_with_fields(
                Event::PushConfirmed,
                &[
                    ("table", &write.table),
                    ("row_id", &write.row_id),
                    ("write_id", &write.write_id.to_string()),
                ],
            );
        }
        self.metrics.increment_events_routed();
        self.status.touch_sync();

        let invoked = match self.connection.default_stream(&upstream) {
            Some(stream) => self.dispatch_default(stream, &event),
            None => {
                let callbacks = self.registry.callbacks_for(&upstream);
                for callback in &callbacks {
                    callback(&event);
                }
                callbacks.len()
            }
        };
        self.metrics.add_callbacks_invoked(invoked as u64);
    }

    /// Deliver a table-wide event to the engine callbacks
    fn dispatch_default(&self, stream: DefaultStream, event: &ChangeEvent) -> usize {
        let callbacks = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return 0,
        };

        let mut invoked = 0;
        match stream {
            DefaultStream::Products => {
                if let Some(on_update) = &callbacks.on_product_update {
                    on_update(event);
                    invoked += 1;
                }
                if let (Some(on_stock), Some(update)) = (
                    &callbacks.on_product_stock_update,
                    StockUpdate::from_event(event, &self.config.stock_column),
                ) {
                    on_stock(&update);
                    invoked += 1;
                }
            }
            DefaultStream::Orders => {
                if let Some(on_update) = &callbacks.on_order_update {
                    on_update(event);
                    invoked += 1;
                }
                if let (Some(on_status), Some(update)) = (
                    &callbacks.on_order_status_update,
                    OrderStatusUpdate::from_event(event, &self.config.status_column),
                ) {
                    on_status(&update);
                    invoked += 1;
                }
            }
        }
        invoked
    }

    /// The transport reported the channel lost. Ignored unless `channel`
    /// is the current one.
    fn fail_connection(&self, channel: ChannelHandle, error: SyncError) {
        let owned = self
            .status
            .mark_failed_if(|| self.connection.retire(channel.generation), &error);
        if !owned {
            return;
        }

        self.registry.detach_all();
        self.connection.clear_default_routes();
        log_event_with_fields(
            Event::ChannelError,
            &[
                ("generation", &channel.generation.to_string()),
                ("error", &error.to_string()),
            ],
        );
        self.notify_error(&error);
    }

    // ==================
    // Errors
    // ==================

    /// Record an error in the status and send it to `on_error`
    fn report(&self, error: &SyncError) {
        self.status.record_error(error);
        self.notify_error(error);
    }

    fn notify_error(&self, error: &SyncError) {
        let on_error = self
            .callbacks
            .read()
            .ok()
            .and_then(|callbacks| callbacks.on_error.clone());
        if let Some(on_error) = on_error {
            on_error(error);
        }
    }
}
