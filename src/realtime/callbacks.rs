//! Engine-level callbacks installed at `initialize` and replaced through
//! `update_callbacks`. These are independent of per-key subscriptions.

use std::fmt;
use std::sync::Arc;

use super::errors::SyncError;
use super::event::{ChangeEvent, OrderStatusUpdate, StockUpdate};

pub type StockCallback = Arc<dyn Fn(&StockUpdate) + Send + Sync>;
pub type OrderStatusCallback = Arc<dyn Fn(&OrderStatusUpdate) + Send + Sync>;
pub type RowCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// The latest set of engine callbacks. Every field is optional.
#[derive(Clone, Default)]
pub struct SyncCallbacks {
    /// Stock column changed on a product row
    pub on_product_stock_update: Option<StockCallback>,
    /// Status column changed on an order row
    pub on_order_status_update: Option<OrderStatusCallback>,
    /// Any product row change
    pub on_product_update: Option<RowCallback>,
    /// Any order row change
    pub on_order_update: Option<RowCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl SyncCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_product_stock_update(
        mut self,
        f: impl Fn(&StockUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_product_stock_update = Some(Arc::new(f));
        self
    }

    pub fn on_order_status_update(
        mut self,
        f: impl Fn(&OrderStatusUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_order_status_update = Some(Arc::new(f));
        self
    }

    pub fn on_product_update(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_product_update = Some(Arc::new(f));
        self
    }

    pub fn on_order_update(mut self, f: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_order_update = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SyncCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCallbacks")
            .field("on_product_stock_update", &self.on_product_stock_update.is_some())
            .field("on_order_status_update", &self.on_order_status_update.is_some())
            .field("on_product_update", &self.on_product_update.is_some())
            .field("on_order_update", &self.on_order_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let callbacks = SyncCallbacks::new()
            .on_error(|_| {})
            .on_product_update(|_| {});
        assert!(callbacks.on_error.is_some());
        assert!(callbacks.on_product_update.is_some());
        assert!(callbacks.on_order_update.is_none());

        let debug = format!("{:?}", callbacks);
        assert!(debug.contains("on_error: true"));
        assert!(debug.contains("on_order_update: false"));
    }
}
