//! Observability for the sync engine
//!
//! - Structured logging (JSON, one line per event)
//! - Counter metrics per engine instance
//! - Begin/complete scopes for multi-step operations
//!
//! # Usage
//!
//! ```ignore
//! use storefront_sync::observability::{log_event_with_fields, Event, ObservationScope};
//!
//! log_event_with_fields(Event::ChannelOpened, &[("generation", "3")]);
//!
//! let scope = ObservationScope::new("RECONNECT");
//! // ... reopen channel ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

/// Log a lifecycle event
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields. Failure events go to stderr at ERROR.
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    if event.is_failure() {
        Logger::error(event.as_str(), fields);
    } else {
        Logger::info(event.as_str(), fields);
    }
}

/// Log a high-volume event at TRACE
pub fn trace_event(event: Event, fields: &[(&str, &str)]) {
    Logger::trace(event.as_str(), fields);
}
