//! Observable sync engine events
//!
//! Events are explicit and typed; the string form is what appears in logs.

use std::fmt;

/// Observable events in the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// First initialize call accepted
    Initialize,
    /// Callback set replaced
    CallbacksUpdated,
    /// Channel opened and default listeners attached
    ChannelOpened,
    /// Channel closed by the engine
    ChannelClosed,
    /// Channel reported an error or dropped
    ChannelError,
    /// All subscriptions and the channel torn down
    Teardown,

    // Subscriptions
    /// Upstream subscription opened for a key
    UpstreamSubscribed,
    /// Upstream subscription closed for a key
    UpstreamUnsubscribed,
    /// Upstream subscribe call failed
    SubscribeFailed,
    /// Event from a superseded connection generation dropped
    StaleEventDropped,

    // Optimistic writes
    /// Local mutation applied, remote write issued
    OptimisticApplied,
    /// Pending write replaced by a newer one for the same row
    WriteSuperseded,
    /// Remote write resolved successfully
    WriteConfirmed,
    /// Push event matched a pending write
    PushConfirmed,
    /// Remote write failed or timed out
    WriteFailed,

    // Connectivity
    /// Browser reported connectivity
    NetworkOnline,
    /// Browser reported loss of connectivity
    NetworkOffline,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Initialize => "SYNC_INITIALIZE",
            Event::CallbacksUpdated => "CALLBACKS_UPDATED",
            Event::ChannelOpened => "CHANNEL_OPENED",
            Event::ChannelClosed => "CHANNEL_CLOSED",
            Event::ChannelError => "CHANNEL_ERROR",
            Event::Teardown => "SYNC_TEARDOWN",

            Event::UpstreamSubscribed => "UPSTREAM_SUBSCRIBED",
            Event::UpstreamUnsubscribed => "UPSTREAM_UNSUBSCRIBED",
            Event::SubscribeFailed => "SUBSCRIBE_FAILED",
            Event::StaleEventDropped => "STALE_EVENT_DROPPED",

            Event::OptimisticApplied => "OPTIMISTIC_APPLIED",
            Event::WriteSuperseded => "WRITE_SUPERSEDED",
            Event::WriteConfirmed => "WRITE_CONFIRMED",
            Event::PushConfirmed => "PUSH_CONFIRMED",
            Event::WriteFailed => "WRITE_FAILED",

            Event::NetworkOnline => "NETWORK_ONLINE",
            Event::NetworkOffline => "NETWORK_OFFLINE",
        }
    }

    /// Returns true if this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::ChannelError | Event::SubscribeFailed | Event::WriteFailed
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::ChannelOpened.as_str(), "CHANNEL_OPENED");
        assert_eq!(Event::PushConfirmed.to_string(), "PUSH_CONFIRMED");
    }

    #[test]
    fn test_failure_events() {
        assert!(Event::WriteFailed.is_failure());
        assert!(Event::ChannelError.is_failure());
        assert!(!Event::WriteConfirmed.is_failure());
        assert!(!Event::NetworkOffline.is_failure());
    }
}
