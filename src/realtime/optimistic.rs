//! # Optimistic Write Coordinator
//!
//! Bookkeeping for local mutations applied ahead of server confirmation.
//! At most one write is pending per `(table, row_id)`; a newer write for the
//! same row supersedes the older one (last-write-wins).
//!
//! A push event confirms the pending write for its row when
//! - it is not a DELETE,
//! - every field of the applied update is present and equal in the event's
//!   new row image, and
//! - its commit time is no earlier than `submitted_at - confirmation_window`.
//!
//! A write whose remote call succeeded before its echo arrived stays
//! matchable for `confirmation_window` after it resolved, so a broadcast that
//! trails the write response is still a confirmation.
//!
//! Confirmed echoes are remembered in a bounded ring so that the same event
//! delivered through several upstream subscriptions is classified the same
//! way each time.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::{SyncError, SyncResult};
use super::event::{ChangeEvent, EventOrigin, EventType};

type RowKey = (String, String);

/// A local mutation awaiting its remote write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOptimisticWrite {
    pub write_id: Uuid,
    pub table: String,
    pub row_id: String,
    pub applied_update: Map<String, Value>,
    pub submitted_at: DateTime<Utc>,
}

impl PendingOptimisticWrite {
    fn confirmed_by(&self, event: &ChangeEvent, window: chrono::Duration) -> bool {
        if event.event_type == EventType::Delete {
            return false;
        }
        if event.commit_timestamp < self.submitted_at - window {
            return false;
        }
        self.applied_update
            .iter()
            .all(|(column, value)| event.new_field(column) == Some(value))
    }
}

/// Outcome of `begin`
#[derive(Debug)]
pub struct Begun {
    pub write_id: Uuid,
    /// Older write for the same row that this one replaced
    pub superseded: Option<PendingOptimisticWrite>,
}

/// How a push event relates to this engine's pending writes
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Not ours
    Remote,
    /// Echo of a pending or recently resolved write, which is now settled
    Confirmed(PendingOptimisticWrite),
    /// Another delivery of an echo already confirmed
    Duplicate,
}

impl Reconciliation {
    pub fn origin(&self) -> EventOrigin {
        match self {
            Reconciliation::Remote => EventOrigin::Remote,
            Reconciliation::Confirmed(_) | Reconciliation::Duplicate => {
                EventOrigin::LocalConfirmation
            }
        }
    }
}

/// A write whose remote call succeeded and whose echo has not arrived
#[derive(Debug)]
struct AwaitingEcho {
    write: PendingOptimisticWrite,
    resolved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    pending: HashMap<RowKey, PendingOptimisticWrite>,
    /// Resolved writes, oldest first
    awaiting_echo: VecDeque<AwaitingEcho>,
    /// Recently confirmed echoes as (table, row_id, commit time)
    recent: VecDeque<(String, String, DateTime<Utc>)>,
}

/// Tracks outstanding optimistic writes
#[derive(Debug)]
pub struct OptimisticCoordinator {
    state: Mutex<CoordinatorState>,
    confirmation_window: chrono::Duration,
    recent_capacity: usize,
}

impl OptimisticCoordinator {
    pub fn new(confirmation_window: chrono::Duration, recent_capacity: usize) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            confirmation_window,
            recent_capacity: recent_capacity.max(1),
        }
    }

    /// Record a pending write, superseding any older one for the same row
    pub fn begin(
        &self,
        table: &str,
        row_id: &str,
        applied_update: Map<String, Value>,
    ) -> SyncResult<Begun> {
        let write = PendingOptimisticWrite {
            write_id: Uuid::new_v4(),
            table: table.to_string(),
            row_id: row_id.to_string(),
            applied_update,
            submitted_at: Utc::now(),
        };
        let write_id = write.write_id;

        let mut state = self.state.lock().map_err(|_| SyncError::lock_poisoned())?;
        let superseded = state
            .pending
            .insert((table.to_string(), row_id.to_string()), write);

        Ok(Begun {
            write_id,
            superseded,
        })
    }

    /// Clear the pending write created by `begin` that returned `write_id`.
    /// Returns false if it was already confirmed or superseded.
    pub fn settle(&self, table: &str, row_id: &str, write_id: Uuid) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        Self::take_pending(&mut state, table, row_id, write_id).is_some()
    }

    /// Clear the pending write after its remote call succeeded. Unless its
    /// echo was already seen, the write keeps matching push events for
    /// `confirmation_window`.
    pub fn resolve(&self, table: &str, row_id: &str, write_id: Uuid) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(write) = Self::take_pending(&mut state, table, row_id, write_id) else {
            return false;
        };

        let now = Utc::now();
        let window = self.confirmation_window;
        state
            .awaiting_echo
            .retain(|entry| entry.resolved_at + window >= now);
        if state.awaiting_echo.len() >= self.recent_capacity {
            state.awaiting_echo.pop_front();
        }
        state.awaiting_echo.push_back(AwaitingEcho {
            write,
            resolved_at: now,
        });
        true
    }

    fn take_pending(
        state: &mut CoordinatorState,
        table: &str,
        row_id: &str,
        write_id: Uuid,
    ) -> Option<PendingOptimisticWrite> {
        let key = (table.to_string(), row_id.to_string());
        match state.pending.get(&key) {
            Some(write) if write.write_id == write_id => state.pending.remove(&key),
            _ => None,
        }
    }

    /// Classify a push event, settling the write it confirms
    pub fn reconcile(&self, event: &ChangeEvent) -> Reconciliation {
        let Ok(mut state) = self.state.lock() else {
            return Reconciliation::Remote;
        };

        let already_seen = state.recent.iter().any(|(table, row_id, at)| {
            *table == event.table && *row_id == event.row_id && *at == event.commit_timestamp
        });
        if already_seen {
            return Reconciliation::Duplicate;
        }

        let window = self.confirmation_window;
        let key = (event.table.clone(), event.row_id.clone());
        let confirms_pending = state
            .pending
            .get(&key)
            .is_some_and(|write| write.confirmed_by(event, window));
        let confirmed = if confirms_pending {
            state.pending.remove(&key)
        } else {
            let awaiting = state.awaiting_echo.iter().rposition(|entry| {
                entry.write.table == event.table
                    && entry.write.row_id == event.row_id
                    && event.commit_timestamp <= entry.resolved_at + window
                    && entry.write.confirmed_by(event, window)
            });
            awaiting
                .and_then(|index| state.awaiting_echo.remove(index))
                .map(|entry| entry.write)
        };
        let Some(write) = confirmed else {
            return Reconciliation::Remote;
        };

        if state.recent.len() >= self.recent_capacity {
            state.recent.pop_front();
        }
        state
            .recent
            .push_back((event.table.clone(), event.row_id.clone(), event.commit_timestamp));

        Reconciliation::Confirmed(write)
    }

    /// Outstanding writes, oldest first
    pub fn pending(&self) -> Vec<PendingOptimisticWrite> {
        let mut writes: Vec<PendingOptimisticWrite> = self
            .state
            .lock()
            .map(|s| s.pending.values().cloned().collect())
            .unwrap_or_default();
        writes.sort_by_key(|w| w.submitted_at);
        writes
    }

    pub fn is_pending(&self, table: &str, row_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.pending.contains_key(&(table.to_string(), row_id.to_string())))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coordinator() -> OptimisticCoordinator {
        OptimisticCoordinator::new(chrono::Duration::seconds(5), 4)
    }

    fn update(fields: Value) -> Map<String, Value> {
        match fields {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_begin_and_settle() {
        let coordinator = coordinator();
        let begun = coordinator
            .begin("orders", "o1", update(json!({"status": "shipped"})))
            .unwrap();
        assert!(begun.superseded.is_none());
        assert!(coordinator.is_pending("orders", "o1"));

        assert!(coordinator.settle("orders", "o1", begun.write_id));
        assert!(!coordinator.is_pending("orders", "o1"));
        assert!(!coordinator.settle("orders", "o1", begun.write_id));
    }

    #[test]
    fn test_newer_write_supersedes() {
        let coordinator = coordinator();
        let first = coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 4})))
            .unwrap();
        let second = coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 3})))
            .unwrap();

        assert_eq!(second.superseded.unwrap().write_id, first.write_id);
        assert_eq!(coordinator.pending().len(), 1);

        // The stale completion must not clear the newer write
        assert!(!coordinator.settle("products", "p1", first.write_id));
        assert!(coordinator.is_pending("products", "p1"));
        assert!(coordinator.settle("products", "p1", second.write_id));
    }

    #[test]
    fn test_matching_push_confirms() {
        let coordinator = coordinator();
        coordinator
            .begin("orders", "o1", update(json!({"status": "shipped"})))
            .unwrap();

        let echo = ChangeEvent::update(
            "orders",
            "o1",
            json!({"status": "paid"}),
            json!({"id": "o1", "status": "shipped", "total": 40}),
        );
        let outcome = coordinator.reconcile(&echo);
        assert!(matches!(outcome, Reconciliation::Confirmed(_)));
        assert_eq!(outcome.origin(), EventOrigin::LocalConfirmation);
        assert!(!coordinator.is_pending("orders", "o1"));

        // Same event through a second upstream
        assert_eq!(coordinator.reconcile(&echo), Reconciliation::Duplicate);
    }

    #[test]
    fn test_different_values_are_remote() {
        let coordinator = coordinator();
        coordinator
            .begin("orders", "o1", update(json!({"status": "shipped"})))
            .unwrap();

        let other = ChangeEvent::update(
            "orders",
            "o1",
            json!({"status": "paid"}),
            json!({"status": "cancelled"}),
        );
        assert_eq!(coordinator.reconcile(&other), Reconciliation::Remote);
        assert!(coordinator.is_pending("orders", "o1"));
    }

    #[test]
    fn test_old_commit_is_remote() {
        let coordinator = coordinator();
        coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 4})))
            .unwrap();

        let stale = ChangeEvent::update(
            "products",
            "p1",
            json!({}),
            json!({"stock_quantity": 4}),
        )
        .at(Utc::now() - chrono::Duration::seconds(60));
        assert_eq!(coordinator.reconcile(&stale), Reconciliation::Remote);
    }

    #[test]
    fn test_delete_never_confirms() {
        let coordinator = coordinator();
        coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 4})))
            .unwrap();
        let deleted = ChangeEvent::delete("products", "p1", json!({"stock_quantity": 4}));
        assert_eq!(coordinator.reconcile(&deleted), Reconciliation::Remote);
    }

    #[test]
    fn test_echo_after_resolve_confirms() {
        let coordinator = coordinator();
        let begun = coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 4})))
            .unwrap();
        assert!(coordinator.resolve("products", "p1", begun.write_id));
        assert!(!coordinator.is_pending("products", "p1"));

        let echo = ChangeEvent::update(
            "products",
            "p1",
            json!({"stock_quantity": 5}),
            json!({"stock_quantity": 4}),
        );
        assert!(matches!(coordinator.reconcile(&echo), Reconciliation::Confirmed(_)));
        assert_eq!(coordinator.reconcile(&echo), Reconciliation::Duplicate);

        // Matched once; a later write of the same value is someone else's
        let later = echo.clone().at(Utc::now() + chrono::Duration::milliseconds(1));
        assert_eq!(coordinator.reconcile(&later), Reconciliation::Remote);
    }

    #[test]
    fn test_echo_past_window_is_remote() {
        let coordinator = coordinator();
        let begun = coordinator
            .begin("products", "p1", update(json!({"stock_quantity": 4})))
            .unwrap();
        coordinator.resolve("products", "p1", begun.write_id);

        let late = ChangeEvent::update("products", "p1", json!({}), json!({"stock_quantity": 4}))
            .at(Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(coordinator.reconcile(&late), Reconciliation::Remote);
    }

    #[test]
    fn test_failed_write_does_not_await_echo() {
        let coordinator = coordinator();
        let begun = coordinator
            .begin("orders", "o1", update(json!({"status": "shipped"})))
            .unwrap();
        assert!(coordinator.settle("orders", "o1", begun.write_id));

        let echo = ChangeEvent::update("orders", "o1", json!({}), json!({"status": "shipped"}));
        assert_eq!(coordinator.reconcile(&echo), Reconciliation::Remote);
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let coordinator = OptimisticCoordinator::new(chrono::Duration::seconds(5), 2);
        let mut echoes = Vec::new();
        for id in ["p1", "p2", "p3"] {
            coordinator
                .begin("products", id, update(json!({"stock_quantity": 1})))
                .unwrap();
            let echo = ChangeEvent::update("products", id, json!({}), json!({"stock_quantity": 1}));
            assert!(matches!(coordinator.reconcile(&echo), Reconciliation::Confirmed(_)));
            echoes.push(echo);
        }

        assert_eq!(coordinator.reconcile(&echoes[0]), Reconciliation::Remote);
        assert_eq!(coordinator.reconcile(&echoes[2]), Reconciliation::Duplicate);
    }
}
