//! Panel session state and the delivery-confirmation state machine.
//!
//! One `PanelSession` exists per mounted panel. It is owned by the panel's
//! event loop and mutated only from there, so nothing in here locks.
//!
//! Per-order workflow:
//!
//! ```text
//!   Active --arm--> Armed --confirm--> Transitioning --ok--> Removed
//!     ^               |                      |
//!     +----disarm-----+                      +--failure--> Active
//! ```
//!
//! At most one order is armed and at most one is transitioning. Arming a
//! second order silently replaces the first. An order that is transitioning
//! can be neither armed nor confirmed again.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::detector::{ChangeDetection, ChangeDetector};
use crate::order::{Order, OrderId};
use crate::projector::{self, ActiveFilter, OrderView, ViewSelector};

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArmRejection {
    #[error("Order {0} is not in the active list")]
    NotActive(OrderId),
    #[error("Order {0} is already being updated")]
    Transitioning(OrderId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmRejection {
    #[error("Order {0} is not armed for confirmation")]
    NotArmed(OrderId),
    #[error("Order {0} is already being updated")]
    AlreadyTransitioning(OrderId),
    #[error("Another order ({0}) is still being updated")]
    Busy(OrderId),
}

// ---------------------------------------------------------------------------
// View model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryView {
    pub loading: bool,
    pub orders: Vec<OrderView>,
}

/// Everything the rendering collaborator needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelView {
    pub session_id: Uuid,
    /// True until the first poll cycle finishes.
    pub loading: bool,
    pub active: Vec<OrderView>,
    pub armed: Option<OrderId>,
    pub transitioning: Option<OrderId>,
    /// `None` while the history view is closed.
    pub history: Option<HistoryView>,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Result of reconciling one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub notify: bool,
    pub previous_count: Option<usize>,
    pub active_count: usize,
}

#[derive(Debug, Default)]
struct HistoryState {
    open: bool,
    loading: bool,
    /// Bumped on every open so a late result from an earlier open is dropped.
    generation: u64,
    orders: Vec<Order>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PanelSession {
    id: Uuid,
    filter: ActiveFilter,
    detector: ChangeDetector,
    loading: bool,
    active_orders: Vec<Order>,
    pending_confirmation: Option<OrderId>,
    in_flight: Option<OrderId>,
    history: HistoryState,
    last_successful_poll: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl PanelSession {
    pub fn new(filter: ActiveFilter, detection: ChangeDetection) -> Self {
        Self {
            id: Uuid::new_v4(),
            filter,
            detector: ChangeDetector::new(detection),
            loading: true,
            active_orders: Vec::new(),
            pending_confirmation: None,
            in_flight: None,
            history: HistoryState::default(),
            last_successful_poll: None,
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn active_orders(&self) -> &[Order] {
        &self.active_orders
    }

    pub fn pending_confirmation(&self) -> Option<&OrderId> {
        self.pending_confirmation.as_ref()
    }

    pub fn in_flight(&self) -> Option<&OrderId> {
        self.in_flight.as_ref()
    }

    pub fn previous_active_count(&self) -> Option<usize> {
        self.detector.previous_count()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // -- Reconciliation -----------------------------------------------------

    /// Replace the active list with the projection of `snapshot` and decide
    /// whether to alert. The detector runs on exactly the list that gets
    /// rendered.
    pub fn apply_snapshot(&mut self, snapshot: &[Order], at: DateTime<Utc>) -> ReconcileOutcome {
        let active = projector::project(snapshot, ViewSelector::Active(self.filter));
        let previous_count = self.detector.previous_count();
        let notify = self.detector.evaluate(&active);
        self.active_orders = active;

        let armed_gone = self
            .pending_confirmation
            .as_ref()
            .is_some_and(|armed| !self.contains(armed));
        if armed_gone {
            if let Some(armed) = self.pending_confirmation.take() {
                debug!(order_id = %armed, "Armed order left the active list; disarming");
            }
        }

        self.loading = false;
        self.last_successful_poll = Some(at);
        self.consecutive_failures = 0;

        ReconcileOutcome {
            notify,
            previous_count,
            active_count: self.active_orders.len(),
        }
    }

    /// A fetch failed. State stays as it was apart from poll health.
    pub fn record_fetch_failure(&mut self) -> u32 {
        self.loading = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    fn contains(&self, id: &OrderId) -> bool {
        self.active_orders.iter().any(|o| &o.id == id)
    }

    // -- Transition controller ----------------------------------------------

    /// Arm `id` for confirmation, replacing any previously armed order.
    pub fn arm(&mut self, id: OrderId) -> Result<(), ArmRejection> {
        if self.in_flight.as_ref() == Some(&id) {
            return Err(ArmRejection::Transitioning(id));
        }
        if !self.contains(&id) {
            return Err(ArmRejection::NotActive(id));
        }
        if let Some(previous) = self.pending_confirmation.replace(id) {
            debug!(order_id = %previous, "Disarmed by a newer arm");
        }
        Ok(())
    }

    pub fn disarm(&mut self) -> Option<OrderId> {
        self.pending_confirmation.take()
    }

    /// Move the armed order into `Transitioning`. On `Ok` the caller must
    /// issue exactly one status-update request for `id`.
    pub fn begin_transition(&mut self, id: &OrderId) -> Result<(), ConfirmRejection> {
        if let Some(current) = &self.in_flight {
            if current == id {
                return Err(ConfirmRejection::AlreadyTransitioning(id.clone()));
            }
            return Err(ConfirmRejection::Busy(current.clone()));
        }
        if self.pending_confirmation.as_ref() != Some(id) {
            return Err(ConfirmRejection::NotArmed(id.clone()));
        }

        self.pending_confirmation = None;
        self.in_flight = Some(id.clone());
        info!(order_id = %id, "Delivery confirmation submitted");
        Ok(())
    }

    /// Settle the in-flight transition. Success removes the order locally
    /// right away; failure leaves it where it was. Returns `false` when `id`
    /// was not the order in flight (the result is ignored).
    pub fn finish_transition(&mut self, id: &OrderId, succeeded: bool) -> bool {
        if self.in_flight.as_ref() != Some(id) {
            debug!(order_id = %id, "Ignoring settlement for an order not in flight");
            return false;
        }
        self.in_flight = None;
        if succeeded {
            self.active_orders.retain(|o| &o.id != id);
        }
        true
    }

    // -- History --------------------------------------------------------------

    /// Open (or refresh) the history view. Returns the generation to tag the
    /// fetch with, or `None` when a fetch for this open is already running.
    pub fn open_history(&mut self) -> Option<u64> {
        if self.history.open && self.history.loading {
            return None;
        }
        self.history.open = true;
        self.history.loading = true;
        self.history.generation += 1;
        Some(self.history.generation)
    }

    pub fn close_history(&mut self) {
        self.history.open = false;
        self.history.loading = false;
        self.history.orders.clear();
    }

    /// Apply a history snapshot. Results for a closed view or an older
    /// generation are discarded.
    pub fn apply_history(&mut self, generation: u64, snapshot: &[Order]) -> bool {
        if !self.accepts_history(generation) {
            return false;
        }
        self.history.orders = projector::project(snapshot, ViewSelector::History);
        self.history.loading = false;
        true
    }

    pub fn fail_history(&mut self, generation: u64) -> bool {
        if !self.accepts_history(generation) {
            return false;
        }
        self.history.orders.clear();
        self.history.loading = false;
        true
    }

    fn accepts_history(&self, generation: u64) -> bool {
        self.history.open && self.history.generation == generation
    }

    // -- View -----------------------------------------------------------------

    pub fn view(&self) -> PanelView {
        PanelView {
            session_id: self.id,
            loading: self.loading,
            active: projector::active_rows(&self.active_orders),
            armed: self.pending_confirmation.clone(),
            transitioning: self.in_flight.clone(),
            history: self.history.open.then(|| HistoryView {
                loading: self.history.loading,
                orders: projector::history_rows(&self.history.orders),
            }),
            last_successful_poll: self.last_successful_poll,
            consecutive_failures: self.consecutive_failures,
        }
    }
}
