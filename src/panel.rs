//! Panel runtime: poll scheduler, reconcile loop and intent handling.
//!
//! Key design goals:
//! - **One owner**: a single event-loop task owns the `PanelSession`; the
//!   scheduler, operator intents and finished network calls all reach it as
//!   `PanelEvent`s, so state changes never race.
//! - **Serialized polling**: the scheduler fetches, hands the snapshot to the
//!   loop and waits until it has been applied before taking the next tick.
//!   Ticks that fall due during a slow cycle are delayed, not bursted, so two
//!   reconciliations are never in flight together.
//! - **Responsive**: status updates and history fetches run as their own
//!   tasks; arming and disarming keep working while they are pending.
//! - **Teardown**: `PanelHandle::shutdown` stops the scheduler and the loop.
//!   Requests already on the wire are left to finish; their results are
//!   dropped because nobody is listening any more.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{FetchFailure, OrderBackend, TransitionFailure};
use crate::chime::Chime;
use crate::detector::ChangeDetection;
use crate::order::{Order, OrderId, OrderStatus};
use crate::projector::ActiveFilter;
use crate::session::{PanelSession, PanelView};

/// Poll period used when nothing else is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Rendering seam
// ---------------------------------------------------------------------------

/// Rendering collaborator. Called from the panel loop only.
pub trait PanelRenderer: Send + 'static {
    /// Draw the current state.
    fn render(&mut self, view: &PanelView);

    /// Show an explicit failure to the operator (failed delivery update).
    fn alert(&mut self, message: &str);
}

/// Operator intents accepted by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelIntent {
    Arm(OrderId),
    Confirm(OrderId),
    Disarm,
    OpenHistory,
    CloseHistory,
    Refresh,
}

enum PanelEvent {
    Intent(PanelIntent),
    Snapshot {
        result: Result<Vec<Order>, FetchFailure>,
        applied: oneshot::Sender<()>,
    },
    TransitionSettled {
        id: OrderId,
        result: Result<(), TransitionFailure>,
    },
    HistoryFetched {
        generation: u64,
        result: Result<Vec<Order>, FetchFailure>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct PanelOptions {
    pub poll_interval: Duration,
    pub active_filter: ActiveFilter,
    pub change_detection: ChangeDetection,
}

impl Default for PanelOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            active_filter: ActiveFilter::default(),
            change_detection: ChangeDetection::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner-side handle of a running panel.
pub struct PanelHandle {
    events: mpsc::UnboundedSender<PanelEvent>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PanelHandle {
    pub fn send(&self, intent: PanelIntent) {
        if self.events.send(PanelEvent::Intent(intent)).is_err() {
            debug!("Panel is gone; intent dropped");
        }
    }

    pub fn arm(&self, id: impl Into<OrderId>) {
        self.send(PanelIntent::Arm(id.into()));
    }

    pub fn confirm(&self, id: impl Into<OrderId>) {
        self.send(PanelIntent::Confirm(id.into()));
    }

    pub fn disarm(&self) {
        self.send(PanelIntent::Disarm);
    }

    pub fn open_history(&self) {
        self.send(PanelIntent::OpenHistory);
    }

    pub fn close_history(&self) {
        self.send(PanelIntent::CloseHistory);
    }

    pub fn refresh(&self) {
        self.send(PanelIntent::Refresh);
    }

    /// Stop polling, stop the loop and wait for every panel task to end.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Panel stopped");
    }
}

/// Dropping the handle without `shutdown` still stops polling; the tasks
/// wind down on their own.
impl Drop for PanelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Start a panel: one immediate poll cycle, then one every `poll_interval`.
pub fn spawn_panel<R: PanelRenderer>(
    options: PanelOptions,
    backend: Arc<dyn OrderBackend>,
    chime: Arc<dyn Chime>,
    renderer: R,
) -> PanelHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let refresh = Arc::new(Notify::new());

    let session = PanelSession::new(options.active_filter, options.change_detection);
    info!(
        session_id = %session.id(),
        interval_secs = options.poll_interval.as_secs(),
        active_filter = ?options.active_filter,
        change_detection = ?options.change_detection,
        "Starting dispatch panel"
    );

    let panel = PanelLoop {
        session,
        backend: backend.clone(),
        chime,
        renderer,
        events: events_tx.clone(),
        refresh: refresh.clone(),
        tracker: tracker.clone(),
    };
    tracker.spawn(panel.run(events_rx, cancel.clone()));
    tracker.spawn(poll_scheduler(
        backend,
        events_tx.clone(),
        options.poll_interval,
        refresh,
        cancel.clone(),
    ));

    PanelHandle {
        events: events_tx,
        cancel,
        tracker,
    }
}

// ---------------------------------------------------------------------------
// Poll scheduler
// ---------------------------------------------------------------------------

async fn poll_scheduler(
    backend: Arc<dyn OrderBackend>,
    events: mpsc::UnboundedSender<PanelEvent>,
    period: Duration,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = refresh.notified() => debug!("Manual refresh requested"),
        }

        let result = backend.fetch_orders().await;

        let (applied_tx, applied_rx) = oneshot::channel();
        let event = PanelEvent::Snapshot {
            result,
            applied: applied_tx,
        };
        if events.send(event).is_err() || applied_rx.await.is_err() {
            break;
        }
    }

    info!("Poll scheduler stopped");
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct PanelLoop<R> {
    session: PanelSession,
    backend: Arc<dyn OrderBackend>,
    chime: Arc<dyn Chime>,
    renderer: R,
    events: mpsc::UnboundedSender<PanelEvent>,
    refresh: Arc<Notify>,
    tracker: TaskTracker,
}

impl<R: PanelRenderer> PanelLoop<R> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PanelEvent>, cancel: CancellationToken) {
        self.renderer.render(&self.session.view());

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event),
                None => break,
            }
        }

        debug!(session_id = %self.session.id(), "Panel loop finished");
    }

    fn handle(&mut self, event: PanelEvent) {
        match event {
            PanelEvent::Snapshot { result, applied } => {
                self.reconcile(result);
                let _ = applied.send(());
            }
            PanelEvent::Intent(intent) => self.on_intent(intent),
            PanelEvent::TransitionSettled { id, result } => self.settle(id, result),
            PanelEvent::HistoryFetched { generation, result } => {
                let changed = match result {
                    Ok(snapshot) => self.session.apply_history(generation, &snapshot),
                    Err(e) => {
                        warn!(error = %e, "Delivery history fetch failed");
                        self.session.fail_history(generation)
                    }
                };
                if changed {
                    self.render();
                }
            }
        }
    }

    fn render(&mut self) {
        self.renderer.render(&self.session.view());
    }

    fn reconcile(&mut self, result: Result<Vec<Order>, FetchFailure>) {
        match result {
            Ok(snapshot) => {
                let outcome = self.session.apply_snapshot(&snapshot, Utc::now());
                debug!(
                    previous = ?outcome.previous_count,
                    active = outcome.active_count,
                    "Snapshot reconciled"
                );
                if outcome.notify {
                    info!(
                        active = outcome.active_count,
                        "New delivery order arrived; ringing"
                    );
                    self.chime.ring();
                }
            }
            Err(e) => {
                let failures = self.session.record_fetch_failure();
                warn!(error = %e, consecutive_failures = failures, "Order fetch failed; will retry next poll");
            }
        }
        self.render();
    }

    fn on_intent(&mut self, intent: PanelIntent) {
        match intent {
            PanelIntent::Arm(id) => match self.session.arm(id) {
                Ok(()) => self.render(),
                Err(rejection) => debug!(%rejection, "Arm ignored"),
            },
            PanelIntent::Disarm => {
                if self.session.disarm().is_some() {
                    self.render();
                }
            }
            PanelIntent::Confirm(id) => match self.session.begin_transition(&id) {
                Ok(()) => {
                    self.spawn_status_update(id);
                    self.render();
                }
                Err(rejection) => debug!(%rejection, "Confirm ignored"),
            },
            PanelIntent::OpenHistory => {
                if let Some(generation) = self.session.open_history() {
                    self.spawn_history_fetch(generation);
                }
                self.render();
            }
            PanelIntent::CloseHistory => {
                self.session.close_history();
                self.render();
            }
            PanelIntent::Refresh => self.refresh.notify_one(),
        }
    }

    fn settle(&mut self, id: OrderId, result: Result<(), TransitionFailure>) {
        if !self.session.finish_transition(&id, result.is_ok()) {
            return;
        }
        if let Err(e) = result {
            warn!(order_id = %id, error = %e, "Marking order delivered failed");
            self.renderer.alert(&e.to_string());
        }
        self.render();
    }

    fn spawn_status_update(&self, id: OrderId) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        self.tracker.spawn(async move {
            let result = backend.update_status(&id, &OrderStatus::Delivered).await;
            // The panel may have been torn down meanwhile.
            let _ = events.send(PanelEvent::TransitionSettled { id, result });
        });
    }

    fn spawn_history_fetch(&self, generation: u64) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        self.tracker.spawn(async move {
            let result = backend.fetch_orders().await;
            let _ = events.send(PanelEvent::HistoryFetched { generation, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    // -- Fakes ----------------------------------------------------------------

    #[derive(Default)]
    struct FakeBackend {
        snapshots: Mutex<VecDeque<Result<Vec<Order>, FetchFailure>>>,
        last_snapshot: Mutex<Vec<Order>>,
        fetch_delay: Option<Duration>,
        fetches: AtomicUsize,
        fetches_in_flight: AtomicUsize,
        max_fetches_in_flight: AtomicUsize,
        update_results: Mutex<VecDeque<Result<(), TransitionFailure>>>,
        update_calls: AtomicUsize,
        update_gate: Option<Semaphore>,
    }

    impl FakeBackend {
        fn push_snapshot(&self, ids: &[&str]) {
            let orders = ids
                .iter()
                .map(|id| Order::new(*id, OrderStatus::Accepted))
                .collect();
            self.snapshots.lock().unwrap().push_back(Ok(orders));
        }

        fn push_failure(&self) {
            self.snapshots
                .lock()
                .unwrap()
                .push_back(Err(FetchFailure::Network("connection refused".into())));
        }
    }

    #[async_trait]
    impl OrderBackend for FakeBackend {
        async fn fetch_orders(&self) -> Result<Vec<Order>, FetchFailure> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_fetches_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);

            // Queue exhausted: keep serving the last good snapshot.
            let next = self.snapshots.lock().unwrap().pop_front();
            match next {
                Some(Ok(orders)) => {
                    *self.last_snapshot.lock().unwrap() = orders.clone();
                    Ok(orders)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last_snapshot.lock().unwrap().clone()),
            }
        }

        async fn update_status(
            &self,
            _id: &OrderId,
            status: &OrderStatus,
        ) -> Result<(), TransitionFailure> {
            assert_eq!(*status, OrderStatus::Delivered);
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.update_gate {
                gate.acquire().await.unwrap().forget();
            }
            self.update_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    #[derive(Default)]
    struct CountingChime(AtomicUsize);

    impl Chime for CountingChime {
        fn ring(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default, Clone)]
    struct Frames {
        views: Arc<Mutex<Vec<PanelView>>>,
        alerts: Arc<Mutex<Vec<String>>>,
    }

    impl Frames {
        fn latest(&self) -> PanelView {
            self.views.lock().unwrap().last().cloned().unwrap()
        }

        fn active_ids(&self) -> Vec<String> {
            self.latest()
                .active
                .iter()
                .map(|v| v.order.id.to_string())
                .collect()
        }
    }

    impl PanelRenderer for Frames {
        fn render(&mut self, view: &PanelView) {
            self.views.lock().unwrap().push(view.clone());
        }

        fn alert(&mut self, message: &str) {
            self.alerts.lock().unwrap().push(message.to_string());
        }
    }

    fn start(backend: Arc<FakeBackend>) -> (PanelHandle, Arc<CountingChime>, Frames) {
        let chime = Arc::new(CountingChime::default());
        let frames = Frames::default();
        let handle = spawn_panel(
            PanelOptions::default(),
            backend,
            chime.clone(),
            frames.clone(),
        );
        (handle, chime, frames)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // -- Tests ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_poll_scenario_rings_once_per_increase() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1"]);
        backend.push_snapshot(&["1", "2"]);
        backend.push_snapshot(&["1", "2"]);
        let (handle, chime, frames) = start(backend.clone());

        settle().await;
        assert_eq!(frames.active_ids(), vec!["1"]);
        assert_eq!(chime.0.load(Ordering::SeqCst), 0);
        assert!(!frames.latest().loading);

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(frames.active_ids(), vec!["2", "1"]);
        assert!(frames.latest().active[0].is_newest);
        assert_eq!(chime.0.load(Ordering::SeqCst), 1);

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(chime.0.load(Ordering::SeqCst), 1);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_previous_state() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1", "2"]);
        backend.push_failure();
        backend.push_snapshot(&["1", "2", "3"]);
        let (handle, chime, frames) = start(backend.clone());

        settle().await;
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        let view = frames.latest();
        assert_eq!(frames.active_ids(), vec!["2", "1"]);
        assert_eq!(view.consecutive_failures, 1);

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(frames.active_ids(), vec!["3", "2", "1"]);
        assert_eq!(frames.latest().consecutive_failures, 0);
        assert_eq!(chime.0.load(Ordering::SeqCst), 1);
        assert!(frames.alerts.lock().unwrap().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_never_overlap() {
        let backend = Arc::new(FakeBackend {
            fetch_delay: Some(Duration::from_secs(25)),
            ..FakeBackend::default()
        });
        backend.push_snapshot(&["1"]);
        let (handle, _chime, _frames) = start(backend.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.max_fetches_in_flight.load(Ordering::SeqCst), 1);
        let fetches = backend.fetches.load(Ordering::SeqCst);
        assert!((4..=5).contains(&fetches), "fetches = {fetches}");

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_then_confirm_success() {
        let backend = Arc::new(FakeBackend {
            update_gate: Some(Semaphore::new(0)),
            ..FakeBackend::default()
        });
        backend.push_snapshot(&["1", "2"]);
        let (handle, _chime, frames) = start(backend.clone());
        settle().await;

        handle.arm("1");
        handle.arm("2");
        settle().await;
        assert_eq!(frames.latest().armed, Some(OrderId::new("2")));

        handle.confirm("2");
        handle.confirm("2");
        settle().await;
        let view = frames.latest();
        assert_eq!(view.transitioning, Some(OrderId::new("2")));
        assert_eq!(view.armed, None);
        assert_eq!(backend.update_calls.load(Ordering::SeqCst), 1);

        // Still responsive while the update is pending.
        handle.arm("1");
        settle().await;
        assert_eq!(frames.latest().armed, Some(OrderId::new("1")));

        backend.update_gate.as_ref().unwrap().add_permits(1);
        settle().await;
        let view = frames.latest();
        assert_eq!(frames.active_ids(), vec!["1"]);
        assert_eq!(view.transitioning, None);
        assert!(frames.alerts.lock().unwrap().is_empty());
        assert_eq!(backend.update_calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_failure_alerts_and_keeps_order() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1", "2"]);
        backend.update_results.lock().unwrap().push_back(Err(TransitionFailure::Rejected {
            status: 500,
            message: "Order backend server error (HTTP 500)".into(),
        }));
        let (handle, _chime, frames) = start(backend.clone());
        settle().await;

        handle.arm("2");
        handle.confirm("2");
        settle().await;

        let view = frames.latest();
        assert_eq!(frames.active_ids(), vec!["2", "1"]);
        assert_eq!(view.transitioning, None);
        assert_eq!(view.armed, None);
        let alerts = frames.alerts.lock().unwrap().clone();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("Failed to update status"));

        // No automatic retry.
        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 2).await;
        assert_eq!(backend.update_calls.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_without_arm_is_noop() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1"]);
        let (handle, _chime, frames) = start(backend.clone());
        settle().await;

        handle.confirm("1");
        settle().await;
        assert_eq!(backend.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(frames.active_ids(), vec!["1"]);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_open_and_close() {
        let backend = Arc::new(FakeBackend::default());
        backend.snapshots.lock().unwrap().push_back(Ok(vec![
            Order::new("1", OrderStatus::Delivered),
            Order::new("2", OrderStatus::Accepted),
            Order::new("3", OrderStatus::Delivered),
        ]));
        let (handle, _chime, frames) = start(backend.clone());
        settle().await;

        handle.open_history();
        settle().await;
        let history = frames.latest().history.unwrap();
        assert!(!history.loading);
        let ids: Vec<String> = history
            .orders
            .iter()
            .map(|v| v.order.id.to_string())
            .collect();
        assert_eq!(ids, vec!["3", "1"]);

        handle.close_history();
        settle().await;
        assert!(frames.latest().history.is_none());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_runs_a_cycle() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1"]);
        backend.push_snapshot(&["1", "2"]);
        let (handle, chime, frames) = start(backend.clone());
        settle().await;

        handle.refresh();
        settle().await;
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(frames.active_ids(), vec!["2", "1"]);
        assert_eq!(chime.0.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_polling() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1"]);
        let (handle, _chime, _frames) = start(backend.clone());
        settle().await;

        handle.shutdown().await;
        let fetches = backend.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 3).await;
        assert_eq!(backend.fetches.load(Ordering::SeqCst), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_polling() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_snapshot(&["1"]);
        let (handle, _chime, _frames) = start(backend.clone());
        settle().await;

        drop(handle);
        settle().await;
        let fetches = backend.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 3).await;
        assert_eq!(backend.fetches.load(Ordering::SeqCst), fetches);
    }
}
