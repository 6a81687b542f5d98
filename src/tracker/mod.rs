//! Sales tracking loop.
//!
//! One check = resolve livestream → walk the sold tab → aggregate → compare
//! with the last reported total → persist + broadcast. Checks run on a
//! fixed-rate timer while a livestream is active and can be forced at any
//! time. Overlapping checks are allowed; shared state is only touched in
//! short critical sections, never across an await, so concurrent checks
//! settle last-write-wins.

use crate::aggregate::{aggregate, AggregateResult, FeeSchedule};
use crate::config::PersistPolicy;
use crate::resolver::LivestreamResolver;
use crate::shop::ShopClient;
use crate::store::{SalesStore, StoredTotals};
use crate::sync::UpdateBus;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ─── Tracker state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerState {
    pub current_livestream_id: Option<String>,
    pub last_total: Decimal,
}

/// Mutable tracker state, shared between the check loop, the livestream
/// watcher and the dashboard.
#[derive(Default)]
pub struct TrackerContext {
    state: Mutex<TrackerState>,
}

impl TrackerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> TrackerState {
        self.state.lock().await.clone()
    }

    pub async fn last_total(&self) -> Decimal {
        self.state.lock().await.last_total
    }

    /// Make `livestream_id` current. On a change `last_total` drops to zero
    /// so the first total of the new livestream always reports.
    pub async fn switch_to(&self, livestream_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.current_livestream_id.as_deref() == Some(livestream_id) {
            return false;
        }
        state.current_livestream_id = Some(livestream_id.to_string());
        state.last_total = Decimal::ZERO;
        true
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.current_livestream_id = None;
        state.last_total = Decimal::ZERO;
    }
}

// ─── Repeating task ─────────────────────────────────────────────────────────

pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct TaskSlot {
    timer: Option<JoinHandle<()>>,
    job: Option<Job>,
}

/// Cancellable fixed-rate timer. Each tick spawns the job on its own, so a
/// slow run never pushes back the next tick. At most one timer is alive.
pub struct RepeatingTask {
    name: &'static str,
    slot: Mutex<TaskSlot>,
}

impl RepeatingTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(TaskSlot::default()),
        }
    }

    /// Install `job` on `period`, replacing any running timer. The first run
    /// fires immediately.
    pub async fn start(&self, period: Duration, job: Job) {
        let mut slot = self.slot.lock().await;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
            debug!(task = self.name, "cleared existing timer");
        }

        let tick_job = job.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                tokio::spawn(tick_job());
            }
        });

        slot.timer = Some(timer);
        slot.job = Some(job);
        info!(task = self.name, period_secs = period.as_secs_f64(), "timer started");
    }

    /// Cancel the timer. Runs already in flight are left to finish.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
            info!(task = self.name, "timer stopped");
        }
    }

    /// Spawn one run of the installed job outside the schedule.
    pub async fn run_now(&self) -> Option<JoinHandle<()>> {
        let job = self.slot.lock().await.job.clone()?;
        Some(tokio::spawn(job()))
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.timer.is_some()
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

/// What a single check did.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// No livestream is active.
    NoLivestream,
    /// Total unchanged (or the write failed); nothing persisted or broadcast.
    Unchanged,
    /// The livestream switched while this check was fetching; result dropped.
    Superseded,
    /// Totals persisted and broadcast.
    Updated(AggregateResult),
}

pub struct TrackerSettings {
    pub check_interval: Duration,
    pub persist_policy: PersistPolicy,
    pub fees: FeeSchedule,
}

pub struct Tracker {
    shop: ShopClient,
    resolver: Arc<dyn LivestreamResolver>,
    context: Arc<TrackerContext>,
    store: SalesStore,
    bus: UpdateBus,
    settings: TrackerSettings,
    task: RepeatingTask,
}

impl Tracker {
    pub fn new(
        shop: ShopClient,
        resolver: Arc<dyn LivestreamResolver>,
        context: Arc<TrackerContext>,
        store: SalesStore,
        bus: UpdateBus,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            shop,
            resolver,
            context,
            store,
            bus,
            settings,
            task: RepeatingTask::new("sales-check"),
        }
    }

    pub fn context(&self) -> &Arc<TrackerContext> {
        &self.context
    }

    pub async fn is_tracking(&self) -> bool {
        self.task.is_running().await
    }

    /// Run one sales check.
    pub async fn check_sales(&self) -> CheckOutcome {
        let Some(livestream_id) = self.resolver.resolve() else {
            info!("no livestream id available, skipping check");
            return CheckOutcome::NoLivestream;
        };

        if self.context.switch_to(&livestream_id).await {
            info!(livestream_id = %livestream_id, "tracking new livestream, total reset");
        }

        debug!(livestream_id = %livestream_id, "checking sales");

        let sales = self.shop.fetch_all_sales(&livestream_id).await;
        let result = aggregate(&sales, &self.settings.fees, Utc::now());

        info!(
            livestream_id = %livestream_id,
            sales = result.sales_count,
            total = %result.total_sales,
            after_fees = %result.total_after_fees,
            "sales check"
        );

        let previous = {
            let state = self.context.state.lock().await;
            if state.current_livestream_id.as_deref() != Some(livestream_id.as_str()) {
                debug!(livestream_id = %livestream_id, "livestream changed mid-check, dropping result");
                return CheckOutcome::Superseded;
            }
            state.last_total
        };

        let changed = result.total_sales != previous;
        if !changed && self.settings.persist_policy == PersistPolicy::OnChange {
            debug!(total = %result.total_sales, "no change in total sales");
            return CheckOutcome::Unchanged;
        }

        let stored = StoredTotals::from(&result);
        if let Err(e) = self.store.set(&stored).await {
            warn!(error = %e, backend = self.store.backend_name(), "failed to persist totals");
            return CheckOutcome::Unchanged;
        }

        {
            let mut state = self.context.state.lock().await;
            if state.current_livestream_id.as_deref() == Some(livestream_id.as_str()) {
                state.last_total = result.total_sales;
            }
        }

        if changed {
            info!(from = %previous, to = %result.total_sales, "total sales updated");
        }

        self.bus.publish(stored);
        CheckOutcome::Updated(result)
    }

    /// (Re)install the periodic check, first run immediately.
    pub async fn start_tracking(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let job: Job = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(tracker) = weak.upgrade() {
                    tracker.check_sales().await;
                }
            }
            .boxed()
        });
        self.task.start(self.settings.check_interval, job).await;
    }

    pub async fn stop_tracking(&self) {
        self.task.stop().await;
    }

    /// Follow resolver changes: a new id resets state and restarts the
    /// timer, a cleared id stops it. Returns when the resolver goes away.
    pub async fn watch_livestreams(self: Arc<Self>) {
        let mut rx = self.resolver.subscribe();
        let mut tracked: Option<String> = None;

        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Some(id) if tracked.as_deref() != Some(id.as_str()) => {
                    self.context.switch_to(&id).await;
                    info!(livestream_id = %id, resolver = self.resolver.name(), "starting sales tracking");
                    self.start_tracking().await;
                    tracked = Some(id);
                }
                None if tracked.is_some() => {
                    info!("livestream ended, stopping sales tracking");
                    self.stop_tracking().await;
                    self.context.clear().await;
                    tracked = None;
                }
                _ => {}
            }

            if rx.changed().await.is_err() {
                debug!("resolver closed, livestream watcher exiting");
                break;
            }
        }
    }
}
