//! Scheduler: drives checks for every active monitor.
//!
//! Active monitors are grouped by check interval. Each group owns one timer
//! task; a tick probes all members concurrently and completes once every
//! probe has settled. A separate timer periodically reconciles the groups
//! against the store.

mod reconcile;

pub use reconcile::*;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::config::ScheduleSettings;
use crate::db::{DbError, Monitor, Store};
use crate::probe::CheckRunner;

/// One interval group as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub interval_seconds: u64,
    pub monitor_ids: Vec<i64>,
}

/// Counts of what one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub moved: usize,
}

#[derive(Default)]
struct SchedulerState {
    monitors: HashMap<i64, Monitor>,
    groups: BTreeMap<u64, BTreeSet<i64>>,
    timers: HashMap<u64, broadcast::Sender<()>>,
    reconciler: Option<broadcast::Sender<()>>,
    started: bool,
}

impl SchedulerState {
    fn insert(&mut self, monitor: Monitor) {
        self.groups
            .entry(monitor.interval_secs())
            .or_default()
            .insert(monitor.id);
        self.monitors.insert(monitor.id, monitor);
    }

    fn remove(&mut self, id: i64) -> Option<Monitor> {
        let monitor = self.monitors.remove(&id)?;
        let interval = monitor.interval_secs();
        if let Some(members) = self.groups.get_mut(&interval) {
            members.remove(&id);
            if members.is_empty() {
                self.groups.remove(&interval);
            }
        }
        Some(monitor)
    }

    fn members(&self, interval: u64) -> Vec<Monitor> {
        self.groups
            .get(&interval)
            .map(|ids| ids.iter().filter_map(|id| self.monitors.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

struct Shared {
    store: Arc<Store>,
    runner: Arc<CheckRunner>,
    settings: ScheduleSettings,
    state: RwLock<SchedulerState>,
}

/// Handle to the scheduler; clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, runner: Arc<CheckRunner>, settings: ScheduleSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                runner,
                settings,
                state: RwLock::new(SchedulerState::default()),
            }),
        }
    }

    /// Load active monitors and start one staggered timer per interval group,
    /// plus the reconciliation timer. A second call is a no-op.
    pub async fn start(&self) -> Result<(), DbError> {
        let monitors = self.shared.store.get_active_monitors()?;

        let mut state = self.shared.state.write().await;
        if state.started {
            return Ok(());
        }
        state.started = true;

        for monitor in monitors {
            state.insert(monitor);
        }

        let intervals: Vec<u64> = state.groups.keys().copied().collect();
        tracing::info!(
            "Scheduler: Starting with {} monitors in {} groups",
            state.monitors.len(),
            intervals.len()
        );

        for (index, interval_secs) in intervals.into_iter().enumerate() {
            let delay = self.shared.settings.group_stagger * index as u32;
            let stop_tx = self.shared.spawn_group(interval_secs, delay);
            state.timers.insert(interval_secs, stop_tx);
        }

        state.reconciler = Some(self.shared.spawn_reconciler());
        Ok(())
    }

    /// Cancel every timer and forget all monitors. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut state = self.shared.state.write().await;
        if !state.started {
            return;
        }

        for (_, stop_tx) in state.timers.drain() {
            let _ = stop_tx.send(());
        }
        if let Some(stop_tx) = state.reconciler.take() {
            let _ = stop_tx.send(());
        }
        state.monitors.clear();
        state.groups.clear();
        state.started = false;

        tracing::info!("Scheduler: Stopped");
    }

    /// Bring the scheduled set in line with the store's active monitors.
    ///
    /// On a store error the current set is left untouched.
    #[cfg(test)]
    pub async fn reconcile(&self) -> Result<ReconcileReport, DbError> {
        self.shared.reconcile().await
    }

    /// Probe every member of one interval group; returns how many checks were recorded.
    #[cfg(test)]
    pub async fn run_tick(&self, interval_secs: u64) -> usize {
        self.shared.run_tick(interval_secs).await
    }

    pub async fn snapshot(&self) -> Vec<GroupSnapshot> {
        let state = self.shared.state.read().await;
        state
            .groups
            .iter()
            .map(|(interval_seconds, ids)| GroupSnapshot {
                interval_seconds: *interval_seconds,
                monitor_ids: ids.iter().copied().collect(),
            })
            .collect()
    }
}

impl Shared {
    fn spawn_group(self: &Arc<Self>, interval_secs: u64, delay: Duration) -> broadcast::Sender<()> {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        tracing::info!("Scheduler: Starting {}s group (delay {:?})", interval_secs, delay);
        tokio::spawn(run_group_loop(self.clone(), interval_secs, delay, stop_rx));
        stop_tx
    }

    fn spawn_reconciler(self: &Arc<Self>) -> broadcast::Sender<()> {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        tokio::spawn(run_reconcile_loop(self.clone(), stop_rx));
        stop_tx
    }

    async fn run_tick(&self, interval_secs: u64) -> usize {
        let monitors = self.state.read().await.members(interval_secs);
        if monitors.is_empty() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        for monitor in monitors {
            let runner = self.runner.clone();
            tasks.spawn(async move {
                let result = runner.run_check(&monitor).await;
                (monitor, result)
            });
        }

        let mut recorded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((monitor, Ok(outcome))) => {
                    recorded += 1;
                    if let (Some(transition), Some(_)) = (&outcome.transition, &outcome.dispatch) {
                        tracing::debug!(
                            "Scheduler: Alerts queued for {} (incident #{}, check #{})",
                            monitor.name,
                            transition.incident().id,
                            outcome.check.id
                        );
                    }
                }
                Ok((monitor, Err(e))) => {
                    tracing::error!("Scheduler: Check failed for {} (id={}): {}", monitor.name, monitor.id, e)
                }
                Err(e) => tracing::error!("Scheduler: Check task for {}s group aborted: {}", interval_secs, e),
            }
        }
        recorded
    }

    async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport, DbError> {
        let fresh = self.store.get_active_monitors()?;

        let mut state = self.state.write().await;
        if !state.started {
            return Ok(ReconcileReport::default());
        }

        let plan = plan_reconcile(&state.monitors, &fresh);
        let report = ReconcileReport {
            added: plan.added.len(),
            removed: plan.removed.len(),
            updated: plan.updated.len(),
            moved: plan.moved.len(),
        };
        if plan.is_empty() {
            return Ok(report);
        }

        for id in plan.removed {
            if let Some(monitor) = state.remove(id) {
                tracing::info!("Scheduler: Removed monitor {} (id={})", monitor.name, id);
            }
        }
        for monitor in plan.moved {
            state.remove(monitor.id);
            tracing::info!(
                "Scheduler: Moved monitor {} (id={}) to {}s group",
                monitor.name,
                monitor.id,
                monitor.interval_secs()
            );
            state.insert(monitor);
        }
        for monitor in plan.updated {
            state.monitors.insert(monitor.id, monitor);
        }
        for monitor in plan.added {
            tracing::info!("Scheduler: Added monitor {} (id={})", monitor.name, monitor.id);
            state.insert(monitor);
        }

        let retired: Vec<u64> = state
            .timers
            .keys()
            .filter(|interval_secs| !state.groups.contains_key(interval_secs))
            .copied()
            .collect();
        for interval_secs in retired {
            if let Some(stop_tx) = state.timers.remove(&interval_secs) {
                let _ = stop_tx.send(());
                tracing::info!("Scheduler: Retired empty {}s group", interval_secs);
            }
        }

        let created: Vec<u64> = state
            .groups
            .keys()
            .filter(|interval_secs| !state.timers.contains_key(interval_secs))
            .copied()
            .collect();
        for interval_secs in created {
            let stop_tx = self.spawn_group(interval_secs, Duration::ZERO);
            state.timers.insert(interval_secs, stop_tx);
        }

        Ok(report)
    }
}

async fn run_group_loop(
    shared: Arc<Shared>,
    interval_secs: u64,
    delay: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    if !delay.is_zero() {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // First tick completes immediately.
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                let recorded = shared.run_tick(interval_secs).await;
                tracing::debug!("Scheduler: Tick for {}s group recorded {} checks", interval_secs, recorded);
            }
        }
    }

    tracing::debug!("Scheduler: Timer for {}s group stopped", interval_secs);
}

async fn run_reconcile_loop(shared: Arc<Shared>, mut stop_rx: broadcast::Receiver<()>) {
    let period = shared.settings.reconcile_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                match shared.reconcile().await {
                    Ok(report) if report != ReconcileReport::default() => tracing::info!(
                        "Scheduler: Reconciled monitors ({} added, {} removed, {} updated, {} moved)",
                        report.added,
                        report.removed,
                        report.updated,
                        report.moved
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Scheduler: Reconciliation failed, keeping previous monitor set: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_server, temp_store, test_monitor, test_runner};
    use axum::{routing::get, Router};

    fn settings() -> ScheduleSettings {
        ScheduleSettings {
            reconcile_interval: Duration::from_secs(3600),
            group_stagger: Duration::from_millis(10),
        }
    }

    fn scheduler(store: Arc<Store>) -> Scheduler {
        let runner = Arc::new(test_runner(store.clone(), 3));
        Scheduler::new(store, runner, settings())
    }

    async fn wait_for_checks(store: &Store, monitor_id: i64, count: usize) -> bool {
        for _ in 0..100 {
            if store.get_checks(monitor_id).unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_groups_by_interval_and_fires_immediately() {
        let addr = spawn_server(Router::new().route("/", get(|| async { "ok" }))).await;
        let url = format!("http://{}/", addr);
        let (_tmp, store) = temp_store();

        let mut ids = Vec::new();
        for interval in [60, 300, 300] {
            let mut monitor = test_monitor(&url, interval);
            store.add_monitor(&mut monitor).unwrap();
            ids.push(monitor.id);
        }
        let mut paused = test_monitor(&url, 60);
        paused.is_active = false;
        store.add_monitor(&mut paused).unwrap();

        let scheduler = scheduler(store.clone());
        scheduler.start().await.unwrap();

        assert_eq!(
            scheduler.snapshot().await,
            vec![
                GroupSnapshot {
                    interval_seconds: 60,
                    monitor_ids: vec![ids[0]],
                },
                GroupSnapshot {
                    interval_seconds: 300,
                    monitor_ids: vec![ids[1], ids[2]],
                },
            ]
        );

        for id in &ids {
            assert!(wait_for_checks(&store, *id, 1).await, "monitor {} never probed", id);
        }
        assert!(store.get_checks(paused.id).unwrap().is_empty());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(scheduler.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_tick_survives_failing_members() {
        let addr = spawn_server(Router::new().route("/", get(|| async { "ok" }))).await;
        let (_tmp, store) = temp_store();

        let mut healthy = test_monitor(&format!("http://{}/", addr), 60);
        store.add_monitor(&mut healthy).unwrap();
        let mut broken = test_monitor("not a url", 60);
        store.add_monitor(&mut broken).unwrap();

        let scheduler = scheduler(store.clone());
        scheduler.start().await.unwrap();
        scheduler.stop().await;

        // Stopped schedulers hold no members.
        assert_eq!(scheduler.run_tick(60).await, 0);

        scheduler.start().await.unwrap();
        assert_eq!(scheduler.run_tick(60).await, 2);
        assert!(!store.get_checks(broken.id).unwrap().last().unwrap().is_up);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_reconcile_adds_removes_and_moves() {
        let addr = spawn_server(Router::new().route("/", get(|| async { "ok" }))).await;
        let url = format!("http://{}/", addr);
        let (_tmp, store) = temp_store();

        let mut first = test_monitor(&url, 60);
        store.add_monitor(&mut first).unwrap();

        let scheduler = scheduler(store.clone());
        scheduler.start().await.unwrap();

        let mut second = test_monitor(&url, 120);
        store.add_monitor(&mut second).unwrap();
        store.set_monitor_active(first.id, false).unwrap();

        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(
            scheduler.snapshot().await,
            vec![GroupSnapshot {
                interval_seconds: 120,
                monitor_ids: vec![second.id],
            }]
        );
        // A newly created group fires right away.
        assert!(wait_for_checks(&store, second.id, 1).await);

        second.check_interval_seconds = 30;
        store.update_monitor(&second).unwrap();
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(scheduler.snapshot().await[0].interval_seconds, 30);
        assert!(wait_for_checks(&store, second.id, 2).await);

        second.url = format!("{}?v=2", url);
        store.update_monitor(&second).unwrap();
        let report = scheduler.reconcile().await.unwrap();
        assert_eq!(report.updated, 1);

        assert_eq!(scheduler.reconcile().await.unwrap(), ReconcileReport::default());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_reconcile_store_error_keeps_previous_set() {
        let addr = spawn_server(Router::new().route("/", get(|| async { "ok" }))).await;
        let url = format!("http://{}/", addr);
        let (_tmp, store) = temp_store();

        let mut first = test_monitor(&url, 60);
        store.add_monitor(&mut first).unwrap();
        let mut second = test_monitor(&url, 300);
        store.add_monitor(&mut second).unwrap();

        let scheduler = scheduler(store.clone());
        scheduler.start().await.unwrap();
        let before = scheduler.snapshot().await;
        assert_eq!(before.len(), 2);

        store.execute_raw("ALTER TABLE monitors RENAME TO monitors_offline").unwrap();
        assert!(scheduler.reconcile().await.is_err());
        assert_eq!(scheduler.snapshot().await, before);

        // Ticks keep running from the cached set.
        assert_eq!(scheduler.run_tick(60).await, 1);

        store.execute_raw("ALTER TABLE monitors_offline RENAME TO monitors").unwrap();
        assert_eq!(scheduler.reconcile().await.unwrap(), ReconcileReport::default());
        assert_eq!(scheduler.snapshot().await, before);
        scheduler.stop().await;
    }
}
