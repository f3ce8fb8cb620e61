//! Scheduler module for running probe cycles and aggregating results.

mod reconcile;
mod stats;

pub use reconcile::*;
pub use stats::*;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::db::{
    AlertState, AlertView, DbError, ProbeOutcome, ProbeParams, ProbeRecord, ProbeStatus, ResetMode, Target,
};
use crate::probe::{probe_within, Connector, ConnectorFactory, ProbeError};
use crate::publish::{Publisher, StateStore};

/// Extra time granted to in-flight probes after the longest timeout.
pub const DRAIN_BUFFER: Duration = Duration::from_millis(500);

/// Below this per-target slice, pacing is unlikely to spread probes evenly.
pub const MIN_PACING_BUDGET: Duration = Duration::from_millis(10);

pub const TARGETS_KEY: &str = "targets";
pub const PARAMS_KEY: &str = "probe_params";
pub const RECORDS_KEY: &str = "probe_records";

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("reconciliation failed: {0}")]
    Reconcile(String),
    #[error("unknown record {0}")]
    UnknownRecord(i64),
    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state store error: {0}")]
    Store(#[from] DbError),
}

/// Live targets, their records and connectors.
#[derive(Default)]
pub struct EngineState {
    pub targets: BTreeMap<i64, Target>,
    pub records: BTreeMap<i64, ProbeRecord>,
    pub connectors: HashMap<i64, Arc<dyn Connector>>,
    pub params: ProbeParams,
}

impl EngineState {
    fn next_id(&self) -> i64 {
        self.records.keys().chain(self.targets.keys()).copied().max().unwrap_or(0).max(0) + 1
    }
}

/// Timing parameters for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub next_run_interval_ms: u64,
    pub global_timeout_ms: u64,
    pub max_buffer_ms: u64,
    /// Write the state blobs at the end of the cycle.
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_persist() -> bool {
    true
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.next_run_interval_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    pub fn max_buffer(&self) -> Duration {
        Duration::from_millis(self.max_buffer_ms)
    }

    /// Time slice between consecutive dispatches.
    pub fn per_target_budget(&self, enabled: usize) -> Duration {
        if enabled == 0 {
            return Duration::ZERO;
        }
        let window = self
            .interval()
            .saturating_sub(self.global_timeout())
            .saturating_sub(self.max_buffer());
        window / u32::try_from(enabled).unwrap_or(u32::MAX)
    }
}

/// What happened during one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub success: bool,
    pub messages: Vec<String>,
    pub warnings: Vec<String>,
    pub reconcile: ReconcileSummary,
    pub per_target_budget_ms: u64,
    pub dispatched: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl CycleResult {
    fn new() -> Self {
        Self {
            success: true,
            messages: Vec::new(),
            warnings: Vec::new(),
            reconcile: ReconcileSummary::default(),
            per_target_budget_ms: 0,
            dispatched: 0,
            completed: 0,
            abandoned: 0,
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    fn note(&mut self, message: String) {
        tracing::info!("Cycle: {}", message);
        self.messages.push(message);
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("Cycle: {}", message);
        self.warnings.push(message.clone());
        self.messages.push(message);
    }

    fn fail(&mut self, message: String) {
        tracing::error!("Cycle: {}", message);
        self.success = false;
        self.messages.push(message);
    }
}

struct Dispatch {
    target_id: i64,
    timeout: Duration,
    connector: Arc<dyn Connector>,
}

/// Owns the live engine state and runs probe cycles over it.
pub struct ProbeScheduler {
    state: RwLock<EngineState>,
    reconciler: TargetReconciler,
    factory: Arc<dyn ConnectorFactory>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn StateStore>,
    cycle_guard: Mutex<()>,
}

impl ProbeScheduler {
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            reconciler: TargetReconciler::new(),
            factory,
            publisher,
            store,
            cycle_guard: Mutex::new(()),
        }
    }

    /// Load persisted targets, params and records. Anything unreadable starts empty.
    pub async fn restore(&self) {
        let params: Option<ProbeParams> = self.load(PARAMS_KEY).await;
        let targets: Vec<Target> = self.load(TARGETS_KEY).await.unwrap_or_default();
        let records: Vec<ProbeRecord> = self.load(RECORDS_KEY).await.unwrap_or_default();

        let mut saved: BTreeMap<i64, ProbeRecord> = records.into_iter().map(|r| (r.id, r)).collect();
        let mut state = self.state.write().await;
        *state = EngineState {
            params: params.unwrap_or_default(),
            ..Default::default()
        };

        for target in targets {
            let mut record = saved.remove(&target.id).unwrap_or_else(|| ProbeRecord::new(&target));
            record.describe(&target);
            state.connectors.insert(target.id, self.factory.build(&target));
            state.records.insert(target.id, record);
            state.targets.insert(target.id, target);
        }
        if !saved.is_empty() {
            tracing::warn!("Restore: dropped {} records without a target", saved.len());
        }

        tracing::info!("Restore: {} targets loaded", state.targets.len());
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.load_blob(key).await {
            Ok(Some(blob)) => match serde_json::from_slice(&blob) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("Restore: blob {} is unreadable, starting empty: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Restore: failed to load {}, starting empty: {}", key, e);
                None
            }
        }
    }

    async fn persist(&self, targets: &[Target], params: &ProbeParams, records: &[ProbeRecord]) -> Result<(), EngineError> {
        self.store.save_blob(TARGETS_KEY, serde_json::to_vec(targets)?).await?;
        self.store.save_blob(PARAMS_KEY, serde_json::to_vec(params)?).await?;
        self.store.save_blob(RECORDS_KEY, serde_json::to_vec(records)?).await?;
        Ok(())
    }

    /// Replace the live target set and parameters.
    ///
    /// Returns the number of targets now live.
    pub async fn init(&self, targets: Vec<Target>, params: ProbeParams, reset_mode: ResetMode) -> usize {
        let _guard = self.cycle_guard.lock().await;
        self.reconciler.clear().await;

        let aggregator = StatsAggregator::new(&params);
        let (targets_snapshot, records_snapshot) = {
            let mut state = self.state.write().await;
            let mut next_id = state.next_id().max(targets.iter().map(|t| t.id).max().unwrap_or(0) + 1);
            let mut previous = match reset_mode {
                ResetMode::Clear => BTreeMap::new(),
                ResetMode::Keep | ResetMode::Zero => std::mem::take(&mut state.records),
            };

            state.records.clear();
            state.targets.clear();
            state.connectors.clear();

            for mut target in targets {
                if target.id == 0 {
                    target.id = next_id;
                    next_id += 1;
                }
                let mut record = previous.remove(&target.id).unwrap_or_else(|| ProbeRecord::new(&target));
                record.describe(&target);
                if reset_mode == ResetMode::Zero {
                    aggregator.zero(&mut record);
                }
                state.connectors.insert(target.id, self.factory.build(&target));
                state.records.insert(target.id, record);
                state.targets.insert(target.id, target);
            }
            state.params = params.clone();

            (
                state.targets.values().cloned().collect::<Vec<_>>(),
                state.records.values().cloned().collect::<Vec<_>>(),
            )
        };

        tracing::info!("Init: {} targets live ({:?})", targets_snapshot.len(), reset_mode);
        if let Err(e) = self.persist(&targets_snapshot, &params, &records_snapshot).await {
            tracing::warn!("Init: failed to persist state: {}", e);
        }
        targets_snapshot.len()
    }

    /// Stage a target batch for `owner_id`; applied at the next cycle.
    pub async fn stage_targets(&self, owner_id: &str, targets: Vec<Target>) {
        self.reconciler.stage(owner_id, targets).await;
    }

    /// Run one probe cycle. Never panics and always signals readiness at the end.
    pub async fn run_cycle(&self, cfg: &CycleConfig) -> CycleResult {
        let _guard = self.cycle_guard.lock().await;
        let started = Instant::now();
        let mut result = CycleResult::new();

        self.signal_ready(false).await;

        let outcome = AssertUnwindSafe(self.execute_cycle(cfg, &mut result))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result.fail(format!("cycle aborted: {}", e)),
            Err(_) => result.fail("cycle aborted: panic inside the engine".to_string()),
        }

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        self.signal_ready(true).await;
        result
    }

    async fn signal_ready(&self, ready: bool) {
        if let Err(e) = self.publisher.publish_ready(ready).await {
            tracing::error!("CRITICAL: failed to signal processor ready={}: {}", ready, e);
        }
    }

    async fn execute_cycle(&self, cfg: &CycleConfig, result: &mut CycleResult) -> Result<(), EngineError> {
        let (plan, aggregator) = {
            let mut state = self.state.write().await;
            result.reconcile = self.reconciler.apply_pending(&mut state, self.factory.as_ref()).await?;

            let rolled = roll_over(&mut state);
            if rolled > 0 {
                result.note(format!("{} records rolled over to a new window", rolled));
            }

            let global_timeout = cfg.global_timeout();
            let plan: Vec<Dispatch> = state
                .targets
                .values()
                .filter(|t| t.enabled)
                .filter_map(|t| {
                    let connector = state.connectors.get(&t.id)?.clone();
                    let timeout = if t.timeout_ms > 0 {
                        Duration::from_millis(t.timeout_ms)
                    } else {
                        global_timeout
                    };
                    Some(Dispatch {
                        target_id: t.id,
                        timeout,
                        connector,
                    })
                })
                .collect();
            (plan, StatsAggregator::new(&state.params))
        };

        if plan.is_empty() {
            result.fail("no enabled targets; nothing dispatched".to_string());
            return Ok(());
        }

        let budget = cfg.per_target_budget(plan.len());
        result.per_target_budget_ms = budget.as_millis() as u64;
        if budget < MIN_PACING_BUDGET {
            result.warn(format!(
                "per-target budget {} ms for {} targets is below {} ms; pacing is likely insufficient",
                budget.as_millis(),
                plan.len(),
                MIN_PACING_BUDGET.as_millis()
            ));
        }

        let drain = plan.iter().map(|d| d.timeout).max().unwrap_or_default() + DRAIN_BUFFER;
        let projected = budget * plan.len() as u32 + drain;
        if projected > cfg.interval() {
            result.warn(format!(
                "projected cycle time {} ms exceeds the {} ms interval",
                projected.as_millis(),
                cfg.next_run_interval_ms
            ));
        }

        let outcomes = dispatch_all(&plan, budget, drain).await;
        result.dispatched = plan.len();
        result.completed = outcomes.len();

        let outcomes = settle_outcomes(&plan, outcomes, Utc::now());
        result.abandoned = outcomes.iter().filter(|o| o.status == ProbeStatus::Abandoned).count();
        if result.abandoned > 0 {
            result.warn(format!("{} probes abandoned after the drain window", result.abandoned));
        }

        let (targets, params, records, alerts) = {
            let mut state = self.state.write().await;
            for outcome in &outcomes {
                if let Some(record) = state.records.get_mut(&outcome.target_id) {
                    aggregator.merge(record, outcome);
                }
            }
            for record in state.records.values_mut() {
                if restore_sent_invariant(record) {
                    tracing::warn!("Cycle: record {} sent count drifted, corrected", record.id);
                }
            }

            let records: Vec<ProbeRecord> = state.records.values().cloned().collect();
            let alerts: Vec<AlertView> = records.iter().map(ProbeRecord::alert_view).collect();
            (
                state.targets.values().cloned().collect::<Vec<_>>(),
                state.params.clone(),
                records,
                alerts,
            )
        };

        if let Err(e) = self.publisher.publish_records(&records).await {
            result.fail(format!("publishing records failed: {}", e));
        }
        if let Err(e) = self.publisher.publish_alerts(&alerts).await {
            result.fail(format!("publishing alert views failed: {}", e));
        }

        if cfg.persist {
            if let Err(e) = self.persist(&targets, &params, &records).await {
                result.warn(format!("persisting state skipped: {}", e));
            }
        }

        result.note(format!(
            "{} dispatched, {} completed, {} abandoned",
            result.dispatched, result.completed, result.abandoned
        ));
        Ok(())
    }

    pub async fn set_alert_flag(&self, ids: &[i64], value: bool) -> usize {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                record.alert.alert_flag = value;
                updated += 1;
            }
        }
        updated
    }

    pub async fn set_alert_sent(&self, ids: &[i64], value: bool) -> usize {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                record.alert.alert_sent = value;
                updated += 1;
            }
        }
        updated
    }

    /// Clear alert flags and hand back the state as it was before the reset.
    ///
    /// `down_count` is zeroed by the next merge, exactly once.
    pub async fn reset_alert(&self, id: i64) -> Result<AlertState, EngineError> {
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&id).ok_or(EngineError::UnknownRecord(id))?;
        let before = record.alert.clone();
        record.alert.alert_flag = false;
        record.alert.alert_sent = false;
        record.dirty_down_count = true;
        Ok(before)
    }

    pub async fn remove_samples(&self, record_id: i64, sample_ids: &[u64]) -> RemovalSummary {
        let mut state = self.state.write().await;
        let aggregator = StatsAggregator::new(&state.params);
        aggregator.remove_samples(&mut state.records, record_id, sample_ids)
    }

    pub async fn records(&self) -> Vec<ProbeRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    pub async fn params(&self) -> ProbeParams {
        self.state.read().await.params.clone()
    }

    pub async fn pending_owners(&self) -> Vec<String> {
        self.reconciler.pending_owners().await
    }

    /// Signal that the processor is going away.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler: shutting down");
        self.signal_ready(false).await;
    }
}

/// Zero records whose measurement window has elapsed.
fn roll_over(state: &mut EngineState) -> usize {
    if state.params.stats_window_secs == 0 {
        return 0;
    }
    let secs = state.params.stats_window_secs;
    let Some(window) = i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds) else {
        tracing::warn!("Scheduler: stats window of {} s is out of range, rollover disabled", secs);
        return 0;
    };
    let aggregator = StatsAggregator::new(&state.params);
    let now = Utc::now();

    let mut rolled = 0;
    for record in state.records.values_mut() {
        if now - record.started_at >= window {
            aggregator.zero(record);
            rolled += 1;
        }
    }
    rolled
}

/// Dispatch every probe, spaced by `budget`, then collect results until `drain` runs out.
async fn dispatch_all(plan: &[Dispatch], budget: Duration, drain: Duration) -> HashMap<i64, ProbeOutcome> {
    let (tx, mut rx) = mpsc::channel::<ProbeOutcome>(plan.len().max(1));
    let mut tasks = JoinSet::new();

    for (i, dispatch) in plan.iter().enumerate() {
        let dispatch_start = Instant::now();

        let tx = tx.clone();
        let connector = dispatch.connector.clone();
        let (target_id, timeout) = (dispatch.target_id, dispatch.timeout);
        tasks.spawn(async move {
            let outcome = run_probe(target_id, connector, timeout).await;
            // The receiver is gone once the drain window has closed.
            let _ = tx.send(outcome).await;
        });

        if i + 1 < plan.len() {
            let overhead = dispatch_start.elapsed();
            tokio::time::sleep(budget.saturating_sub(overhead)).await;
        }
    }
    drop(tx);

    let deadline = Instant::now() + drain;
    let mut outcomes = HashMap::with_capacity(plan.len());
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(outcome)) => {
                outcomes.insert(outcome.target_id, outcome);
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    "Drain window closed with {} probes outstanding",
                    plan.len() - outcomes.len()
                );
                break;
            }
        }
    }
    tasks.abort_all();
    outcomes
}

async fn run_probe(target_id: i64, connector: Arc<dyn Connector>, timeout: Duration) -> ProbeOutcome {
    let time = Utc::now();
    let result = AssertUnwindSafe(probe_within(connector.as_ref(), timeout))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(rtt)) => ProbeOutcome::success(target_id, time, rtt.as_secs_f64() * 1000.0),
        Ok(Err(ProbeError::Timeout(t))) => ProbeOutcome::failure(
            target_id,
            time,
            ProbeStatus::Timeout,
            format!("timed out after {} ms", t.as_millis()),
        ),
        Ok(Err(e)) => {
            tracing::debug!("Probe {} ({}) failed: {}", target_id, connector.describe(), e);
            ProbeOutcome::failure(target_id, time, ProbeStatus::Error, e.to_string())
        }
        Err(_) => {
            tracing::error!("Probe {} ({}) panicked", target_id, connector.describe());
            ProbeOutcome::failure(target_id, time, ProbeStatus::Error, "connector panicked".to_string())
        }
    }
}

/// One outcome per dispatched target, in dispatch order; missing ones become abandoned.
fn settle_outcomes(plan: &[Dispatch], mut outcomes: HashMap<i64, ProbeOutcome>, now: DateTime<Utc>) -> Vec<ProbeOutcome> {
    plan.iter()
        .map(|d| {
            outcomes.remove(&d.target_id).unwrap_or_else(|| {
                ProbeOutcome::failure(
                    d.target_id,
                    now,
                    ProbeStatus::Abandoned,
                    "no result before the drain window closed".to_string(),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ProbeKind, Store};
    use crate::publish::{ChannelPublisher, Publication, PublishError};
    use crate::jobs::JobResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// Behaviour is picked from the target address.
    struct ScriptedConnector {
        address: String,
        calls: Arc<AtomicUsize>,
        starts: Arc<std::sync::Mutex<Vec<(String, Instant)>>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn describe(&self) -> String {
            format!("scripted://{}", self.address)
        }

        async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts.lock().unwrap().push((self.address.clone(), Instant::now()));
            match self.address.as_str() {
                a if a.starts_with("fail") => Err(ProbeError::Network("refused".to_string())),
                a if a.starts_with("panic") => panic!("connector exploded"),
                a if a.starts_with("hang") => {
                    tokio::time::sleep(timeout * 10).await;
                    Ok(Duration::ZERO)
                }
                _ => Ok(Duration::from_millis(12)),
            }
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        calls: Arc<AtomicUsize>,
        starts: Arc<std::sync::Mutex<Vec<(String, Instant)>>>,
    }

    impl ConnectorFactory for ScriptedFactory {
        fn build(&self, target: &Target) -> Arc<dyn Connector> {
            Arc::new(ScriptedConnector {
                address: target.address.clone(),
                calls: self.calls.clone(),
                starts: self.starts.clone(),
            })
        }
    }

    struct DeadPublisher;

    #[async_trait]
    impl Publisher for DeadPublisher {
        async fn publish_records(&self, _: &[ProbeRecord]) -> Result<(), PublishError> {
            Err(PublishError::Failed("bus down".to_string()))
        }
        async fn publish_alerts(&self, _: &[AlertView]) -> Result<(), PublishError> {
            Err(PublishError::Failed("bus down".to_string()))
        }
        async fn publish_job_output(&self, _: &str, _: &JobResult) -> Result<(), PublishError> {
            Err(PublishError::Failed("bus down".to_string()))
        }
        async fn publish_ready(&self, _: bool) -> Result<(), PublishError> {
            Err(PublishError::Failed("bus down".to_string()))
        }
    }

    struct Harness {
        scheduler: ProbeScheduler,
        factory: Arc<ScriptedFactory>,
        rx: mpsc::Receiver<Publication>,
        _db: NamedTempFile,
        store: Arc<Store>,
    }

    fn harness() -> Harness {
        let db = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(db.path()).unwrap());
        let factory = Arc::new(ScriptedFactory::default());
        let (publisher, rx) = ChannelPublisher::new(256);
        let scheduler = ProbeScheduler::new(factory.clone(), Arc::new(publisher), store.clone());
        Harness {
            scheduler,
            factory,
            rx,
            _db: db,
            store,
        }
    }

    fn target(id: i64, address: &str) -> Target {
        Target {
            id,
            owner_id: "owner".to_string(),
            address: address.to_string(),
            kind: ProbeKind::Tcp,
            ..Default::default()
        }
    }

    fn cfg() -> CycleConfig {
        CycleConfig {
            next_run_interval_ms: 10_000,
            global_timeout_ms: 2_000,
            max_buffer_ms: 500,
            persist: true,
        }
    }

    fn drain_ready(rx: &mut mpsc::Receiver<Publication>) -> Vec<bool> {
        let mut ready = Vec::new();
        while let Ok(publication) = rx.try_recv() {
            if let Publication::Ready(r) = publication {
                ready.push(r);
            }
        }
        ready
    }

    #[test]
    fn test_per_target_budget() {
        assert_eq!(cfg().per_target_budget(5), Duration::from_millis(1500));
        assert_eq!(cfg().per_target_budget(0), Duration::ZERO);

        let tight = CycleConfig {
            next_run_interval_ms: 1000,
            global_timeout_ms: 2000,
            ..cfg()
        };
        assert_eq!(tight.per_target_budget(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_enabled_targets_dispatches_nothing() {
        let mut h = harness();
        let mut disabled = target(1, "ok-1");
        disabled.enabled = false;
        h.scheduler.init(vec![disabled], ProbeParams::default(), ResetMode::Clear).await;

        let result = h.scheduler.run_cycle(&cfg()).await;
        assert!(!result.success);
        assert_eq!(result.dispatched, 0);
        assert_eq!(h.factory.calls.load(Ordering::SeqCst), 0);
        assert_eq!(drain_ready(&mut h.rx), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_is_paced_across_budget() {
        let h = harness();
        let targets = (1..=5).map(|i| target(i, &format!("ok-{}", i))).collect();
        h.scheduler.init(targets, ProbeParams::default(), ResetMode::Clear).await;

        let cycle_start = Instant::now();
        let result = h.scheduler.run_cycle(&cfg()).await;
        assert!(result.success, "{:?}", result.messages);
        assert_eq!(result.per_target_budget_ms, 1500);
        assert_eq!(result.completed, 5);

        let starts = h.factory.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 5);
        for (n, (address, at)) in starts.iter().enumerate() {
            assert_eq!(address, &format!("ok-{}", n + 1));
            let offset = at.duration_since(cycle_start);
            let expected = Duration::from_millis(1500) * n as u32;
            assert!(offset >= expected, "dispatch {} at {:?}", n, offset);
            assert!(offset < expected + Duration::from_millis(5), "dispatch {} at {:?}", n, offset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_stay_with_their_target() {
        let h = harness();
        let targets = vec![target(1, "ok-1"), target(2, "fail-2"), target(3, "panic-3"), target(4, "hang-4")];
        h.scheduler.init(targets, ProbeParams::default(), ResetMode::Clear).await;

        let result = h.scheduler.run_cycle(&cfg()).await;
        assert!(result.success, "{:?}", result.messages);
        assert_eq!(result.dispatched, 4);
        assert_eq!(result.abandoned, 0);

        let records = h.scheduler.records().await;
        assert_eq!(records[0].received, 1);
        assert_eq!(records[1].lost, 1);
        assert_eq!(records[2].lost, 1);
        assert_eq!(records[2].alert.message, "connector panicked");
        assert_eq!(records[3].timeouts, 1);
        for r in &records {
            assert_eq!(r.sent, r.received + r.lost);
            assert_eq!(r.sent, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_records_and_alert_views() {
        let mut h = harness();
        h.scheduler
            .init(vec![target(1, "ok-1"), target(2, "fail-2")], ProbeParams::default(), ResetMode::Clear)
            .await;
        h.scheduler.run_cycle(&cfg()).await;

        let mut saw_records = false;
        let mut saw_alerts = false;
        while let Ok(publication) = h.rx.try_recv() {
            match publication {
                Publication::Records(records) => {
                    saw_records = true;
                    assert_eq!(records.len(), 2);
                }
                Publication::Alerts(alerts) => {
                    saw_alerts = true;
                    assert!(alerts.iter().any(|a| a.id == 2 && !a.is_up));
                }
                _ => {}
            }
        }
        assert!(saw_records && saw_alerts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_reset_consumes_down_count_once() {
        let h = harness();
        h.scheduler
            .init(vec![target(1, "fail-1")], ProbeParams::default(), ResetMode::Clear)
            .await;
        for _ in 0..3 {
            h.scheduler.run_cycle(&cfg()).await;
        }
        assert_eq!(h.scheduler.records().await[0].alert.down_count, 3);

        assert_eq!(h.scheduler.set_alert_flag(&[1, 99], true).await, 1);
        let before = h.scheduler.reset_alert(1).await.unwrap();
        assert_eq!(before.down_count, 3);
        assert!(before.alert_flag);
        // A second reset before the next merge changes nothing.
        h.scheduler.reset_alert(1).await.unwrap();

        h.scheduler.run_cycle(&cfg()).await;
        let record = &h.scheduler.records().await[0];
        assert_eq!(record.alert.down_count, 1);
        assert!(!record.alert.alert_flag);

        assert!(matches!(
            h.scheduler.reset_alert(42).await,
            Err(EngineError::UnknownRecord(42))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staged_batches_apply_at_cycle_start() {
        let h = harness();
        h.scheduler
            .init(
                vec![target(1, "ok-1"), target(2, "ok-2"), target(3, "ok-3")],
                ProbeParams::default(),
                ResetMode::Clear,
            )
            .await;

        h.scheduler
            .stage_targets("owner", vec![target(1, "ok-1"), target(3, "ok-3")])
            .await;
        assert_eq!(h.scheduler.pending_owners().await, vec!["owner".to_string()]);

        let result = h.scheduler.run_cycle(&cfg()).await;
        assert_eq!(result.reconcile.removed, 1);
        assert_eq!(result.dispatched, 2);
        let ids: Vec<i64> = h.scheduler.records().await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_failure_aborts_cycle() {
        let mut h = harness();
        h.scheduler.init(vec![target(1, "ok-1")], ProbeParams::default(), ResetMode::Clear).await;
        drain_ready(&mut h.rx);

        h.scheduler.stage_targets("a", vec![target(7, "ok-7")]).await;
        h.scheduler.stage_targets("b", vec![target(7, "ok-7")]).await;
        let result = h.scheduler.run_cycle(&cfg()).await;

        assert!(!result.success);
        assert_eq!(result.dispatched, 0);
        assert_eq!(drain_ready(&mut h.rx), vec![false, true]);

        // The engine stays usable.
        assert!(h.scheduler.run_cycle(&cfg()).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_marks_cycle_failed() {
        let db = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(db.path()).unwrap());
        let scheduler = ProbeScheduler::new(Arc::new(ScriptedFactory::default()), Arc::new(DeadPublisher), store);
        scheduler.init(vec![target(1, "ok-1")], ProbeParams::default(), ResetMode::Clear).await;

        let result = scheduler.run_cycle(&cfg()).await;
        assert!(!result.success);
        assert_eq!(result.completed, 1);
        assert_eq!(scheduler.records().await[0].received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_and_restore() {
        let h = harness();
        h.scheduler
            .init(vec![target(0, "ok-a"), target(0, "fail-b")], ProbeParams::default(), ResetMode::Clear)
            .await;
        h.scheduler.run_cycle(&cfg()).await;

        let (publisher, _rx) = ChannelPublisher::new(16);
        let restored = ProbeScheduler::new(Arc::new(ScriptedFactory::default()), Arc::new(publisher), h.store.clone());
        restored.restore().await;

        let records = restored.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].received, 1);
        assert_eq!(records[1].lost, 1);
    }

    #[tokio::test]
    async fn test_restore_tolerates_missing_and_corrupt_blobs() {
        let h = harness();
        h.store.put_blob(RECORDS_KEY, b"not json").unwrap();
        h.scheduler.restore().await;
        assert!(h.scheduler.records().await.is_empty());
        assert_eq!(h.scheduler.params().await, ProbeParams::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_reset_modes() {
        let h = harness();
        h.scheduler.init(vec![target(1, "fail-1")], ProbeParams::default(), ResetMode::Clear).await;
        h.scheduler.run_cycle(&cfg()).await;

        h.scheduler.init(vec![target(1, "fail-1")], ProbeParams::default(), ResetMode::Keep).await;
        assert_eq!(h.scheduler.records().await[0].sent, 1);

        h.scheduler.init(vec![target(1, "fail-1")], ProbeParams::default(), ResetMode::Zero).await;
        let record = &h.scheduler.records().await[0];
        assert_eq!(record.sent, 0);
        assert_eq!(record.alert.down_count, 1);

        h.scheduler.init(vec![target(1, "fail-1")], ProbeParams::default(), ResetMode::Clear).await;
        assert_eq!(h.scheduler.records().await[0].alert.down_count, 0);
    }

    #[tokio::test]
    async fn test_remove_samples_through_scheduler() {
        let h = harness();
        h.scheduler.init(vec![target(1, "ok-1")], ProbeParams::default(), ResetMode::Clear).await;
        let fast = CycleConfig {
            next_run_interval_ms: 100,
            global_timeout_ms: 50,
            max_buffer_ms: 10,
            persist: false,
        };
        h.scheduler.run_cycle(&fast).await;

        let summary = h.scheduler.remove_samples(1, &[1, 2]).await;
        assert_eq!(summary, RemovalSummary { removed: 1, failed: 1 });
        assert!(h.scheduler.records().await[0].samples.is_empty());
    }

    #[test]
    fn test_settle_outcomes_marks_missing_as_abandoned() {
        let factory = ScriptedFactory::default();
        let plan: Vec<Dispatch> = [1, 2]
            .iter()
            .map(|id| Dispatch {
                target_id: *id,
                timeout: Duration::from_secs(1),
                connector: factory.build(&target(*id, "ok")),
            })
            .collect();
        let got = HashMap::from([(2, ProbeOutcome::success(2, Utc::now(), 3.0))]);

        let settled = settle_outcomes(&plan, got, Utc::now());
        assert_eq!(settled[0].status, ProbeStatus::Abandoned);
        assert_eq!(settled[1].status, ProbeStatus::Ok);
    }

    #[tokio::test]
    async fn test_rollover_zeroes_expired_windows() {
        let mut state = EngineState {
            params: ProbeParams {
                stats_window_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut old = ProbeRecord::new(&target(1, "ok"));
        old.sent = 4;
        old.lost = 4;
        old.started_at = Utc::now() - chrono::Duration::seconds(120);
        let mut fresh = ProbeRecord::new(&target(2, "ok"));
        fresh.sent = 2;
        fresh.received = 2;
        state.records.insert(1, old);
        state.records.insert(2, fresh);

        assert_eq!(roll_over(&mut state), 1);
        assert_eq!(state.records[&1].sent, 0);
        assert_eq!(state.records[&2].sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_window_disables_rollover() {
        for secs in [1u64 << 60, u64::MAX] {
            let h = harness();
            let mut params = h.scheduler.params().await;
            params.stats_window_secs = secs;
            h.scheduler.init(vec![target(1, "ok-1")], params, ResetMode::Clear).await;

            {
                let mut state = h.scheduler.state.write().await;
                let record = state.records.get_mut(&1).unwrap();
                record.sent = 4;
                record.received = 4;
                record.started_at = Utc::now() - chrono::Duration::days(365);
                assert_eq!(roll_over(&mut state), 0);
                assert_eq!(state.records[&1].sent, 4);
            }

            for _ in 0..3 {
                let result = h.scheduler.run_cycle(&cfg()).await;
                assert!(result.success, "{:?}", result.messages);
            }
            assert_eq!(h.scheduler.records().await[0].sent, 7);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tight_budget_warns_but_succeeds() {
        let h = harness();
        let targets = (1..=10).map(|i| target(i, &format!("ok-{}", i))).collect();
        h.scheduler.init(targets, Default::default(), ResetMode::Clear).await;

        let tight = CycleConfig {
            next_run_interval_ms: 1_000,
            global_timeout_ms: 900,
            max_buffer_ms: 50,
            persist: false,
        };
        let result = h.scheduler.run_cycle(&tight).await;
        assert!(result.success, "{:?}", result.messages);
        assert_eq!(result.per_target_budget_ms, 5);
        assert_eq!(result.completed, 10);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("below 10 ms") && w.contains("pacing is likely insufficient")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_projected_overrun_warns_but_succeeds() {
        let h = harness();
        let mut slow = target(1, "ok-1");
        slow.timeout_ms = 9_000;
        h.scheduler.init(vec![slow], Default::default(), ResetMode::Clear).await;

        let result = h.scheduler.run_cycle(&cfg()).await;
        assert!(result.success, "{:?}", result.messages);
        assert_eq!(result.per_target_budget_ms, 7_500);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("projected cycle time 17000 ms exceeds the 10000 ms interval"));
    }

    #[tokio::test]
    async fn test_shutdown_signals_not_ready() {
        let mut h = harness();
        h.scheduler.shutdown().await;
        assert_eq!(drain_ready(&mut h.rx), vec![false]);
    }
}
