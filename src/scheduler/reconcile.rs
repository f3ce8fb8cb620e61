//! Staging and applying per-owner target batches.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use super::{EngineError, EngineState};
use crate::db::{ProbeRecord, Target};
use crate::probe::ConnectorFactory;

/// What one `apply_pending` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub rebuilt: usize,
    pub removed: usize,
    /// Targets skipped because their id is live under another owner.
    pub rejected: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Holds target batches staged by the control plane until the next cycle.
#[derive(Default)]
pub struct TargetReconciler {
    staged: Mutex<HashMap<String, Vec<Target>>>,
}

impl TargetReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `targets` for `owner_id`, replacing any batch not yet applied.
    pub async fn stage(&self, owner_id: &str, mut targets: Vec<Target>) {
        for target in &mut targets {
            target.owner_id = owner_id.to_string();
        }
        let mut staged = self.staged.lock().await;
        if staged.insert(owner_id.to_string(), targets).is_some() {
            tracing::debug!("Reconciler: replaced pending batch for owner {}", owner_id);
        }
    }

    /// Owners with a batch waiting to be applied.
    pub async fn pending_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.staged.lock().await.keys().cloned().collect();
        owners.sort();
        owners
    }

    /// Drop every staged batch without applying it.
    pub async fn clear(&self) {
        self.staged.lock().await.clear();
    }

    /// Apply and clear all staged batches.
    pub async fn apply_pending(
        &self,
        state: &mut EngineState,
        factory: &dyn ConnectorFactory,
    ) -> Result<ReconcileSummary, EngineError> {
        let batches = std::mem::take(&mut *self.staged.lock().await);
        apply_batches(state, factory, batches)
    }
}

fn validate(batches: &HashMap<String, Vec<Target>>) -> Result<(), EngineError> {
    let mut claimed: HashMap<i64, &str> = HashMap::new();
    for (owner, targets) in batches {
        for target in targets.iter().filter(|t| t.id != 0) {
            if let Some(other) = claimed.insert(target.id, owner.as_str()) {
                if other != owner.as_str() {
                    return Err(EngineError::Reconcile(format!(
                        "target id {} staged by both {} and {}",
                        target.id, other, owner
                    )));
                }
            }
        }
    }
    Ok(())
}

fn apply_batches(
    state: &mut EngineState,
    factory: &dyn ConnectorFactory,
    batches: HashMap<String, Vec<Target>>,
) -> Result<ReconcileSummary, EngineError> {
    let mut summary = ReconcileSummary::default();
    if batches.is_empty() {
        return Ok(summary);
    }
    validate(&batches)?;

    let mut next_id = state
        .records
        .keys()
        .copied()
        .chain(batches.values().flatten().map(|t| t.id))
        .max()
        .unwrap_or(0)
        .max(0)
        + 1;

    let mut owners: Vec<(String, Vec<Target>)> = batches.into_iter().collect();
    owners.sort_by(|a, b| a.0.cmp(&b.0));

    let mut seen: HashSet<i64> = HashSet::new();
    let mut reporting_owners: HashSet<String> = HashSet::new();

    for (owner, targets) in owners {
        if targets.is_empty() {
            tracing::debug!("Reconciler: empty batch from {}, leaving its targets untouched", owner);
            continue;
        }
        reporting_owners.insert(owner);

        for mut target in targets {
            if target.id == 0 {
                target.id = next_id;
                next_id += 1;
            }
            let id = target.id;
            if let Some(holder) = state.records.get(&id).filter(|r| r.owner_id != target.owner_id) {
                tracing::warn!(
                    "Reconciler: {} staged target {} which belongs to {}, skipping",
                    target.owner_id,
                    id,
                    holder.owner_id
                );
                summary.rejected += 1;
                continue;
            }
            seen.insert(id);

            match state.records.get_mut(&id) {
                Some(record) => {
                    let rebuild = state
                        .targets
                        .get(&id)
                        .map_or(true, |previous| previous.endpoint_differs(&target))
                        || (!record.enabled && target.enabled)
                        || !state.connectors.contains_key(&id);

                    record.describe(&target);
                    if rebuild {
                        tracing::debug!("Reconciler: rebuilding {} connector for target {}", target.kind, id);
                        state.connectors.insert(id, factory.build(&target));
                        summary.rebuilt += 1;
                    } else {
                        summary.updated += 1;
                    }
                }
                None => {
                    state.records.insert(id, ProbeRecord::new(&target));
                    state.connectors.insert(id, factory.build(&target));
                    summary.added += 1;
                }
            }
            state.targets.insert(id, target);
        }
    }

    let doomed: Vec<i64> = state
        .records
        .values()
        .filter(|r| reporting_owners.contains(&r.owner_id) && !seen.contains(&r.id))
        .map(|r| r.id)
        .collect();
    for id in doomed {
        state.records.remove(&id);
        state.connectors.remove(&id);
        state.targets.remove(&id);
        summary.removed += 1;
    }

    tracing::info!(
        "Reconciler: {} added, {} updated, {} rebuilt, {} removed, {} rejected",
        summary.added,
        summary.updated,
        summary.rebuilt,
        summary.removed,
        summary.rejected
    );
    Ok(summary)
}
