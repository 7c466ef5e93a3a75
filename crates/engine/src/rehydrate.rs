//! Rebuilds the external tuple set from the persisted domain state.
//!
//! Runs once at startup, after the tuple store is reachable and before
//! mutating routes open. Writes are lenient so replaying tuples that already
//! exist is a no-op, and a failed batch is logged without aborting the rest.

use custos_core::types::Tuple;
use custos_core::{DomainStore, StoreState};
use custos_provider::{TupleDelta, TupleStore};
use serde::Serialize;
use std::collections::HashSet;

/// Tuples per write call.
pub const REHYDRATE_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RehydrationReport {
    pub total: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub orphans_cleaned: usize,
}

/// Every tuple implied by `state`, in a stable order: dossiers, guardian
/// edges, organizations.
pub fn derive_tuples(state: &StoreState) -> Vec<Tuple> {
    let mut tuples = Vec::new();

    for dossier in state.dossiers.values() {
        tuples.extend(dossier.tuples());
    }

    for (ward, guardians) in &state.guardianships {
        for guardian in guardians {
            tuples.push(Tuple::guardian(guardian, ward));
        }
    }

    for org in state.organizations.values() {
        tuples.extend(org.tuples());
    }

    tuples
}

pub async fn rehydrate(store: &DomainStore, tuples: &dyn TupleStore) -> RehydrationReport {
    let (derived, orphans) = store.read(|s| (derive_tuples(s), s.orphaned_tuples.clone()));
    let mut report = RehydrationReport {
        total: derived.len(),
        ..RehydrationReport::default()
    };

    tracing::info!(
        tuples = derived.len(),
        orphans = orphans.len(),
        batch_size = REHYDRATE_BATCH_SIZE,
        "rehydrating tuple store"
    );

    let cleaned = sweep_orphans(tuples, &derived, &orphans).await;
    if !cleaned.is_empty() {
        report.orphans_cleaned = cleaned.len();
        store.update(|s| s.orphaned_tuples.retain(|t| !cleaned.contains(t)));
        store.persist();
    }

    for (index, batch) in derived.chunks(REHYDRATE_BATCH_SIZE).enumerate() {
        report.batches += 1;
        let delta = TupleDelta::write(batch.iter().cloned()).lenient();
        if let Err(e) = tuples.write(&delta).await {
            report.failed_batches += 1;
            tracing::warn!(batch = index, tuples = batch.len(), error = %e, "rehydration batch failed");
        }
    }

    tracing::info!(
        total = report.total,
        batches = report.batches,
        failed = report.failed_batches,
        orphans_cleaned = report.orphans_cleaned,
        "rehydration done"
    );
    report
}

/// Deletes orphaned tuples that the current state no longer derives.
/// Returns those confirmed removed.
async fn sweep_orphans(
    tuples: &dyn TupleStore,
    derived: &[Tuple],
    orphans: &[Tuple],
) -> HashSet<Tuple> {
    let live: HashSet<&Tuple> = derived.iter().collect();
    let mut cleaned = HashSet::new();

    // A derived tuple listed as orphaned is live again; just drop it from the list.
    cleaned.extend(orphans.iter().filter(|t| live.contains(t)).cloned());

    let stale: Vec<Tuple> = orphans
        .iter()
        .filter(|t| !live.contains(t))
        .cloned()
        .collect();
    for batch in stale.chunks(REHYDRATE_BATCH_SIZE) {
        let delta = TupleDelta::delete(batch.iter().cloned()).lenient();
        match tuples.write(&delta).await {
            Ok(()) => cleaned.extend(batch.iter().cloned()),
            Err(e) => {
                tracing::warn!(tuples = batch.len(), error = %e, "orphan sweep batch failed")
            }
        }
    }
    cleaned
}
