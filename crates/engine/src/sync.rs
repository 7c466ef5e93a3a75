//! Shared write discipline for every mutating operation.
//!
//! Callers mutate the [`DomainStore`] under its lock, release it, then hand
//! the tuple delta and an undo closure to [`commit_or_revert`]. The remote
//! write happens with no lock held; on failure the undo runs under a fresh
//! exclusive lock and the error is returned.

use custos_core::error::{CustosError, CustosResult};
use custos_core::{Caller, DomainStore, StoreState};
use custos_provider::{TupleDelta, TupleStore};

/// Applies `delta` remotely, keeping the local change on success and
/// reverting it with `undo` on failure. The snapshot is persisted on both
/// paths.
pub async fn commit_or_revert<U>(
    store: &DomainStore,
    tuples: &dyn TupleStore,
    delta: &TupleDelta,
    undo: U,
) -> CustosResult<()>
where
    U: FnOnce(&mut StoreState) + Send,
{
    match tuples.write(delta).await {
        Ok(()) => {
            store.persist();
            Ok(())
        }
        Err(e) => {
            tracing::warn!(
                writes = delta.writes.len(),
                deletes = delta.deletes.len(),
                error = %e,
                "tuple write failed, reverting local change"
            );
            store.update(undo);
            store.persist();
            Err(e)
        }
    }
}

/// Fails with `Forbidden` unless `caller` holds `relation` on `object`.
///
/// Admin-channel callers pass without a check.
pub async fn authorize(
    tuples: &dyn TupleStore,
    caller: &Caller,
    relation: &str,
    object: &str,
) -> CustosResult<()> {
    if caller.admin_channel {
        tracing::debug!(subject = %caller.subject, relation, object, "admin channel bypass");
        return Ok(());
    }
    if tuples.check(&caller.user_ref(), relation, object).await {
        Ok(())
    } else {
        Err(CustosError::forbidden(relation, object))
    }
}

/// Trims `value` and rejects it when empty.
pub(crate) fn required(field: &str, value: &str) -> CustosResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CustosError::Validation(format!("{field} is required")))
    } else {
        Ok(trimmed.to_string())
    }
}
