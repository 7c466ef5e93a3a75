//! In-memory tuple store.
//!
//! Holds tuples in a set and answers checks with same-object rewrites only
//! (`owner`/`mandate` imply `editor`, `admin` implies `member` and
//! `can_manage`, and `blocked` overrides `viewer`). It does not follow
//! tuple-to-userset edges such as `guardian from owner`; use a real OpenFGA
//! server for those.
//!
//! Write semantics match OpenFGA: a batch is atomic, and unless it is lenient
//! a duplicate write or a missing delete rejects the whole batch.

use crate::{TupleDelta, TupleStore};
use async_trait::async_trait;
use custos_core::error::{CustosError, CustosResult};
use custos_core::types::{relation, split_ref, WILDCARD_USER};
use custos_core::Tuple;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    tuples: BTreeSet<Tuple>,
    calls: Vec<TupleDelta>,
    fail_all: bool,
    fail_calls: HashSet<usize>,
}

#[derive(Debug, Default)]
pub struct MemoryTupleStore {
    inner: Mutex<Inner>,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `tuples`, bypassing write accounting.
    pub fn with_tuples(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        let store = Self::new();
        store.lock().tuples.extend(tuples);
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    /// Makes the write call with 0-based index `call` fail.
    pub fn fail_write_call(&self, call: usize) {
        self.lock().fail_calls.insert(call);
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        self.lock().tuples.contains(tuple)
    }

    pub fn tuples(&self) -> Vec<Tuple> {
        self.lock().tuples.iter().cloned().collect()
    }

    /// Tuples whose object is `object`.
    pub fn tuples_for(&self, object: &str) -> Vec<Tuple> {
        self.lock()
            .tuples
            .iter()
            .filter(|t| t.object == object)
            .cloned()
            .collect()
    }

    /// Every write call received, including failed ones.
    pub fn calls(&self) -> Vec<TupleDelta> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Same-object evaluation over `stored` plus `contextual`.
fn holds(stored: &BTreeSet<Tuple>, contextual: &[Tuple], user: &str, rel: &str, object: &str) -> bool {
    let has = |u: &str, r: &str| {
        let wanted = Tuple::new(u, r, object);
        stored.contains(&wanted) || contextual.contains(&wanted)
    };

    match rel {
        relation::EDITOR => has(user, relation::OWNER) || has(user, relation::MANDATE),
        relation::MEMBER => has(user, relation::MEMBER) || has(user, relation::ADMIN),
        relation::CAN_MANAGE => has(user, relation::ADMIN),
        relation::VIEWER => {
            if has(user, relation::BLOCKED) {
                return false;
            }
            has(user, relation::VIEWER)
                || has(WILDCARD_USER, relation::VIEWER)
                || has(user, relation::CAN_VIEW)
                || holds(stored, contextual, user, relation::EDITOR, object)
        }
        other => has(user, other),
    }
}

#[async_trait]
impl TupleStore for MemoryTupleStore {
    async fn write(&self, delta: &TupleDelta) -> CustosResult<()> {
        let mut inner = self.lock();
        let call = inner.calls.len();
        inner.calls.push(delta.clone());

        if inner.fail_all || inner.fail_calls.contains(&call) {
            return Err(CustosError::TupleStore(format!(
                "injected failure on write call {call}"
            )));
        }

        if !delta.lenient {
            if let Some(dup) = delta.writes.iter().find(|t| inner.tuples.contains(*t)) {
                return Err(CustosError::TupleStore(format!(
                    "cannot write a tuple which already exists: {dup}"
                )));
            }
            if let Some(missing) = delta.deletes.iter().find(|t| !inner.tuples.contains(*t)) {
                return Err(CustosError::TupleStore(format!(
                    "cannot delete a tuple which does not exist: {missing}"
                )));
            }
        }

        for t in &delta.deletes {
            inner.tuples.remove(t);
        }
        inner.tuples.extend(delta.writes.iter().cloned());
        Ok(())
    }

    async fn check(&self, user: &str, relation: &str, object: &str) -> bool {
        holds(&self.lock().tuples, &[], user, relation, object)
    }

    async fn list_objects(&self, user: &str, relation: &str, object_type: &str) -> Vec<String> {
        let inner = self.lock();
        let objects: BTreeSet<&str> = inner
            .tuples
            .iter()
            .map(|t| t.object.as_str())
            .filter(|o| split_ref(o).is_some_and(|(t, _)| t == object_type))
            .collect();
        objects
            .into_iter()
            .filter(|o| holds(&inner.tuples, &[], user, relation, o))
            .map(str::to_string)
            .collect()
    }

    async fn check_with_context(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> bool {
        holds(&self.lock().tuples, contextual, user, relation, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn owner_implies_editor_and_viewer() {
        let store = MemoryTupleStore::with_tuples([Tuple::owner("alice", "d1")]);
        assert!(store.check("user:alice", "editor", "dossier:d1").await);
        assert!(store.check("user:alice", "viewer", "dossier:d1").await);
        assert!(!store.check("user:bob", "viewer", "dossier:d1").await);
    }

    #[tokio::test]
    async fn blocked_overrides_wildcard_viewer() {
        let store = MemoryTupleStore::with_tuples([
            Tuple::owner("alice", "d1"),
            Tuple::public("d1"),
            Tuple::blocked("bob", "d1"),
        ]);
        assert!(store.check("user:carol", "viewer", "dossier:d1").await);
        assert!(!store.check("user:bob", "viewer", "dossier:d1").await);
    }

    #[tokio::test]
    async fn strict_write_rejects_duplicates_atomically() {
        let store = MemoryTupleStore::with_tuples([Tuple::owner("alice", "d1")]);
        let delta = TupleDelta::write([Tuple::public("d1"), Tuple::owner("alice", "d1")]);
        assert!(store.write(&delta).await.is_err());
        assert!(!store.contains(&Tuple::public("d1")));

        assert!(store.write(&delta.lenient()).await.is_ok());
        assert!(store.contains(&Tuple::public("d1")));
    }

    #[tokio::test]
    async fn contextual_tuples_are_not_persisted() {
        let store = MemoryTupleStore::with_tuples([Tuple::owner("alice", "d1")]);
        let ctx = [Tuple::emergency("erin", "d1")];
        assert!(
            store
                .check_with_context("user:erin", "viewer", "dossier:d1", &ctx)
                .await
        );
        assert!(!store.check("user:erin", "viewer", "dossier:d1").await);
        assert_eq!(store.tuples().len(), 1);
    }

    #[tokio::test]
    async fn list_objects_filters_by_type_and_relation() {
        let store = MemoryTupleStore::with_tuples([
            Tuple::owner("alice", "d1"),
            Tuple::owner("bob", "d2"),
            Tuple::member("alice", "o1"),
        ]);
        assert_eq!(
            store.list_objects("user:alice", "viewer", "dossier").await,
            vec!["dossier:d1".to_string()]
        );
        assert_eq!(
            store.list_objects("user:alice", "member", "organization").await,
            vec!["organization:o1".to_string()]
        );
    }

    #[tokio::test]
    async fn injected_failure_hits_only_the_selected_call() {
        let store = MemoryTupleStore::new();
        store.fail_write_call(1);
        assert!(store.write(&TupleDelta::write([Tuple::owner("a", "d1")])).await.is_ok());
        assert!(store.write(&TupleDelta::write([Tuple::owner("a", "d2")])).await.is_err());
        assert!(store.write(&TupleDelta::write([Tuple::owner("a", "d3")])).await.is_ok());
        assert_eq!(store.call_count(), 3);
        assert_eq!(store.tuples().len(), 2);
    }
}
