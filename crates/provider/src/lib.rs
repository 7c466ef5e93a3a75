//! Tuple store abstraction and backends for Custos.

pub mod audit;
pub mod memory;
pub mod openfga;

use async_trait::async_trait;
use custos_core::error::CustosResult;
use custos_core::Tuple;

pub use audit::{AuditDispatcher, AuditRecord, Audited};
pub use memory::MemoryTupleStore;
pub use openfga::{OpenFgaClient, StoreIds};

/// One combined write/delete request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleDelta {
    pub writes: Vec<Tuple>,
    pub deletes: Vec<Tuple>,
    /// Ignore duplicate writes and missing deletes instead of failing the batch.
    pub lenient: bool,
}

impl TupleDelta {
    pub fn write(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        Self {
            writes: tuples.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn delete(tuples: impl IntoIterator<Item = Tuple>) -> Self {
        Self {
            deletes: tuples.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn and_delete(mut self, tuples: impl IntoIterator<Item = Tuple>) -> Self {
        self.deletes.extend(tuples);
        self
    }

    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }
}

/// Client seam to the external relationship-tuple store.
///
/// Authorization queries fail closed: `check` and `check_with_context`
/// return `false` on any transport or decode error, and `list_objects`
/// returns an empty list.
#[async_trait]
pub trait TupleStore: Send + Sync {
    async fn write(&self, delta: &TupleDelta) -> CustosResult<()>;

    async fn check(&self, user: &str, relation: &str, object: &str) -> bool;

    async fn list_objects(&self, user: &str, relation: &str, object_type: &str) -> Vec<String>;

    /// `check` evaluated as if `contextual` tuples existed. Nothing is persisted.
    async fn check_with_context(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> bool;

    /// True once the store can serve requests.
    fn is_ready(&self) -> bool {
        true
    }
}
