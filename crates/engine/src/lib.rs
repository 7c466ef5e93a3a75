//! Application workflows over the domain store and the tuple store.
//!
//! Every mutating operation follows the same write discipline (see
//! [`sync::commit_or_revert`]): the local change is made under the store lock,
//! the lock is released, the tuple delta is written, and the local change is
//! undone if the write fails.

pub mod dossier;
pub mod guardianship;
pub mod organization;
pub mod rehydrate;
pub mod sync;

use custos_core::DomainStore;
use custos_provider::TupleStore;
use std::sync::Arc;

pub use dossier::DossierService;
pub use guardianship::GuardianshipService;
pub use organization::OrganizationService;
pub use rehydrate::{derive_tuples, rehydrate, RehydrationReport, REHYDRATE_BATCH_SIZE};

/// The three workflow services, sharing one domain store and tuple store.
#[derive(Clone)]
pub struct Services {
    pub dossiers: DossierService,
    pub guardianships: GuardianshipService,
    pub organizations: OrganizationService,
}

impl Services {
    pub fn new(store: Arc<DomainStore>, tuples: Arc<dyn TupleStore>) -> Self {
        Self {
            dossiers: DossierService::new(store.clone(), tuples.clone()),
            guardianships: GuardianshipService::new(store.clone(), tuples.clone()),
            organizations: OrganizationService::new(store, tuples),
        }
    }
}
