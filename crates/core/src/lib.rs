//! Domain models, tuple vocabulary, the domain store, and error definitions.
//!
//! Foundation crate -- no async or network dependencies.

pub mod error;
pub mod store;
pub mod types;

pub use error::{CustosError, CustosResult, ErrorKind};
pub use store::{DomainStore, StoreState};
pub use types::{
    Caller, Dossier, DossierType, GuardianshipRequest, Organization, RelationEntry,
    RequestStatus, Tuple,
};
