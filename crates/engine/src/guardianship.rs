//! Guardianship proposals: request, accept, deny, remove.
//!
//! Accepting a request from `from` to `to` makes `from` a guardian of `to`,
//! both locally and as a `user:<from> guardian user:<to>` tuple.

use crate::sync::commit_or_revert;
use custos_core::error::{CustosError, CustosResult};
use custos_core::types::{new_id, user_id};
use custos_core::{Caller, DomainStore, GuardianshipRequest, RequestStatus, Tuple};
use custos_provider::{TupleDelta, TupleStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct RequestGuardianship {
    pub to: String,
}

/// Identifies one directional edge: `guardian` guards `ward`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveGuardianship {
    pub guardian: String,
    pub ward: String,
}

/// Everything the caller is party to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardianshipOverview {
    pub incoming: Vec<GuardianshipRequest>,
    pub outgoing: Vec<GuardianshipRequest>,
    pub guardians: Vec<String>,
    pub wards: Vec<String>,
}

#[derive(Clone)]
pub struct GuardianshipService {
    store: Arc<DomainStore>,
    tuples: Arc<dyn TupleStore>,
}

impl GuardianshipService {
    pub fn new(store: Arc<DomainStore>, tuples: Arc<dyn TupleStore>) -> Self {
        Self { store, tuples }
    }

    pub fn request(
        &self,
        caller: &Caller,
        req: RequestGuardianship,
    ) -> CustosResult<GuardianshipRequest> {
        let to = user_id("to", &req.to)?;
        let from = caller.subject.clone();
        if to == from {
            return Err(CustosError::Validation(
                "cannot request guardianship of yourself".into(),
            ));
        }

        let request = self.store.update(|s| {
            if s.guardianship_between(&from, &to) {
                return Err(CustosError::Conflict(format!(
                    "a guardianship already exists between {from} and {to}"
                )));
            }
            if s.pending_between(&from, &to).is_some() {
                return Err(CustosError::Conflict(format!(
                    "a pending request already exists between {from} and {to}"
                )));
            }
            let request = GuardianshipRequest {
                id: new_id(),
                from: from.clone(),
                to: to.clone(),
                status: RequestStatus::Pending,
            };
            s.guardianship_requests.push(request.clone());
            Ok(request)
        })?;

        self.store.persist();
        tracing::info!(request = %request.id, from = %request.from, to = %request.to, "guardianship requested");
        Ok(request)
    }

    pub async fn accept(&self, caller: &Caller, request_id: &str) -> CustosResult<GuardianshipRequest> {
        let (request, edge_added) = self.store.update(|s| {
            let request = pending_for(s.request_mut(request_id), request_id, caller, "accept")?;
            request.status = RequestStatus::Accepted;
            let request = request.clone();

            let edge_added = !s.is_guardian(&request.from, &request.to);
            s.add_guardian(&request.from, &request.to);
            Ok::<_, CustosError>((request, edge_added))
        })?;

        let delta = if edge_added {
            TupleDelta::write([Tuple::guardian(&request.from, &request.to)])
        } else {
            TupleDelta::default()
        };

        let (id, from, to) = (request.id.clone(), request.from.clone(), request.to.clone());
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            if let Some(r) = s.request_mut(&id) {
                r.status = RequestStatus::Pending;
            }
            if edge_added {
                s.remove_guardian(&from, &to);
            }
        })
        .await?;

        tracing::info!(request = %request.id, guardian = %request.from, ward = %request.to, "guardianship accepted");
        Ok(request)
    }

    pub fn deny(&self, caller: &Caller, request_id: &str) -> CustosResult<GuardianshipRequest> {
        let request = self.store.update(|s| {
            let request = pending_for(s.request_mut(request_id), request_id, caller, "deny")?;
            request.status = RequestStatus::Denied;
            Ok::<_, CustosError>(request.clone())
        })?;

        self.store.persist();
        tracing::info!(request = %request.id, "guardianship denied");
        Ok(request)
    }

    /// Removes the `guardian guards ward` edge. Either party may remove it;
    /// a missing edge is not an error. Returns whether an edge was removed.
    pub async fn remove(&self, caller: &Caller, req: RemoveGuardianship) -> CustosResult<bool> {
        let guardian = user_id("guardian", &req.guardian)?;
        let ward = user_id("ward", &req.ward)?;
        if caller.subject != guardian && caller.subject != ward {
            return Err(CustosError::Forbidden(
                "only a party to the guardianship may remove it".into(),
            ));
        }

        if !self.store.update(|s| s.remove_guardian(&guardian, &ward)) {
            tracing::debug!(%guardian, %ward, "no guardianship to remove");
            return Ok(false);
        }

        // Only the removed edge comes back; edges added meanwhile stay.
        let delta = TupleDelta::delete([Tuple::guardian(&guardian, &ward)]);
        let (restore_guardian, restore_ward) = (guardian.clone(), ward.clone());
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            s.add_guardian(&restore_guardian, &restore_ward);
        })
        .await?;

        tracing::info!(%guardian, %ward, "guardianship removed");
        Ok(true)
    }

    pub fn list(&self, caller: &Caller) -> GuardianshipOverview {
        let me = caller.subject.as_str();
        self.store.read(|s| GuardianshipOverview {
            incoming: s
                .guardianship_requests
                .iter()
                .filter(|r| r.to == me)
                .cloned()
                .collect(),
            outgoing: s
                .guardianship_requests
                .iter()
                .filter(|r| r.from == me)
                .cloned()
                .collect(),
            guardians: s.guardians_of(me).to_vec(),
            wards: s.wards_of(me),
        })
    }
}

/// Only the addressee may answer, and only while the request is pending.
fn pending_for<'a>(
    request: Option<&'a mut GuardianshipRequest>,
    request_id: &str,
    caller: &Caller,
    action: &str,
) -> CustosResult<&'a mut GuardianshipRequest> {
    let request = request
        .ok_or_else(|| CustosError::NotFound(format!("guardianship request {request_id}")))?;
    if request.to != caller.subject {
        return Err(CustosError::Forbidden(format!(
            "only {} may {action} this request",
            request.to
        )));
    }
    if request.status != RequestStatus::Pending {
        return Err(CustosError::Conflict(format!(
            "request {request_id} is no longer pending"
        )));
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_provider::MemoryTupleStore;

    fn service() -> (GuardianshipService, Arc<DomainStore>, Arc<MemoryTupleStore>) {
        let store = Arc::new(DomainStore::in_memory());
        let tuples = Arc::new(MemoryTupleStore::new());
        (
            GuardianshipService::new(store.clone(), tuples.clone()),
            store,
            tuples,
        )
    }

    fn ask(to: &str) -> RequestGuardianship {
        RequestGuardianship { to: to.into() }
    }

    #[tokio::test]
    async fn accept_materializes_guardian_edge() {
        let (svc, store, tuples) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        let accepted = svc.accept(&Caller::user("alice"), &req.id).await.unwrap();

        assert_eq!(accepted.status, RequestStatus::Accepted);
        assert_eq!(store.read(|s| s.guardians_of("alice").to_vec()), vec!["bob".to_string()]);
        assert!(tuples.contains(&Tuple::new("user:bob", "guardian", "user:alice")));
    }

    #[tokio::test]
    async fn only_addressee_may_accept() {
        let (svc, _, _) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        let err = svc.accept(&Caller::user("bob"), &req.id).await.unwrap_err();
        assert!(matches!(err, CustosError::Forbidden(_)));
    }

    #[test]
    fn self_and_duplicate_requests_are_rejected() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.request(&Caller::user("bob"), ask("bob")),
            Err(CustosError::Validation(_))
        ));
        svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        assert!(matches!(
            svc.request(&Caller::user("alice"), ask("bob")),
            Err(CustosError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn established_guardianship_blocks_requests_both_ways() {
        let (svc, _, _) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        svc.accept(&Caller::user("alice"), &req.id).await.unwrap();

        for (from, to) in [("bob", "alice"), ("alice", "bob")] {
            assert!(matches!(
                svc.request(&Caller::user(from), ask(to)),
                Err(CustosError::Conflict(_))
            ));
        }
    }

    #[tokio::test]
    async fn failed_tuple_write_reverts_acceptance() {
        let (svc, store, tuples) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        tuples.set_fail_writes(true);

        assert!(svc.accept(&Caller::user("alice"), &req.id).await.is_err());
        assert!(store.read(|s| s.guardianships.is_empty()));
        assert_eq!(
            store.read(|s| s.guardianship_requests[0].status),
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn deny_only_from_pending() {
        let (svc, _, _) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        let denied = svc.deny(&Caller::user("alice"), &req.id).unwrap();
        assert_eq!(denied.status, RequestStatus::Denied);
        assert!(matches!(
            svc.accept(&Caller::user("alice"), &req.id).await,
            Err(CustosError::Conflict(_))
        ));
        // A denied request no longer blocks a new proposal.
        svc.request(&Caller::user("bob"), ask("alice")).unwrap();
    }

    #[tokio::test]
    async fn either_party_removes_and_missing_edge_is_noop() {
        let (svc, store, tuples) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        svc.accept(&Caller::user("alice"), &req.id).await.unwrap();

        let backwards = RemoveGuardianship {
            guardian: "alice".into(),
            ward: "bob".into(),
        };
        assert!(!svc.remove(&Caller::user("bob"), backwards).await.unwrap());

        let edge = RemoveGuardianship {
            guardian: "bob".into(),
            ward: "alice".into(),
        };
        assert!(svc.remove(&Caller::user("alice"), edge).await.unwrap());
        assert!(store.read(|s| s.guardianships.is_empty()));
        assert!(!tuples.contains(&Tuple::guardian("bob", "alice")));
    }

    #[tokio::test]
    async fn outsiders_cannot_remove() {
        let (svc, _, _) = service();
        let edge = RemoveGuardianship {
            guardian: "bob".into(),
            ward: "alice".into(),
        };
        assert!(matches!(
            svc.remove(&Caller::user("eve"), edge).await,
            Err(CustosError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn list_splits_by_direction() {
        let (svc, _, _) = service();
        let req = svc.request(&Caller::user("bob"), ask("alice")).unwrap();
        svc.request(&Caller::user("alice"), ask("carol")).unwrap();
        svc.accept(&Caller::user("alice"), &req.id).await.unwrap();

        let alice = svc.list(&Caller::user("alice"));
        assert_eq!(alice.incoming.len(), 1);
        assert_eq!(alice.outgoing.len(), 1);
        assert_eq!(alice.guardians, vec!["bob".to_string()]);
        assert!(alice.wards.is_empty());
        assert_eq!(svc.list(&Caller::user("bob")).wards, vec!["alice".to_string()]);
    }
}
