//! Organization membership and adminship.
//!
//! Every mutation is gated on `can_manage`, which the authorization model
//! grants to admins, so admins manage admins. The last admin can never be
//! removed.

use crate::sync::{authorize, commit_or_revert, required};
use custos_core::error::{CustosError, CustosResult};
use custos_core::types::{new_id, organization_ref, relation, user_id};
use custos_core::{Caller, DomainStore, Organization, StoreState, Tuple};
use custos_provider::{TupleDelta, TupleStore};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrganization {
    pub name: String,
}

#[derive(Clone)]
pub struct OrganizationService {
    store: Arc<DomainStore>,
    tuples: Arc<dyn TupleStore>,
}

fn not_found(org_id: &str) -> CustosError {
    CustosError::NotFound(format!("organization {org_id}"))
}

fn org_mut<'a>(s: &'a mut StoreState, org_id: &str) -> CustosResult<&'a mut Organization> {
    s.organizations.get_mut(org_id).ok_or_else(|| not_found(org_id))
}

impl OrganizationService {
    pub fn new(store: Arc<DomainStore>, tuples: Arc<dyn TupleStore>) -> Self {
        Self { store, tuples }
    }

    pub async fn create(&self, caller: &Caller, req: CreateOrganization) -> CustosResult<Organization> {
        let name = required("name", &req.name)?;
        let org = Organization::new(new_id(), name, &caller.subject);

        self.store
            .update(|s| s.organizations.insert(org.id.clone(), org.clone()));

        let id = org.id.clone();
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::write(org.tuples()),
            move |s| {
                s.organizations.remove(&id);
            },
        )
        .await?;

        tracing::info!(org = %org.id, creator = %caller.subject, "organization created");
        Ok(org)
    }

    /// Organizations the caller belongs to; all of them for the admin channel.
    pub fn list(&self, caller: &Caller) -> Vec<Organization> {
        self.store.read(|s| {
            s.organizations
                .values()
                .filter(|o| caller.admin_channel || o.members.contains(&caller.subject))
                .cloned()
                .collect()
        })
    }

    pub async fn get(&self, caller: &Caller, org_id: &str) -> CustosResult<Organization> {
        let org = self.load(org_id)?;
        authorize(&*self.tuples, caller, relation::MEMBER, &organization_ref(org_id)).await?;
        Ok(org)
    }

    pub async fn add_member(&self, caller: &Caller, org_id: &str, user: &str) -> CustosResult<Organization> {
        let user = user_id("user", user)?;
        self.authorize_manage(caller, org_id).await?;

        let org = self.store.update(|s| {
            let org = org_mut(s, org_id)?;
            if !org.members.insert(user.clone()) {
                return Err(CustosError::Conflict(format!("{user} is already a member")));
            }
            Ok::<_, CustosError>(org.clone())
        })?;

        let (id, undo_user) = (org_id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::write([Tuple::member(&user, org_id)]),
            move |s| {
                if let Some(o) = s.organizations.get_mut(&id) {
                    o.members.remove(&undo_user);
                }
            },
        )
        .await?;

        tracing::info!(org = org_id, member = %user, "member added");
        Ok(org)
    }

    /// Removing an admin's membership also drops the admin role.
    pub async fn remove_member(&self, caller: &Caller, org_id: &str, user: &str) -> CustosResult<Organization> {
        let user = user_id("user", user)?;
        self.authorize_manage(caller, org_id).await?;

        let (org, was_admin) = self.store.update(|s| {
            let org = org_mut(s, org_id)?;
            if !org.members.contains(&user) {
                return Err(CustosError::NotFound(format!("{user} is not a member")));
            }
            let was_admin = org.admins.contains(&user);
            if was_admin && org.admins.len() == 1 {
                return Err(CustosError::Conflict("cannot remove the last admin".into()));
            }
            org.admins.remove(&user);
            org.members.remove(&user);
            Ok::<_, CustosError>((org.clone(), was_admin))
        })?;

        let mut deletes = vec![Tuple::member(&user, org_id)];
        if was_admin {
            deletes.push(Tuple::admin(&user, org_id));
        }

        let (id, undo_user) = (org_id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::delete(deletes),
            move |s| {
                if let Some(o) = s.organizations.get_mut(&id) {
                    o.members.insert(undo_user.clone());
                    if was_admin {
                        o.admins.insert(undo_user);
                    }
                }
            },
        )
        .await?;

        tracing::info!(org = org_id, member = %user, was_admin, "member removed");
        Ok(org)
    }

    /// Promotes `user`, adding membership first if needed.
    pub async fn add_admin(&self, caller: &Caller, org_id: &str, user: &str) -> CustosResult<Organization> {
        let user = user_id("user", user)?;
        self.authorize_manage(caller, org_id).await?;

        let (org, was_member) = self.store.update(|s| {
            let org = org_mut(s, org_id)?;
            if org.admins.contains(&user) {
                return Err(CustosError::Conflict(format!("{user} is already an admin")));
            }
            let was_member = !org.members.insert(user.clone());
            org.admins.insert(user.clone());
            Ok::<_, CustosError>((org.clone(), was_member))
        })?;

        let mut writes = Vec::with_capacity(2);
        if !was_member {
            writes.push(Tuple::member(&user, org_id));
        }
        writes.push(Tuple::admin(&user, org_id));

        let (id, undo_user) = (org_id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::write(writes),
            move |s| {
                if let Some(o) = s.organizations.get_mut(&id) {
                    o.admins.remove(&undo_user);
                    if !was_member {
                        o.members.remove(&undo_user);
                    }
                }
            },
        )
        .await?;

        tracing::info!(org = org_id, admin = %user, "admin added");
        Ok(org)
    }

    /// Demotes `user` to plain member.
    pub async fn remove_admin(&self, caller: &Caller, org_id: &str, user: &str) -> CustosResult<Organization> {
        let user = user_id("user", user)?;
        self.authorize_manage(caller, org_id).await?;

        let org = self.store.update(|s| {
            let org = org_mut(s, org_id)?;
            if !org.admins.contains(&user) {
                return Err(CustosError::NotFound(format!("{user} is not an admin")));
            }
            if org.admins.len() == 1 {
                return Err(CustosError::Conflict("cannot remove the last admin".into()));
            }
            org.admins.remove(&user);
            Ok::<_, CustosError>(org.clone())
        })?;

        let (id, undo_user) = (org_id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::delete([Tuple::admin(&user, org_id)]),
            move |s| {
                if let Some(o) = s.organizations.get_mut(&id) {
                    o.admins.insert(undo_user);
                }
            },
        )
        .await?;

        tracing::info!(org = org_id, admin = %user, "admin removed");
        Ok(org)
    }

    /// Deletes the organization and detaches every dossier that referenced it.
    /// If the tuple deletion fails the whole cascade is restored.
    pub async fn delete(&self, caller: &Caller, org_id: &str) -> CustosResult<()> {
        self.authorize_manage(caller, org_id).await?;

        let (org, detached) = self.store.update(|s| {
            let org = s.organizations.remove(org_id).ok_or_else(|| not_found(org_id))?;
            let detached = s.dossiers_in_org(org_id);
            for id in &detached {
                if let Some(d) = s.dossiers.get_mut(id) {
                    d.org_id = None;
                }
            }
            Ok::<_, CustosError>((org, detached))
        })?;

        let delta = TupleDelta::delete(
            org.tuples()
                .into_iter()
                .chain(detached.iter().map(|d| Tuple::org_parent(org_id, d))),
        );

        let restore_org = org.clone();
        let restore_dossiers = detached.clone();
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            let org_id = restore_org.id.clone();
            s.organizations.insert(org_id.clone(), restore_org);
            // A dossier moved to another org meanwhile keeps its new parent.
            for id in &restore_dossiers {
                if let Some(d) = s.dossiers.get_mut(id).filter(|d| d.org_id.is_none()) {
                    d.org_id = Some(org_id.clone());
                }
            }
        })
        .await?;

        tracing::info!(org = org_id, dossiers_detached = detached.len(), "organization deleted");
        Ok(())
    }

    fn load(&self, org_id: &str) -> CustosResult<Organization> {
        self.store
            .read(|s| s.organizations.get(org_id).cloned())
            .ok_or_else(|| not_found(org_id))
    }

    /// Not-found is reported before the authorization check.
    async fn authorize_manage(&self, caller: &Caller, org_id: &str) -> CustosResult<()> {
        self.load(org_id)?;
        authorize(
            &*self.tuples,
            caller,
            relation::CAN_MANAGE,
            &organization_ref(org_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_provider::MemoryTupleStore;

    async fn setup() -> (OrganizationService, Arc<DomainStore>, Arc<MemoryTupleStore>, Organization) {
        let store = Arc::new(DomainStore::in_memory());
        let tuples = Arc::new(MemoryTupleStore::new());
        let svc = OrganizationService::new(store.clone(), tuples.clone());
        let org = svc
            .create(&Caller::user("carol"), CreateOrganization { name: "Clinic".into() })
            .await
            .unwrap();
        (svc, store, tuples, org)
    }

    #[tokio::test]
    async fn creator_is_member_and_admin() {
        let (_, _, tuples, org) = setup().await;
        assert!(org.members.contains("carol"));
        assert!(org.admins.contains("carol"));
        assert!(tuples.contains(&Tuple::member("carol", &org.id)));
        assert!(tuples.contains(&Tuple::admin("carol", &org.id)));
    }

    #[tokio::test]
    async fn non_admins_cannot_manage() {
        let (svc, _, _, org) = setup().await;
        let carol = Caller::user("carol");
        svc.add_member(&carol, &org.id, "dave").await.unwrap();

        let err = svc
            .add_member(&Caller::user("dave"), &org.id, "eve")
            .await
            .unwrap_err();
        assert!(matches!(err, CustosError::Forbidden(_)));
    }

    #[tokio::test]
    async fn add_admin_implies_membership() {
        let (svc, _, tuples, org) = setup().await;
        let updated = svc.add_admin(&Caller::user("carol"), &org.id, "dave").await.unwrap();
        assert!(updated.members.contains("dave"));
        assert!(updated.admins.contains("dave"));
        assert!(tuples.contains(&Tuple::member("dave", &org.id)));
        assert!(tuples.contains(&Tuple::admin("dave", &org.id)));

        // The new admin can now manage.
        svc.add_member(&Caller::user("dave"), &org.id, "erin").await.unwrap();
    }

    #[tokio::test]
    async fn last_admin_cannot_be_removed() {
        let (svc, _, _, org) = setup().await;
        let carol = Caller::user("carol");
        assert!(matches!(
            svc.remove_admin(&carol, &org.id, "carol").await,
            Err(CustosError::Conflict(_))
        ));
        assert!(matches!(
            svc.remove_member(&carol, &org.id, "carol").await,
            Err(CustosError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn removing_admin_member_drops_both_roles() {
        let (svc, store, tuples, org) = setup().await;
        let carol = Caller::user("carol");
        svc.add_admin(&carol, &org.id, "dave").await.unwrap();
        svc.remove_member(&carol, &org.id, "dave").await.unwrap();

        let o = store.read(|s| s.organizations[&org.id].clone());
        assert!(!o.members.contains("dave"));
        assert!(!o.admins.contains("dave"));
        assert!(!tuples.contains(&Tuple::admin("dave", &org.id)));
    }

    #[tokio::test]
    async fn failed_write_reverts_promotion() {
        let (svc, store, tuples, org) = setup().await;
        tuples.set_fail_writes(true);
        assert!(svc.add_admin(&Caller::user("carol"), &org.id, "dave").await.is_err());

        let o = store.read(|s| s.organizations[&org.id].clone());
        assert!(!o.members.contains("dave"));
        assert!(!o.admins.contains("dave"));
    }

    #[tokio::test]
    async fn admin_channel_bypasses_can_manage() {
        let (svc, _, _, org) = setup().await;
        svc.add_member(&Caller::admin_channel("ops"), &org.id, "dave")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_org_is_not_found_before_forbidden() {
        let (svc, _, _, _) = setup().await;
        assert!(matches!(
            svc.add_member(&Caller::user("eve"), "missing", "dave").await,
            Err(CustosError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_get_follow_membership() {
        let (svc, _, _, org) = setup().await;
        assert_eq!(svc.list(&Caller::user("carol")).len(), 1);
        assert!(svc.list(&Caller::user("eve")).is_empty());
        assert_eq!(svc.list(&Caller::admin_channel("ops")).len(), 1);

        svc.get(&Caller::user("carol"), &org.id).await.unwrap();
        assert!(matches!(
            svc.get(&Caller::user("eve"), &org.id).await,
            Err(CustosError::Forbidden(_))
        ));
    }
}
