//! Dossier CRUD and per-dossier relation management.
//!
//! Authority by operation:
//! - read (`get`, `list`, `get_relations`): `viewer`
//! - write (`update`, `delete`, `add_relation`, `remove_relation`): `editor`
//! - `set_org`, `toggle_public`, `block`, `unblock`: the owner only
//!
//! The admin channel passes `viewer`/`editor` checks but not owner-only ones.

use crate::sync::{authorize, commit_or_revert, required};
use custos_core::error::{CustosError, CustosResult};
use custos_core::types::{
    dossier_ref, new_id, object_type, relation, split_ref, user_id, user_ref,
    DELEGABLE_RELATIONS,
};
use custos_core::{Caller, DomainStore, Dossier, DossierType, RelationEntry, StoreState, Tuple};
use custos_provider::{TupleDelta, TupleStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDossier {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub public: bool,
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDossier {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddRelation {
    pub user: String,
    #[serde(default = "default_delegated_relation")]
    pub relation: String,
}

fn default_delegated_relation() -> String {
    relation::MANDATE.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOrganization {
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmergencyCheck {
    pub user: Option<String>,
    pub relation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyAccess {
    pub user: String,
    pub relation: String,
    pub object: String,
    pub allowed: bool,
}

#[derive(Clone)]
pub struct DossierService {
    store: Arc<DomainStore>,
    tuples: Arc<dyn TupleStore>,
}

fn not_found(id: &str) -> CustosError {
    CustosError::NotFound(format!("dossier {id}"))
}

fn dossier_mut<'a>(s: &'a mut StoreState, id: &str) -> CustosResult<&'a mut Dossier> {
    s.dossiers.get_mut(id).ok_or_else(|| not_found(id))
}

fn require_owner(dossier: &Dossier, caller: &Caller, action: &str) -> CustosResult<()> {
    if dossier.owner == caller.subject {
        Ok(())
    } else {
        Err(CustosError::Forbidden(format!(
            "only the owner may {action} dossier {}",
            dossier.id
        )))
    }
}

impl DossierService {
    pub fn new(store: Arc<DomainStore>, tuples: Arc<dyn TupleStore>) -> Self {
        Self { store, tuples }
    }

    pub async fn create(&self, caller: &Caller, req: CreateDossier) -> CustosResult<Dossier> {
        let title = required("title", &req.title)?;
        let kind: DossierType = req.kind.trim().parse()?;
        let org_id = req
            .org_id
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty());

        let dossier = Dossier {
            id: new_id(),
            title,
            content: req.content,
            kind,
            owner: caller.subject.clone(),
            relations: Vec::new(),
            org_id,
            public: req.public,
            blocked_users: BTreeSet::new(),
        };

        self.store.update(|s| {
            if let Some(org) = &dossier.org_id {
                if !s.organizations.contains_key(org) {
                    return Err(CustosError::NotFound(format!("organization {org}")));
                }
            }
            s.dossiers.insert(dossier.id.clone(), dossier.clone());
            Ok::<_, CustosError>(())
        })?;

        // Owner, plus org-parent and public when set.
        let delta = TupleDelta::write(dossier.tuples());
        let id = dossier.id.clone();
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            s.dossiers.remove(&id);
        })
        .await?;

        tracing::info!(dossier = %dossier.id, owner = %dossier.owner, kind = %dossier.kind, "dossier created");
        Ok(dossier)
    }

    /// Dossiers the caller can view, ordered by id. A tuple-store error
    /// yields an empty list.
    pub async fn list(&self, caller: &Caller) -> Vec<Dossier> {
        if caller.admin_channel {
            return self.store.read(|s| s.dossiers.values().cloned().collect());
        }

        let objects = self
            .tuples
            .list_objects(&caller.user_ref(), relation::VIEWER, object_type::DOSSIER)
            .await;
        let ids: BTreeSet<&str> = objects
            .iter()
            .filter_map(|o| split_ref(o))
            .filter(|(t, _)| *t == object_type::DOSSIER)
            .map(|(_, id)| id)
            .collect();

        self.store
            .read(|s| ids.iter().filter_map(|id| s.dossiers.get(*id).cloned()).collect())
    }

    pub async fn get(&self, caller: &Caller, id: &str) -> CustosResult<Dossier> {
        let dossier = self.load(id)?;
        authorize(&*self.tuples, caller, relation::VIEWER, &dossier_ref(id)).await?;
        Ok(dossier)
    }

    pub async fn update(&self, caller: &Caller, id: &str, req: UpdateDossier) -> CustosResult<Dossier> {
        let title = req.title.as_deref().map(|t| required("title", t)).transpose()?;
        let kind = req
            .kind
            .as_deref()
            .map(|k| k.trim().parse::<DossierType>())
            .transpose()?;

        self.load(id)?;
        authorize(&*self.tuples, caller, relation::EDITOR, &dossier_ref(id)).await?;

        let updated = self.store.update(|s| {
            let d = dossier_mut(s, id)?;
            if let Some(title) = title {
                d.title = title;
            }
            if let Some(content) = req.content {
                d.content = content;
            }
            if let Some(kind) = kind {
                d.kind = kind;
            }
            Ok::<_, CustosError>(d.clone())
        })?;

        self.store.persist();
        tracing::info!(dossier = id, editor = %caller.subject, "dossier updated");
        Ok(updated)
    }

    /// Removes every tuple the dossier caused, then the record itself.
    ///
    /// The record is removed even if tuple cleanup fails; the leftover tuples
    /// are recorded as orphans for the next rehydration to sweep.
    pub async fn delete(&self, caller: &Caller, id: &str) -> CustosResult<()> {
        self.load(id)?;
        authorize(&*self.tuples, caller, relation::EDITOR, &dossier_ref(id)).await?;

        let Some(removed) = self.store.update(|s| s.dossiers.remove(id)) else {
            return Err(not_found(id));
        };

        let leftovers = removed.tuples();
        if let Err(e) = self
            .tuples
            .write(&TupleDelta::delete(leftovers.iter().cloned()).lenient())
            .await
        {
            tracing::warn!(dossier = id, tuples = leftovers.len(), error = %e, "tuple cleanup failed, recording orphans");
            self.store.update(|s| s.record_orphans(leftovers));
        }

        self.store.persist();
        tracing::info!(dossier = id, by = %caller.subject, "dossier deleted");
        Ok(())
    }

    pub async fn get_relations(&self, caller: &Caller, id: &str) -> CustosResult<Vec<RelationEntry>> {
        Ok(self.get(caller, id).await?.relations)
    }

    /// Delegates `relation` to a user who shares a guardianship with the caller.
    pub async fn add_relation(&self, caller: &Caller, id: &str, req: AddRelation) -> CustosResult<Dossier> {
        let user = user_id("user", &req.user)?;
        let rel = req.relation.trim().to_string();
        if !DELEGABLE_RELATIONS.contains(&rel.as_str()) {
            return Err(CustosError::Validation(format!(
                "relation {rel:?} cannot be delegated; expected one of {}",
                DELEGABLE_RELATIONS.join(", ")
            )));
        }

        let dossier = self.load(id)?;
        authorize(&*self.tuples, caller, relation::EDITOR, &dossier_ref(id)).await?;
        if user == dossier.owner {
            return Err(CustosError::Validation(
                "the owner cannot be granted a relation on their own dossier".into(),
            ));
        }

        let updated = self.store.update(|s| {
            if !caller.admin_channel && !s.guardianship_between(&caller.subject, &user) {
                return Err(CustosError::Forbidden(format!(
                    "{user} must be in a guardianship with {} to receive a {rel}",
                    caller.subject
                )));
            }
            let d = dossier_mut(s, id)?;
            if d.has_relation(&user, &rel) {
                return Err(CustosError::Conflict(format!("{user} already holds {rel}")));
            }
            d.relations.push(RelationEntry {
                user: user.clone(),
                relation: rel.clone(),
            });
            Ok::<_, CustosError>(d.clone())
        })?;

        let (undo_id, undo_user, undo_rel) = (id.to_string(), user.clone(), rel.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::write([Tuple::dossier_relation(&user, &rel, id)]),
            move |s| {
                if let Some(d) = s.dossiers.get_mut(&undo_id) {
                    d.relations
                        .retain(|r| !(r.user == undo_user && r.relation == undo_rel));
                }
            },
        )
        .await?;

        tracing::info!(dossier = id, user = %user, relation = %rel, "relation granted");
        Ok(updated)
    }

    pub async fn remove_relation(
        &self,
        caller: &Caller,
        id: &str,
        user: &str,
        rel: &str,
    ) -> CustosResult<Dossier> {
        let user = user_id("user", user)?;
        self.load(id)?;
        authorize(&*self.tuples, caller, relation::EDITOR, &dossier_ref(id)).await?;

        let (updated, index, entry) = self.store.update(|s| {
            let d = dossier_mut(s, id)?;
            let index = d
                .relations
                .iter()
                .position(|r| r.user == user && r.relation == rel)
                .ok_or_else(|| CustosError::NotFound(format!("{user} does not hold {rel}")))?;
            let entry = d.relations.remove(index);
            Ok::<_, CustosError>((d.clone(), index, entry))
        })?;

        let undo_id = id.to_string();
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::delete([Tuple::dossier_relation(&user, rel, id)]),
            move |s| {
                if let Some(d) = s.dossiers.get_mut(&undo_id) {
                    let at = index.min(d.relations.len());
                    d.relations.insert(at, entry);
                }
            },
        )
        .await?;

        tracing::info!(dossier = id, user = %user, relation = rel, "relation revoked");
        Ok(updated)
    }

    /// Assigns the dossier to an organization the owner belongs to, or
    /// detaches it with `None`.
    pub async fn set_org(&self, caller: &Caller, id: &str, req: SetOrganization) -> CustosResult<Dossier> {
        let target = req
            .org_id
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty());

        let (updated, previous) = self.store.update(|s| {
            if let Some(org_id) = &target {
                let org = s
                    .organizations
                    .get(org_id)
                    .ok_or_else(|| CustosError::NotFound(format!("organization {org_id}")))?;
                if !org.members.contains(&caller.subject) {
                    return Err(CustosError::Forbidden(format!(
                        "{} is not a member of organization {org_id}",
                        caller.subject
                    )));
                }
            }
            let d = dossier_mut(s, id)?;
            require_owner(d, caller, "reassign")?;
            let previous = std::mem::replace(&mut d.org_id, target.clone());
            Ok::<_, CustosError>((d.clone(), previous))
        })?;

        if previous == target {
            return Ok(updated);
        }

        let mut delta = TupleDelta::default();
        if let Some(old) = &previous {
            delta.deletes.push(Tuple::org_parent(old, id));
        }
        if let Some(new) = &target {
            delta.writes.push(Tuple::org_parent(new, id));
        }

        let undo_id = id.to_string();
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            if let Some(d) = s.dossiers.get_mut(&undo_id) {
                d.org_id = previous;
            }
        })
        .await?;

        tracing::info!(dossier = id, org = ?updated.org_id, "dossier organization changed");
        Ok(updated)
    }

    pub async fn toggle_public(&self, caller: &Caller, id: &str) -> CustosResult<Dossier> {
        let updated = self.store.update(|s| {
            let d = dossier_mut(s, id)?;
            require_owner(d, caller, "publish")?;
            d.public = !d.public;
            Ok::<_, CustosError>(d.clone())
        })?;

        let delta = if updated.public {
            TupleDelta::write([Tuple::public(id)])
        } else {
            TupleDelta::delete([Tuple::public(id)])
        };

        let (undo_id, was_public) = (id.to_string(), !updated.public);
        commit_or_revert(&self.store, &*self.tuples, &delta, move |s| {
            if let Some(d) = s.dossiers.get_mut(&undo_id) {
                d.public = was_public;
            }
        })
        .await?;

        tracing::info!(dossier = id, public = updated.public, "dossier visibility toggled");
        Ok(updated)
    }

    pub async fn block(&self, caller: &Caller, id: &str, user: &str) -> CustosResult<Dossier> {
        let user = user_id("user", user)?;
        let updated = self.store.update(|s| {
            let d = dossier_mut(s, id)?;
            require_owner(d, caller, "block users on")?;
            if user == d.owner {
                return Err(CustosError::Validation("the owner cannot be blocked".into()));
            }
            if !d.blocked_users.insert(user.clone()) {
                return Err(CustosError::Conflict(format!("{user} is already blocked")));
            }
            Ok::<_, CustosError>(d.clone())
        })?;

        let (undo_id, undo_user) = (id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::write([Tuple::blocked(&user, id)]),
            move |s| {
                if let Some(d) = s.dossiers.get_mut(&undo_id) {
                    d.blocked_users.remove(&undo_user);
                }
            },
        )
        .await?;

        tracing::info!(dossier = id, user = %user, "user blocked");
        Ok(updated)
    }

    pub async fn unblock(&self, caller: &Caller, id: &str, user: &str) -> CustosResult<Dossier> {
        let user = user_id("user", user)?;
        let updated = self.store.update(|s| {
            let d = dossier_mut(s, id)?;
            require_owner(d, caller, "unblock users on")?;
            if !d.blocked_users.remove(&user) {
                return Err(CustosError::NotFound(format!("{user} is not blocked")));
            }
            Ok::<_, CustosError>(d.clone())
        })?;

        let (undo_id, undo_user) = (id.to_string(), user.clone());
        commit_or_revert(
            &self.store,
            &*self.tuples,
            &TupleDelta::delete([Tuple::blocked(&user, id)]),
            move |s| {
                if let Some(d) = s.dossiers.get_mut(&undo_id) {
                    d.blocked_users.insert(undo_user);
                }
            },
        )
        .await?;

        tracing::info!(dossier = id, user = %user, "user unblocked");
        Ok(updated)
    }

    /// Break-glass evaluation: would `user` hold `relation` if a `can_view`
    /// grant existed? The grant is contextual and never written.
    ///
    /// Anyone may check themselves. Checking another user requires `viewer`.
    pub async fn emergency_check(
        &self,
        caller: &Caller,
        id: &str,
        req: EmergencyCheck,
    ) -> CustosResult<EmergencyAccess> {
        let user = match req.user.as_deref() {
            Some(u) => user_id("user", u)?,
            None => caller.subject.clone(),
        };
        let rel = match req.relation.as_deref() {
            Some(r) => required("relation", r)?,
            None => relation::VIEWER.to_string(),
        };
        self.load(id)?;
        let object = dossier_ref(id);
        if user != caller.subject {
            authorize(&*self.tuples, caller, relation::VIEWER, &object).await?;
        }

        let allowed = self
            .tuples
            .check_with_context(&user_ref(&user), &rel, &object, &[Tuple::emergency(&user, id)])
            .await;

        tracing::warn!(
            dossier = id,
            requested_by = %caller.subject,
            user = %user,
            relation = %rel,
            allowed,
            "emergency access evaluated"
        );
        Ok(EmergencyAccess {
            user,
            relation: rel,
            object,
            allowed,
        })
    }

    fn load(&self, id: &str) -> CustosResult<Dossier> {
        self.store
            .read(|s| s.dossiers.get(id).cloned())
            .ok_or_else(|| not_found(id))
    }
}
