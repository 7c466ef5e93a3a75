//! End-to-end workflows over the in-memory tuple store.

use custos_core::types::dossier_ref;
use custos_core::{Caller, DomainStore, RequestStatus, StoreState, Tuple};
use custos_engine::dossier::{AddRelation, CreateDossier, EmergencyCheck, SetOrganization};
use custos_engine::guardianship::RequestGuardianship;
use custos_engine::organization::CreateOrganization;
use custos_engine::{derive_tuples, rehydrate, Services};
use custos_provider::{MemoryTupleStore, TupleStore};
use std::collections::BTreeSet;
use std::sync::Arc;

fn services() -> (Services, Arc<DomainStore>, Arc<MemoryTupleStore>) {
    let store = Arc::new(DomainStore::in_memory());
    let tuples = Arc::new(MemoryTupleStore::new());
    (Services::new(store.clone(), tuples.clone()), store, tuples)
}

fn dossier(title: &str, kind: &str) -> CreateDossier {
    CreateDossier {
        title: title.into(),
        content: String::new(),
        kind: kind.into(),
        org_id: None,
        public: false,
    }
}

/// Domain invariants that must hold after any sequence of operations.
fn assert_invariants(state: &StoreState) {
    for d in state.dossiers.values() {
        assert!(d.relations.iter().all(|r| r.user != d.owner), "owner in relations of {}", d.id);
        assert!(!d.blocked_users.contains(&d.owner), "owner blocked on {}", d.id);
    }
    for o in state.organizations.values() {
        assert!(!o.admins.is_empty(), "organization {} has no admin", o.id);
        assert!(o.admins.is_subset(&o.members), "admin outside members in {}", o.id);
    }
}

/// Local state and the tuple store agree exactly.
fn assert_in_sync(store: &DomainStore, tuples: &MemoryTupleStore) {
    let derived: BTreeSet<Tuple> = store.read(derive_tuples).into_iter().collect();
    let stored: BTreeSet<Tuple> = tuples.tuples().into_iter().collect();
    assert_eq!(derived, stored);
}

#[tokio::test]
async fn tax_return_writes_a_single_owner_tuple() {
    let (svc, _, tuples) = services();
    let d = svc
        .dossiers
        .create(&Caller::user("alice"), dossier("Tax Return 2024", "tax"))
        .await
        .unwrap();

    assert_eq!(d.owner, "alice");
    let json = serde_json::to_value(&d).unwrap();
    assert_eq!(json["owner"], "alice");
    assert_eq!(json["type"], "tax");
    assert_eq!(tuples.tuples(), vec![Tuple::owner("alice", &d.id)]);
}

#[tokio::test]
async fn guardianship_then_mandate_delegation() {
    let (svc, store, tuples) = services();
    let (alice, bob) = (Caller::user("alice"), Caller::user("bob"));

    let req = svc
        .guardianships
        .request(&bob, RequestGuardianship { to: "alice".into() })
        .unwrap();
    let accepted = svc.guardianships.accept(&alice, &req.id).await.unwrap();
    assert_eq!(accepted.status, RequestStatus::Accepted);
    assert_eq!(store.read(|s| s.guardians_of("alice").to_vec()), vec!["bob".to_string()]);
    assert!(tuples.contains(&Tuple::new("user:bob", "guardian", "user:alice")));

    let d = svc
        .dossiers
        .create(&alice, dossier("Insurance policy", "insurance"))
        .await
        .unwrap();
    svc.dossiers
        .add_relation(
            &alice,
            &d.id,
            AddRelation {
                user: "bob".into(),
                relation: "mandate".into(),
            },
        )
        .await
        .unwrap();
    assert!(tuples.check("user:bob", "editor", &dossier_ref(&d.id)).await);

    assert_invariants(&store.snapshot());
    assert_in_sync(&store, &tuples);
}

#[tokio::test]
async fn deleting_an_organization_detaches_its_dossiers() {
    let (svc, store, tuples) = services();
    let carol = Caller::user("carol");
    let org = svc
        .organizations
        .create(&carol, CreateOrganization { name: "Clinic".into() })
        .await
        .unwrap();

    let mut req = dossier("Lab results", "medical");
    req.org_id = Some(org.id.clone());
    let d1 = svc.dossiers.create(&carol, req).await.unwrap();
    assert!(tuples.contains(&Tuple::org_parent(&org.id, &d1.id)));

    svc.organizations.delete(&carol, &org.id).await.unwrap();

    let after = store.read(|s| s.dossiers[&d1.id].clone());
    assert_eq!(after.org_id, None);
    assert!(tuples
        .tuples_for(&dossier_ref(&d1.id))
        .iter()
        .all(|t| t.relation != "org_parent"));
    assert!(store.read(|s| s.organizations.is_empty()));
    assert_in_sync(&store, &tuples);
}

#[tokio::test]
async fn failed_org_cascade_is_rolled_back() {
    let (svc, store, tuples) = services();
    let carol = Caller::user("carol");
    let org = svc
        .organizations
        .create(&carol, CreateOrganization { name: "Clinic".into() })
        .await
        .unwrap();
    let mut req = dossier("Lab results", "medical");
    req.org_id = Some(org.id.clone());
    svc.dossiers.create(&carol, req).await.unwrap();
    let before = store.snapshot();

    tuples.set_fail_writes(true);
    assert!(svc.organizations.delete(&carol, &org.id).await.is_err());
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn toggling_public_twice_is_a_round_trip() {
    let (svc, store, tuples) = services();
    let alice = Caller::user("alice");
    let d = svc.dossiers.create(&alice, dossier("Passport", "identity")).await.unwrap();
    let before = tuples.tuples();

    svc.dossiers.toggle_public(&alice, &d.id).await.unwrap();
    assert!(tuples.check("user:anyone", "viewer", &dossier_ref(&d.id)).await);
    svc.dossiers.toggle_public(&alice, &d.id).await.unwrap();

    assert_eq!(tuples.tuples(), before);
    assert!(!store.read(|s| s.dossiers[&d.id].public));
}

#[tokio::test]
async fn emergency_check_leaves_state_untouched() {
    let (svc, store, tuples) = services();
    let alice = Caller::user("alice");
    let d = svc.dossiers.create(&alice, dossier("Will", "legal")).await.unwrap();
    let object = dossier_ref(&d.id);

    let before = tuples.check("user:erin", "viewer", &object).await;
    let snapshot = store.snapshot();
    let access = svc
        .dossiers
        .emergency_check(
            &alice,
            &d.id,
            EmergencyCheck {
                user: Some("erin".into()),
                relation: None,
            },
        )
        .await
        .unwrap();

    assert!(access.allowed);
    assert_eq!(tuples.check("user:erin", "viewer", &object).await, before);
    assert_eq!(store.snapshot(), snapshot);
}

#[tokio::test]
async fn blocking_overrides_public_visibility() {
    let (svc, _, tuples) = services();
    let alice = Caller::user("alice");
    let d = svc.dossiers.create(&alice, dossier("Bank statement", "financial")).await.unwrap();
    let object = dossier_ref(&d.id);

    svc.dossiers.toggle_public(&alice, &d.id).await.unwrap();
    svc.dossiers.block(&alice, &d.id, "bob").await.unwrap();
    assert!(!tuples.check("user:bob", "viewer", &object).await);
    assert!(svc.dossiers.get(&Caller::user("bob"), &d.id).await.is_err());

    svc.dossiers.unblock(&alice, &d.id, "bob").await.unwrap();
    assert!(tuples.check("user:bob", "viewer", &object).await);
}

#[tokio::test]
async fn rehydration_restores_a_fresh_tuple_store() {
    let (svc, store, tuples) = services();
    let (alice, carol) = (Caller::user("alice"), Caller::user("carol"));

    let org = svc
        .organizations
        .create(&carol, CreateOrganization { name: "Clinic".into() })
        .await
        .unwrap();
    svc.organizations.add_member(&carol, &org.id, "alice").await.unwrap();
    let d = svc.dossiers.create(&alice, dossier("X-ray", "medical")).await.unwrap();
    svc.dossiers
        .set_org(
            &alice,
            &d.id,
            SetOrganization {
                org_id: Some(org.id.clone()),
            },
        )
        .await
        .unwrap();
    let req = svc
        .guardianships
        .request(&carol, RequestGuardianship { to: "alice".into() })
        .unwrap();
    svc.guardianships.accept(&alice, &req.id).await.unwrap();

    // Restart: same snapshot, empty tuple store.
    let restarted = DomainStore::with_state(store.snapshot());
    let fresh = MemoryTupleStore::new();
    let report = rehydrate(&restarted, &fresh).await;

    assert_eq!(report.failed_batches, 0);
    assert_eq!(fresh.tuples(), tuples.tuples());

    // Replaying against a consistent store changes nothing.
    rehydrate(&restarted, &fresh).await;
    assert_eq!(fresh.tuples(), tuples.tuples());
    assert_invariants(&restarted.snapshot());
}

#[tokio::test]
async fn snapshot_survives_a_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custos.json");
    let store = Arc::new(DomainStore::load(&path));
    let tuples = Arc::new(MemoryTupleStore::new());
    let svc = Services::new(store.clone(), tuples.clone());

    let alice = Caller::user("alice");
    let d = svc.dossiers.create(&alice, dossier("Tax Return 2024", "tax")).await.unwrap();
    svc.dossiers.block(&alice, &d.id, "mallory").await.unwrap();

    let reloaded = DomainStore::load(&path);
    assert_eq!(reloaded.snapshot(), store.snapshot());
    assert!(reloaded.read(|s| s.dossiers[&d.id].blocked_users.contains("mallory")));
}
