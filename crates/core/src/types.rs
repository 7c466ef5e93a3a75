//! Domain types for the Custos access-control layer.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CustosError, CustosResult};

// ---------------------------------------------------------------------------
// Authorization model vocabulary
// ---------------------------------------------------------------------------

/// Object types of the authorization model.
pub mod object_type {
    pub const USER: &str = "user";
    pub const DOSSIER: &str = "dossier";
    pub const ORGANIZATION: &str = "organization";
}

/// Relation names of the authorization model.
pub mod relation {
    pub const OWNER: &str = "owner";
    pub const MANDATE: &str = "mandate";
    pub const ORG_PARENT: &str = "org_parent";
    pub const BLOCKED: &str = "blocked";
    pub const CAN_VIEW: &str = "can_view";
    pub const EDITOR: &str = "editor";
    pub const VIEWER: &str = "viewer";
    pub const GUARDIAN: &str = "guardian";
    pub const MEMBER: &str = "member";
    pub const ADMIN: &str = "admin";
    pub const CAN_MANAGE: &str = "can_manage";
}

/// Relations an owner may delegate through the dossier's relation list.
pub const DELEGABLE_RELATIONS: &[&str] = &[relation::MANDATE];

/// Subject matching any authenticated user.
pub const WILDCARD_USER: &str = "user:*";

pub fn user_ref(id: &str) -> String {
    format!("{}:{id}", object_type::USER)
}

pub fn dossier_ref(id: &str) -> String {
    format!("{}:{id}", object_type::DOSSIER)
}

pub fn organization_ref(id: &str) -> String {
    format!("{}:{id}", object_type::ORGANIZATION)
}

/// Characters that would turn `user:<id>` into a wildcard or userset.
const RESERVED_ID_CHARS: &[char] = &['*', ':', '#'];

/// Trims a user id and rejects it when empty or when it contains a
/// reserved tuple character.
pub fn user_id(field: &str, value: &str) -> CustosResult<String> {
    let id = value.trim();
    if id.is_empty() {
        return Err(CustosError::Validation(format!("{field} is required")));
    }
    if id.contains(RESERVED_ID_CHARS) || id.contains(char::is_whitespace) {
        return Err(CustosError::Validation(format!(
            "{field} must not contain whitespace, '*', ':' or '#'"
        )));
    }
    Ok(id.to_string())
}

/// Splits `type:id` into its parts.
pub fn split_ref(reference: &str) -> Option<(&str, &str)> {
    reference.split_once(':').filter(|(t, id)| !t.is_empty() && !id.is_empty())
}

// ---------------------------------------------------------------------------
// Tuple
// ---------------------------------------------------------------------------

/// A `(user, relation, object)` fact in the external relationship store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub user: String,
    pub relation: String,
    pub object: String,
}

impl Tuple {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }

    pub fn owner(owner: &str, dossier_id: &str) -> Self {
        Self::new(user_ref(owner), relation::OWNER, dossier_ref(dossier_id))
    }

    pub fn dossier_relation(user: &str, rel: &str, dossier_id: &str) -> Self {
        Self::new(user_ref(user), rel, dossier_ref(dossier_id))
    }

    pub fn org_parent(org_id: &str, dossier_id: &str) -> Self {
        Self::new(
            organization_ref(org_id),
            relation::ORG_PARENT,
            dossier_ref(dossier_id),
        )
    }

    pub fn public(dossier_id: &str) -> Self {
        Self::new(WILDCARD_USER, relation::VIEWER, dossier_ref(dossier_id))
    }

    pub fn blocked(user: &str, dossier_id: &str) -> Self {
        Self::new(user_ref(user), relation::BLOCKED, dossier_ref(dossier_id))
    }

    /// `guardian` guards `ward`.
    pub fn guardian(guardian: &str, ward: &str) -> Self {
        Self::new(user_ref(guardian), relation::GUARDIAN, user_ref(ward))
    }

    pub fn member(user: &str, org_id: &str) -> Self {
        Self::new(user_ref(user), relation::MEMBER, organization_ref(org_id))
    }

    pub fn admin(user: &str, org_id: &str) -> Self {
        Self::new(user_ref(user), relation::ADMIN, organization_ref(org_id))
    }

    /// Break-glass grant. Only ever sent as a contextual tuple.
    pub fn emergency(user: &str, dossier_id: &str) -> Self {
        Self::new(user_ref(user), relation::CAN_VIEW, dossier_ref(dossier_id))
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.user, self.relation, self.object)
    }
}

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// The authenticated subject of a request.
///
/// `admin_channel` is set only for requests arriving over the internal
/// management channel; it bypasses relation checks on organizations and
/// dossiers. The HTTP layer decides whether to honor it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: String,
    pub admin_channel: bool,
}

impl Caller {
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            admin_channel: false,
        }
    }

    pub fn admin_channel(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            admin_channel: true,
        }
    }

    pub fn user_ref(&self) -> String {
        user_ref(&self.subject)
    }
}

// ---------------------------------------------------------------------------
// Dossier
// ---------------------------------------------------------------------------

/// Fixed set of dossier categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DossierType {
    Medical,
    Tax,
    Legal,
    Financial,
    Insurance,
    Identity,
    Other,
}

impl DossierType {
    pub const ALL: [DossierType; 7] = [
        DossierType::Medical,
        DossierType::Tax,
        DossierType::Legal,
        DossierType::Financial,
        DossierType::Insurance,
        DossierType::Identity,
        DossierType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DossierType::Medical => "medical",
            DossierType::Tax => "tax",
            DossierType::Legal => "legal",
            DossierType::Financial => "financial",
            DossierType::Insurance => "insurance",
            DossierType::Identity => "identity",
            DossierType::Other => "other",
        }
    }
}

impl FromStr for DossierType {
    type Err = CustosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DossierType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = DossierType::ALL.iter().map(|t| t.as_str()).collect();
                CustosError::Validation(format!(
                    "unknown dossier type {s:?}; expected one of {}",
                    allowed.join(", ")
                ))
            })
    }
}

impl fmt::Display for DossierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delegated grant on a dossier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEntry {
    pub user: String,
    pub relation: String,
}

/// The protected resource.
///
/// `owner` never appears in `relations` or `blocked_users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dossier {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: DossierType,
    pub owner: String,
    #[serde(default)]
    pub relations: Vec<RelationEntry>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub org_id: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub blocked_users: BTreeSet<String>,
}

impl Dossier {
    pub fn has_relation(&self, user: &str, rel: &str) -> bool {
        self.relations
            .iter()
            .any(|r| r.user == user && r.relation == rel)
    }

    /// Every tuple this dossier implies in the external store.
    pub fn tuples(&self) -> Vec<Tuple> {
        let mut tuples = Vec::with_capacity(3 + self.relations.len() + self.blocked_users.len());
        tuples.push(Tuple::owner(&self.owner, &self.id));
        for r in &self.relations {
            tuples.push(Tuple::dossier_relation(&r.user, &r.relation, &self.id));
        }
        if let Some(org) = &self.org_id {
            tuples.push(Tuple::org_parent(org, &self.id));
        }
        if self.public {
            tuples.push(Tuple::public(&self.id));
        }
        for u in &self.blocked_users {
            tuples.push(Tuple::blocked(u, &self.id));
        }
        tuples
    }
}

// ---------------------------------------------------------------------------
// Organization
// ---------------------------------------------------------------------------

/// `admins` is a non-empty subset of `members` for as long as the organization exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub admins: BTreeSet<String>,
}

impl Organization {
    /// New organization whose creator is both member and admin.
    pub fn new(id: impl Into<String>, name: impl Into<String>, creator: &str) -> Self {
        let creator = creator.to_string();
        Self {
            id: id.into(),
            name: name.into(),
            members: BTreeSet::from([creator.clone()]),
            admins: BTreeSet::from([creator]),
        }
    }

    pub fn tuples(&self) -> Vec<Tuple> {
        self.members
            .iter()
            .map(|m| Tuple::member(m, &self.id))
            .chain(self.admins.iter().map(|a| Tuple::admin(a, &self.id)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Guardianship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Denied,
}

/// A proposal that `from` becomes a guardian of `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianshipRequest {
    pub id: String,
    pub from: String,
    pub to: String,
    pub status: RequestStatus,
}

impl GuardianshipRequest {
    /// True if this request connects `a` and `b` in either direction.
    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.from == a && self.to == b) || (self.from == b && self.to == a)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_reject_tuple_syntax() {
        assert_eq!(user_id("user", "  bob ").unwrap(), "bob");
        for bad in ["", "  ", "*", "org:o1", "org:o1#member", "bob smith"] {
            assert!(
                matches!(user_id("user", bad), Err(CustosError::Validation(_))),
                "{bad:?} accepted"
            );
        }
    }

    fn sample_dossier() -> Dossier {
        Dossier {
            id: "d1".into(),
            title: "Tax Return 2024".into(),
            content: String::new(),
            kind: DossierType::Tax,
            owner: "alice".into(),
            relations: vec![RelationEntry {
                user: "bob".into(),
                relation: relation::MANDATE.into(),
            }],
            org_id: Some("o1".into()),
            public: true,
            blocked_users: BTreeSet::from(["mallory".to_string()]),
        }
    }

    #[test]
    fn dossier_serializes_with_wire_field_names() {
        let mut d = sample_dossier();
        d.org_id = None;
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["type"], "tax");
        assert_eq!(v["blockedUsers"][0], "mallory");
        assert!(v.get("orgId").is_none(), "absent orgId is omitted");
    }

    #[test]
    fn empty_org_id_loads_as_none() {
        let raw = r#"{"id":"d1","title":"t","type":"medical","owner":"alice","orgId":""}"#;
        let d: Dossier = serde_json::from_str(raw).unwrap();
        assert_eq!(d.org_id, None);
        assert!(d.relations.is_empty());
        assert!(!d.public);
    }

    #[test]
    fn dossier_tuples_cover_every_authorization_field() {
        let tuples = sample_dossier().tuples();
        assert_eq!(
            tuples,
            vec![
                Tuple::new("user:alice", "owner", "dossier:d1"),
                Tuple::new("user:bob", "mandate", "dossier:d1"),
                Tuple::new("organization:o1", "org_parent", "dossier:d1"),
                Tuple::new("user:*", "viewer", "dossier:d1"),
                Tuple::new("user:mallory", "blocked", "dossier:d1"),
            ]
        );
    }

    #[test]
    fn unknown_dossier_type_is_a_validation_error() {
        let err = "recipe".parse::<DossierType>().unwrap_err();
        assert!(matches!(err, CustosError::Validation(_)));
        assert_eq!("tax".parse::<DossierType>().unwrap(), DossierType::Tax);
    }

    #[test]
    fn new_organization_seeds_creator_as_admin_member() {
        let org = Organization::new("o1", "Clinic", "carol");
        assert!(org.admins.is_subset(&org.members));
        assert_eq!(
            org.tuples(),
            vec![
                Tuple::new("user:carol", "member", "organization:o1"),
                Tuple::new("user:carol", "admin", "organization:o1"),
            ]
        );
    }

    #[test]
    fn guardian_tuple_points_from_guardian_to_ward() {
        assert_eq!(
            Tuple::guardian("bob", "alice").to_string(),
            "user:bob guardian user:alice"
        );
    }

    #[test]
    fn split_ref_rejects_malformed_references() {
        assert_eq!(split_ref("dossier:d1"), Some(("dossier", "d1")));
        assert_eq!(split_ref("dossier:"), None);
        assert_eq!(split_ref("d1"), None);
    }
}
