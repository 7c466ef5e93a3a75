//! In-process domain store with JSON snapshot persistence.
//!
//! All state sits behind one `RwLock`. Access goes through the synchronous
//! [`DomainStore::read`] and [`DomainStore::update`] closures, so a guard can
//! never be held across an `.await` on the tuple store.

use crate::error::{CustosError, CustosResult};
use crate::types::{Dossier, GuardianshipRequest, Organization, RequestStatus, Tuple};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

/// The persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    #[serde(default)]
    pub dossiers: BTreeMap<String, Dossier>,
    #[serde(default)]
    pub guardianship_requests: Vec<GuardianshipRequest>,
    /// Guarded subject -> guardians.
    #[serde(default)]
    pub guardianships: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub organizations: BTreeMap<String, Organization>,
    /// Tuples whose removal failed after their record was deleted. Swept by
    /// the next rehydration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orphaned_tuples: Vec<Tuple>,
}

impl StoreState {
    pub fn guardians_of(&self, ward: &str) -> &[String] {
        self.guardianships
            .get(ward)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_guardian(&self, guardian: &str, ward: &str) -> bool {
        self.guardians_of(ward).iter().any(|g| g == guardian)
    }

    /// True if either subject guards the other.
    pub fn guardianship_between(&self, a: &str, b: &str) -> bool {
        self.is_guardian(a, b) || self.is_guardian(b, a)
    }

    /// Subjects guarded by `guardian`.
    pub fn wards_of(&self, guardian: &str) -> Vec<String> {
        self.guardianships
            .iter()
            .filter(|(_, gs)| gs.iter().any(|g| g == guardian))
            .map(|(ward, _)| ward.clone())
            .collect()
    }

    pub fn add_guardian(&mut self, guardian: &str, ward: &str) {
        let guardians = self.guardianships.entry(ward.to_string()).or_default();
        if !guardians.iter().any(|g| g == guardian) {
            guardians.push(guardian.to_string());
        }
    }

    /// Returns whether an edge was removed.
    pub fn remove_guardian(&mut self, guardian: &str, ward: &str) -> bool {
        let Some(guardians) = self.guardianships.get_mut(ward) else {
            return false;
        };
        let before = guardians.len();
        guardians.retain(|g| g != guardian);
        let removed = guardians.len() != before;
        if guardians.is_empty() {
            self.guardianships.remove(ward);
        }
        removed
    }

    pub fn pending_between(&self, a: &str, b: &str) -> Option<&GuardianshipRequest> {
        self.guardianship_requests
            .iter()
            .find(|r| r.status == RequestStatus::Pending && r.involves_pair(a, b))
    }

    pub fn request_mut(&mut self, id: &str) -> Option<&mut GuardianshipRequest> {
        self.guardianship_requests.iter_mut().find(|r| r.id == id)
    }

    pub fn record_orphans(&mut self, tuples: impl IntoIterator<Item = Tuple>) {
        for t in tuples {
            if !self.orphaned_tuples.contains(&t) {
                self.orphaned_tuples.push(t);
            }
        }
    }

    /// Dossier ids that reference `org_id`.
    pub fn dossiers_in_org(&self, org_id: &str) -> Vec<String> {
        self.dossiers
            .values()
            .filter(|d| d.org_id.as_deref() == Some(org_id))
            .map(|d| d.id.clone())
            .collect()
    }
}

/// Owner of the [`StoreState`] and its snapshot file.
#[derive(Debug, Default)]
pub struct DomainStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    /// Serializes writers of the temp file.
    save_lock: Mutex<()>,
}

impl DomainStore {
    /// Store with no backing file. `save` becomes a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    /// Loads the snapshot at `path`, best-effort.
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// logged and also yields an empty store; the file is left untouched until
    /// the next successful save.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StoreState>(&bytes) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        dossiers = state.dossiers.len(),
                        organizations = state.organizations.len(),
                        requests = state.guardianship_requests.len(),
                        "loaded domain snapshot"
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt domain snapshot, starting empty");
                    StoreState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no domain snapshot yet");
                StoreState::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable domain snapshot, starting empty");
                StoreState::default()
            }
        };

        Self {
            state: RwLock::new(state),
            path: Some(path),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` under the shared lock.
    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Runs `f` under the exclusive lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> StoreState {
        self.read(StoreState::clone)
    }

    /// Writes the full snapshot to disk.
    ///
    /// Serializes under the shared lock, then writes a sibling temp file and
    /// renames it over the target.
    pub fn save(&self) -> CustosResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _serialized = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let bytes = self
            .read(|state| serde_json::to_vec_pretty(state))
            .map_err(|e| CustosError::Persistence(format!("serialize snapshot: {e}")))?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                CustosError::Persistence(format!("create {}: {e}", dir.display()))
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)
            .map_err(|e| CustosError::Persistence(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| CustosError::Persistence(format!("rename {}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved domain snapshot");
        Ok(())
    }

    /// `save`, logging instead of failing. Used after committed mutations.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::error!(error = %e, "failed to persist domain snapshot");
        }
    }
}
