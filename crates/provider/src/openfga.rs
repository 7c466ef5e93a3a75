//! OpenFGA HTTP client.
//!
//! Speaks the OpenFGA JSON API: tuple writes/deletes, point checks (with
//! optional contextual tuples), list-objects, plus the store/model discovery
//! calls used at startup.

use crate::{TupleDelta, TupleStore};
use async_trait::async_trait;
use custos_core::error::{CustosError, CustosResult};
use custos_core::Tuple;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Authorization model shipped with the binary, written when a store has none.
pub const BUNDLED_MODEL: &str = include_str!("../../../model/custos.json");

const STORE_PAGE_SIZE: u32 = 100;

/// Identifiers every data-plane call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIds {
    pub store_id: String,
    pub model_id: String,
}

/// Which store and model to bind to. Absent ids are discovered.
#[derive(Debug, Clone, Default)]
pub struct StoreSelector {
    pub name: String,
    pub store_id: Option<String>,
    pub model_id: Option<String>,
}

/// Talks to an OpenFGA server over HTTP.
///
/// ```ignore
/// let client = OpenFgaClient::new("http://localhost:8081")?;
/// client.resolve_with_retry(&selector, 30, Duration::from_secs(2)).await?;
/// let allowed = client.check("user:alice", "viewer", "dossier:d1").await;
/// ```
pub struct OpenFgaClient {
    base: Url,
    client: reqwest::Client,
    ids: OnceLock<StoreIds>,
}

impl OpenFgaClient {
    pub fn new(api_url: &str) -> CustosResult<Self> {
        if api_url.is_empty() {
            return Err(CustosError::Validation("OpenFGA URL must not be empty".into()));
        }

        // `Url::join` drops the last path segment unless it ends with '/'.
        let normalized = if api_url.ends_with('/') {
            api_url.to_string()
        } else {
            format!("{api_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| CustosError::Validation(format!("invalid OpenFGA URL {api_url}: {e}")))?;

        Ok(Self {
            base,
            client: reqwest::Client::new(),
            ids: OnceLock::new(),
        })
    }

    /// Pins known identifiers, skipping discovery.
    pub fn with_ids(self, ids: StoreIds) -> Self {
        let _ = self.ids.set(ids);
        self
    }

    pub fn ids(&self) -> Option<&StoreIds> {
        self.ids.get()
    }

    /// Resolves the store and model ids, creating the store and writing the
    /// bundled model when they do not exist yet.
    pub async fn resolve(&self, selector: &StoreSelector) -> CustosResult<StoreIds> {
        if let Some(ids) = self.ids.get() {
            return Ok(ids.clone());
        }

        let store_id = match &selector.store_id {
            Some(id) => id.clone(),
            None => match self.find_store(&selector.name).await? {
                Some(id) => id,
                None => self.create_store(&selector.name).await?,
            },
        };

        let model_id = match &selector.model_id {
            Some(id) => id.clone(),
            None => match self.latest_model(&store_id).await? {
                Some(id) => id,
                None => self.write_bundled_model(&store_id).await?,
            },
        };

        let ids = StoreIds { store_id, model_id };
        tracing::info!(store_id = %ids.store_id, model_id = %ids.model_id, "tuple store resolved");
        Ok(self.ids.get_or_init(|| ids).clone())
    }

    /// `resolve` with a fixed delay between attempts.
    pub async fn resolve_with_retry(
        &self,
        selector: &StoreSelector,
        max_attempts: u32,
        interval: Duration,
    ) -> CustosResult<StoreIds> {
        let mut last_error = None;
        for attempt in 1..=max_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(interval).await;
            }
            match self.resolve(selector).await {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "tuple store not reachable yet");
                    last_error = Some(e);
                }
            }
        }
        Err(CustosError::Unavailable(format!(
            "tuple store unreachable after {max_attempts} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn find_store(&self, name: &str) -> CustosResult<Option<String>> {
        let mut token = String::new();
        loop {
            let mut path = format!("stores?page_size={STORE_PAGE_SIZE}");
            if !token.is_empty() {
                path.push_str("&continuation_token=");
                path.push_str(&token);
            }
            let page: ListStoresResponse = self.get(&path).await?;
            if let Some(store) = page.stores.into_iter().find(|s| s.name == name) {
                return Ok(Some(store.id));
            }
            if page.continuation_token.is_empty() {
                return Ok(None);
            }
            token = page.continuation_token;
        }
    }

    async fn create_store(&self, name: &str) -> CustosResult<String> {
        let created: CreateStoreResponse = self.post("stores", &CreateStoreBody { name }).await?;
        tracing::info!(store_id = %created.id, name, "created tuple store");
        Ok(created.id)
    }

    async fn latest_model(&self, store_id: &str) -> CustosResult<Option<String>> {
        let page: ListModelsResponse = self
            .get(&format!("stores/{store_id}/authorization-models?page_size=1"))
            .await?;
        Ok(page.authorization_models.into_iter().next().map(|m| m.id))
    }

    async fn write_bundled_model(&self, store_id: &str) -> CustosResult<String> {
        let model: serde_json::Value = serde_json::from_str(BUNDLED_MODEL)
            .map_err(|e| CustosError::Internal(format!("bundled model is not JSON: {e}")))?;
        let written: WriteModelResponse = self
            .post(&format!("stores/{store_id}/authorization-models"), &model)
            .await?;
        tracing::info!(model_id = %written.authorization_model_id, "wrote bundled authorization model");
        Ok(written.authorization_model_id)
    }

    fn require_ids(&self) -> CustosResult<&StoreIds> {
        self.ids
            .get()
            .ok_or_else(|| CustosError::Unavailable("tuple store not bootstrapped".into()))
    }

    fn url(&self, path: &str) -> CustosResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CustosError::Internal(format!("bad OpenFGA path {path}: {e}")))
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> CustosResult<R> {
        let resp = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .map_err(|e| CustosError::TupleStore(format!("GET {path}: {e}")))?;
        decode(path, resp).await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> CustosResult<R> {
        let resp = self
            .client
            .post(self.url(path)?)
            .json(body)
            .send()
            .await
            .map_err(|e| CustosError::TupleStore(format!("POST {path}: {e}")))?;
        decode(path, resp).await
    }

    async fn try_check(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> CustosResult<bool> {
        let ids = self.require_ids()?;
        let body = CheckBody {
            tuple_key: TupleKeyRef {
                user,
                relation,
                object,
            },
            contextual_tuples: (!contextual.is_empty()).then_some(TupleKeys {
                tuple_keys: contextual,
            }),
            authorization_model_id: &ids.model_id,
        };
        let resp: CheckResponse = self
            .post(&format!("stores/{}/check", ids.store_id), &body)
            .await?;
        Ok(resp.allowed)
    }

    async fn try_list_objects(
        &self,
        user: &str,
        relation: &str,
        object_type: &str,
    ) -> CustosResult<Vec<String>> {
        let ids = self.require_ids()?;
        let body = ListObjectsBody {
            authorization_model_id: &ids.model_id,
            object_type,
            relation,
            user,
        };
        let resp: ListObjectsResponse = self
            .post(&format!("stores/{}/list-objects", ids.store_id), &body)
            .await?;
        Ok(resp.objects)
    }
}

#[async_trait]
impl TupleStore for OpenFgaClient {
    async fn write(&self, delta: &TupleDelta) -> CustosResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let ids = self.require_ids()?;

        let body = WriteBody {
            writes: (!delta.writes.is_empty()).then_some(WriteKeys {
                tuple_keys: &delta.writes,
                on_duplicate: delta.lenient.then_some("ignore"),
            }),
            deletes: (!delta.deletes.is_empty()).then_some(DeleteKeys {
                tuple_keys: &delta.deletes,
                on_missing: delta.lenient.then_some("ignore"),
            }),
            authorization_model_id: &ids.model_id,
        };

        tracing::debug!(
            writes = delta.writes.len(),
            deletes = delta.deletes.len(),
            lenient = delta.lenient,
            "tuple write"
        );
        let _: serde_json::Value = self
            .post(&format!("stores/{}/write", ids.store_id), &body)
            .await?;
        Ok(())
    }

    async fn check(&self, user: &str, relation: &str, object: &str) -> bool {
        match self.try_check(user, relation, object, &[]).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(user, relation, object, error = %e, "check failed, denying");
                false
            }
        }
    }

    async fn list_objects(&self, user: &str, relation: &str, object_type: &str) -> Vec<String> {
        match self.try_list_objects(user, relation, object_type).await {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!(user, relation, object_type, error = %e, "list-objects failed, returning none");
                Vec::new()
            }
        }
    }

    async fn check_with_context(
        &self,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> bool {
        match self.try_check(user, relation, object, contextual).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(user, relation, object, error = %e, "contextual check failed, denying");
                false
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ids.get().is_some()
    }
}

async fn decode<R: DeserializeOwned>(path: &str, resp: reqwest::Response) -> CustosResult<R> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(CustosError::TupleStore(format!("HTTP {status} from {path}: {text}")));
    }
    resp.json::<R>()
        .await
        .map_err(|e| CustosError::TupleStore(format!("decode {path}: {e}")))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TupleKeyRef<'a> {
    user: &'a str,
    relation: &'a str,
    object: &'a str,
}

#[derive(Serialize)]
struct TupleKeys<'a> {
    tuple_keys: &'a [Tuple],
}

#[derive(Serialize)]
struct WriteKeys<'a> {
    tuple_keys: &'a [Tuple],
    #[serde(skip_serializing_if = "Option::is_none")]
    on_duplicate: Option<&'static str>,
}

#[derive(Serialize)]
struct DeleteKeys<'a> {
    tuple_keys: &'a [Tuple],
    #[serde(skip_serializing_if = "Option::is_none")]
    on_missing: Option<&'static str>,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    writes: Option<WriteKeys<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deletes: Option<DeleteKeys<'a>>,
    authorization_model_id: &'a str,
}

#[derive(Serialize)]
struct CheckBody<'a> {
    tuple_key: TupleKeyRef<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contextual_tuples: Option<TupleKeys<'a>>,
    authorization_model_id: &'a str,
}

#[derive(Serialize)]
struct ListObjectsBody<'a> {
    authorization_model_id: &'a str,
    #[serde(rename = "type")]
    object_type: &'a str,
    relation: &'a str,
    user: &'a str,
}

#[derive(Serialize)]
struct CreateStoreBody<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct CheckResponse {
    allowed: bool,
}

#[derive(Deserialize)]
struct ListObjectsResponse {
    #[serde(default)]
    objects: Vec<String>,
}

#[derive(Deserialize)]
struct StoreSummary {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ListStoresResponse {
    #[serde(default)]
    stores: Vec<StoreSummary>,
    #[serde(default)]
    continuation_token: String,
}

#[derive(Deserialize)]
struct CreateStoreResponse {
    id: String,
}

#[derive(Deserialize)]
struct ModelSummary {
    id: String,
}

#[derive(Deserialize)]
struct ListModelsResponse {
    #[serde(default)]
    authorization_models: Vec<ModelSummary>,
}

#[derive(Deserialize)]
struct WriteModelResponse {
    authorization_model_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(
            OpenFgaClient::new(""),
            Err(CustosError::Validation(_))
        ));
    }

    #[test]
    fn base_url_keeps_path_prefix() {
        let client = OpenFgaClient::new("http://fga.internal/api").unwrap();
        assert_eq!(
            client.url("stores/s1/check").unwrap().as_str(),
            "http://fga.internal/api/stores/s1/check"
        );
    }

    #[test]
    fn bundled_model_declares_all_types() {
        let model: serde_json::Value = serde_json::from_str(BUNDLED_MODEL).unwrap();
        let types: Vec<&str> = model["type_definitions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, ["user", "organization", "dossier"]);
    }

    #[test]
    fn lenient_write_body_sets_ignore_options() {
        let writes = vec![Tuple::owner("alice", "d1")];
        let deletes = vec![Tuple::public("d1")];
        let body = WriteBody {
            writes: Some(WriteKeys {
                tuple_keys: &writes,
                on_duplicate: Some("ignore"),
            }),
            deletes: Some(DeleteKeys {
                tuple_keys: &deletes,
                on_missing: Some("ignore"),
            }),
            authorization_model_id: "m1",
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["writes"]["tuple_keys"][0]["user"], "user:alice");
        assert_eq!(v["writes"]["on_duplicate"], "ignore");
        assert_eq!(v["deletes"]["on_missing"], "ignore");
    }

    #[tokio::test]
    async fn unresolved_client_fails_closed() {
        let client = OpenFgaClient::new("http://127.0.0.1:9").unwrap();
        assert!(!client.is_ready());
        assert!(!client.check("user:alice", "viewer", "dossier:d1").await);
        assert!(client.list_objects("user:alice", "viewer", "dossier").await.is_empty());
        let err = client
            .write(&TupleDelta::write([Tuple::owner("alice", "d1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, CustosError::Unavailable(_)));
    }
}
