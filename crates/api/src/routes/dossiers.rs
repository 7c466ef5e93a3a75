use super::UserBody;
use crate::error::ApiResult;
use crate::state::AppState;
use crate::subject::Subject;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use custos_core::types::relation;
use custos_core::{Dossier, RelationEntry};
use custos_engine::dossier::{
    AddRelation, CreateDossier, EmergencyAccess, EmergencyCheck, SetOrganization, UpdateDossier,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RelationQuery {
    pub relation: Option<String>,
}

pub async fn list(State(state): State<AppState>, Subject(caller): Subject) -> Json<Vec<Dossier>> {
    Json(state.services.dossiers.list(&caller).await)
}

pub async fn create(
    State(state): State<AppState>,
    Subject(caller): Subject,
    payload: Result<Json<CreateDossier>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Dossier>)> {
    let Json(req) = payload?;
    let dossier = state.services.dossiers.create(&caller, req).await?;
    Ok((StatusCode::CREATED, Json(dossier)))
}

pub async fn get_one(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<Dossier>> {
    Ok(Json(state.services.dossiers.get(&caller, &id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<UpdateDossier>, JsonRejection>,
) -> ApiResult<Json<Dossier>> {
    let Json(req) = payload?;
    Ok(Json(state.services.dossiers.update(&caller, &id, req).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.services.dossiers.delete(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn relations(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<RelationEntry>>> {
    Ok(Json(state.services.dossiers.get_relations(&caller, &id).await?))
}

pub async fn add_relation(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<AddRelation>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Dossier>)> {
    let Json(req) = payload?;
    let dossier = state.services.dossiers.add_relation(&caller, &id, req).await?;
    Ok((StatusCode::CREATED, Json(dossier)))
}

pub async fn remove_relation(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path((id, user)): Path<(String, String)>,
    query: Result<Query<RelationQuery>, QueryRejection>,
) -> ApiResult<Json<Dossier>> {
    let Query(query) = query?;
    let rel = query.relation.as_deref().unwrap_or(relation::MANDATE);
    Ok(Json(
        state
            .services
            .dossiers
            .remove_relation(&caller, &id, &user, rel)
            .await?,
    ))
}

pub async fn set_org(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<SetOrganization>, JsonRejection>,
) -> ApiResult<Json<Dossier>> {
    let Json(req) = payload?;
    Ok(Json(state.services.dossiers.set_org(&caller, &id, req).await?))
}

pub async fn toggle_public(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<Dossier>> {
    Ok(Json(state.services.dossiers.toggle_public(&caller, &id).await?))
}

pub async fn block(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<UserBody>, JsonRejection>,
) -> ApiResult<Json<Dossier>> {
    let Json(body) = payload?;
    Ok(Json(state.services.dossiers.block(&caller, &id, &body.user).await?))
}

pub async fn unblock(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path((id, user)): Path<(String, String)>,
) -> ApiResult<Json<Dossier>> {
    Ok(Json(state.services.dossiers.unblock(&caller, &id, &user).await?))
}

/// The body is optional; without one the caller is checked for `viewer`.
pub async fn emergency_check(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<EmergencyCheck>, JsonRejection>,
) -> ApiResult<Json<EmergencyAccess>> {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(JsonRejection::MissingJsonContentType(_)) => EmergencyCheck::default(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(
        state.services.dossiers.emergency_check(&caller, &id, req).await?,
    ))
}
