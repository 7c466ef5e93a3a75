use crate::error::ApiResult;
use crate::state::AppState;
use crate::subject::Subject;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use custos_core::GuardianshipRequest;
use custos_engine::guardianship::{GuardianshipOverview, RemoveGuardianship, RequestGuardianship};
use serde_json::{json, Value};

pub async fn list(State(state): State<AppState>, Subject(caller): Subject) -> Json<GuardianshipOverview> {
    Json(state.services.guardianships.list(&caller))
}

pub async fn request(
    State(state): State<AppState>,
    Subject(caller): Subject,
    payload: Result<Json<RequestGuardianship>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<GuardianshipRequest>)> {
    let Json(req) = payload?;
    let request = state.services.guardianships.request(&caller, req)?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn accept(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<GuardianshipRequest>> {
    Ok(Json(state.services.guardianships.accept(&caller, &id).await?))
}

pub async fn deny(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<GuardianshipRequest>> {
    Ok(Json(state.services.guardianships.deny(&caller, &id)?))
}

pub async fn remove(
    State(state): State<AppState>,
    Subject(caller): Subject,
    payload: Result<Json<RemoveGuardianship>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = payload?;
    let removed = state.services.guardianships.remove(&caller, req).await?;
    Ok(Json(json!({ "removed": removed })))
}
