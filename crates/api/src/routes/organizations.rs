use super::UserBody;
use crate::error::ApiResult;
use crate::state::AppState;
use crate::subject::Subject;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use custos_core::Organization;
use custos_engine::organization::CreateOrganization;

pub async fn list(State(state): State<AppState>, Subject(caller): Subject) -> Json<Vec<Organization>> {
    Json(state.services.organizations.list(&caller))
}

pub async fn create(
    State(state): State<AppState>,
    Subject(caller): Subject,
    payload: Result<Json<CreateOrganization>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Organization>)> {
    let Json(req) = payload?;
    let org = state.services.organizations.create(&caller, req).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

pub async fn get_one(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<Json<Organization>> {
    Ok(Json(state.services.organizations.get(&caller, &id).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.services.organizations.delete(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_member(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<UserBody>, JsonRejection>,
) -> ApiResult<Json<Organization>> {
    let Json(body) = payload?;
    Ok(Json(
        state.services.organizations.add_member(&caller, &id, &body.user).await?,
    ))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path((id, user)): Path<(String, String)>,
) -> ApiResult<Json<Organization>> {
    Ok(Json(
        state.services.organizations.remove_member(&caller, &id, &user).await?,
    ))
}

pub async fn add_admin(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path(id): Path<String>,
    payload: Result<Json<UserBody>, JsonRejection>,
) -> ApiResult<Json<Organization>> {
    let Json(body) = payload?;
    Ok(Json(
        state.services.organizations.add_admin(&caller, &id, &body.user).await?,
    ))
}

pub async fn remove_admin(
    State(state): State<AppState>,
    Subject(caller): Subject,
    Path((id, user)): Path<(String, String)>,
) -> ApiResult<Json<Organization>> {
    Ok(Json(
        state.services.organizations.remove_admin(&caller, &id, &user).await?,
    ))
}
