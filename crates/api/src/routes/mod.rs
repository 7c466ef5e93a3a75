use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use custos_core::CustosError;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

mod dossiers;
mod guardianships;
mod health;
mod organizations;

/// `{"user": "..."}` body shared by block and membership routes.
#[derive(Debug, Deserialize)]
pub(crate) struct UserBody {
    pub user: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/dossiers", get(dossiers::list).post(dossiers::create))
        .route(
            "/dossiers/:id",
            get(dossiers::get_one)
                .patch(dossiers::update)
                .delete(dossiers::remove),
        )
        .route(
            "/dossiers/:id/relations",
            get(dossiers::relations).post(dossiers::add_relation),
        )
        .route(
            "/dossiers/:id/relations/:user",
            delete(dossiers::remove_relation),
        )
        .route("/dossiers/:id/org", put(dossiers::set_org))
        .route("/dossiers/:id/public", post(dossiers::toggle_public))
        .route("/dossiers/:id/block", post(dossiers::block))
        .route("/dossiers/:id/block/:user", delete(dossiers::unblock))
        .route(
            "/dossiers/:id/emergency-check",
            post(dossiers::emergency_check),
        )
        .route(
            "/guardianships",
            get(guardianships::list).delete(guardianships::remove),
        )
        .route("/guardianships/requests", post(guardianships::request))
        .route(
            "/guardianships/requests/:id/accept",
            post(guardianships::accept),
        )
        .route("/guardianships/requests/:id/deny", post(guardianships::deny))
        .route(
            "/organizations",
            get(organizations::list).post(organizations::create),
        )
        .route(
            "/organizations/:id",
            get(organizations::get_one).delete(organizations::remove),
        )
        .route("/organizations/:id/members", post(organizations::add_member))
        .route(
            "/organizations/:id/members/:user",
            delete(organizations::remove_member),
        )
        .route("/organizations/:id/admins", post(organizations::add_admin))
        .route(
            "/organizations/:id/admins/:user",
            delete(organizations::remove_admin),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_ready,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects mutating requests until the tuple store is rehydrated.
async fn require_ready(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let read_only = *request.method() == Method::GET || *request.method() == Method::HEAD;
    if !read_only && !state.is_ready() {
        tracing::debug!(method = %request.method(), path = %request.uri().path(), "rejected before readiness");
        return ApiError::Domain(CustosError::Unavailable("tuple store is not ready".into()))
            .into_response();
    }
    next.run(request).await
}
