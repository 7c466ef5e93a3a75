use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "ready": state.is_ready(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
