//! HTTP surface for Custos.
//!
//! Mutating routes answer 503 until [`AppState::mark_ready`] is called.

pub mod error;
pub mod routes;
pub mod state;
pub mod subject;

pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::{ApiConfig, AppState};
pub use subject::{Subject, ADMIN_CHANNEL_HEADER};
