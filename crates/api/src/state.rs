use axum::http::HeaderName;
use custos_core::{CustosError, CustosResult};
use custos_engine::Services;
use custos_provider::TupleStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// HTTP-layer settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Header carrying the authenticated subject id.
    pub subject_header: String,
    /// Honor `x-admin-channel: true`. Only enable behind a proxy that strips
    /// the header from end-user traffic.
    pub trust_admin_header: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            subject_header: "x-forwarded-user".into(),
            trust_admin_header: false,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    tuples: Arc<dyn TupleStore>,
    ready: Arc<AtomicBool>,
    pub(crate) subject_header: HeaderName,
    pub(crate) trust_admin_header: bool,
}

impl AppState {
    pub fn new(services: Services, tuples: Arc<dyn TupleStore>, config: &ApiConfig) -> CustosResult<Self> {
        let subject_header = HeaderName::try_from(config.subject_header.as_str()).map_err(|e| {
            CustosError::Validation(format!("invalid subject header {:?}: {e}", config.subject_header))
        })?;
        if config.trust_admin_header {
            tracing::warn!("x-admin-channel is trusted; it must be stripped from end-user traffic upstream");
        }

        Ok(Self {
            services,
            tuples,
            ready: Arc::new(AtomicBool::new(false)),
            subject_header,
            trust_admin_header: config.trust_admin_header,
        })
    }

    /// Opens mutating routes. Called once rehydration has finished.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Rehydrated and the tuple store reports ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.tuples.is_ready()
    }
}
