//! REST API surface for the visual-extraction worker.
//!
//! Exposes exactly two endpoints: `GET /health` for liveness, and
//! `POST /extract-visuals` which runs the full pipeline for one page and
//! always answers with HTTP 200, even on failure.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vision_ocr::{OcrEngine, TesseractOcr};
use vision_orchestrator::Config;

pub use handlers::HealthResponse;

/// API server state shared across handlers: pipeline configuration and an
/// optional OCR engine. The engine is `None` when Tesseract could not be
/// initialized for the configured language; handlers degrade gracefully
/// rather than failing to start.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub ocr_engine: Option<Arc<dyn OcrEngine>>,
}

impl ApiState {
    /// Build state from configuration, attempting to initialize the
    /// Tesseract engine. A failed initialization is logged and the server
    /// still starts, with OCR degraded for every request.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let ocr_engine = match TesseractOcr::new(&config.ocr_language, config.ocr_min_confidence) {
            Ok(engine) => Some(Arc::new(engine) as Arc<dyn OcrEngine>),
            Err(e) => {
                tracing::warn!(error = %e, "ocr engine unavailable at startup");
                None
            }
        };

        Self {
            config: Arc::new(config),
            ocr_engine,
        }
    }
}

/// Build the API router with both endpoints and standard middleware.
#[must_use]
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/extract-visuals", post(handlers::extract_visuals_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve on `addr` until the process is killed.
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!(addr, "starting visual-extraction api server");

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_degrades_when_ocr_language_is_bogus() {
        let config = Config {
            ocr_language: "not-a-real-language-code".to_string(),
            ..Config::default()
        };
        let state = ApiState::new(config);
        assert!(state.ocr_engine.is_none());
    }
}
