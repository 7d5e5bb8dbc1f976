//! HTTP request handlers for the visual-extraction API.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;
use vision_ocr::OcrEngine;
use vision_orchestrator::{extract_visuals, ExtractVisualsRequest};

use crate::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Liveness probe. Always returns `{"status": "ok"}`.
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Run the visual-extraction pipeline for one page. Always returns HTTP 200:
/// every failure mode the pipeline can hit is represented in the response
/// body as a degraded asset with a `quality_flags.error` entry, never as a
/// non-200 status.
pub async fn extract_visuals_handler(
    State(state): State<ApiState>,
    Json(request): Json<ExtractVisualsRequest>,
) -> impl IntoResponse {
    let engine: Option<&dyn OcrEngine> = state.ocr_engine.as_deref();
    let response = extract_visuals(&request, &state.config, engine).await;
    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_reports_ok() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
