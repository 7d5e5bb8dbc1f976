//! Standalone CLI entry point: run the visual-extraction pipeline against a
//! single local image and print the resulting asset as JSON, bypassing the
//! HTTP surface entirely.

use std::process::ExitCode;
use tracing::{error, info};
use vision_ocr::TesseractOcr;
use vision_orchestrator::{Config, ExtractVisualsRequest};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <image-path-or-url>", args[0]);
        return ExitCode::FAILURE;
    }

    let config = Config::from_env();
    info!(addr = %config.server_addr, lang = %config.ocr_language, "starting one-shot extraction");

    let engine = match TesseractOcr::new(&config.ocr_language, config.ocr_min_confidence) {
        Ok(engine) => Some(engine),
        Err(e) => {
            error!(error = %e, "ocr engine unavailable, continuing without OCR");
            None
        }
    };

    let request = ExtractVisualsRequest {
        document_id: "cli".to_string(),
        page_index: 0,
        image_uri: args[1].clone(),
        extractor_version: "vision_v1".to_string(),
    };

    let response = vision_orchestrator::extract_visuals(
        &request,
        &config,
        engine.as_ref().map(|e| e as &dyn vision_ocr::OcrEngine),
    )
    .await;

    match serde_json::to_string_pretty(&response.assets) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to serialize response"),
    }

    ExitCode::SUCCESS
}
