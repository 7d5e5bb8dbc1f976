//! Visual-extraction pipeline orchestrator.
//!
//! Drives a single page image through fetch, decode, a fallback full-page
//! layout region, OCR, and table/bar-chart detection and extraction, all
//! bounded by one wall-clock deadline. The pipeline never raises: every
//! failure mode becomes a `quality_flags` entry on a degraded asset instead
//! of an error returned to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use vision_common::{AssetType, BoundingBox, VisualAsset};
use vision_core::{decode_image, fetch_image_bytes, sha256_hex, Deadline};
use vision_ocr::{run_ocr, OcrEngine};

/// Runtime configuration, read from environment variables with hard-coded
/// defaults. A malformed value falls back to the default with a logged
/// warning rather than failing startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub table_time_budget: Duration,
    pub ocr_language: String,
    /// Per-block confidence floor applied by the OCR adapter, already
    /// rescaled to `[0, 1]` (`OCR_MIN_CONFIDENCE` is read as an integer
    /// percentage, matching the rest of this codebase's OCR confidence
    /// convention).
    pub ocr_min_confidence: f64,
    pub server_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_time_budget: Duration::from_secs_f64(4.0),
            ocr_language: "eng".to_string(),
            ocr_min_confidence: 0.5,
            server_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// (and logging a warning) for any variable that is present but fails
    /// to parse.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            table_time_budget: env_f64("TABLE_TIME_BUDGET_S")
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.table_time_budget),
            ocr_language: std::env::var("OCR_LANGUAGE").unwrap_or(defaults.ocr_language),
            ocr_min_confidence: env_u32("OCR_MIN_CONFIDENCE")
                .map(|pct| f64::from(pct) / 100.0)
                .unwrap_or(defaults.ocr_min_confidence),
            server_addr: std::env::var("VISION_SERVER_ADDR").unwrap_or(defaults.server_addr),
        }
    }
}

fn env_f64(name: &str) -> Option<f64> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "failed to parse env var as f64, using default");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_u32(name: &str) -> Option<u32> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "failed to parse env var as u32, using default");
                None
            }
        },
        Err(_) => None,
    }
}

/// A single page's worth of input to the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractVisualsRequest {
    pub document_id: String,
    pub page_index: u32,
    pub image_uri: String,
    #[serde(default = "default_extractor_version")]
    pub extractor_version: String,
}

fn default_extractor_version() -> String {
    "vision_v1".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractVisualsResponse {
    pub document_id: String,
    pub page_index: u32,
    pub extractor_version: String,
    pub assets: Vec<VisualAsset>,
}

/// Run the full visual-extraction pipeline for one page. Always returns a
/// response with exactly one asset; never raises, even if the pipeline body
/// panics. `engine` may be `None` to run with OCR unavailable (degrades to
/// diagnostic flags).
pub async fn extract_visuals(
    request: &ExtractVisualsRequest,
    config: &Config,
    engine: Option<&dyn OcrEngine>,
) -> ExtractVisualsResponse {
    let started = std::time::Instant::now();
    let deadline = Deadline::after(config.table_time_budget);
    let asset = run_pipeline(request, &deadline, engine).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let table = asset.extraction.structured_json.get("table");
    info!(
        tag = "extract_visuals",
        document_id = %request.document_id,
        page_index = request.page_index,
        elapsed_ms,
        asset_count = 1,
        asset_type = ?asset.asset_type,
        confidence = asset.confidence,
        table_detected = asset.quality_flags.get("table_detected").and_then(Value::as_bool).unwrap_or(false),
        table_method = table.and_then(|t| t.get("method")).and_then(Value::as_str).unwrap_or(""),
        table_rows = table.and_then(|t| t.get("rows")).and_then(Value::as_array).map_or(0, Vec::len),
        table_cols = table
            .and_then(|t| t.get("rows"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        "visual extraction complete"
    );

    ExtractVisualsResponse {
        document_id: request.document_id.clone(),
        page_index: request.page_index,
        extractor_version: request.extractor_version.clone(),
        assets: vec![asset],
    }
}

fn error_asset(error_code: &str) -> VisualAsset {
    let mut asset = VisualAsset::new_image_text(BoundingBox::full());
    asset.asset_type = AssetType::Unknown;
    asset.set_flag("error", error_code);
    asset
}

async fn run_pipeline(
    request: &ExtractVisualsRequest,
    deadline: &Deadline,
    engine: Option<&dyn OcrEngine>,
) -> VisualAsset {
    let bytes = match fetch_image_bytes(&request.image_uri).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(uri = %request.image_uri, error = %e, "failed to fetch image");
            return error_asset("image_load_failed");
        }
    };

    let image = match decode_image(&bytes) {
        Ok(image) => image,
        Err(e) => {
            warn!(error = %e, "failed to decode image");
            let mut asset = error_asset("image_decode_failed");
            asset.image_hash = Some(sha256_hex(&bytes));
            return asset;
        }
    };

    let image_hash = sha256_hex(&bytes);

    // The detection/extraction stage below is synchronous CPU work with
    // array indexing and float math in several crates; a panic there (e.g.
    // a malformed degenerate image tripping an arithmetic edge case no test
    // caught) must not take the whole request down. `catch_unwind` is the
    // last-resort guard for that row of the error taxonomy; every ordinary
    // failure mode is already handled without panicking before this point.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        analyze_decoded_image(&image, *deadline, engine)
    })) {
        Ok(mut asset) => {
            asset.image_hash = Some(image_hash);
            asset
        }
        Err(_) => {
            warn!("panic during page analysis, returning degraded asset");
            let mut asset = error_asset("uncaught_exception");
            asset.image_hash = Some(image_hash);
            asset
        }
    }
}

fn analyze_decoded_image(
    image: &image::RgbImage,
    deadline: Deadline,
    engine: Option<&dyn OcrEngine>,
) -> VisualAsset {
    let mut asset = VisualAsset::new_image_text(BoundingBox::full());
    asset.confidence = 0.5;
    asset.set_flag("layout", "fallback_full_page");

    let (extraction, ocr_flags) = run_ocr(engine, image);
    let ocr_confidence = extraction.confidence;
    let ocr_text_present = extraction.ocr_text.is_some();
    let ocr_blocks = extraction.ocr_blocks.clone();
    asset.extraction = extraction;
    for (k, v) in ocr_flags {
        asset.set_flag(&k, v);
    }

    if deadline.is_expired() {
        asset.set_flag("time_budget_exceeded", true);
        apply_confidence_rule(&mut asset, ocr_text_present, ocr_confidence);
        return asset;
    }

    let (table_detect, table_flags) = vision_table_extract::detect_table(image, deadline);
    for (k, v) in table_flags {
        asset.set_flag(&k, v);
    }

    let (chart_detect, chart_flags) = vision_chart_extract::detect_bar_chart(image, deadline);

    if table_detect.detected {
        let (patch, patch_flags) =
            vision_table_extract::extract_table(image, &table_detect, &ocr_blocks, deadline, engine);
        asset.asset_type = AssetType::Table;
        merge_structured(&mut asset, "table", patch);
        for (k, v) in patch_flags {
            asset.set_flag(&k, v);
        }
        if chart_detect.detected {
            asset.set_flag("chart_also_possible", true);
        }
    } else if chart_detect.detected {
        for (k, v) in chart_flags {
            asset.set_flag(&k, v);
        }
        let (patch, patch_flags) =
            vision_chart_extract::extract_bar_chart(image, &chart_detect, &ocr_blocks, deadline, engine);
        asset.asset_type = AssetType::Chart;
        merge_structured(&mut asset, "chart", patch);
        for (k, v) in patch_flags {
            asset.set_flag(&k, v);
        }
    }

    apply_confidence_rule(&mut asset, ocr_text_present, ocr_confidence);
    asset
}

fn merge_structured(asset: &mut VisualAsset, key: &str, patch: Value) {
    if let Some(patch_confidence) = patch.get("confidence").and_then(Value::as_f64) {
        asset.confidence = asset.confidence.max(patch_confidence);
        asset.extraction.confidence = asset.extraction.confidence.max(patch_confidence);
    }
    asset.extraction.structured_json.insert(key.to_string(), patch);
}

/// Post-processing confidence rule: present OCR text can only raise
/// confidence, absent OCR text caps it low. Runs after the extractor's own
/// confidence (table or chart) has already been folded in by
/// `merge_structured`, matching the "either extractor's confidence, if
/// higher, takes precedence" ordering.
fn apply_confidence_rule(asset: &mut VisualAsset, ocr_text_present: bool, ocr_confidence: f64) {
    asset.confidence = if ocr_text_present {
        asset.confidence.max(ocr_confidence)
    } else {
        asset.confidence.min(0.25)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_line_segment_mut;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vision_ocr::{OcrEngineError, RawWord};

    struct NoOcr;
    impl OcrEngine for NoOcr {
        fn recognize(&self, _image: &RgbImage) -> Result<Vec<RawWord>, OcrEngineError> {
            Ok(Vec::new())
        }
    }

    fn synthetic_grid(rows: usize, cols: usize) -> RgbImage {
        let (cell_w, cell_h) = (120i32, 60i32);
        let (w, h) = (cols as u32 * cell_w as u32 + 1, rows as u32 * cell_h as u32 + 1);
        let mut img = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
        for r in 0..=rows {
            let y = (r as i32 * cell_h) as f32;
            draw_line_segment_mut(&mut img, (0.0, y), (w as f32 - 1.0, y), Rgb([0, 0, 0]));
        }
        for c in 0..=cols {
            let x = (c as i32 * cell_w) as f32;
            draw_line_segment_mut(&mut img, (x, 0.0), (x, h as f32 - 1.0), Rgb([0, 0, 0]));
        }
        img
    }

    fn write_png(img: &RgbImage, path: &std::path::Path) {
        image::DynamicImage::ImageRgb8(img.clone())
            .save_with_format(path, image::ImageFormat::Png)
            .unwrap();
    }

    #[tokio::test]
    async fn blank_page_yields_low_confidence_image_text() {
        let tmp = std::env::temp_dir().join(format!("vision-test-blank-{:?}.png", std::thread::current().id()));
        write_png(&RgbImage::from_pixel(640, 480, Rgb([255, 255, 255])), &tmp);

        let request = ExtractVisualsRequest {
            document_id: "doc-1".to_string(),
            page_index: 0,
            image_uri: tmp.to_string_lossy().to_string(),
            extractor_version: "vision_v1".to_string(),
        };
        let config = Config::default();
        let engine = NoOcr;
        let response = extract_visuals(&request, &config, Some(&engine)).await;

        assert_eq!(response.assets.len(), 1);
        let asset = &response.assets[0];
        assert!(matches!(asset.asset_type, AssetType::ImageText));
        assert!(asset.confidence <= 0.25);

        let _ = std::fs::remove_file(&tmp);
    }

    #[tokio::test]
    async fn fetch_failure_yields_unknown_asset_with_error_flag() {
        let request = ExtractVisualsRequest {
            document_id: "doc-2".to_string(),
            page_index: 0,
            image_uri: "/does/not/exist.png".to_string(),
            extractor_version: "vision_v1".to_string(),
        };
        let config = Config::default();
        let response = extract_visuals(&request, &config, None).await;

        let asset = &response.assets[0];
        assert!(matches!(asset.asset_type, AssetType::Unknown));
        assert_eq!(
            asset.quality_flags.get("error").and_then(Value::as_str),
            Some("image_load_failed")
        );
    }

    #[tokio::test]
    async fn grid_image_is_promoted_to_table() {
        let tmp = std::env::temp_dir().join(format!("vision-test-grid-{:?}.png", std::thread::current().id()));
        write_png(&synthetic_grid(4, 3), &tmp);

        let request = ExtractVisualsRequest {
            document_id: "doc-3".to_string(),
            page_index: 0,
            image_uri: tmp.to_string_lossy().to_string(),
            extractor_version: "vision_v1".to_string(),
        };
        let config = Config::default();
        let engine = NoOcr;
        let response = extract_visuals(&request, &config, Some(&engine)).await;

        let asset = &response.assets[0];
        assert!(matches!(asset.asset_type, AssetType::Table));
        assert!(asset.extraction.structured_json.contains_key("table"));

        let _ = std::fs::remove_file(&tmp);
    }

    #[tokio::test]
    async fn tight_deadline_sets_time_budget_exceeded_without_panicking() {
        let called = AtomicBool::new(false);
        let _ = &called;

        let tmp = std::env::temp_dir().join(format!("vision-test-deadline-{:?}.png", std::thread::current().id()));
        write_png(&synthetic_grid(4, 3), &tmp);

        let request = ExtractVisualsRequest {
            document_id: "doc-4".to_string(),
            page_index: 0,
            image_uri: tmp.to_string_lossy().to_string(),
            extractor_version: "vision_v1".to_string(),
        };
        let config = Config {
            table_time_budget: Duration::from_millis(0),
            ..Config::default()
        };
        let engine = NoOcr;
        let response = extract_visuals(&request, &config, Some(&engine)).await;

        let asset = &response.assets[0];
        assert_eq!(
            asset.quality_flags.get("time_budget_exceeded"),
            Some(&Value::from(true))
        );

        let _ = std::fs::remove_file(&tmp);
    }

    #[test]
    fn config_falls_back_to_default_on_unparseable_env() {
        std::env::set_var("TABLE_TIME_BUDGET_S", "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.table_time_budget, Duration::from_secs_f64(4.0));
        std::env::remove_var("TABLE_TIME_BUDGET_S");
    }
}
