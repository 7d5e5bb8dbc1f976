//! Shared data model and error types for the visual-extraction pipeline.
//!
//! Every stage in the pipeline (OCR, table detection/extraction, bar-chart
//! detection/extraction) exchanges the types defined here. None of them hold
//! behavior beyond clamping and normalization invariants; the algorithms live
//! in their respective crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors surfaced by the boundary stages (image fetch/decode, HTTP layer).
///
/// Everything below the orchestrator is fail-soft and communicates failure
/// through quality flags rather than this type; `VisionError` only exists for
/// the handful of operations that have no sensible non-exceptional return.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("failed to fetch image: {0}")]
    Fetch(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for boundary operations.
pub type Result<T> = std::result::Result<T, VisionError>;

/// Clamp a value into `[0.0, 1.0]`.
#[must_use]
pub fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else if v < 0.0 {
        0.0
    } else if v > 1.0 {
        1.0
    } else {
        v
    }
}

/// A bounding box normalized to `[0, 1]` relative to image dimensions, origin
/// top-left. Construction always clamps `w`/`h` so that `x + w <= 1` and
/// `y + h <= 1` hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BoundingBox {
    /// Build a normalized box from pixel coordinates, clamping to the image
    /// bounds. Returns the full-image box if the image has zero area.
    #[must_use]
    pub fn from_pixels(x: i64, y: i64, w: i64, h: i64, img_w: u32, img_h: u32) -> Self {
        if img_w == 0 || img_h == 0 {
            return Self::full();
        }
        let img_w = f64::from(img_w);
        let img_h = f64::from(img_h);
        let nx = clamp01(x as f64 / img_w);
        let ny = clamp01(y as f64 / img_h);
        let nw = clamp01(w as f64 / img_w).min(1.0 - nx);
        let nh = clamp01(h as f64 / img_h).min(1.0 - ny);
        Self {
            x: nx,
            y: ny,
            w: nw.max(0.0),
            h: nh.max(0.0),
        }
    }

    /// The box covering the whole image.
    #[must_use]
    pub fn full() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
        }
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::full()
    }
}

/// A single OCR text block with a normalized bounding box. Order within a
/// `Vec<OcrBlock>` is supplied by the OCR adapter and carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Per-region extraction output: OCR text/blocks plus whatever structured
/// payload a downstream extractor (table or chart) attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualExtraction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub ocr_blocks: Vec<OcrBlock>,
    #[serde(default)]
    pub structured_json: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub confidence: f64,
}

impl Default for VisualExtraction {
    fn default() -> Self {
        Self {
            ocr_text: None,
            ocr_blocks: Vec::new(),
            structured_json: Map::new(),
            units: None,
            labels: Map::new(),
            model_version: None,
            confidence: 0.0,
        }
    }
}

/// The kind a [`VisualAsset`] was classified as. Every asset starts as
/// `ImageText` and is promoted to `Table` or `Chart` when the matching
/// extractor fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Chart,
    Table,
    Map,
    Diagram,
    ImageText,
    Unknown,
}

/// One detected region of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualAsset {
    pub asset_type: AssetType,
    pub bbox: BoundingBox,
    pub confidence: f64,
    #[serde(default)]
    pub quality_flags: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
    pub extraction: VisualExtraction,
}

impl VisualAsset {
    /// A freshly laid-out region before any extractor has run: `image_text`
    /// at the fallback-layout confidence.
    #[must_use]
    pub fn new_image_text(bbox: BoundingBox) -> Self {
        Self {
            asset_type: AssetType::ImageText,
            bbox,
            confidence: 0.0,
            quality_flags: Map::new(),
            image_uri: None,
            image_hash: None,
            extraction: VisualExtraction::default(),
        }
    }

    /// Insert (or overwrite) a quality flag. Flags are append-only from the
    /// pipeline's point of view: earlier stages' keys are never removed, but
    /// a later stage writing the same key wins.
    pub fn set_flag(&mut self, key: &str, value: impl Into<Value>) {
        self.quality_flags.insert(key.to_string(), value.into());
    }
}

/// An axis-aligned rectangle in pixel coordinates, used internally by
/// detectors before normalization into a [`BoundingBox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

impl PixelRect {
    #[must_use]
    pub fn left(&self) -> i64 {
        self.x
    }

    #[must_use]
    pub fn right(&self) -> i64 {
        self.x + self.w
    }

    #[must_use]
    pub fn top(&self) -> i64 {
        self.y
    }

    #[must_use]
    pub fn bottom(&self) -> i64 {
        self.y + self.h
    }

    #[must_use]
    pub fn x_center(&self) -> f64 {
        self.x as f64 + self.w as f64 / 2.0
    }

    #[must_use]
    pub fn area(&self) -> i64 {
        self.w * self.h
    }
}

/// Output of the table detector (`§4.3`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDetectResult {
    pub detected: bool,
    pub grid_detected: bool,
    pub method: String,
    pub line_pixel_ratio: f64,
    pub intersections_count: usize,
    pub x_lines: Vec<i64>,
    pub y_lines: Vec<i64>,
}

impl TableDetectResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            detected: false,
            grid_detected: false,
            method: "grid_lines_v1".to_string(),
            line_pixel_ratio: 0.0,
            intersections_count: 0,
            x_lines: Vec::new(),
            y_lines: Vec::new(),
        }
    }
}

/// Output of the bar-chart detector (`§4.5`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarChartDetectResult {
    pub detected: bool,
    pub bar_count: usize,
    pub bars: Vec<PixelRect>,
    pub baseline_y: i64,
    pub score: f64,
}

impl BarChartDetectResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            detected: false,
            bar_count: 0,
            bars: Vec::new(),
            baseline_y: 0,
            score: 0.0,
        }
    }
}

/// Quality flags are a free-form string -> JSON map. This helper keeps call
/// sites from constructing `serde_json::Value` by hand for the common case of
/// a plain string or bool flag.
pub fn flags() -> Map<String, Value> {
    Map::new()
}
