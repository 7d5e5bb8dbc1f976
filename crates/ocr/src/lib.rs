//! OCR adapter using Tesseract 5.x.
//!
//! The pipeline core never talks to Tesseract directly: it depends on the
//! [`OcrEngine`] trait, and this crate supplies the default implementation
//! backed by `leptess`. This is the "explicit interface injection" design
//! called for by the project: the orchestrator is handed `Option<&dyn
//! OcrEngine>` rather than reaching for an optional native dependency at
//! call time, and an absent or non-functional engine degrades to diagnostic
//! flags instead of an error.

use image::RgbImage;
use leptess::{LepTess, Variable};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use vision_common::{clamp01, BoundingBox, OcrBlock, VisualExtraction};

/// A single recognized word, in the coordinate space of the image that was
/// handed to [`OcrEngine::recognize`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawWord {
    pub text: String,
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
    /// Native engine confidence rescaled to `[0, 1]`, or `None` if the
    /// engine reported no confidence for this word.
    pub confidence: Option<f64>,
}

/// Raised when the engine cannot service a recognition request because its
/// native backend (binary, language data) is unavailable. This is never
/// raised across the pipeline's component boundaries; [`run_ocr`] catches it
/// and converts it into a quality flag.
#[derive(Debug, Error)]
pub enum OcrEngineError {
    #[error("ocr engine unavailable: {0}")]
    Unavailable(String),
}

/// Capability contract for an OCR backend: an image in, a list of words
/// with pixel boxes and rescaled confidence out.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<RawWord>, OcrEngineError>;
}

/// Tesseract-backed [`OcrEngine`], one instance per configured language.
pub struct TesseractOcr {
    language: String,
    min_confidence: f64,
}

impl TesseractOcr {
    /// Build an engine for `language`, verifying Tesseract can initialize
    /// with the requested language data. `min_confidence` (`[0, 1]`) drops
    /// recognized words below threshold before they reach a block.
    pub fn new(language: &str, min_confidence: f64) -> Result<Self, OcrEngineError> {
        LepTess::new(None, language).map_err(|e| {
            OcrEngineError::Unavailable(format!(
                "failed to initialize tesseract with language '{language}': {e}"
            ))
        })?;

        Ok(Self {
            language: language.to_string(),
            min_confidence: clamp01(min_confidence),
        })
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<RawWord>, OcrEngineError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let mut lt = LepTess::new(None, &self.language)
            .map_err(|e| OcrEngineError::Unavailable(e.to_string()))?;
        lt.set_variable(Variable::TesseditPagesegMode, "3")
            .map_err(|e| OcrEngineError::Unavailable(e.to_string()))?;

        let mut png_buf = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut png_buf, image::ImageFormat::Png)
            .map_err(|e| OcrEngineError::Unavailable(format!("failed to encode image: {e}")))?;
        lt.set_image_from_mem(png_buf.get_ref())
            .map_err(|e| OcrEngineError::Unavailable(e.to_string()))?;

        let boxes = match lt.get_component_boxes(leptess::capi::TessPageIteratorLevel_RIL_WORD, true) {
            Some(boxes) => boxes,
            None => return Ok(Vec::new()),
        };

        let mut words = Vec::new();
        for bbox in &boxes {
            let geom = bbox.get_geometry();
            lt.set_rectangle(geom.x, geom.y, geom.w, geom.h);
            let text = lt.get_utf8_text().unwrap_or_default().trim().to_string();
            if text.is_empty() {
                continue;
            }

            let raw_conf = lt.mean_text_conf();
            let confidence = if raw_conf >= 0 {
                Some(clamp01(f64::from(raw_conf) / 100.0))
            } else {
                None
            };

            if confidence.is_some_and(|c| c < self.min_confidence) {
                continue;
            }

            debug!(text = %text, confidence = ?confidence, "ocr word");

            words.push(RawWord {
                text,
                left: i64::from(geom.x),
                top: i64::from(geom.y),
                width: i64::from(geom.w),
                height: i64::from(geom.h),
                confidence,
            });
        }

        Ok(words)
    }
}

fn empty_extraction() -> VisualExtraction {
    VisualExtraction {
        ocr_text: None,
        confidence: 0.0,
        ..VisualExtraction::default()
    }
}

/// Recognize words without normalizing to `[0, 1]`, for callers (the chart
/// extractor's axis-label strip) that need pixel coordinates relative to a
/// crop rather than an aggregated extraction. Never raises.
#[must_use]
pub fn recognize_words(engine: Option<&dyn OcrEngine>, image: &RgbImage) -> (Vec<RawWord>, Map<String, Value>) {
    let mut flags = Map::new();

    let Some(engine) = engine else {
        flags.insert("ocr".to_string(), Value::from("missing"));
        return (Vec::new(), flags);
    };

    match engine.recognize(image) {
        Ok(words) => (words, flags),
        Err(e) => {
            flags.insert("ocr".to_string(), Value::from("binary_missing"));
            flags.insert("ocr_error".to_string(), Value::from(e.to_string()));
            (Vec::new(), flags)
        }
    }
}

/// Run OCR over the whole image. Never raises: an absent engine or a failed
/// recognition call produces an empty extraction and a diagnostic flag
/// instead of propagating an error.
#[must_use]
pub fn run_ocr(engine: Option<&dyn OcrEngine>, image: &RgbImage) -> (VisualExtraction, Map<String, Value>) {
    let (words, flags) = recognize_words(engine, image);
    if words.is_empty() && !flags.is_empty() {
        return (empty_extraction(), flags);
    }
    let mut flags = flags;

    let (width, height) = image.dimensions();
    let blocks: Vec<OcrBlock> = words
        .iter()
        .map(|w| OcrBlock {
            text: w.text.clone(),
            bbox: BoundingBox::from_pixels(w.left, w.top, w.width, w.height, width, height),
            confidence: w.confidence,
        })
        .collect();

    let ocr_text = if blocks.is_empty() {
        None
    } else {
        let joined = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    };

    let confs: Vec<f64> = blocks.iter().filter_map(|b| b.confidence).collect();
    let confidence = if !confs.is_empty() {
        clamp01(confs.iter().sum::<f64>() / confs.len() as f64)
    } else if ocr_text.is_some() {
        0.5
    } else {
        0.0
    };

    if ocr_text.is_none() {
        flags.insert("ocr".to_string(), Value::from("no_text_detected"));
    }

    (
        VisualExtraction {
            ocr_text,
            ocr_blocks: blocks,
            confidence,
            ..VisualExtraction::default()
        },
        flags,
    )
}

/// OCR a single table cell crop, returning plain text (empty string on
/// failure) and any diagnostic flags. Multiple words are joined with single
/// spaces.
#[must_use]
pub fn recognize_cell(engine: Option<&dyn OcrEngine>, cell: &RgbImage) -> (String, Map<String, Value>) {
    let (extraction, flags) = run_ocr(engine, cell);
    (extraction.ocr_text.unwrap_or_default(), flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct StubEngine {
        words: Vec<RawWord>,
    }

    impl OcrEngine for StubEngine {
        fn recognize(&self, _image: &RgbImage) -> Result<Vec<RawWord>, OcrEngineError> {
            Ok(self.words.clone())
        }
    }

    struct FailingEngine;

    impl OcrEngine for FailingEngine {
        fn recognize(&self, _image: &RgbImage) -> Result<Vec<RawWord>, OcrEngineError> {
            Err(OcrEngineError::Unavailable("no binary".to_string()))
        }
    }

    fn blank(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    #[test]
    fn missing_engine_sets_flag_and_is_empty() {
        let (extraction, flags) = run_ocr(None, &blank(10, 10));
        assert!(extraction.ocr_text.is_none());
        assert_eq!(extraction.confidence, 0.0);
        assert_eq!(flags.get("ocr").and_then(Value::as_str), Some("missing"));
    }

    #[test]
    fn failing_engine_sets_binary_missing_flag() {
        let engine = FailingEngine;
        let (extraction, flags) = run_ocr(Some(&engine), &blank(10, 10));
        assert!(extraction.ocr_blocks.is_empty());
        assert_eq!(
            flags.get("ocr").and_then(Value::as_str),
            Some("binary_missing")
        );
    }

    #[test]
    fn no_words_sets_no_text_detected() {
        let engine = StubEngine { words: Vec::new() };
        let (extraction, flags) = run_ocr(Some(&engine), &blank(10, 10));
        assert!(extraction.ocr_text.is_none());
        assert_eq!(
            flags.get("ocr").and_then(Value::as_str),
            Some("no_text_detected")
        );
    }

    #[test]
    fn words_aggregate_text_and_confidence() {
        let engine = StubEngine {
            words: vec![
                RawWord {
                    text: "Hello".to_string(),
                    left: 0,
                    top: 0,
                    width: 10,
                    height: 10,
                    confidence: Some(0.8),
                },
                RawWord {
                    text: "World".to_string(),
                    left: 20,
                    top: 0,
                    width: 10,
                    height: 10,
                    confidence: Some(0.6),
                },
            ],
        };
        let (extraction, flags) = run_ocr(Some(&engine), &blank(100, 100));
        assert_eq!(extraction.ocr_text.as_deref(), Some("Hello World"));
        assert!((extraction.confidence - 0.7).abs() < 1e-9);
        assert_eq!(extraction.ocr_blocks.len(), 2);
        assert!(flags.get("ocr").is_none());
    }

    #[test]
    fn confidence_defaults_to_half_when_text_present_but_unscored() {
        let engine = StubEngine {
            words: vec![RawWord {
                text: "X".to_string(),
                left: 0,
                top: 0,
                width: 5,
                height: 5,
                confidence: None,
            }],
        };
        let (extraction, _) = run_ocr(Some(&engine), &blank(10, 10));
        assert_eq!(extraction.confidence, 0.5);
    }

    #[test]
    fn recognize_cell_returns_joined_text() {
        let engine = StubEngine {
            words: vec![RawWord {
                text: "X".to_string(),
                left: 0,
                top: 0,
                width: 5,
                height: 5,
                confidence: Some(0.9),
            }],
        };
        let (text, _) = recognize_cell(Some(&engine), &blank(10, 10));
        assert_eq!(text, "X");
    }
}
