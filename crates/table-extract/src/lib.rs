//! Ruled-table detection and extraction.
//!
//! `detect_table` finds the grid of ruling lines via directional
//! morphological opening; `extract_table` either slices the grid into cells
//! and OCRs each one, or, when the grid is too sparse, falls back to
//! clustering free OCR blocks into rows and columns by position.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use image::{imageops, RgbImage};
use serde_json::{json, Map, Value};
use vision_common::{clamp01, OcrBlock, TableDetectResult};
use vision_core::morph::{
    and_images, col_projection, collapse_runs_to_midpoints, count_nonzero, gaussian_blur_3x3,
    open_rect, or_images, otsu_binarize_inverted, row_projection, to_gray,
};
use vision_core::Deadline;
use vision_ocr::{recognize_cell, OcrEngine};

const MIN_KERNEL: u32 = 10;
const MIN_LINE_RATIO: f64 = 0.008;
const MIN_INTERSECTIONS: usize = 200;
const MAX_X_LINES: usize = 60;
const MAX_Y_LINES: usize = 80;
const MAX_ROWS: usize = 40;
const MAX_COLS: usize = 20;
const CELL_PAD: i64 = 2;

/// Detect ruling lines and decide whether the image contains a table.
/// Never raises; an expired deadline yields an empty, `time_budget_exceeded`
/// result rather than a partial scan.
#[must_use]
pub fn detect_table(image: &RgbImage, deadline: Deadline) -> (TableDetectResult, Map<String, Value>) {
    let mut flags = Map::new();
    flags.insert("table_detected".to_string(), Value::from(false));
    flags.insert("grid_detected".to_string(), Value::from(false));

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (TableDetectResult::empty(), flags);
    }

    let gray = to_gray(image);
    let blurred = gaussian_blur_3x3(&gray);
    let binary = otsu_binarize_inverted(&blurred);

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (TableDetectResult::empty(), flags);
    }

    let (w, h) = binary.dimensions();
    let h_kernel = MIN_KERNEL.max(w / 30);
    let v_kernel = MIN_KERNEL.max(h / 30);

    let horizontal = open_rect(&binary, h_kernel, 1);
    let vertical = open_rect(&binary, 1, v_kernel);

    let combined = or_images(&horizontal, &vertical);
    let intersections = and_images(&horizontal, &vertical);

    let total_pixels = (w as f64 * h as f64).max(1.0);
    let line_ratio = count_nonzero(&combined) as f64 / total_pixels;
    let intersections_count = count_nonzero(&intersections);

    let y_lines = line_positions(&row_projection(&horizontal), w);
    let x_lines = line_positions(&col_projection(&vertical), h);

    let min_lines_ok = x_lines.len() >= 3 && y_lines.len() >= 3;
    let ratio_ok = line_ratio >= MIN_LINE_RATIO;
    let intersections_ok = intersections_count >= MIN_INTERSECTIONS;

    let detected = min_lines_ok && (ratio_ok || intersections_ok);
    let grid_detected = min_lines_ok;

    flags.insert("table_detected".to_string(), Value::from(detected));
    flags.insert("grid_detected".to_string(), Value::from(grid_detected));

    (
        TableDetectResult {
            detected,
            grid_detected,
            method: "grid_lines_v1".to_string(),
            line_pixel_ratio: clamp01(line_ratio * 10.0),
            intersections_count,
            x_lines,
            y_lines,
        },
        flags,
    )
}

/// Recover line positions along an axis from a projection count, using the
/// `max(10, 0.35 * extent)` activity threshold and collapsing consecutive
/// active positions into their midpoint.
fn line_positions(projection: &[usize], cross_extent: u32) -> Vec<i64> {
    let threshold = 10usize.max((cross_extent as f64 * 0.35) as usize);
    collapse_runs_to_midpoints(projection.len(), |i| projection[i] >= threshold)
}

/// Dedup, sort ascending, and downsample evenly to at most `cap` entries.
fn cap_lines(lines: &[i64], cap: usize) -> Vec<i64> {
    let mut xs: Vec<i64> = lines.to_vec();
    xs.sort_unstable();
    xs.dedup();
    if xs.len() <= cap {
        return xs;
    }
    (0..cap)
        .map(|i| {
            let idx = if cap <= 1 {
                0
            } else {
                (i * (xs.len() - 1)) / (cap - 1)
            };
            xs[idx]
        })
        .collect()
}

fn crop_cell(image: &RgbImage, left: i64, top: i64, right: i64, bottom: i64) -> RgbImage {
    let (w, h) = image.dimensions();
    let l = left.clamp(0, i64::from(w));
    let t = top.clamp(0, i64::from(h));
    let r = right.clamp(0, i64::from(w));
    let b = bottom.clamp(0, i64::from(h));
    if r <= l + 1 || b <= t + 1 {
        return imageops::crop_imm(image, 0, 0, 1.min(w), 1.min(h)).to_image();
    }
    imageops::crop_imm(image, l as u32, t as u32, (r - l) as u32, (b - t) as u32).to_image()
}

/// Slice the grid into cells and OCR each one, or fall back to clustering
/// free OCR blocks by position. Returns the `{"table": {...}}` patch plus
/// diagnostic flags. Never raises.
#[must_use]
pub fn extract_table(
    image: &RgbImage,
    detect: &TableDetectResult,
    ocr_blocks: &[OcrBlock],
    deadline: Deadline,
    engine: Option<&dyn OcrEngine>,
) -> (Value, Map<String, Value>) {
    let mut flags = Map::new();
    flags.insert("table_detected".to_string(), Value::from(detect.detected));
    flags.insert("grid_detected".to_string(), Value::from(detect.grid_detected));
    flags.insert("used_fallback_clustering".to_string(), Value::from(false));

    let (img_w, img_h) = image.dimensions();

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (
            json!({"rows": [], "confidence": 0.0, "method": "grid_lines_v1", "notes": "time_budget_exceeded"}),
            flags,
        );
    }

    let x_lines = cap_lines(&detect.x_lines, MAX_X_LINES);
    let y_lines = cap_lines(&detect.y_lines, MAX_Y_LINES);

    if detect.grid_detected && x_lines.len() >= 3 && y_lines.len() >= 3 {
        let max_rows = (y_lines.len() - 1).min(MAX_ROWS);
        let max_cols = (x_lines.len() - 1).min(MAX_COLS);

        let mut rows_out: Vec<Vec<String>> = Vec::with_capacity(max_rows);
        let mut exceeded = false;

        'rows: for ri in 0..max_rows {
            if deadline.is_expired() {
                exceeded = true;
                break;
            }
            let top = y_lines[ri];
            let bottom = y_lines[ri + 1];
            let mut row_cells = Vec::with_capacity(max_cols);
            for ci in 0..max_cols {
                if deadline.is_expired() {
                    exceeded = true;
                    break 'rows;
                }
                let left = x_lines[ci];
                let right = x_lines[ci + 1];
                let cell = crop_cell(image, left + CELL_PAD, top + CELL_PAD, right - CELL_PAD, bottom - CELL_PAD);
                let (text, cell_flags) = recognize_cell(engine, &cell);
                for (k, v) in cell_flags {
                    flags.insert(k, v);
                }
                row_cells.push(text);
            }
            rows_out.push(row_cells);
        }

        if exceeded {
            flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        }

        let grid_strength = clamp01((detect.intersections_count as f64 / 4000.0).min(1.0));
        let base = if exceeded { 0.45 } else { 0.65 };
        let confidence = clamp01(base + 0.25 * grid_strength);

        let mut table = json!({
            "rows": rows_out,
            "confidence": confidence,
            "method": "grid_lines_v1",
        });
        if exceeded {
            table["notes"] = Value::from("time_budget_exceeded");
        }
        return (table, flags);
    }

    flags.insert("used_fallback_clustering".to_string(), Value::from(true));

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (
            json!({"rows": [], "confidence": 0.0, "method": "ocr_cluster_v1", "notes": "time_budget_exceeded"}),
            flags,
        );
    }

    let (grid, rows, cols) = cluster_blocks_to_grid(ocr_blocks, img_w, img_h);
    let confidence = if rows > 0 && cols > 0 { 0.35 } else { 0.15 };
    let mut table = json!({
        "rows": grid,
        "confidence": confidence,
        "method": "ocr_cluster_v1",
    });
    if rows == 0 {
        table["notes"] = Value::from("no_ocr_blocks_for_clustering");
    }
    (table, flags)
}

/// Cluster OCR block centroids into rows by y-proximity, then into columns
/// by x-proximity, producing a ragged `rows x cols` grid of joined text.
fn cluster_blocks_to_grid(blocks: &[OcrBlock], img_w: u32, img_h: u32) -> (Vec<Vec<String>>, usize, usize) {
    if blocks.is_empty() || img_w == 0 || img_h == 0 {
        return (Vec::new(), 0, 0);
    }

    let img_w = f64::from(img_w);
    let img_h = f64::from(img_h);

    let mut items: Vec<(i64, i64, String)> = blocks
        .iter()
        .filter(|b| !b.text.trim().is_empty())
        .map(|b| {
            let x = ((b.bbox.x + b.bbox.w / 2.0) * img_w) as i64;
            let y = ((b.bbox.y + b.bbox.h / 2.0) * img_h) as i64;
            (x, y, b.text.trim().to_string())
        })
        .collect();

    if items.is_empty() {
        return (Vec::new(), 0, 0);
    }

    items.sort_by_key(|(x, y, _)| (*y, *x));
    let y_tol = 8i64.max((img_h * 0.02) as i64);

    let mut rows: Vec<Vec<(i64, String)>> = Vec::new();
    let mut current: Vec<(i64, String)> = Vec::new();
    let mut current_y: Option<i64> = None;

    for (x, y, text) in items {
        match current_y {
            None => {
                current_y = Some(y);
                current.push((x, text));
            }
            Some(cy) if (y - cy).abs() <= y_tol => {
                current.push((x, text));
                current_y = Some((cy + y) / 2);
            }
            Some(_) => {
                current.sort_by_key(|(x, _)| *x);
                rows.push(std::mem::take(&mut current));
                current_y = Some(y);
                current.push((x, text));
            }
        }
    }
    if !current.is_empty() {
        current.sort_by_key(|(x, _)| *x);
        rows.push(current);
    }

    let mut xs: Vec<i64> = rows.iter().flatten().map(|(x, _)| *x).collect();
    xs.sort_unstable();
    if xs.is_empty() {
        return (Vec::new(), 0, 0);
    }

    let x_gap = 12i64.max((img_w * 0.04) as i64);
    let mut centers: Vec<i64> = vec![xs[0]];
    for &x in &xs[1..] {
        let last = *centers.last().unwrap();
        if (x - last).abs() > x_gap {
            centers.push(x);
        } else {
            *centers.last_mut().unwrap() = (last + x) / 2;
        }
    }
    let col_count = centers.len();

    let grid: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut cells: Vec<Vec<String>> = vec![Vec::new(); col_count];
            for (x, text) in row {
                let j = centers
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| (*x - **c).abs())
                    .map_or(0, |(i, _)| i);
                cells[j].push(text.clone());
            }
            cells.into_iter().map(|ws| ws.join(" ")).collect()
        })
        .collect();

    let row_count = grid.len();
    (grid, row_count, col_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_line_segment_mut;
    use std::time::Duration;
    use vision_common::BoundingBox;

    fn synthetic_grid(rows: u32, cols: u32, cell_w: u32, cell_h: u32) -> RgbImage {
        let width = cols * cell_w + 2;
        let height = rows * cell_h + 2;
        let mut img = RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
        let black = image::Rgb([0, 0, 0]);
        for r in 0..=rows {
            let y = (1 + r * cell_h) as f32;
            draw_line_segment_mut(&mut img, (1.0, y), ((1 + cols * cell_w) as f32, y), black);
        }
        for c in 0..=cols {
            let x = (1 + c * cell_w) as f32;
            draw_line_segment_mut(&mut img, (x, 1.0), (x, (1 + rows * cell_h) as f32), black);
        }
        img
    }

    #[test]
    fn detects_synthetic_grid() {
        let img = synthetic_grid(4, 3, 120, 60);
        let (res, _flags) = detect_table(&img, Deadline::after(Duration::from_secs(4)));
        assert!(res.grid_detected);
        assert!(res.detected);
    }

    struct StubOcr;
    impl OcrEngine for StubOcr {
        fn recognize(&self, _image: &RgbImage) -> Result<Vec<vision_ocr::RawWord>, vision_ocr::OcrEngineError> {
            Ok(vec![vision_ocr::RawWord {
                text: "X".to_string(),
                left: 1,
                top: 1,
                width: 3,
                height: 3,
                confidence: Some(0.9),
            }])
        }
    }

    #[test]
    fn extracts_grid_with_non_empty_cells() {
        let img = synthetic_grid(3, 3, 120, 60);
        let (detect, _) = detect_table(&img, Deadline::after(Duration::from_secs(4)));
        assert!(detect.detected);

        let stub = StubOcr;
        let (table, _flags) = extract_table(&img, &detect, &[], Deadline::after(Duration::from_secs(4)), Some(&stub));
        assert_eq!(table["method"], "grid_lines_v1");
        let rows = table["rows"].as_array().unwrap();
        assert!(rows.len() >= 2);
        assert!(rows[0].as_array().unwrap().len() >= 2);
        for row in rows.iter().take(3) {
            for cell in row.as_array().unwrap().iter().take(3) {
                assert!(!cell.as_str().unwrap().trim().is_empty());
            }
        }
    }

    #[test]
    fn extracts_grid_with_empty_cells_when_ocr_engine_unavailable() {
        let img = synthetic_grid(4, 3, 120, 60);
        let (detect, _) = detect_table(&img, Deadline::after(Duration::from_secs(4)));
        assert!(detect.detected);

        let (table, _flags) = extract_table(&img, &detect, &[], Deadline::after(Duration::from_secs(4)), None);
        assert_eq!(table["method"], "grid_lines_v1");
        let rows = table["rows"].as_array().unwrap();
        assert!(rows.len() >= 2, "grid slicing still runs with no OCR engine");
        for row in rows {
            for cell in row.as_array().unwrap() {
                assert_eq!(cell.as_str().unwrap(), "");
            }
        }
    }

    #[test]
    fn deadline_exceeded_produces_partial_result_without_panic() {
        let img = synthetic_grid(4, 3, 120, 60);
        let (detect, flags) = detect_table(&img, Deadline::expired_now());
        assert!(!detect.detected);
        assert_eq!(flags.get("time_budget_exceeded"), Some(&Value::from(true)));
    }

    #[test]
    fn fallback_clusters_ocr_blocks_into_rows() {
        let img = RgbImage::from_pixel(400, 200, image::Rgb([255, 255, 255]));
        let detect = TableDetectResult::empty();
        let blocks = vec![
            OcrBlock {
                text: "A".to_string(),
                bbox: BoundingBox::from_pixels(10, 10, 10, 10, 400, 200),
                confidence: Some(0.9),
            },
            OcrBlock {
                text: "B".to_string(),
                bbox: BoundingBox::from_pixels(200, 10, 10, 10, 400, 200),
                confidence: Some(0.9),
            },
        ];
        let (table, flags) = extract_table(&img, &detect, &blocks, Deadline::after(Duration::from_secs(4)), None);
        assert_eq!(table["method"], "ocr_cluster_v1");
        assert_eq!(flags.get("used_fallback_clustering"), Some(&Value::from(true)));
        let rows = table["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_array().unwrap().len(), 2);
    }
}
