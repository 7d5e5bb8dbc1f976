//! Bar-chart detection and extraction.
//!
//! `detect_bar_chart` finds repeated, baseline-aligned filled rectangles
//! after subtracting thin axis/grid lines from the binarized page;
//! `extract_bar_chart` turns the detected bars into a single numeric series,
//! optionally calibrated against OCR'd axis tick labels.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use image::{imageops, RgbImage};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use vision_common::{clamp01, BarChartDetectResult, OcrBlock, PixelRect};
use vision_core::morph::{
    fill_rect, find_component_rects, gaussian_blur_3x3, open_rect, or_images,
    otsu_binarize_inverted, subtract_images, to_gray,
};
use vision_core::Deadline;
use vision_ocr::{recognize_words, OcrEngine};

/// Remove thin, long axis/grid-line components from a binarized image while
/// preserving filled bars. A component only qualifies for removal if it is
/// both long (spans most of the image along its axis) and thin (a handful
/// of pixels across); this double gate is what keeps a tall filled bar from
/// being mistaken for a vertical axis line.
fn subtract_thin_axis_lines(bw: &image::GrayImage) -> (image::GrayImage, usize) {
    let (w, h) = bw.dimensions();

    let kx = 35u32.max(w / 14);
    let horiz_candidates = open_rect(bw, kx, 1);
    let min_line_w = (f64::from(w) * 0.35) as i64;
    let max_line_h = 6i64.max((f64::from(h) * 0.03) as i64);

    let mut h_mask = image::GrayImage::new(w, h);
    let mut kept = 0usize;
    for rect in find_component_rects(&horiz_candidates) {
        if rect.w >= min_line_w && rect.h <= max_line_h {
            fill_rect(&mut h_mask, &rect);
            kept += 1;
        }
    }

    let ky = 45u32.max(h / 10);
    let vert_candidates = open_rect(bw, 1, ky);
    let min_line_h = (f64::from(h) * 0.35) as i64;
    let max_line_w = 6i64.max((f64::from(w) * 0.02) as i64);

    let mut v_mask = image::GrayImage::new(w, h);
    for rect in find_component_rects(&vert_candidates) {
        if rect.h >= min_line_h && rect.w <= max_line_w {
            fill_rect(&mut v_mask, &rect);
            kept += 1;
        }
    }

    let line_mask = or_images(&h_mask, &v_mask);
    (subtract_images(bw, &line_mask), kept)
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|v| (v - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

fn median(xs: &[f64]) -> f64 {
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn filter_bar_candidates(rects: &[PixelRect], img_w: u32, img_h: u32) -> Vec<PixelRect> {
    let w = f64::from(img_w);
    let h = f64::from(img_h);
    let min_area = 80i64.max((w * h * 0.00008) as i64);
    let min_h = 18i64.max((h * 0.06) as i64);
    let min_w = 5i64.max((w * 0.008) as i64);
    let max_w = (w * 0.6) as i64;
    let max_h = (h * 0.9) as i64;

    rects
        .iter()
        .filter(|r| r.w > 0 && r.h > 0)
        .filter(|r| r.area() >= min_area)
        .filter(|r| (r.h as f64 / r.w.max(1) as f64) >= 0.55)
        .filter(|r| r.h >= min_h)
        .filter(|r| r.w >= min_w)
        .filter(|r| r.w <= max_w && r.h <= max_h)
        .copied()
        .collect()
}

/// Merge rectangles whose x-centers fall within `merge_px` of each other,
/// keeping the largest-area rectangle per cluster. Collapses duplicate
/// detections of the same bar.
fn cluster_by_x(rects: &[PixelRect], merge_px: f64) -> Vec<PixelRect> {
    if rects.is_empty() {
        return Vec::new();
    }
    let mut sorted = rects.to_vec();
    sorted.sort_by(|a, b| a.x_center().partial_cmp(&b.x_center()).unwrap());

    let mut clusters: Vec<Vec<PixelRect>> = Vec::new();
    let mut current = vec![sorted[0]];
    let mut current_cx = sorted[0].x_center();

    for r in &sorted[1..] {
        let cx = r.x_center();
        if (cx - current_cx).abs() <= merge_px {
            current.push(*r);
            current_cx = current.iter().map(PixelRect::x_center).sum::<f64>() / current.len() as f64;
        } else {
            clusters.push(std::mem::take(&mut current));
            current = vec![*r];
            current_cx = cx;
        }
    }
    clusters.push(current);

    clusters
        .into_iter()
        .map(|c| *c.iter().max_by_key(|r| r.area()).unwrap())
        .collect()
}

/// Detect a vertical bar chart: repeated, similarly-wide, baseline-aligned
/// filled rectangles. Never raises.
#[must_use]
pub fn detect_bar_chart(image: &RgbImage, deadline: Deadline) -> (BarChartDetectResult, Map<String, Value>) {
    let mut flags = Map::new();
    flags.insert("chart_detected".to_string(), Value::from(false));

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (BarChartDetectResult::empty(), flags);
    }

    let (img_w, img_h) = image.dimensions();
    let gray = to_gray(image);
    let blurred = gaussian_blur_3x3(&gray);
    let bw = otsu_binarize_inverted(&blurred);

    let (cleaned, removed) = subtract_thin_axis_lines(&bw);
    flags.insert("axis_line_components_removed".to_string(), Value::from(removed));

    let denoise_k = if img_w.min(img_h) >= 300 { 5 } else { 3 };
    let denoised = open_rect(&cleaned, denoise_k, denoise_k);
    flags.insert("denoise_open_kernel".to_string(), Value::from(denoise_k));

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        return (BarChartDetectResult::empty(), flags);
    }

    let rects = find_component_rects(&denoised);
    let candidates = filter_bar_candidates(&rects, img_w, img_h);
    if candidates.is_empty() {
        return (BarChartDetectResult::empty(), flags);
    }

    let merge_px = 6.0f64.max(f64::from(img_w) * 0.02);
    let bars = cluster_by_x(&candidates, merge_px);

    if bars.len() < 3 {
        return (
            BarChartDetectResult {
                detected: false,
                bar_count: bars.len(),
                bars,
                baseline_y: 0,
                score: 0.0,
            },
            flags,
        );
    }

    let bottoms: Vec<f64> = bars.iter().map(|b| b.bottom() as f64).collect();
    let baseline_y = median(&bottoms) as i64;
    let baseline_std = std_dev(&bottoms);

    let widths: Vec<f64> = bars.iter().map(|b| b.w as f64).collect();
    let width_mean = mean(&widths).max(1e-6);
    let width_cv = std_dev(&widths) / width_mean;

    let baseline_tol = 6.0f64.max(f64::from(img_h) * 0.015);
    let aligned = bottoms
        .iter()
        .filter(|b| (*b - baseline_y as f64).abs() <= baseline_tol)
        .count();
    let aligned_ratio = aligned as f64 / bars.len().max(1) as f64;

    let detected = aligned_ratio >= 0.7 && width_cv <= 0.4;
    if !detected {
        return (
            BarChartDetectResult {
                detected: false,
                bar_count: bars.len(),
                bars,
                baseline_y,
                score: 0.0,
            },
            flags,
        );
    }

    let bar_count_score = clamp01((bars.len() as f64 - 2.0) / 6.0);
    let width_score = clamp01(1.0 - width_cv);
    let baseline_score = clamp01(1.0 - baseline_std / (baseline_tol * 2.0).max(1.0));
    let score = clamp01(0.15 + 0.45 * bar_count_score + 0.25 * width_score + 0.15 * baseline_score);

    flags.insert("chart_detected".to_string(), Value::from(true));
    flags.insert("chart_type_bar".to_string(), Value::from(true));

    let mut sorted_bars = bars;
    sorted_bars.sort_by_key(PixelRect::left);

    (
        BarChartDetectResult {
            detected: true,
            bar_count: sorted_bars.len(),
            bars: sorted_bars,
            baseline_y,
            score,
        },
        flags,
    )
}

fn numeric_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-+]?\d{1,3}(?:,\d{3})*(?:\.\d+)?%?\$?").unwrap())
}

fn parse_number(token: &str) -> Option<f64> {
    let s = token.trim();
    if s.is_empty() {
        return None;
    }
    let is_percent = s.ends_with('%');
    let cleaned: String = s.chars().filter(|&c| c != '%' && c != '$' && c != ',').collect();
    let v: f64 = cleaned.parse().ok()?;
    Some(if is_percent { v / 100.0 } else { v })
}

/// Fit `v = a*y + b` by ordinary least squares. Requires at least two
/// points with distinct `y`.
fn fit_linear(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let ys: Vec<f64> = points.iter().map(|p| p.0).collect();
    if std_dev(&ys) < 1e-6 {
        return None;
    }
    let n = points.len() as f64;
    let sum_y: f64 = ys.iter().sum();
    let sum_v: f64 = points.iter().map(|p| p.1).sum();
    let sum_yy: f64 = ys.iter().map(|y| y * y).sum();
    let sum_yv: f64 = points.iter().map(|(y, v)| y * v).sum();

    let denom = n * sum_yy - sum_y * sum_y;
    if denom.abs() < 1e-9 {
        return None;
    }
    let a = (n * sum_yv - sum_y * sum_v) / denom;
    let b = (sum_v - a * sum_y) / n;
    Some((a, b))
}

/// Extract a single numeric bar series from detected bars, optionally
/// calibrated against an OCR'd axis strip. Returns the `{"chart": {...}}`
/// patch plus diagnostic flags. Never raises.
#[must_use]
pub fn extract_bar_chart(
    image: &RgbImage,
    detect: &BarChartDetectResult,
    ocr_blocks: &[OcrBlock],
    deadline: Deadline,
    engine: Option<&dyn OcrEngine>,
) -> (Value, Map<String, Value>) {
    let mut flags = Map::new();
    flags.insert("chart_detected".to_string(), Value::from(detect.detected));
    flags.insert("axis_mapping_succeeded".to_string(), Value::from(false));
    flags.insert("axis_mapping_failed".to_string(), Value::from(false));
    flags.insert("x_labels_missing".to_string(), Value::from(false));

    let mut chart = json!({
        "type": "bar",
        "title": Value::Null,
        "x_labels": Vec::<String>::new(),
        "series": [{
            "name": "Series 1",
            "values": Vec::<f64>::new(),
            "unit": Value::Null,
            "values_are_normalized": true,
        }],
        "y_unit": Value::Null,
        "confidence": 0.0,
        "method": "bar_pixels_v1",
    });

    if !detect.detected || detect.bar_count < 3 {
        chart["notes"] = Value::from("not_detected");
        return (chart, flags);
    }

    let (img_w, img_h) = image.dimensions();
    let mut bars = detect.bars.clone();
    bars.sort_by_key(PixelRect::left);

    let heights_px: Vec<i64> = bars.iter().map(|b| (detect.baseline_y - b.y).max(0)).collect();
    let max_h = heights_px.iter().copied().max().unwrap_or(0).max(1) as f64;

    if deadline.is_expired() {
        flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        chart["notes"] = Value::from("time_budget_exceeded");
        return (chart, flags);
    }

    let axis_points = calibration_points(image, &bars, detect.baseline_y, img_w, img_h, deadline, engine, &mut flags);
    let mapping = fit_linear(&axis_points);

    let values_are_normalized;
    let values: Vec<f64> = if let Some((a, b)) = mapping {
        let v_base = a * detect.baseline_y as f64 + b;
        values_are_normalized = false;
        flags.insert("axis_mapping_succeeded".to_string(), Value::from(true));
        heights_px
            .iter()
            .map(|&hpx| {
                let y_top = (detect.baseline_y - hpx) as f64;
                a * y_top + b - v_base
            })
            .collect()
    } else {
        values_are_normalized = true;
        flags.insert("axis_mapping_failed".to_string(), Value::from(true));
        heights_px.iter().map(|&h| h as f64 / max_h).collect()
    };

    chart["series"][0]["values"] = json!(values);
    chart["series"][0]["values_are_normalized"] = Value::from(values_are_normalized);

    let x_centers: Vec<f64> = bars.iter().map(PixelRect::x_center).collect();
    let mut labels = vec![String::new(); bars.len()];
    if ocr_blocks.is_empty() {
        flags.insert("x_labels_missing".to_string(), Value::from(true));
    } else {
        for block in ocr_blocks {
            if block.text.trim().is_empty() {
                continue;
            }
            let cx = (block.bbox.x + block.bbox.w / 2.0) * f64::from(img_w);
            let cy = (block.bbox.y + block.bbox.h / 2.0) * f64::from(img_h);
            if cy < detect.baseline_y as f64 + f64::from(img_h) * 0.03 {
                continue;
            }
            let j = x_centers
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (cx - **a).abs().partial_cmp(&(cx - **b).abs()).unwrap())
                .map_or(0, |(i, _)| i);
            let joined = format!("{} {}", labels[j], block.text.trim());
            labels[j] = joined.trim().to_string();
        }
        if labels.iter().any(|l| !l.trim().is_empty()) {
            chart["x_labels"] = json!(labels);
        } else {
            flags.insert("x_labels_missing".to_string(), Value::from(true));
        }
    }

    let mut confidence = clamp01(0.45 + 0.45 * detect.score);
    if flags.get("axis_mapping_succeeded") == Some(&Value::from(true)) {
        confidence = clamp01(confidence + 0.18);
    }
    if flags.get("x_labels_missing") == Some(&Value::from(true)) {
        confidence = clamp01(confidence - 0.10);
    }
    if values_are_normalized {
        confidence = clamp01(confidence - 0.08);
    }
    chart["confidence"] = Value::from(confidence);
    chart["notes"] = Value::from("mvp_single_series");

    (chart, flags)
}

#[allow(clippy::too_many_arguments)]
fn calibration_points(
    image: &RgbImage,
    bars: &[PixelRect],
    baseline_y: i64,
    img_w: u32,
    img_h: u32,
    deadline: Deadline,
    engine: Option<&dyn OcrEngine>,
    flags: &mut Map<String, Value>,
) -> Vec<(f64, f64)> {
    let Some(min_x) = bars.iter().map(PixelRect::left).min() else {
        return Vec::new();
    };

    let strip_l = (min_x - (f64::from(img_w) * 0.22) as i64).max(0);
    let strip_r = (min_x - (f64::from(img_w) * 0.02) as i64).max(0);
    let strip_t = ((f64::from(img_h) * 0.05) as i64).max(0);
    let strip_b = (baseline_y + (f64::from(img_h) * 0.02) as i64).min(i64::from(img_h));

    if strip_r <= strip_l + 4 || strip_b <= strip_t + 4 || deadline.is_expired() {
        if deadline.is_expired() {
            flags.insert("time_budget_exceeded".to_string(), Value::from(true));
        }
        return Vec::new();
    }

    let crop = imageops::crop_imm(
        image,
        strip_l as u32,
        strip_t as u32,
        (strip_r - strip_l) as u32,
        (strip_b - strip_t) as u32,
    )
    .to_image();

    let (words, ocr_flags) = recognize_words(engine, &crop);
    for (k, v) in ocr_flags {
        flags.insert(k, v);
    }

    let re = numeric_regex();
    let mut points: Vec<(f64, f64)> = words
        .iter()
        .filter_map(|w| {
            let m = re.find(&w.text)?;
            let value = parse_number(m.as_str())?;
            let y_center = strip_t as f64 + w.top as f64 + w.height as f64 / 2.0;
            Some((y_center, value))
        })
        .collect();

    if points.len() < 2 {
        return points;
    }

    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let mut thinned = Vec::new();
    let mut last_y: Option<f64> = None;
    for (y, v) in points {
        if last_y.is_none_or(|ly| (y - ly).abs() > 12.0) {
            thinned.push((y, v));
            last_y = Some(y);
        }
        if thinned.len() >= 6 {
            break;
        }
    }
    thinned
}
