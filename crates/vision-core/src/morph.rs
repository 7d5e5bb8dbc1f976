//! Pure-Rust morphology primitives shared by the table and bar-chart
//! detectors: grayscale/blur/Otsu binarization, rectangular erosion and
//! dilation (the `image`/`imageproc` crates only ship symmetric structuring
//! elements, but both detectors need long, thin, axis-aligned kernels), and
//! the boolean image algebra (`or`, `and`, `subtract`) the detection
//! algorithms are built from.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use vision_common::PixelRect;

/// Convert to 8-bit grayscale.
#[must_use]
pub fn to_gray(img: &RgbImage) -> GrayImage {
    image::DynamicImage::ImageRgb8(img.clone()).to_luma8()
}

/// 3x3-ish Gaussian blur. `image::imageops::blur` approximates a Gaussian
/// with the given sigma; a sigma of 1.0 matches a small 3x3 kernel closely
/// enough for threshold stability without smearing thin rules.
#[must_use]
pub fn gaussian_blur_3x3(img: &GrayImage) -> GrayImage {
    image::imageops::blur(img, 1.0)
}

/// Otsu-threshold and invert: pixels at or below the computed level (the
/// dark strokes: rules, bars, text) become foreground (255); everything else
/// becomes background (0).
#[must_use]
pub fn otsu_binarize_inverted(img: &GrayImage) -> GrayImage {
    let level = otsu_level(img);
    let (w, h) = img.dimensions();
    let mut out = GrayImage::new(w, h);
    for (x, y, p) in img.enumerate_pixels() {
        let v = if p.0[0] <= level { 255 } else { 0 };
        out.put_pixel(x, y, Luma([v]));
    }
    out
}

/// Rectangular erosion: a pixel survives only if every pixel in the
/// `kw x kh` window centered on it is foreground.
#[must_use]
pub fn erode_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    window_reduce(img, kw, kh, u8::MIN, |acc, v| acc.min(v))
}

/// Rectangular dilation: a pixel is foreground if any pixel in the
/// `kw x kh` window centered on it is foreground.
#[must_use]
pub fn dilate_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    window_reduce(img, kw, kh, u8::MAX, |acc, v| acc.max(v))
}

/// Morphological open (erode then dilate) with a `kw x kh` rectangular
/// structuring element. A `(k, 1)` kernel isolates long horizontal runs; a
/// `(1, k)` kernel isolates long vertical runs.
#[must_use]
pub fn open_rect(img: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    dilate_rect(&erode_rect(img, kw, kh), kw, kh)
}

fn window_reduce(img: &GrayImage, kw: u32, kh: u32, identity: u8, combine: fn(u8, u8) -> u8) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut out = GrayImage::new(w, h);
    let half_w = (kw / 2) as i64;
    let half_h = (kh / 2) as i64;
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let mut acc = identity;
            for dy in -half_h..=half_h {
                let sy = y + dy;
                if sy < 0 || sy >= h as i64 {
                    continue;
                }
                for dx in -half_w..=half_w {
                    let sx = x + dx;
                    if sx < 0 || sx >= w as i64 {
                        continue;
                    }
                    let v = img.get_pixel(sx as u32, sy as u32).0[0];
                    acc = combine(acc, v);
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([acc]));
        }
    }
    out
}

/// Pixelwise logical OR of two binary (0/255) images.
#[must_use]
pub fn or_images(a: &GrayImage, b: &GrayImage) -> GrayImage {
    zip_images(a, b, |x, y| x.max(y))
}

/// Pixelwise logical AND of two binary (0/255) images.
#[must_use]
pub fn and_images(a: &GrayImage, b: &GrayImage) -> GrayImage {
    zip_images(a, b, |x, y| x.min(y))
}

/// Subtract `mask` from `img`: any pixel set in `mask` is cleared in the
/// result, all other pixels pass through unchanged.
#[must_use]
pub fn subtract_images(img: &GrayImage, mask: &GrayImage) -> GrayImage {
    zip_images(img, mask, |v, m| if m > 0 { 0 } else { v })
}

fn zip_images(a: &GrayImage, b: &GrayImage, combine: fn(u8, u8) -> u8) -> GrayImage {
    let (w, h) = a.dimensions();
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let av = a.get_pixel(x, y).0[0];
            let bv = b.get_pixel(x, y).0[0];
            out.put_pixel(x, y, Luma([combine(av, bv)]));
        }
    }
    out
}

/// Count nonzero pixels.
#[must_use]
pub fn count_nonzero(img: &GrayImage) -> usize {
    img.pixels().filter(|p| p.0[0] > 0).count()
}

/// Per-row count of nonzero columns.
#[must_use]
pub fn row_projection(img: &GrayImage) -> Vec<usize> {
    let (w, h) = img.dimensions();
    (0..h)
        .map(|y| (0..w).filter(|&x| img.get_pixel(x, y).0[0] > 0).count())
        .collect()
}

/// Per-column count of nonzero rows.
#[must_use]
pub fn col_projection(img: &GrayImage) -> Vec<usize> {
    let (w, h) = img.dimensions();
    (0..w)
        .map(|x| (0..h).filter(|&y| img.get_pixel(x, y).0[0] > 0).count())
        .collect()
}

/// Collapse runs of consecutive indices for which `meets(i)` holds into the
/// midpoint of each run. Used to turn a thick projected line band into a
/// single representative coordinate.
pub fn collapse_runs_to_midpoints(len: usize, meets: impl Fn(usize) -> bool) -> Vec<i64> {
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    for i in 0..=len {
        let hit = i < len && meets(i);
        match (hit, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let mid = (start + i - 1) / 2;
                out.push(mid as i64);
                run_start = None;
            }
            _ => {}
        }
    }
    out
}

/// Bounding boxes of the outer contours of every connected foreground
/// component, in pixel coordinates.
#[must_use]
pub fn find_component_rects(img: &GrayImage) -> Vec<PixelRect> {
    find_contours::<u32>(img)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|c| bounding_rect(&c.points))
        .collect()
}

fn bounding_rect(points: &[imageproc::point::Point<u32>]) -> Option<PixelRect> {
    if points.is_empty() {
        return None;
    }
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (u32::MAX, 0u32, u32::MAX, 0u32);
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    Some(PixelRect {
        x: i64::from(min_x),
        y: i64::from(min_y),
        w: i64::from(max_x - min_x + 1),
        h: i64::from(max_y - min_y + 1),
    })
}

/// Paint every pixel inside `rect` (clamped to the image) as foreground.
pub fn fill_rect(img: &mut GrayImage, rect: &PixelRect) {
    let (w, h) = img.dimensions();
    let y0 = rect.y.max(0);
    let y1 = rect.bottom().min(i64::from(h));
    let x0 = rect.x.max(0);
    let x1 = rect.right().min(i64::from(w));
    for y in y0..y1 {
        for x in x0..x1 {
            img.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, v: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([v]))
    }

    #[test]
    fn erode_shrinks_and_dilate_grows() {
        let mut img = solid(20, 20, 0);
        for x in 8..12 {
            img.put_pixel(x, 10, Luma([255]));
        }
        let eroded = erode_rect(&img, 3, 1);
        assert!(count_nonzero(&eroded) <= count_nonzero(&img));
        let dilated = dilate_rect(&img, 3, 1);
        assert!(count_nonzero(&dilated) >= count_nonzero(&img));
    }

    #[test]
    fn open_removes_small_component_keeps_long_one() {
        let mut img = solid(60, 60, 0);
        // A long horizontal run.
        for x in 5..55 {
            img.put_pixel(x, 30, Luma([255]));
        }
        // A small isolated dot.
        img.put_pixel(5, 5, Luma([255]));

        let opened = open_rect(&img, 15, 1);
        assert!(opened.get_pixel(30, 30).0[0] > 0);
        assert_eq!(opened.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn or_and_and_images() {
        let mut a = solid(4, 4, 0);
        let mut b = solid(4, 4, 0);
        a.put_pixel(0, 0, Luma([255]));
        b.put_pixel(0, 0, Luma([255]));
        b.put_pixel(1, 1, Luma([255]));

        let or = or_images(&a, &b);
        assert_eq!(count_nonzero(&or), 2);

        let and = and_images(&a, &b);
        assert_eq!(count_nonzero(&and), 1);
    }

    #[test]
    fn subtract_clears_masked_pixels() {
        let mut img = solid(4, 4, 255);
        let mut mask = solid(4, 4, 0);
        mask.put_pixel(0, 0, Luma([255]));
        let out = subtract_images(&img, &mask);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(1, 1).0[0], 255);
        img.put_pixel(1, 1, Luma([255]));
    }

    #[test]
    fn find_component_rects_finds_isolated_block() {
        let mut img = solid(40, 40, 0);
        for y in 10..20 {
            for x in 5..15 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let rects = find_component_rects(&img);
        assert_eq!(rects.len(), 1);
        assert_eq!(rects[0].w, 10);
        assert_eq!(rects[0].h, 10);
    }

    #[test]
    fn fill_rect_clamps_to_image_bounds() {
        let mut img = solid(10, 10, 0);
        fill_rect(
            &mut img,
            &PixelRect {
                x: 5,
                y: 5,
                w: 20,
                h: 20,
            },
        );
        assert_eq!(img.get_pixel(9, 9).0[0], 255);
        assert_eq!(img.get_pixel(4, 4).0[0], 0);
    }

    #[test]
    fn collapse_runs_finds_midpoints() {
        let hits = [false, true, true, true, false, false, true, true];
        let runs = collapse_runs_to_midpoints(hits.len(), |i| hits[i]);
        assert_eq!(runs, vec![2, 6]);
    }
}
