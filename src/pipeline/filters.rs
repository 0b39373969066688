//! Pixel operations used by the enhancement pipeline.
//!
//! Pure functions over `image` buffers, no I/O and no randomness: the same
//! input always yields the same output. Everything after grayscale works on
//! single-channel 8-bit images.

use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use tracing::debug;

/// Spatial radius of the bilateral window.
pub const BILATERAL_RADIUS: u32 = 2;

/// Convert RGB to grayscale using ITU-R BT.601 luminance.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let (w, h) = rgb.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
        gray.put_pixel(x, y, Luma([luma.round().min(255.0) as u8]));
    }
    gray
}

/// Output dimensions for an integer upscale, capped so the long edge stays
/// within `max_dimension` while keeping the aspect ratio.
pub fn upscaled_dimensions(width: u32, height: u32, factor: u32, max_dimension: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let factor = factor.max(1);
    let target_w = width.saturating_mul(factor);
    let target_h = height.saturating_mul(factor);
    let largest = target_w.max(target_h);

    if max_dimension == 0 || largest <= max_dimension {
        return (target_w, target_h);
    }

    let scale = max_dimension as f64 / largest as f64;
    (
        ((target_w as f64 * scale).round() as u32).clamp(1, max_dimension),
        ((target_h as f64 * scale).round() as u32).clamp(1, max_dimension),
    )
}

/// Cubic (CatmullRom) upscale by an integer factor.
///
/// Oversized inputs are shrunk first so the result never exceeds
/// `max_dimension` on its long edge.
pub fn upscale(img: &GrayImage, factor: u32, max_dimension: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let (new_w, new_h) = upscaled_dimensions(w, h, factor, max_dimension);
    if (new_w, new_h) == (w, h) {
        return img.clone();
    }

    debug!(
        from = format!("{w}x{h}"),
        to = format!("{new_w}x{new_h}"),
        "Upscaling image"
    );
    image::imageops::resize(img, new_w, new_h, FilterType::CatmullRom)
}

/// Edge-preserving bilateral filter on a grayscale image.
///
/// `range_sigma` controls how different a neighbour may be before it stops
/// contributing; smaller values keep edges sharper. A sigma of 0 returns the
/// input unchanged.
pub fn bilateral_denoise(img: &GrayImage, radius: u32, range_sigma: f32) -> GrayImage {
    if range_sigma <= 0.0 || radius == 0 {
        return img.clone();
    }

    let (w, h) = img.dimensions();
    let r = radius as i64;

    // Gaussian weights indexed by absolute intensity difference.
    let range_lut: Vec<f32> = (0..256)
        .map(|d| {
            let d = d as f32;
            (-(d * d) / (2.0 * range_sigma * range_sigma)).exp()
        })
        .collect();

    let space_sigma = radius as f32;
    let side = (2 * radius + 1) as usize;
    let mut space_kernel = vec![0.0f32; side * side];
    for dy in -r..=r {
        for dx in -r..=r {
            let dist_sq = (dx * dx + dy * dy) as f32;
            space_kernel[((dy + r) as usize) * side + (dx + r) as usize] =
                (-dist_sq / (2.0 * space_sigma * space_sigma)).exp();
        }
    }

    let mut output = GrayImage::new(w, h);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let center = img.get_pixel(x as u32, y as u32).0[0];
            let mut sum = 0.0f32;
            let mut weight_sum = 0.0f32;

            for dy in -r..=r {
                let ny = y + dy;
                if ny < 0 || ny >= h as i64 {
                    continue;
                }
                for dx in -r..=r {
                    let nx = x + dx;
                    if nx < 0 || nx >= w as i64 {
                        continue;
                    }
                    let value = img.get_pixel(nx as u32, ny as u32).0[0];
                    let weight = space_kernel[((dy + r) as usize) * side + (dx + r) as usize]
                        * range_lut[(value as i16 - center as i16).unsigned_abs() as usize];
                    sum += value as f32 * weight;
                    weight_sum += weight;
                }
            }

            let filtered = if weight_sum > 0.0 {
                (sum / weight_sum).round().clamp(0.0, 255.0) as u8
            } else {
                center
            };
            output.put_pixel(x as u32, y as u32, Luma([filtered]));
        }
    }
    output
}

/// Contrast-limited adaptive histogram equalisation.
///
/// The image is split into a `grid`×`grid` tile layout (fewer tiles when the
/// image is smaller than the grid). Each tile gets its own clipped
/// equalisation table and pixels blend the four nearest tables bilinearly.
pub fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || grid == 0 {
        return img.clone();
    }

    let tile_w = ceil_div(w, grid.min(w));
    let tile_h = ceil_div(h, grid.min(h));
    let tiles_x = ceil_div(w, tile_w);
    let tiles_y = ceil_div(h, tile_h);

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts.push(tile_lut(img, x0, y0, x1, y1, clip_limit));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let mut output = GrayImage::new(w, h);

    for y in 0..h {
        let (ty0, ty1, ay) = blend_coords(y, tile_h, tiles_y);
        for x in 0..w {
            let (tx0, tx1, ax) = blend_coords(x, tile_w, tiles_x);
            let v = img.get_pixel(x, y).0[0] as usize;

            let top = lut_at(tx0, ty0)[v] as f32 * (1.0 - ax) + lut_at(tx1, ty0)[v] as f32 * ax;
            let bottom = lut_at(tx0, ty1)[v] as f32 * (1.0 - ax) + lut_at(tx1, ty1)[v] as f32 * ax;
            let value = top * (1.0 - ay) + bottom * ay;

            output.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    output
}

fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b.max(1)
}

/// Neighbouring tile indices and blend weight for one axis.
fn blend_coords(pos: u32, tile_size: u32, tiles: u32) -> (u32, u32, f32) {
    let f = (pos as f32 + 0.5) / tile_size as f32 - 0.5;
    let last = tiles - 1;
    if f <= 0.0 {
        return (0, 0, 0.0);
    }
    let t0 = (f.floor() as u32).min(last);
    if t0 >= last {
        return (last, last, 0.0);
    }
    (t0, t0 + 1, f - t0 as f32)
}

/// Clipped equalisation table for one tile.
fn tile_lut(img: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y).0[0] as usize] += 1;
        }
    }

    let area = ((x1 - x0) * (y1 - y0)).max(1);

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let share = excess / 256;
        let remainder = (excess % 256) as usize;
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin += share + u32::from(i < remainder);
        }
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (i, count) in hist.iter().enumerate() {
        cdf += count;
        lut[i] = ((cdf as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
    }
    lut
}

/// Normalised 1-D Gaussian kernel for an odd window size.
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as i32;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= total;
    }
    kernel
}

/// Gaussian-weighted adaptive threshold.
///
/// A pixel becomes white (255) iff its value exceeds the Gaussian-weighted
/// mean of its `block_size` neighbourhood minus `offset`; otherwise black.
/// Borders replicate the edge pixels. `block_size` must be odd and >= 3.
pub fn adaptive_threshold(img: &GrayImage, block_size: u32, offset: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }

    let kernel = gaussian_kernel(block_size.max(3) | 1);
    let half = (kernel.len() / 2) as i64;
    let clamp = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as u32;

    // Horizontal pass
    let mut horizontal = vec![0.0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sx = clamp(x as i64 + i as i64 - half, w);
                acc += img.get_pixel(sx, y).0[0] as f32 * k;
            }
            horizontal[(y * w + x) as usize] = acc;
        }
    }

    // Vertical pass + compare
    let mut output = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut mean = 0.0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sy = clamp(y as i64 + i as i64 - half, h);
                mean += horizontal[(sy * w + x) as usize] * k;
            }
            let value = img.get_pixel(x, y).0[0] as f32;
            let out = if value > mean - offset { 255 } else { 0 };
            output.put_pixel(x, y, Luma([out]));
        }
    }
    output
}

/// Morphological closing of dark strokes.
///
/// Min filter (grows ink) followed by a max filter over the mirrored window
/// (shrinks it back), bridging gaps thinner than the kernel. Borders
/// replicate. A kernel of 0 or 1 is a no-op.
pub fn close_ink(img: &GrayImage, kernel: u32) -> GrayImage {
    if kernel <= 1 {
        return img.clone();
    }
    let anchor = (kernel / 2) as i64;
    let lo = -anchor;
    let hi = kernel as i64 - 1 - anchor;

    let grown = rank_filter(img, lo, hi, u8::min, u8::MAX);
    rank_filter(&grown, -hi, -lo, u8::max, u8::MIN)
}

/// Separable min/max filter over the window `[lo, hi]` on both axes.
fn rank_filter(img: &GrayImage, lo: i64, hi: i64, pick: fn(u8, u8) -> u8, init: u8) -> GrayImage {
    let (w, h) = img.dimensions();
    let clamp = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as u32;

    let mut rows = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = (lo..=hi).fold(init, |acc, d| {
                pick(acc, img.get_pixel(clamp(x as i64 + d, w), y).0[0])
            });
            rows.put_pixel(x, y, Luma([v]));
        }
    }

    let mut output = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = (lo..=hi).fold(init, |acc, d| {
                pick(acc, rows.get_pixel(x, clamp(y as i64 + d, h)).0[0])
            });
            output.put_pixel(x, y, Luma([v]));
        }
    }
    output
}
