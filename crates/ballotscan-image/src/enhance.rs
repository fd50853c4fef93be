// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tone operations — Otsu thresholding, binarization, speckle removal and
// Floyd–Steinberg dithering.

use tracing::{debug, instrument};

use crate::buffer::PixelBuffer;

// -- Thresholding -------------------------------------------------------------

/// Compute the Otsu threshold over the image's luminosity.
///
/// Maximises the between-class variance of the dark and light pixel groups
/// and returns the brightest value still in the dark class, so binarizing
/// with `lum > threshold` splits the two clusters.
pub fn otsu_threshold(image: &PixelBuffer) -> u8 {
    let mut histogram = [0u64; 256];
    for y in 0..image.height() {
        for x in 0..image.width() {
            histogram[image.luminosity(x, y) as usize] += 1;
        }
    }
    otsu_from_histogram(&histogram)
}

fn otsu_from_histogram(histogram: &[u64; 256]) -> u8 {
    let total_pixels: u64 = histogram.iter().sum();
    if total_pixels == 0 {
        return 128;
    }

    let mut sum_total: f64 = 0.0;
    for (i, &count) in histogram.iter().enumerate() {
        sum_total += i as f64 * count as f64;
    }

    let mut sum_background: f64 = 0.0;
    let mut weight_background: u64 = 0;
    let mut max_variance: f64 = 0.0;
    let mut best_threshold: u8 = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count;
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total_pixels - weight_background;
        if weight_foreground == 0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum_total - sum_background) / weight_foreground as f64;

        let between_variance = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground).powi(2);

        if between_variance > max_variance {
            max_variance = between_variance;
            best_threshold = t as u8;
        }
    }

    best_threshold
}

/// Binarize using the Otsu threshold.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn binarize(image: &PixelBuffer) -> PixelBuffer {
    let threshold = otsu_threshold(image);
    debug!(threshold, "Otsu threshold computed");
    binarize_with_threshold(image, threshold)
}

/// Per pixel `lum > threshold ? 255 : 0`. RGBA output has identical color
/// channels and opaque alpha.
pub fn binarize_with_threshold(image: &PixelBuffer, threshold: u8) -> PixelBuffer {
    let mut out = image.clone();
    for y in 0..image.height() {
        for x in 0..image.width() {
            let value = if image.luminosity(x, y) > threshold { 255 } else { 0 };
            out.set_luminosity(x, y, value);
        }
    }
    out
}

// -- Denoise ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenoiseOptions {
    /// Luminosity of ink pixels. Everything else is background.
    pub foreground: u8,
    /// Foreground pixels with fewer orthogonal foreground neighbors than this
    /// are flipped to background.
    pub minimum_neighbors: u8,
}

impl Default for DenoiseOptions {
    fn default() -> Self {
        Self {
            foreground: 0,
            minimum_neighbors: 1,
        }
    }
}

/// Remove isolated speckle from a binarized image.
///
/// Neighbor counts are taken from the input, so removals never cascade.
pub fn denoise(image: &PixelBuffer, options: DenoiseOptions) -> PixelBuffer {
    let background = 255 - options.foreground;
    let (width, height) = (image.width(), image.height());
    let is_foreground = |x: i64, y: i64| {
        x >= 0
            && y >= 0
            && x < width as i64
            && y < height as i64
            && image.luminosity(x as u32, y as u32) == options.foreground
    };

    let mut out = image.clone();
    let mut removed = 0usize;
    for y in 0..height {
        for x in 0..width {
            let (xi, yi) = (x as i64, y as i64);
            if !is_foreground(xi, yi) {
                continue;
            }
            let neighbors = [(xi - 1, yi), (xi + 1, yi), (xi, yi - 1), (xi, yi + 1)]
                .into_iter()
                .filter(|&(nx, ny)| is_foreground(nx, ny))
                .count();
            if neighbors < options.minimum_neighbors as usize {
                out.set_luminosity(x, y, background);
                removed += 1;
            }
        }
    }
    debug!(removed, "denoise complete");
    out
}

// -- Dither -------------------------------------------------------------------

/// Floyd–Steinberg error diffusion to pure black and white.
///
/// Quantization error goes right (7/16), below-left (3/16), below (5/16) and
/// below-right (1/16).
pub fn dither(image: &PixelBuffer) -> PixelBuffer {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut working: Vec<f32> = Vec::with_capacity(width * height);
    for y in 0..image.height() {
        for x in 0..image.width() {
            working.push(image.luminosity(x, y) as f32);
        }
    }

    let mut out = image.clone();
    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            let old = working[i];
            let new = if old < 128.0 { 0.0 } else { 255.0 };
            let error = old - new;
            out.set_luminosity(x as u32, y as u32, new as u8);

            if x + 1 < width {
                working[i + 1] += error * 7.0 / 16.0;
            }
            if y + 1 < height {
                let below = i + width;
                if x > 0 {
                    working[below - 1] += error * 3.0 / 16.0;
                }
                working[below] += error * 5.0 / 16.0;
                if x + 1 < width {
                    working[below + 1] += error * 1.0 / 16.0;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[u8]) -> PixelBuffer {
        PixelBuffer::new(values.len() as u32, 1, 1, values.to_vec()).expect("buffer")
    }

    #[test]
    fn otsu_splits_bimodal_clusters() {
        let img = row(&[1, 2, 35, 98, 244, 255, 255, 255]);
        let threshold = otsu_threshold(&img);
        assert_eq!(threshold, 98);

        let binary = binarize(&img);
        assert_eq!(binary.data(), &[0, 0, 0, 0, 255, 255, 255, 255]);
    }

    #[test]
    fn otsu_agrees_with_imageproc_on_a_two_tone_image() {
        let mut data = vec![40u8; 50];
        data.extend(vec![210u8; 50]);
        let img = PixelBuffer::new(10, 10, 1, data).expect("buffer");

        let ours = otsu_threshold(&img);
        let gray = img.clone().into_dynamic().expect("dynamic").to_luma8();
        let theirs = imageproc::contrast::otsu_level(&gray);

        assert!((40..210).contains(&ours));
        assert!((40..=210).contains(&theirs));
    }

    #[test]
    fn binarize_is_idempotent_on_binary_images() {
        for channels in [1u8, 4] {
            let mut img = PixelBuffer::filled(4, 4, channels, 255).expect("filled");
            img.set_luminosity(1, 1, 0);
            img.set_luminosity(2, 3, 0);
            for threshold in [0u8, 1, 127, 254] {
                assert_eq!(binarize_with_threshold(&img, threshold), img);
            }
            assert_eq!(binarize(&img), img);
        }
    }

    #[test]
    fn binarize_rgba_forces_opaque_gray() {
        let img = PixelBuffer::new(2, 1, 4, vec![200, 200, 200, 10, 20, 20, 20, 0]).expect("buffer");
        let out = binarize_with_threshold(&img, 128);
        assert_eq!(out.data(), &[255, 255, 255, 255, 0, 0, 0, 255]);
    }

    #[test]
    fn denoise_removes_isolated_pixels_only() {
        let mut img = PixelBuffer::filled(5, 5, 1, 255).expect("filled");
        // Lone speck.
        img.set_luminosity(0, 0, 0);
        // Two-pixel stroke survives with the default of one neighbor.
        img.set_luminosity(3, 2, 0);
        img.set_luminosity(3, 3, 0);

        let out = denoise(&img, DenoiseOptions::default());
        assert_eq!(out.luminosity(0, 0), 255);
        assert_eq!(out.luminosity(3, 2), 0);
        assert_eq!(out.luminosity(3, 3), 0);
    }

    #[test]
    fn denoise_respects_minimum_neighbors() {
        let mut img = PixelBuffer::filled(3, 1, 4, 255).expect("filled");
        img.set_luminosity(0, 0, 0);
        img.set_luminosity(1, 0, 0);

        let strict = denoise(
            &img,
            DenoiseOptions {
                minimum_neighbors: 2,
                ..Default::default()
            },
        );
        assert_eq!(strict.luminosity(0, 0), 255);
        assert_eq!(strict.luminosity(1, 0), 255);
        assert_eq!(strict.channels(), 4);
    }

    #[test]
    fn dither_preserves_extremes() {
        let black = PixelBuffer::filled(6, 6, 1, 0).expect("filled");
        assert_eq!(dither(&black), black);
        let white = PixelBuffer::filled(6, 6, 4, 255).expect("filled");
        assert_eq!(dither(&white), white);
    }

    #[test]
    fn dither_mid_gray_is_roughly_half_black() {
        let gray = PixelBuffer::filled(20, 20, 1, 128).expect("filled");
        let out = dither(&gray);
        let black = out.data().iter().filter(|&&v| v == 0).count();
        assert!(out.data().iter().all(|&v| v == 0 || v == 255));
        assert!((150..=250).contains(&black), "black pixels: {black}");
    }
}
