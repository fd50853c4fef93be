// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Codec and resampling helpers at the edge of the pixel-buffer world: load
// page scans, resize to template dimensions, encode PNGs, and count ink blobs.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageFormat, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::{debug, info, instrument};

use crate::buffer::{ImageError, PixelBuffer};
use crate::enhance::binarize_with_threshold;

/// Load an image file as a single-channel buffer.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_grayscale(path: impl AsRef<Path>) -> Result<PixelBuffer, ImageError> {
    let img = image::open(path.as_ref()).map_err(|err| {
        ImageError::Codec(format!("failed to open {}: {}", path.as_ref().display(), err))
    })?;
    info!(width = img.width(), height = img.height(), "Image loaded");
    Ok(PixelBuffer::from_dynamic(&DynamicImage::ImageLuma8(img.to_luma8())))
}

/// Decode encoded bytes (PNG, JPEG, ...) as a single-channel buffer.
pub fn decode_grayscale(data: &[u8]) -> Result<PixelBuffer, ImageError> {
    let img = image::load_from_memory(data)
        .map_err(|err| ImageError::Codec(format!("failed to decode image: {err}")))?;
    Ok(PixelBuffer::from_dynamic(&DynamicImage::ImageLuma8(img.to_luma8())))
}

/// Resize to exactly `width` x `height`, ignoring aspect ratio.
pub fn resize_exact(image: &PixelBuffer, width: u32, height: u32) -> Result<PixelBuffer, ImageError> {
    if (image.width(), image.height()) == (width, height) {
        return Ok(image.clone());
    }
    let resized = image.clone().into_dynamic()?.resize_exact(
        width,
        height,
        image::imageops::FilterType::Triangle,
    );
    debug!(width, height, "Resize complete");
    Ok(match image.channels() {
        1 => PixelBuffer::from_dynamic(&DynamicImage::ImageLuma8(resized.to_luma8())),
        _ => PixelBuffer::from_dynamic(&resized),
    })
}

/// Encode as PNG bytes.
pub fn encode_png(image: &PixelBuffer) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    image
        .clone()
        .into_dynamic()?
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| ImageError::Codec(format!("PNG encoding failed: {err}")))?;
    Ok(bytes)
}

/// Write a PNG file.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn write_png(image: &PixelBuffer, path: impl AsRef<Path>) -> Result<(), ImageError> {
    let bytes = encode_png(image)?;
    std::fs::write(path.as_ref(), bytes)
        .map_err(|err| ImageError::Codec(format!("failed to write {}: {err}", path.as_ref().display())))
}

/// Number of 8-connected ink regions (luminosity `<= threshold`) with at
/// least `min_area` pixels.
pub fn ink_blob_count(image: &PixelBuffer, threshold: u8, min_area: u32) -> Result<usize, ImageError> {
    let binary = binarize_with_threshold(&image.to_gray(), threshold);
    let gray = binary.into_dynamic()?.to_luma8();
    let labels = connected_components(&gray, Connectivity::Eight, Luma([255u8]));

    let mut areas: HashMap<u32, u32> = HashMap::new();
    for label in labels.pixels() {
        if label.0[0] != 0 {
            *areas.entry(label.0[0]).or_default() += 1;
        }
    }
    let count = areas.values().filter(|&&area| area >= min_area).count();
    debug!(count, components = areas.len(), "Ink blobs counted");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballotscan_core::types::Rect;

    fn page_with_square(size: u32, square: Rect) -> PixelBuffer {
        let mut img = PixelBuffer::filled(size, size, 1, 255).expect("white");
        for y in square.y..square.y + square.height {
            for x in square.x..square.x + square.width {
                img.set_luminosity(x, y, 0);
            }
        }
        img
    }

    #[test]
    fn png_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.png");
        let img = page_with_square(16, Rect::new(4, 4, 3, 3));

        write_png(&img, &path).expect("write");
        let loaded = load_grayscale(&path).expect("load");
        assert_eq!(loaded, img);
    }

    #[test]
    fn resize_exact_changes_dimensions() {
        let img = page_with_square(20, Rect::new(0, 0, 10, 10));
        let out = resize_exact(&img, 10, 5).expect("resize");
        assert_eq!((out.width(), out.height(), out.channels()), (10, 5, 1));
        assert!(out.luminosity(1, 1) < 128);
        assert!(out.luminosity(8, 4) > 128);
    }

    #[test]
    fn ink_blob_count_ignores_specks() {
        let mut img = page_with_square(30, Rect::new(2, 2, 5, 5));
        for y in 20..24 {
            for x in 20..24 {
                img.set_luminosity(x, y, 0);
            }
        }
        img.set_luminosity(12, 28, 0);

        assert_eq!(ink_blob_count(&img, 128, 4).expect("count"), 2);
        assert_eq!(ink_blob_count(&img, 128, 1).expect("count"), 3);

        let blank = PixelBuffer::filled(30, 30, 1, 250).expect("blank");
        assert_eq!(ink_blob_count(&blank, 128, 1).expect("count"), 0);
    }
}
