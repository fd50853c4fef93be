// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Luminosity diff against a template, and fill-ratio scoring of a region.

use ballotscan_core::types::Rect;

use crate::buffer::{ImageError, PixelBuffer};

/// One-sided difference of two equally sized regions.
///
/// Each output channel is `255 - max(base - compare, 0)`: white wherever
/// `compare` is at least as light as `base`, darker where `compare` has ink
/// the template lacks. Swapping the arguments gives a different image.
pub fn diff(
    base: &PixelBuffer,
    compare: &PixelBuffer,
    base_bounds: Rect,
    compare_bounds: Rect,
) -> Result<PixelBuffer, ImageError> {
    if base.channels() != compare.channels() {
        return Err(ImageError::ChannelMismatch {
            left: base.channels(),
            right: compare.channels(),
        });
    }
    if (base_bounds.width, base_bounds.height) != (compare_bounds.width, compare_bounds.height) {
        return Err(ImageError::BoundsMismatch {
            left_width: base_bounds.width,
            left_height: base_bounds.height,
            right_width: compare_bounds.width,
            right_height: compare_bounds.height,
        });
    }

    let base_region = base.crop(base_bounds)?;
    let compare_region = compare.crop(compare_bounds)?;

    let mut out = base_region;
    for (dst, &cmp) in out.data_mut().iter_mut().zip(compare_region.data()) {
        *dst = 255 - dst.saturating_sub(cmp);
    }
    Ok(out)
}

/// Fraction of pixels inside `bounds` whose luminosity is below `threshold`.
pub fn fill_ratio(image: &PixelBuffer, bounds: Rect, threshold: u8) -> Result<f32, ImageError> {
    image.check_bounds(&bounds)?;
    let area = bounds.width as u64 * bounds.height as u64;
    if area == 0 {
        return Ok(0.0);
    }
    let mut dark = 0u64;
    for y in bounds.y..bounds.y + bounds.height {
        for x in bounds.x..bounds.x + bounds.width {
            if image.luminosity(x, y) < threshold {
                dark += 1;
            }
        }
    }
    Ok(dark as f32 / area as f32)
}
