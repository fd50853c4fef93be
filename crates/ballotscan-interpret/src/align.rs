// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Register a scanned hand-marked page against its template: pick the
// orientation, resample to template size, then search a small window of
// translations for the best fit.

use tracing::debug;

use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::types::Rect;
use ballotscan_image::{PixelBuffer, resize_exact};

/// Largest translation searched in either axis, in template pixels.
pub const MAX_ALIGNMENT_OFFSET: i32 = 8;

/// Mean absolute luminosity difference above which a page is considered not
/// to be a scan of the template at all.
pub const MAX_MEAN_MISMATCH: f64 = 64.0;

/// A page registered to its template.
#[derive(Debug, Clone)]
pub struct AlignedPage {
    /// Upright page resampled to template dimensions.
    pub image: PixelBuffer,
    /// Translation from template to page coordinates.
    pub offset: (i32, i32),
    pub rotated: bool,
}

impl AlignedPage {
    /// Template-space `bounds` moved into page space, kept inside the image.
    pub fn map_bounds(&self, bounds: Rect) -> Rect {
        let shifted = bounds.offset(self.offset.0, self.offset.1);
        let max_x = self.image.width().saturating_sub(bounds.width);
        let max_y = self.image.height().saturating_sub(bounds.height);
        Rect {
            x: shifted.x.min(max_x),
            y: shifted.y.min(max_y),
            ..shifted
        }
    }
}

/// Sum of absolute differences between `template(x, y)` and
/// `page(x + dx, y + dy)` over a sampled interior, with the sample count.
fn mismatch(template: &PixelBuffer, page: &PixelBuffer, dx: i32, dy: i32, margin: u32, step: u32) -> (u64, u64) {
    let (w, h) = (template.width(), template.height());
    let mut total = 0u64;
    let mut samples = 0u64;
    for y in (margin..h - margin).step_by(step as usize) {
        for x in (margin..w - margin).step_by(step as usize) {
            let px = (x as i64 + dx as i64) as u32;
            let py = (y as i64 + dy as i64) as u32;
            total += template.luminosity(x, y).abs_diff(page.luminosity(px, py)) as u64;
            samples += 1;
        }
    }
    (total, samples)
}

/// Best translation for `page`, its summed mismatch and sample count.
fn best_offset(template: &PixelBuffer, page: &PixelBuffer, radius: i32, step: u32) -> ((i32, i32), u64, u64) {
    let margin = radius as u32;
    let (mut best_total, samples) = mismatch(template, page, 0, 0, margin, step);
    let mut best = (0, 0);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if (dx, dy) == (0, 0) {
                continue;
            }
            let (total, _) = mismatch(template, page, dx, dy, margin, step);
            if total < best_total {
                best_total = total;
                best = (dx, dy);
            }
        }
    }
    (best, best_total, samples)
}

/// Align `page` to `template`. Both are reduced to grayscale.
pub fn align_to_template(page: &PixelBuffer, template: &PixelBuffer) -> Result<AlignedPage> {
    let template = template.to_gray();
    let (w, h) = (template.width(), template.height());
    if w == 0 || h == 0 {
        return Err(BallotscanError::Interpretation("template has no pixels".into()));
    }

    let upright = resize_exact(&page.to_gray(), w, h)?;
    let mut flipped = upright.clone();
    flipped.rotate180();

    let radius = if w > 4 * MAX_ALIGNMENT_OFFSET as u32 && h > 4 * MAX_ALIGNMENT_OFFSET as u32 {
        MAX_ALIGNMENT_OFFSET
    } else {
        0
    };
    let step = (w.min(h) / 200).max(1);

    let (up_offset, up_total, samples) = best_offset(&template, &upright, radius, step);
    let (flip_offset, flip_total, _) = best_offset(&template, &flipped, radius, step);
    let (image, offset, total, rotated) = if flip_total < up_total {
        (flipped, flip_offset, flip_total, true)
    } else {
        (upright, up_offset, up_total, false)
    };

    let mean = total as f64 / samples.max(1) as f64;
    debug!(?offset, rotated, mean, "page aligned to template");
    if mean > MAX_MEAN_MISMATCH {
        return Err(BallotscanError::Interpretation(format!(
            "page does not match template (mean mismatch {mean:.1})"
        )));
    }

    Ok(AlignedPage {
        image,
        offset,
        rotated,
    })
}
