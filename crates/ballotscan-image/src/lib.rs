// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan-image — Stateless pixel-buffer operations used for mark scoring
// and template alignment.

pub mod buffer;
pub mod diff;
pub mod enhance;
pub mod processor;

pub use buffer::{ImageError, PixelBuffer};
pub use diff::{diff, fill_ratio};
pub use enhance::{
    DenoiseOptions, binarize, binarize_with_threshold, denoise, dither, otsu_threshold,
};
pub use processor::{
    decode_grayscale, encode_png, ink_blob_count, load_grayscale, resize_exact, write_png,
};
