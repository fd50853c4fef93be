// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw pixel buffer with an explicit channel count (1 = gray, 4 = RGBA), plus
// the geometric primitives crop and rotate180.

use ballotscan_core::error::BallotscanError;
use ballotscan_core::types::Rect;
use image::{DynamicImage, GrayImage, RgbaImage};
use thiserror::Error;

/// Errors raised by pixel-buffer primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("unsupported channel count {0} (expected 1 or 4)")]
    UnsupportedChannels(u8),

    #[error("channel count mismatch: {left} vs {right}")]
    ChannelMismatch { left: u8, right: u8 },

    #[error("bounds size mismatch: {left_width}x{left_height} vs {right_width}x{right_height}")]
    BoundsMismatch {
        left_width: u32,
        left_height: u32,
        right_width: u32,
        right_height: u32,
    },

    #[error("bounds {x},{y} {width}x{height} exceed image {image_width}x{image_height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("buffer holds {actual} bytes, {expected} required")]
    BufferSize { expected: usize, actual: usize },

    #[error("image codec failed: {0}")]
    Codec(String),
}

impl From<ImageError> for BallotscanError {
    fn from(err: ImageError) -> Self {
        BallotscanError::Image(err.to_string())
    }
}

/// A width × height × channels byte buffer, row-major, no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl PixelBuffer {
    // -- Construction ---------------------------------------------------------

    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self, ImageError> {
        check_channels(channels)?;
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(ImageError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Uniform image. For RGBA the color channels take `value` and alpha is
    /// opaque.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Result<Self, ImageError> {
        check_channels(channels)?;
        let pixel: &[u8] = if channels == 1 {
            &[value]
        } else {
            &[value, value, value, 255]
        };
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * channels as usize)
            .collect();
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Gray images stay single-channel; everything else becomes RGBA.
    pub fn from_dynamic(image: &DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => Self {
                width: gray.width(),
                height: gray.height(),
                channels: 1,
                data: gray.as_raw().clone(),
            },
            other => {
                let rgba = other.to_rgba8();
                Self {
                    width: rgba.width(),
                    height: rgba.height(),
                    channels: 4,
                    data: rgba.into_raw(),
                }
            }
        }
    }

    pub fn into_dynamic(self) -> Result<DynamicImage, ImageError> {
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        let actual = self.data.len();
        let image = match self.channels {
            1 => GrayImage::from_raw(self.width, self.height, self.data).map(DynamicImage::ImageLuma8),
            _ => RgbaImage::from_raw(self.width, self.height, self.data).map(DynamicImage::ImageRgba8),
        };
        image.ok_or(ImageError::BufferSize { expected, actual })
    }

    /// Single-channel copy holding each pixel's luminosity.
    pub fn to_gray(&self) -> Self {
        if self.channels == 1 {
            return self.clone();
        }
        let data = self
            .data
            .chunks_exact(4)
            .map(|px| rgb_luminosity(px[0], px[1], px[2]))
            .collect();
        Self {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    // -- Accessors ------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Luminosity of the pixel at `(x, y)`. Caller guarantees the coordinate
    /// is in range.
    pub fn luminosity(&self, x: u32, y: u32) -> u8 {
        let i = self.offset(x, y);
        match self.channels {
            1 => self.data[i],
            _ => rgb_luminosity(self.data[i], self.data[i + 1], self.data[i + 2]),
        }
    }

    /// Set a pixel to a gray level; alpha becomes opaque on RGBA buffers.
    pub fn set_luminosity(&mut self, x: u32, y: u32, value: u8) {
        let i = self.offset(x, y);
        match self.channels {
            1 => self.data[i] = value,
            _ => self.data[i..i + 4].copy_from_slice(&[value, value, value, 255]),
        }
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels as usize
    }

    /// Fail unless `bounds` lies entirely inside this image.
    pub fn check_bounds(&self, bounds: &Rect) -> Result<(), ImageError> {
        let fits_x = bounds.x as u64 + bounds.width as u64 <= self.width as u64;
        let fits_y = bounds.y as u64 + bounds.height as u64 <= self.height as u64;
        if fits_x && fits_y {
            Ok(())
        } else {
            Err(ImageError::OutOfBounds {
                x: bounds.x,
                y: bounds.y,
                width: bounds.width,
                height: bounds.height,
                image_width: self.width,
                image_height: self.height,
            })
        }
    }

    // -- Geometry -------------------------------------------------------------

    /// Copy out the sub-image covered by `bounds`.
    pub fn crop(&self, bounds: Rect) -> Result<Self, ImageError> {
        self.check_bounds(&bounds)?;
        let channels = self.channels as usize;
        let row_len = bounds.width as usize * channels;
        let mut data = Vec::with_capacity(row_len * bounds.height as usize);
        for y in bounds.y..bounds.y + bounds.height {
            let start = self.offset(bounds.x, y);
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Ok(Self {
            width: bounds.width,
            height: bounds.height,
            channels: self.channels,
            data,
        })
    }

    /// Rotate 180° in place by reversing the order of whole pixels.
    pub fn rotate180(&mut self) {
        let channels = self.channels as usize;
        let pixels = self.data.len() / channels;
        for i in 0..pixels / 2 {
            let j = pixels - 1 - i;
            for c in 0..channels {
                self.data.swap(i * channels + c, j * channels + c);
            }
        }
    }
}

fn check_channels(channels: u8) -> Result<(), ImageError> {
    match channels {
        1 | 4 => Ok(()),
        other => Err(ImageError::UnsupportedChannels(other)),
    }
}

/// ITU-R BT.601 luma, integer arithmetic.
fn rgb_luminosity(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, channels: u8) -> PixelBuffer {
        let len = width as usize * height as usize * channels as usize;
        let data = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        PixelBuffer::new(width, height, channels, data).expect("buffer")
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        assert_eq!(
            PixelBuffer::new(1, 1, 3, vec![0, 0, 0]),
            Err(ImageError::UnsupportedChannels(3))
        );
        assert!(matches!(
            PixelBuffer::new(2, 2, 1, vec![0; 3]),
            Err(ImageError::BufferSize { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn rotate180_twice_is_identity() {
        for channels in [1, 4] {
            for (w, h) in [(1, 1), (3, 2), (5, 5), (4, 7)] {
                let original = gradient(w, h, channels);
                let mut rotated = original.clone();
                rotated.rotate180();
                rotated.rotate180();
                assert_eq!(rotated, original);
            }
        }
    }

    #[test]
    fn rotate180_keeps_pixel_channels_together() {
        let mut img = PixelBuffer::new(2, 1, 4, vec![1, 2, 3, 4, 5, 6, 7, 8]).expect("buffer");
        img.rotate180();
        assert_eq!(img.data(), &[5, 6, 7, 8, 1, 2, 3, 4]);
    }

    #[test]
    fn crop_extracts_sub_rectangle() {
        let img = PixelBuffer::new(3, 3, 1, (0..9).collect()).expect("buffer");
        let cropped = img.crop(Rect::new(1, 1, 2, 2)).expect("crop");
        assert_eq!(cropped.data(), &[4, 5, 7, 8]);
    }

    #[test]
    fn crop_is_bounds_checked() {
        let img = gradient(4, 4, 4);
        assert!(matches!(
            img.crop(Rect::new(2, 2, 3, 1)),
            Err(ImageError::OutOfBounds { .. })
        ));
        assert!(img.crop(Rect::new(0, 0, 4, 4)).is_ok());
    }

    #[test]
    fn dynamic_round_trip_preserves_channels() {
        let gray = gradient(3, 2, 1);
        let back = PixelBuffer::from_dynamic(&gray.clone().into_dynamic().expect("dynamic"));
        assert_eq!(back, gray);

        let rgb = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30])));
        let converted = PixelBuffer::from_dynamic(&rgb);
        assert_eq!(converted.channels(), 4);
        assert_eq!(&converted.data()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn filled_rgba_is_opaque() {
        let img = PixelBuffer::filled(2, 1, 4, 9).expect("filled");
        assert_eq!(img.data(), &[9, 9, 9, 255, 9, 9, 9, 255]);
        assert_eq!(img.luminosity(1, 0), 9);
    }
}
