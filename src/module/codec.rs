//! Pixel compression strategies for image frames.
//!
//! Each strategy implements [`PixelCodec`]: `compress` takes the frame
//! geometry so encoders that need it (PNG) can reconstruct the image,
//! `decompress` is geometry-free, and `supports` gates channel/bit-depth
//! combinations. Strategy failures are hard errors — a frame that cannot
//! be encoded losslessly must not be silently written raw.

use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};

use crate::compress;
use crate::error::{Result, UmdfError};
use crate::format::types::CompressionKind;

pub trait PixelCodec: std::fmt::Debug {
    fn kind(&self) -> CompressionKind;

    fn supports(&self, channels: u8, bit_depth: u8) -> bool;

    fn compress(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        channels: u8,
        bit_depth: u8,
    ) -> Result<Vec<u8>>;

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Look up the strategy for an encoding kind.
pub fn codec_for(kind: CompressionKind) -> Result<Box<dyn PixelCodec>> {
    match kind {
        CompressionKind::Raw => Ok(Box::new(RawCodec)),
        CompressionKind::Png => Ok(Box::new(PngCodec)),
        CompressionKind::Zstd => Ok(Box::new(ZstdPixelCodec)),
        CompressionKind::Jpeg2000Lossless => Err(UmdfError::Format(
            "JPEG 2000 pixel encoding is not supported by this build".into(),
        )),
    }
}

// ── Raw ────────────────────────────────────────────────────────────

/// Identity strategy.
#[derive(Debug)]
pub struct RawCodec;

impl PixelCodec for RawCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Raw
    }

    fn supports(&self, _channels: u8, _bit_depth: u8) -> bool {
        true
    }

    fn compress(
        &self,
        pixels: &[u8],
        _width: u16,
        _height: u16,
        _channels: u8,
        _bit_depth: u8,
    ) -> Result<Vec<u8>> {
        Ok(pixels.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

// ── Zstd ───────────────────────────────────────────────────────────

/// General-purpose lossless fallback for pixel payloads.
#[derive(Debug)]
pub struct ZstdPixelCodec;

impl PixelCodec for ZstdPixelCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn supports(&self, _channels: u8, _bit_depth: u8) -> bool {
        true
    }

    fn compress(
        &self,
        pixels: &[u8],
        _width: u16,
        _height: u16,
        _channels: u8,
        _bit_depth: u8,
    ) -> Result<Vec<u8>> {
        compress::compress(pixels)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        compress::decompress(bytes)
    }
}

// ── PNG ────────────────────────────────────────────────────────────

/// Lossless PNG for 1- or 3-channel frames at 8 or 16 bits per sample.
/// 16-bit samples travel little-endian in frame payloads.
#[derive(Debug)]
pub struct PngCodec;

impl PixelCodec for PngCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Png
    }

    fn supports(&self, channels: u8, bit_depth: u8) -> bool {
        matches!(channels, 1 | 3) && matches!(bit_depth, 8 | 16)
    }

    fn compress(
        &self,
        pixels: &[u8],
        width: u16,
        height: u16,
        channels: u8,
        bit_depth: u8,
    ) -> Result<Vec<u8>> {
        if !self.supports(channels, bit_depth) {
            return Err(UmdfError::Format(format!(
                "PNG encoding does not support {channels} channels at {bit_depth} bits"
            )));
        }
        let width = width as u32;
        let height = height as u32;
        let expected =
            width as usize * height as usize * channels as usize * (bit_depth as usize / 8);
        if pixels.len() != expected {
            return Err(UmdfError::Format(format!(
                "Frame pixel buffer is {} bytes, expected {expected}",
                pixels.len()
            )));
        }

        let img = match (channels, bit_depth) {
            (1, 8) => ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels.to_vec())
                .map(DynamicImage::ImageLuma8),
            (3, 8) => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, pixels.to_vec())
                .map(DynamicImage::ImageRgb8),
            (1, 16) => ImageBuffer::<Luma<u16>, _>::from_raw(width, height, le_to_u16(pixels))
                .map(DynamicImage::ImageLuma16),
            (3, 16) => ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, le_to_u16(pixels))
                .map(DynamicImage::ImageRgb16),
            _ => unreachable!(),
        }
        .ok_or_else(|| UmdfError::Format("Frame geometry does not match pixel buffer".into()))?;

        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|e| UmdfError::Format(format!("PNG encoding failed: {e}")))?;
        Ok(out.into_inner())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|e| UmdfError::Format(format!("PNG decoding failed: {e}")))?;
        match img {
            DynamicImage::ImageLuma8(buf) => Ok(buf.into_raw()),
            DynamicImage::ImageRgb8(buf) => Ok(buf.into_raw()),
            DynamicImage::ImageLuma16(buf) => Ok(u16_to_le(&buf.into_raw())),
            DynamicImage::ImageRgb16(buf) => Ok(u16_to_le(&buf.into_raw())),
            other => Err(UmdfError::Format(format!(
                "Unsupported PNG color type: {:?}",
                other.color()
            ))),
        }
    }
}

fn le_to_u16(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn u16_to_le(samples: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
