//! Image module structure: dimensions, sample format and pixel encoding.
//!
//! An image module's metadata carries an `image_structure` object:
//! `dimensions` (width, height, then frame axes), optional
//! `dimension_names`, `bit_depth`, `channels`, and the pixel `encoding`
//! enum. The frame count is the product of the dimensions beyond the
//! first two. Frames themselves are embedded sub-modules in the image
//! data section; their schema comes from the `frames.$ref` entry of the
//! image schema's data section.

use serde_json::Value;

use crate::error::{Result, UmdfError};
use crate::format::types::CompressionKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStructure {
    /// Width, height, then one entry per frame axis.
    pub dimensions: Vec<u16>,
    pub dimension_names: Vec<String>,
    pub bit_depth: u8,
    pub channels: u8,
    pub encoding: CompressionKind,
}

impl ImageStructure {
    /// Parse from one metadata row object containing `image_structure`.
    pub fn from_metadata(row: &Value) -> Result<Self> {
        let structure = row
            .get("image_structure")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                UmdfError::Schema("Image metadata missing 'image_structure' object".into())
            })?;

        let dims_value = structure
            .get("dimensions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                UmdfError::Schema("'dimensions' array is required in image_structure".into())
            })?;
        if dims_value.len() < 2 {
            return Err(UmdfError::Schema(
                "'dimensions' must have at least 2 elements (width, height)".into(),
            ));
        }
        let mut dimensions = Vec::with_capacity(dims_value.len());
        for (i, dim) in dims_value.iter().enumerate() {
            let v = dim.as_u64().ok_or_else(|| {
                UmdfError::Schema(format!("Dimension {i} must be a number, got {dim}"))
            })?;
            if v == 0 || v > u16::MAX as u64 {
                return Err(UmdfError::Schema(format!(
                    "Dimension {i} out of range: {v}"
                )));
            }
            dimensions.push(v as u16);
        }

        let dimension_names = match structure.get("dimension_names").and_then(Value::as_array) {
            Some(names) => {
                let mut out = Vec::with_capacity(dimensions.len());
                for i in 0..dimensions.len() {
                    match names.get(i).and_then(Value::as_str) {
                        Some(name) => out.push(name.to_owned()),
                        None => out.push(default_dimension_name(i)),
                    }
                }
                out
            }
            None => (0..dimensions.len()).map(default_dimension_name).collect(),
        };

        let bit_depth = structure
            .get("bit_depth")
            .and_then(Value::as_u64)
            .unwrap_or(8) as u8;
        if !matches!(bit_depth, 8 | 16 | 32) {
            return Err(UmdfError::Schema(format!(
                "Unsupported bit depth: {bit_depth}"
            )));
        }

        let channels = structure
            .get("channels")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u8;
        if channels == 0 {
            return Err(UmdfError::Schema("'channels' must be at least 1".into()));
        }

        let encoding = match structure.get("encoding") {
            Some(value) => {
                let name = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!("'encoding' must be a string, got {value}"))
                })?;
                CompressionKind::from_name(name).ok_or_else(|| {
                    UmdfError::Schema(format!("Unknown pixel encoding: {name}"))
                })?
            }
            None => CompressionKind::Raw,
        };

        Ok(Self {
            dimensions,
            dimension_names,
            bit_depth,
            channels,
            encoding,
        })
    }

    pub fn width(&self) -> u16 {
        self.dimensions[0]
    }

    pub fn height(&self) -> u16 {
        self.dimensions[1]
    }

    /// Product of the dimensions beyond width and height; 1 for a plain
    /// 2-D image.
    pub fn frame_count(&self) -> usize {
        self.dimensions[2..]
            .iter()
            .map(|&d| d as usize)
            .product::<usize>()
            .max(1)
    }

    /// Expected byte length of one frame's pixel buffer.
    pub fn frame_byte_len(&self) -> usize {
        self.width() as usize
            * self.height() as usize
            * self.channels as usize
            * (self.bit_depth as usize / 8)
    }

    /// Check that the schema's `image_structure.encoding` enum admits
    /// this structure's encoding. Schemas without an encoding enum pass.
    pub fn validate_encoding_in_schema(&self, schema: &Value) -> Result<()> {
        let allowed = schema
            .pointer("/properties/metadata/properties/image_structure/properties/encoding/enum")
            .and_then(Value::as_array);
        let Some(allowed) = allowed else {
            return Ok(());
        };
        let name = self.encoding.as_str();
        let admitted = allowed.iter().any(|v| {
            v.as_str()
                .map(|s| s.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        });
        if !admitted {
            return Err(UmdfError::Schema(format!(
                "Schema does not admit pixel encoding '{name}'"
            )));
        }
        Ok(())
    }
}

/// Extract the frame schema reference from an image schema's data
/// section (`properties.data.properties.frames.$ref`).
pub fn frame_schema_ref(schema: &Value) -> Result<String> {
    schema
        .pointer("/properties/data/properties/frames/$ref")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            UmdfError::Schema(
                "Image schema missing required 'frames' reference in data section".into(),
            )
        })
}

fn default_dimension_name(i: usize) -> String {
    match i {
        0 => "x".to_owned(),
        1 => "y".to_owned(),
        _ => format!("dim{i}"),
    }
}
