//! Modules: the versioned, self-describing records of a container file.
//!
//! A module on disk is a TLV header followed by a payload envelope:
//!
//! | Path                | Payload bytes |
//! |---------------------|---------------|
//! | plain, uncompressed | `string buffer ‖ metadata rows ‖ data` |
//! | compressed metadata | `zstd(sbs ‖ ms ‖ string buffer ‖ metadata)` then `data` |
//! | encrypted           | `AES-256-GCM(sbs ‖ ms ‖ ds ‖ string buffer ‖ metadata ‖ data)` |
//!
//! Module kinds are a closed enum dispatched by `ModuleType`: tabular
//! rows, images made of embedded frame sub-modules, and the frames
//! themselves. Frames are written with encryption disabled — the parent
//! image's envelope already covers them.

pub mod codec;
pub mod header;
pub mod image;

use std::io::{Cursor, Read, Seek, Write};
use std::path::PathBuf;

use serde_json::Value;
use uuid::Uuid;

use crate::compress;
use crate::crypto::{self, EncryptionParams, ModuleCrypto};
use crate::error::{Result, UmdfError};
use crate::format::string_buffer::StringBuffer;
use crate::format::types::{CompressionKind, EncryptionKind, ModuleType, UtcTimestamp};
use crate::format::xref::XrefTable;
use crate::schema::field::{parse_field, Field};
use crate::schema::resolver::SchemaResolver;
use crate::schema::row::RowCodec;
use self::header::ModuleHeader;
use self::image::ImageStructure;

// ── Exchange types ─────────────────────────────────────────────────

/// Module payload as exchanged with callers.
#[derive(Debug, Clone, PartialEq)]
pub enum ModulePayload {
    /// Tabular rows (a JSON array of row objects).
    Tabular(Value),
    /// Opaque bytes: a frame's pixels.
    Binary(Vec<u8>),
    /// Ordered child frames of an image.
    Frames(Vec<ModuleData>),
}

/// Metadata plus payload, the unit callers write and read.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleData {
    pub metadata: Value,
    pub data: ModulePayload,
}

// ── Module body variants ───────────────────────────────────────────

#[derive(Debug)]
enum ModuleBody {
    Tabular {
        fields: Vec<Field>,
        required: Vec<String>,
        rows: Vec<Vec<u8>>,
    },
    Image {
        frame_schema: PathBuf,
        structure: Option<ImageStructure>,
        frames: Vec<Module>,
    },
    Frame { pixels: Vec<u8> },
}

// ── Module ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Module {
    pub header: ModuleHeader,
    schema: Value,
    metadata_fields: Vec<Field>,
    metadata_required: Vec<String>,
    metadata_rows: Vec<Vec<u8>>,
    strings: StringBuffer,
    body: ModuleBody,
}

impl Module {
    /// Build an empty module for a schema, dispatching the variant on
    /// the schema's `module_type`.
    pub fn create(
        schema_path: &str,
        schema: Value,
        module_id: Uuid,
        params: &EncryptionParams,
        resolver: &mut SchemaResolver,
    ) -> Result<Self> {
        let type_name = schema
            .get("module_type")
            .and_then(Value::as_str)
            .ok_or_else(|| UmdfError::Schema("Schema missing 'module_type'".into()))?;
        let module_type = ModuleType::from_name(type_name)
            .ok_or_else(|| UmdfError::Schema(format!("Unknown module type: {type_name}")))?;
        if !matches!(
            module_type,
            ModuleType::Tabular | ModuleType::Image | ModuleType::Frame
        ) {
            return Err(UmdfError::Schema(format!(
                "Module type '{type_name}' cannot be instantiated from a schema"
            )));
        }
        Self::with_type(schema_path, schema, module_id, module_type, params, resolver)
    }

    fn with_type(
        schema_path: &str,
        schema: Value,
        module_id: Uuid,
        module_type: ModuleType,
        params: &EncryptionParams,
        resolver: &mut SchemaResolver,
    ) -> Result<Self> {
        let mut header = ModuleHeader::new(module_id, module_type, schema_path);
        if params.is_encrypted() && module_type != ModuleType::Frame {
            header.encryption = EncryptionKind::Aes256Gcm;
        }

        if let Some(endianness) = schema.get("endianness").and_then(Value::as_str) {
            if endianness == "big" {
                return Err(UmdfError::Schema(
                    "Big-endian schemas are not supported".into(),
                ));
            }
        }

        let props = schema
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                UmdfError::Schema("Schema missing essential 'properties' field".into())
            })?;

        let (metadata_fields, metadata_required) = match props.get("metadata") {
            Some(section) => parse_section(section, resolver, schema_path)?,
            None => (Vec::new(), Vec::new()),
        };

        let body = match module_type {
            ModuleType::Tabular => {
                let (fields, required) = match props.get("data") {
                    Some(section) => parse_section(section, resolver, schema_path)?,
                    None => (Vec::new(), Vec::new()),
                };
                ModuleBody::Tabular {
                    fields,
                    required,
                    rows: Vec::new(),
                }
            }
            ModuleType::Image => {
                let reference = self::image::frame_schema_ref(&schema)?;
                let frame_schema = SchemaResolver::resolve_relative(&reference, schema_path);
                ModuleBody::Image {
                    frame_schema,
                    structure: None,
                    frames: Vec::new(),
                }
            }
            ModuleType::Frame => ModuleBody::Frame { pixels: Vec::new() },
            _ => unreachable!("guarded by create"),
        };

        Ok(Self {
            header,
            schema,
            metadata_fields,
            metadata_required,
            metadata_rows: Vec::new(),
            strings: StringBuffer::new(),
            body,
        })
    }

    pub fn module_type(&self) -> ModuleType {
        self.header.module_type
    }

    pub fn module_id(&self) -> Uuid {
        self.header.module_id
    }

    // ── Populating ─────────────────────────────────────────────────

    /// Add metadata rows: a JSON object for one row, or an array for
    /// several. Image modules additionally parse their
    /// `image_structure` from the first row.
    pub fn add_metadata(&mut self, metadata: &Value) -> Result<()> {
        let codec = RowCodec::new(&self.metadata_fields);
        match metadata {
            Value::Array(rows) => {
                for row in rows {
                    self.metadata_rows.push(codec.encode_row(
                        row,
                        &self.metadata_required,
                        &mut self.strings,
                    )?);
                }
            }
            single => {
                self.metadata_rows.push(codec.encode_row(
                    single,
                    &self.metadata_required,
                    &mut self.strings,
                )?);
            }
        }

        if let ModuleBody::Image { structure, .. } = &mut self.body {
            let first = match metadata {
                Value::Array(rows) => rows.first().ok_or_else(|| {
                    UmdfError::Schema("Image metadata must not be empty".into())
                })?,
                single => single,
            };
            let parsed = ImageStructure::from_metadata(first)?;
            parsed.validate_encoding_in_schema(&self.schema)?;
            *structure = Some(parsed);
        }

        Ok(())
    }

    /// Attach the payload. The variant must match the module type.
    pub fn add_data(&mut self, payload: &ModulePayload, resolver: &mut SchemaResolver) -> Result<()> {
        match (&mut self.body, payload) {
            (
                ModuleBody::Tabular {
                    fields,
                    required,
                    rows,
                },
                ModulePayload::Tabular(value),
            ) => {
                let row_values: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                if fields.is_empty() && !row_values.is_empty() {
                    return Err(UmdfError::Schema(
                        "Schema declares no data fields but data rows were provided".into(),
                    ));
                }
                let codec = RowCodec::new(fields);
                for row in row_values {
                    rows.push(codec.encode_row(row, required, &mut self.strings)?);
                }
                Ok(())
            }
            (
                ModuleBody::Image {
                    frame_schema,
                    structure,
                    frames,
                },
                ModulePayload::Frames(frame_data),
            ) => {
                let structure = structure.as_ref().ok_or_else(|| {
                    UmdfError::State(
                        "Image structure not set; add metadata before data".into(),
                    )
                })?;
                if frame_data.len() != structure.frame_count() {
                    return Err(UmdfError::Schema(format!(
                        "Expected {} frames from the dimensions, got {}",
                        structure.frame_count(),
                        frame_data.len()
                    )));
                }
                let frame_schema_str = frame_schema.to_string_lossy().into_owned();
                let frame_schema_json = resolver.get_by_path(frame_schema)?;
                for (i, child) in frame_data.iter().enumerate() {
                    let ModulePayload::Binary(pixels) = &child.data else {
                        return Err(UmdfError::Schema(format!(
                            "Frame {i} payload must be pixel bytes"
                        )));
                    };
                    if pixels.len() != structure.frame_byte_len() {
                        return Err(UmdfError::Schema(format!(
                            "Frame {i} has {} pixel bytes, expected {}",
                            pixels.len(),
                            structure.frame_byte_len()
                        )));
                    }
                    let mut frame = Module::with_type(
                        &frame_schema_str,
                        frame_schema_json.clone(),
                        Uuid::new_v4(),
                        ModuleType::Frame,
                        &EncryptionParams::none(),
                        resolver,
                    )?;
                    frame.add_metadata(&child.metadata)?;
                    frame.body = ModuleBody::Frame {
                        pixels: pixels.clone(),
                    };
                    frames.push(frame);
                }
                Ok(())
            }
            (ModuleBody::Frame { pixels }, ModulePayload::Binary(bytes)) => {
                *pixels = bytes.clone();
                Ok(())
            }
            _ => Err(UmdfError::Schema(
                "Payload variant does not match the module type".into(),
            )),
        }
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Serialize the module at the stream's current position, patch the
    /// header sizes, and register the module in the XREF.
    /// `absolute_start` is the offset the entry will record — for
    /// top-level modules the file offset, for embedded frames the
    /// position inside the parent's data buffer.
    pub fn write_binary<W: Write + Seek>(
        &mut self,
        absolute_start: u64,
        out: &mut W,
        xref: &mut XrefTable,
        author: &str,
        params: &EncryptionParams,
    ) -> Result<()> {
        let module_start = out.stream_position()?;

        if self.header.created_by.is_empty() {
            self.header.created_by = author.to_owned();
        }
        self.header.modified_by = author.to_owned();
        self.header.modified_at = UtcTimestamp::now();

        if self.header.encryption != EncryptionKind::None {
            self.header.crypto = ModuleCrypto::generate();
        }

        self.header.write_to(out)?;

        // Metadata segment, with inner sizes captured before the
        // envelope rewrites them.
        let metadata_rows_len: u64 = self.metadata_rows.iter().map(|r| r.len() as u64).sum();
        let meta_segment = match self.header.metadata_compression {
            CompressionKind::Zstd => {
                let mut blob = Vec::with_capacity(
                    16 + self.strings.size() as usize + metadata_rows_len as usize,
                );
                blob.extend_from_slice(&self.strings.size().to_le_bytes());
                blob.extend_from_slice(&metadata_rows_len.to_le_bytes());
                blob.extend_from_slice(self.strings.bytes());
                for row in &self.metadata_rows {
                    blob.extend_from_slice(row);
                }
                let compressed = compress::compress(&blob)?;
                self.header.string_buffer_size = 0;
                self.header.metadata_size = compressed.len() as u64;
                compressed
            }
            CompressionKind::Raw => {
                let mut segment = Vec::with_capacity(
                    self.strings.size() as usize + metadata_rows_len as usize,
                );
                segment.extend_from_slice(self.strings.bytes());
                for row in &self.metadata_rows {
                    segment.extend_from_slice(row);
                }
                self.header.string_buffer_size = self.strings.size();
                self.header.metadata_size = metadata_rows_len;
                segment
            }
            other => {
                return Err(UmdfError::Format(format!(
                    "Metadata compression must be raw or zstd, got {}",
                    other.as_str()
                )))
            }
        };

        let data_segment = self.encode_data(author)?;
        self.header.data_size = data_segment.len() as u64;

        if self.header.encryption != EncryptionKind::None {
            let mut plaintext =
                Vec::with_capacity(24 + meta_segment.len() + data_segment.len());
            plaintext.extend_from_slice(&self.header.string_buffer_size.to_le_bytes());
            plaintext.extend_from_slice(&self.header.metadata_size.to_le_bytes());
            plaintext.extend_from_slice(&self.header.data_size.to_le_bytes());
            plaintext.extend_from_slice(&meta_segment);
            plaintext.extend_from_slice(&data_segment);

            let ciphertext = crypto::seal(params, &mut self.header.crypto, plaintext)?;
            self.header.string_buffer_size = 0;
            self.header.metadata_size = 0;
            self.header.data_size = ciphertext.len() as u64;
            out.write_all(&ciphertext)?;
        } else {
            out.write_all(&meta_segment)?;
            out.write_all(&data_segment)?;
        }

        let module_end = out.stream_position()?;
        let total = module_end - module_start;
        if total != self.header.total_module_size() {
            return Err(UmdfError::Format(format!(
                "Module size mismatch: wrote {total} bytes but header declares {}",
                self.header.total_module_size()
            )));
        }

        self.header.patch_sizes(out)?;
        xref.add(
            self.header.module_type,
            self.header.module_id,
            absolute_start,
            total,
        );

        tracing::debug!(
            module = %self.header.module_id,
            kind = %self.header.module_type,
            bytes = total,
            "module written"
        );
        Ok(())
    }

    /// Produce the data section bytes. Image frames are pixel-encoded
    /// and embedded as sub-modules here.
    fn encode_data(&mut self, author: &str) -> Result<Vec<u8>> {
        match &mut self.body {
            ModuleBody::Tabular { rows, .. } => {
                let mut bytes = Vec::new();
                for row in rows.iter() {
                    bytes.extend_from_slice(row);
                }
                match self.header.data_compression {
                    CompressionKind::Raw => Ok(bytes),
                    CompressionKind::Zstd => compress::compress(&bytes),
                    other => Err(UmdfError::Format(format!(
                        "Tabular data compression must be raw or zstd, got {}",
                        other.as_str()
                    ))),
                }
            }
            ModuleBody::Frame { pixels } => Ok(pixels.clone()),
            ModuleBody::Image {
                structure, frames, ..
            } => {
                let structure = structure.as_ref().ok_or_else(|| {
                    UmdfError::State("Image structure not set before write".into())
                })?;

                if structure.encoding != CompressionKind::Raw {
                    let pixel_codec = codec::codec_for(structure.encoding)?;
                    if !pixel_codec.supports(structure.channels, structure.bit_depth) {
                        return Err(UmdfError::Format(format!(
                            "Encoding '{}' does not support {} channels at {} bits",
                            structure.encoding.as_str(),
                            structure.channels,
                            structure.bit_depth
                        )));
                    }
                    for frame in frames.iter_mut() {
                        if let ModuleBody::Frame { pixels } = &mut frame.body {
                            *pixels = pixel_codec.compress(
                                pixels,
                                structure.width(),
                                structure.height(),
                                structure.channels,
                                structure.bit_depth,
                            )?;
                        }
                    }
                }

                let mut cur = Cursor::new(Vec::new());
                let mut scratch = XrefTable::new();
                for frame in frames.iter_mut() {
                    let frame_start = cur.stream_position()?;
                    frame.write_binary(
                        frame_start,
                        &mut cur,
                        &mut scratch,
                        author,
                        &EncryptionParams::none(),
                    )?;
                }
                Ok(cur.into_inner())
            }
        }
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Rebuild a module from its on-disk bytes (header included).
    pub fn from_bytes(
        bytes: &[u8],
        expected_type: ModuleType,
        params: &EncryptionParams,
        resolver: &mut SchemaResolver,
    ) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let read_header = ModuleHeader::read_from(&mut cur)?;
        if read_header.module_type != expected_type {
            return Err(UmdfError::Format(format!(
                "XREF says {} but module header says {}",
                expected_type, read_header.module_type
            )));
        }

        let effective_params = if expected_type == ModuleType::Frame {
            EncryptionParams::none()
        } else {
            params.clone()
        };

        let schema = resolver.get_by_path(std::path::Path::new(&read_header.schema_path))?;
        let mut module = Module::with_type(
            read_header.schema_path.as_str(),
            schema,
            read_header.module_id,
            read_header.module_type,
            &effective_params,
            resolver,
        )?;
        module.header = read_header;

        if module.header.encryption != EncryptionKind::None {
            let mut ciphertext = vec![0u8; module.header.data_size as usize];
            cur.read_exact(&mut ciphertext)?;
            let plaintext = crypto::open(&effective_params, &module.header.crypto, ciphertext)?;
            if plaintext.len() < 24 {
                return Err(UmdfError::Format(
                    "Encrypted payload shorter than its size prefix".into(),
                ));
            }
            module.header.string_buffer_size =
                u64::from_le_bytes(plaintext[0..8].try_into().unwrap());
            module.header.metadata_size =
                u64::from_le_bytes(plaintext[8..16].try_into().unwrap());
            module.header.data_size = u64::from_le_bytes(plaintext[16..24].try_into().unwrap());
            let mut inner = Cursor::new(&plaintext[24..]);
            module.read_sections(&mut inner, resolver)?;
        } else {
            module.read_sections(&mut cur, resolver)?;
        }

        Ok(module)
    }

    fn read_sections<R: Read>(
        &mut self,
        input: &mut R,
        resolver: &mut SchemaResolver,
    ) -> Result<()> {
        let rows_bytes = match self.header.metadata_compression {
            CompressionKind::Zstd => {
                let mut compressed = vec![0u8; self.header.metadata_size as usize];
                input.read_exact(&mut compressed)?;
                let blob = compress::decompress(&compressed)?;
                if blob.len() < 16 {
                    return Err(UmdfError::Format(
                        "Compressed metadata shorter than its size prefix".into(),
                    ));
                }
                let string_buffer_size = u64::from_le_bytes(blob[0..8].try_into().unwrap());
                let metadata_size = u64::from_le_bytes(blob[8..16].try_into().unwrap());
                if blob.len() as u64 != 16 + string_buffer_size + metadata_size {
                    return Err(UmdfError::Format(
                        "Compressed metadata sizes do not match its contents".into(),
                    ));
                }
                self.header.string_buffer_size = string_buffer_size;
                self.header.metadata_size = metadata_size;
                let strings_end = 16 + string_buffer_size as usize;
                self.strings
                    .read_from(&mut Cursor::new(&blob[16..strings_end]), string_buffer_size)?;
                blob[strings_end..].to_vec()
            }
            CompressionKind::Raw => {
                self.strings
                    .read_from(input, self.header.string_buffer_size)?;
                let mut rows = vec![0u8; self.header.metadata_size as usize];
                input.read_exact(&mut rows)?;
                rows
            }
            other => {
                return Err(UmdfError::Format(format!(
                    "Metadata compression must be raw or zstd, got {}",
                    other.as_str()
                )))
            }
        };

        let codec = RowCodec::new(&self.metadata_fields);
        self.metadata_rows = codec.split_rows(&rows_bytes)?;

        if matches!(self.body, ModuleBody::Image { .. }) {
            let first = self
                .metadata_rows
                .first()
                .ok_or_else(|| UmdfError::Format("Image module has no metadata rows".into()))?;
            let row = codec.decode_row(first, &self.strings)?;
            let parsed = ImageStructure::from_metadata(&row)?;
            if let ModuleBody::Image { structure, .. } = &mut self.body {
                *structure = Some(parsed);
            }
        }

        if self.header.data_size > 0 {
            let mut data = vec![0u8; self.header.data_size as usize];
            input.read_exact(&mut data)?;
            if self.header.data_compression == CompressionKind::Zstd {
                data = compress::decompress(&data)?;
                self.header.data_size = data.len() as u64;
            }
            self.decode_data(&data, resolver)?;
        }

        Ok(())
    }

    fn decode_data(&mut self, bytes: &[u8], resolver: &mut SchemaResolver) -> Result<()> {
        match &mut self.body {
            ModuleBody::Tabular { fields, rows, .. } => {
                let codec = RowCodec::new(fields);
                *rows = codec.split_rows(bytes)?;
                Ok(())
            }
            ModuleBody::Frame { pixels } => {
                *pixels = bytes.to_vec();
                Ok(())
            }
            ModuleBody::Image {
                structure, frames, ..
            } => {
                let frame_count = structure
                    .as_ref()
                    .ok_or_else(|| {
                        UmdfError::Format("Image structure missing while reading frames".into())
                    })?
                    .frame_count();

                let mut offset = 0usize;
                for i in 0..frame_count {
                    let mut cur = Cursor::new(&bytes[offset..]);
                    let frame_header = ModuleHeader::read_from(&mut cur).map_err(|e| {
                        UmdfError::Format(format!("Frame {i} header unreadable: {e}"))
                    })?;
                    let frame_size = frame_header.total_module_size() as usize;
                    let end = offset.checked_add(frame_size).ok_or_else(|| {
                        UmdfError::Format("Frame size overflow".into())
                    })?;
                    if end > bytes.len() {
                        return Err(UmdfError::Format(format!(
                            "Frame {i} runs past the image data section"
                        )));
                    }
                    let frame = Module::from_bytes(
                        &bytes[offset..end],
                        ModuleType::Frame,
                        &EncryptionParams::none(),
                        resolver,
                    )?;
                    frames.push(frame);
                    offset = end;
                }
                if offset != bytes.len() {
                    return Err(UmdfError::Format(format!(
                        "Image data section has {} trailing bytes after the last frame",
                        bytes.len() - offset
                    )));
                }
                Ok(())
            }
        }
    }

    // ── Materializing ──────────────────────────────────────────────

    /// Metadata rows as a JSON array, one object per row.
    pub fn metadata_json(&self) -> Result<Value> {
        let codec = RowCodec::new(&self.metadata_fields);
        let rows = self
            .metadata_rows
            .iter()
            .map(|row| codec.decode_row(row, &self.strings))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(rows))
    }

    /// Materialize the module for callers. Image frames are pixel-decoded
    /// here, on first access rather than at load time.
    pub fn module_data(&self) -> Result<ModuleData> {
        let data = match &self.body {
            ModuleBody::Tabular { fields, rows, .. } => {
                let codec = RowCodec::new(fields);
                let values = rows
                    .iter()
                    .map(|row| codec.decode_row(row, &self.strings))
                    .collect::<Result<Vec<_>>>()?;
                ModulePayload::Tabular(Value::Array(values))
            }
            ModuleBody::Frame { pixels } => ModulePayload::Binary(pixels.clone()),
            ModuleBody::Image {
                structure, frames, ..
            } => {
                let structure = structure.as_ref().ok_or_else(|| {
                    UmdfError::State("Image structure not available".into())
                })?;
                let mut children = Vec::with_capacity(frames.len());
                for frame in frames {
                    let mut child = frame.module_data()?;
                    if structure.encoding != CompressionKind::Raw {
                        if let ModulePayload::Binary(pixels) = &child.data {
                            let pixel_codec = codec::codec_for(structure.encoding)?;
                            child.data = ModulePayload::Binary(pixel_codec.decompress(pixels)?);
                        }
                    }
                    children.push(child);
                }
                ModulePayload::Frames(children)
            }
        };

        Ok(ModuleData {
            metadata: self.metadata_json()?,
            data,
        })
    }
}

/// Parse a schema section (`properties.metadata` or `properties.data`)
/// into its fields and required-name list.
fn parse_section(
    section: &Value,
    resolver: &mut SchemaResolver,
    schema_path: &str,
) -> Result<(Vec<Field>, Vec<String>)> {
    let properties = section
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| UmdfError::Schema("Schema section missing 'properties'".into()))?;

    let required: Vec<String> = match section.get("required") {
        Some(Value::Array(names)) => names
            .iter()
            .map(|v| {
                v.as_str().map(str::to_owned).ok_or_else(|| {
                    UmdfError::Schema("'required' entries must be strings".into())
                })
            })
            .collect::<Result<_>>()?,
        _ => Vec::new(),
    };
    for name in &required {
        if !properties.contains_key(name) {
            return Err(UmdfError::Schema(format!(
                "Required field '{name}' is not declared in properties"
            )));
        }
    }

    let mut fields = Vec::with_capacity(properties.len());
    for (name, definition) in properties {
        fields.push(parse_field(name, definition, resolver, schema_path)?);
    }
    Ok((fields, required))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tabular_schema() -> Value {
        json!({
            "module_type": "tabular",
            "properties": {
                "metadata": {
                    "properties": {
                        "name": {"type": "string"},
                        "patient_id": {"type": "string", "length": 16}
                    },
                    "required": ["patient_id"]
                },
                "data": {
                    "type": "object",
                    "properties": {
                        "age": {"type": "integer", "format": "uint8", "minimum": 0, "maximum": 120},
                        "height_cm": {"type": "number", "format": "float32"}
                    }
                }
            }
        })
    }

    fn build_tabular(params: &EncryptionParams) -> Module {
        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            "schemas/patient.json",
            tabular_schema(),
            Uuid::new_v4(),
            params,
            &mut resolver,
        )
        .unwrap();
        module
            .add_metadata(&json!({"patient_id": "P0001", "name": "Jane Doe"}))
            .unwrap();
        module
            .add_data(
                &ModulePayload::Tabular(json!([
                    {"age": 30, "height_cm": 165.5},
                    {"age": 31}
                ])),
                &mut resolver,
            )
            .unwrap();
        module
    }

    /// Schema files must exist on disk for the read path; write them to
    /// a temp dir and rewrite the schema path.
    fn persist_schema(dir: &std::path::Path, name: &str, schema: &Value) -> String {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(schema).unwrap()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn write_module(module: &mut Module, params: &EncryptionParams) -> (Vec<u8>, XrefTable) {
        let mut cur = Cursor::new(Vec::new());
        let mut xref = XrefTable::new();
        module
            .write_binary(0, &mut cur, &mut xref, "tester", params)
            .unwrap();
        (cur.into_inner(), xref)
    }

    #[test]
    fn test_tabular_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = persist_schema(dir.path(), "patient.json", &tabular_schema());

        let params = EncryptionParams::none();
        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            &schema_path,
            tabular_schema(),
            Uuid::new_v4(),
            &params,
            &mut resolver,
        )
        .unwrap();
        module
            .add_metadata(&json!({"patient_id": "P0001", "name": "Jane Doe"}))
            .unwrap();
        module
            .add_data(
                &ModulePayload::Tabular(json!([
                    {"age": 30, "height_cm": 165.5},
                    {"age": 31}
                ])),
                &mut resolver,
            )
            .unwrap();

        let (bytes, xref) = write_module(&mut module, &params);
        assert_eq!(xref.entries().len(), 1);
        assert_eq!(xref.entries()[0].size, bytes.len() as u64);

        let loaded =
            Module::from_bytes(&bytes, ModuleType::Tabular, &params, &mut resolver).unwrap();
        let data = loaded.module_data().unwrap();

        assert_eq!(
            data.metadata,
            json!([{"patient_id": "P0001", "name": "Jane Doe"}])
        );
        let ModulePayload::Tabular(rows) = &data.data else {
            panic!("expected tabular payload");
        };
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["age"], json!(30));
        assert!((rows[0]["height_cm"].as_f64().unwrap() - 165.5).abs() < 1e-3);
        // Absent field decodes as absent, not as a placeholder.
        assert_eq!(rows[1], json!({"age": 31}));
    }

    #[test]
    fn test_size_sum_invariant() {
        let params = EncryptionParams::none();
        let mut module = build_tabular(&params);
        let (bytes, _) = write_module(&mut module, &params);

        assert_eq!(module.header.total_module_size(), bytes.len() as u64);
        assert_eq!(
            module.header.header_size as u64
                + module.header.string_buffer_size
                + module.header.metadata_size
                + module.header.data_size,
            bytes.len() as u64
        );
    }

    #[test]
    fn test_metadata_required_enforced() {
        let params = EncryptionParams::none();
        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            "schemas/patient.json",
            tabular_schema(),
            Uuid::new_v4(),
            &params,
            &mut resolver,
        )
        .unwrap();
        let err = module
            .add_metadata(&json!({"name": "No Id"}))
            .unwrap_err();
        assert!(err.to_string().contains("patient_id"));
    }

    #[test]
    fn test_invalid_data_value_rejected() {
        let params = EncryptionParams::none();
        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            "schemas/patient.json",
            tabular_schema(),
            Uuid::new_v4(),
            &params,
            &mut resolver,
        )
        .unwrap();
        module
            .add_metadata(&json!({"patient_id": "P0001"}))
            .unwrap();

        let err = module
            .add_data(
                &ModulePayload::Tabular(json!([{"age": "thirty"}])),
                &mut resolver,
            )
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));

        let err = module
            .add_data(
                &ModulePayload::Tabular(json!([{"age": 121}])),
                &mut resolver,
            )
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));
    }

    #[test]
    fn test_payload_variant_mismatch() {
        let params = EncryptionParams::none();
        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            "schemas/patient.json",
            tabular_schema(),
            Uuid::new_v4(),
            &params,
            &mut resolver,
        )
        .unwrap();
        let err = module
            .add_data(&ModulePayload::Binary(vec![1, 2, 3]), &mut resolver)
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_encrypted_module_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = persist_schema(dir.path(), "patient.json", &tabular_schema());

        let mut params = EncryptionParams::generate("pw");
        // Keep the KDF cheap in tests.
        params.memory_cost = 64;
        params.time_cost = 1;
        params.parallelism = 1;

        let mut resolver = SchemaResolver::new();
        let mut module = Module::create(
            &schema_path,
            tabular_schema(),
            Uuid::new_v4(),
            &params,
            &mut resolver,
        )
        .unwrap();
        module
            .add_metadata(&json!({"patient_id": "P0001", "name": "Jane Doe"}))
            .unwrap();
        module
            .add_data(
                &ModulePayload::Tabular(json!([{"age": 30}])),
                &mut resolver,
            )
            .unwrap();

        let (bytes, _) = write_module(&mut module, &params);

        // On disk only the ciphertext size is declared.
        assert_eq!(module.header.string_buffer_size, 0);
        assert_eq!(module.header.metadata_size, 0);
        assert!(module.header.data_size > 0);

        // Correct password round-trips.
        let loaded =
            Module::from_bytes(&bytes, ModuleType::Tabular, &params, &mut resolver).unwrap();
        let data = loaded.module_data().unwrap();
        assert_eq!(
            data.metadata,
            json!([{"patient_id": "P0001", "name": "Jane Doe"}])
        );

        // Wrong password fails the tag check.
        let mut wrong = params.clone();
        wrong.password = Some("other".into());
        let err =
            Module::from_bytes(&bytes, ModuleType::Tabular, &wrong, &mut resolver).unwrap_err();
        assert!(matches!(err, UmdfError::Crypto(_)));

        // No password at all is a crypto error too.
        let mut missing = params.clone();
        missing.password = None;
        let err = Module::from_bytes(&bytes, ModuleType::Tabular, &missing, &mut resolver)
            .unwrap_err();
        assert!(matches!(err, UmdfError::Crypto(_)));
    }
}
