//! Module header: the TLV block preceding every module payload.
//!
//! Writing emits placeholders for the sizes (and the auth tag, when
//! encrypted) and remembers their value offsets; once the payload is on
//! the stream the writer patches them in place. Reading walks the block
//! bounded by the leading `HeaderSize` record and also remembers where
//! the `IsCurrent` byte lives so the updater can demote a previous
//! version with a one-byte overwrite.

use std::io::{Read, Seek, Write};

use uuid::Uuid;

use crate::crypto::ModuleCrypto;
use crate::error::{Result, UmdfError};
use crate::format::tlv::{
    patch_bytes, value_as_i64, value_as_str, value_as_u64, value_as_u8, write_tlv, write_tlv_i64,
    write_tlv_str, write_tlv_u32, write_tlv_u64, write_tlv_u8, Tag, TlvBlockReader,
};
use crate::format::types::{CompressionKind, EncryptionKind, ModuleType, UtcTimestamp};

/// Value offsets recorded while writing, for post-payload patching.
#[derive(Debug, Clone, Copy)]
struct HeaderPatches {
    string_buffer_size: u64,
    metadata_size: u64,
    data_size: u64,
    modified_at: u64,
    auth_tag: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModuleHeader {
    pub module_id: Uuid,
    pub module_type: ModuleType,
    pub schema_path: String,

    pub header_size: u32,
    pub string_buffer_size: u64,
    pub metadata_size: u64,
    pub data_size: u64,

    pub is_current: bool,
    pub previous_version: u64,

    pub metadata_compression: CompressionKind,
    pub data_compression: CompressionKind,
    pub encryption: EncryptionKind,
    pub crypto: ModuleCrypto,

    pub little_endian: bool,

    pub created_at: UtcTimestamp,
    pub created_by: String,
    pub modified_at: UtcTimestamp,
    pub modified_by: String,

    /// Offset of the IsCurrent value byte, relative to the header start.
    /// Populated on both write and read.
    is_current_offset: Option<u32>,

    patches: Option<HeaderPatches>,
}

impl ModuleHeader {
    pub fn new(module_id: Uuid, module_type: ModuleType, schema_path: &str) -> Self {
        let now = UtcTimestamp::now();
        Self {
            module_id,
            module_type,
            schema_path: schema_path.to_owned(),
            header_size: 0,
            string_buffer_size: 0,
            metadata_size: 0,
            data_size: 0,
            is_current: true,
            previous_version: 0,
            metadata_compression: CompressionKind::Zstd,
            data_compression: CompressionKind::Raw,
            encryption: EncryptionKind::None,
            crypto: ModuleCrypto::default(),
            little_endian: true,
            created_at: now,
            created_by: String::new(),
            modified_at: now,
            modified_by: String::new(),
            is_current_offset: None,
            patches: None,
        }
    }

    /// Total on-disk module size implied by the declared sizes.
    pub fn total_module_size(&self) -> u64 {
        self.header_size as u64 + self.string_buffer_size + self.metadata_size + self.data_size
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Emit the full TLV block. Size fields are written with their
    /// current values (normally zero) and patched later through
    /// [`patch_sizes`](Self::patch_sizes).
    pub fn write_to<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        let header_start = out.stream_position()?;

        let header_size_pos = write_tlv_u32(out, Tag::HeaderSize, 0)?;
        write_tlv(out, Tag::ModuleId, self.module_id.as_bytes())?;
        write_tlv_str(out, Tag::ModuleType, self.module_type.as_str())?;
        write_tlv_str(out, Tag::SchemaPath, &self.schema_path)?;

        let string_buffer_size_pos =
            write_tlv_u64(out, Tag::StringBufferSize, self.string_buffer_size)?;
        let metadata_size_pos = write_tlv_u64(out, Tag::MetadataSize, self.metadata_size)?;
        let data_size_pos = write_tlv_u64(out, Tag::DataSize, self.data_size)?;

        let is_current_pos = write_tlv_u8(out, Tag::IsCurrent, self.is_current as u8)?;
        write_tlv_u64(out, Tag::PreviousVersion, self.previous_version)?;

        write_tlv_u8(out, Tag::MetadataCompression, self.metadata_compression as u8)?;
        write_tlv_u8(out, Tag::DataCompression, self.data_compression as u8)?;
        write_tlv_u8(out, Tag::EncryptionType, self.encryption as u8)?;

        let mut auth_tag_pos = None;
        if self.encryption != EncryptionKind::None {
            write_tlv(out, Tag::ModuleSalt, &self.crypto.module_salt)?;
            write_tlv(out, Tag::Iv, &self.crypto.iv)?;
            // Tag is only known after the payload is sealed.
            auth_tag_pos = Some(write_tlv(
                out,
                Tag::AuthTag,
                &[0u8; crate::format::types::AUTH_TAG_LEN],
            )?);
        }

        write_tlv_u8(out, Tag::Endianness, self.little_endian as u8)?;

        write_tlv_i64(out, Tag::CreatedAt, self.created_at.epoch_seconds())?;
        write_tlv_str(out, Tag::CreatedBy, &self.created_by)?;
        let modified_at_pos = write_tlv_i64(out, Tag::ModifiedAt, self.modified_at.epoch_seconds())?;
        write_tlv_str(out, Tag::ModifiedBy, &self.modified_by)?;

        let header_end = out.stream_position()?;
        self.header_size = (header_end - header_start) as u32;
        patch_bytes(out, header_size_pos, &self.header_size.to_le_bytes())?;

        self.is_current_offset = Some((is_current_pos - header_start) as u32);
        self.patches = Some(HeaderPatches {
            string_buffer_size: string_buffer_size_pos,
            metadata_size: metadata_size_pos,
            data_size: data_size_pos,
            modified_at: modified_at_pos,
            auth_tag: auth_tag_pos,
        });

        Ok(())
    }

    /// Patch the size fields (and modification time) after the payload
    /// is complete. Must follow a `write_to` on the same stream.
    pub fn patch_sizes<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        let patches = self
            .patches
            .ok_or_else(|| UmdfError::State("Header was never written to this stream".into()))?;
        patch_bytes(
            out,
            patches.string_buffer_size,
            &self.string_buffer_size.to_le_bytes(),
        )?;
        patch_bytes(out, patches.metadata_size, &self.metadata_size.to_le_bytes())?;
        patch_bytes(out, patches.data_size, &self.data_size.to_le_bytes())?;
        patch_bytes(
            out,
            patches.modified_at,
            &self.modified_at.epoch_seconds().to_le_bytes(),
        )?;
        if let Some(auth_tag_pos) = patches.auth_tag {
            if self.crypto.auth_tag.len() != crate::format::types::AUTH_TAG_LEN {
                return Err(UmdfError::Crypto(format!(
                    "Auth tag not set before header patch ({} bytes)",
                    self.crypto.auth_tag.len()
                )));
            }
            patch_bytes(out, auth_tag_pos, &self.crypto.auth_tag)?;
        }
        Ok(())
    }

    /// Flip the on-disk IsCurrent byte of an already-written header.
    /// `header_start` is the absolute offset the header was read from or
    /// written to.
    pub fn update_is_current<W: Write + Seek>(
        &mut self,
        out: &mut W,
        header_start: u64,
        is_current: bool,
    ) -> Result<()> {
        let offset = self.is_current_offset.ok_or_else(|| {
            UmdfError::State("Header has no recorded IsCurrent position".into())
        })?;
        patch_bytes(out, header_start + offset as u64, &[is_current as u8])?;
        self.is_current = is_current;
        Ok(())
    }

    // ── Reading ────────────────────────────────────────────────────

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut header = Self::new(Uuid::nil(), ModuleType::Tabular, "");
        header.metadata_compression = CompressionKind::Raw;
        let mut reader = TlvBlockReader::begin(input)?;
        header.header_size = reader.block_len();

        while let Some((tag_byte, value, value_offset)) = reader.next_record()? {
            let tag = Tag::from_u8(tag_byte).ok_or_else(|| {
                UmdfError::Format(format!("Unknown module header tag: {tag_byte}"))
            })?;
            match tag {
                Tag::ModuleId => {
                    let bytes: [u8; 16] = value.as_slice().try_into().map_err(|_| {
                        UmdfError::Format(format!("Invalid module id length: {}", value.len()))
                    })?;
                    header.module_id = Uuid::from_bytes(bytes);
                }
                Tag::ModuleType => {
                    let name = value_as_str(tag_byte, &value)?;
                    header.module_type = ModuleType::from_name(&name).ok_or_else(|| {
                        UmdfError::Format(format!("Unknown module type: {name}"))
                    })?;
                }
                Tag::SchemaPath => header.schema_path = value_as_str(tag_byte, &value)?,
                Tag::StringBufferSize => {
                    header.string_buffer_size = value_as_u64(tag_byte, &value)?
                }
                Tag::MetadataSize => header.metadata_size = value_as_u64(tag_byte, &value)?,
                Tag::DataSize => header.data_size = value_as_u64(tag_byte, &value)?,
                Tag::IsCurrent => {
                    header.is_current = value_as_u8(tag_byte, &value)? != 0;
                    header.is_current_offset = Some(value_offset);
                }
                Tag::PreviousVersion => {
                    header.previous_version = value_as_u64(tag_byte, &value)?
                }
                Tag::MetadataCompression => {
                    header.metadata_compression =
                        CompressionKind::from_u8(value_as_u8(tag_byte, &value)?)?
                }
                Tag::DataCompression => {
                    header.data_compression =
                        CompressionKind::from_u8(value_as_u8(tag_byte, &value)?)?
                }
                Tag::EncryptionType => {
                    header.encryption = EncryptionKind::from_u8(value_as_u8(tag_byte, &value)?)?
                }
                Tag::ModuleSalt => header.crypto.module_salt = value,
                Tag::Iv => header.crypto.iv = value,
                Tag::AuthTag => header.crypto.auth_tag = value,
                Tag::Endianness => {
                    if value_as_u8(tag_byte, &value)? != 1 {
                        return Err(UmdfError::Format(
                            "Big-endian modules are not supported".into(),
                        ));
                    }
                }
                Tag::CreatedAt => {
                    header.created_at =
                        UtcTimestamp::from_epoch_seconds(value_as_i64(tag_byte, &value)?)
                }
                Tag::CreatedBy => header.created_by = value_as_str(tag_byte, &value)?,
                Tag::ModifiedAt => {
                    header.modified_at =
                        UtcTimestamp::from_epoch_seconds(value_as_i64(tag_byte, &value)?)
                }
                Tag::ModifiedBy => header.modified_by = value_as_str(tag_byte, &value)?,
                other => {
                    return Err(UmdfError::Format(format!(
                        "Header tag {:?} is not valid in a module header",
                        other
                    )))
                }
            }
        }

        Ok(header)
    }
}
