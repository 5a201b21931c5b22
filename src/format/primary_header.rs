//! Primary file header: magic line plus the encryption-parameter TLVs.
//!
//! A file starts with `#UMDFv<major>.<minor>\n`, then one TLV block:
//! `HeaderSize`, `EncryptionType`, and for encrypted files `BaseSalt`,
//! `MemoryCost`, `TimeCost` and `Parallelism`. Readers accept any file
//! whose major version matches the tool's.

use std::io::{BufRead, Read, Seek, Write};

use crate::crypto::{EncryptionKindState, EncryptionParams};
use crate::error::{Result, UmdfError};
use crate::format::tlv::{
    patch_bytes, value_as_u32, value_as_u64, value_as_u8, write_tlv, write_tlv_u32, write_tlv_u64,
    write_tlv_u8, Tag, TlvBlockReader,
};
use crate::format::types::{magic_line, EncryptionKind, Version, FORMAT_VERSION};

/// Write the magic line and primary header TLV block.
pub fn write_primary_header<W: Write + Seek>(
    out: &mut W,
    params: &EncryptionParams,
) -> Result<()> {
    out.write_all(&magic_line())?;

    let block_start = out.stream_position()?;
    let header_size_pos = write_tlv_u32(out, Tag::HeaderSize, 0)?;

    write_tlv_u8(out, Tag::EncryptionType, params.wire_kind() as u8)?;
    if params.is_encrypted() {
        write_tlv(out, Tag::BaseSalt, &params.base_salt)?;
        write_tlv_u64(out, Tag::MemoryCost, params.memory_cost)?;
        write_tlv_u32(out, Tag::TimeCost, params.time_cost)?;
        write_tlv_u32(out, Tag::Parallelism, params.parallelism)?;
    }

    let block_end = out.stream_position()?;
    let block_len = (block_end - block_start) as u32;
    patch_bytes(out, header_size_pos, &block_len.to_le_bytes())?;
    Ok(())
}

/// Read the magic line and primary header from the start of a stream.
/// Returns the encryption parameters (with no password attached).
pub fn read_primary_header<R: Read + Seek>(input: &mut R) -> Result<EncryptionParams> {
    input.rewind()?;
    let mut reader = std::io::BufReader::new(input);

    let mut magic = String::new();
    reader.read_line(&mut magic)?;
    let magic = magic.trim_end_matches('\n');
    let version_text = magic
        .strip_prefix("#UMDFv")
        .ok_or_else(|| UmdfError::Format("Invalid magic number".into()))?;
    let version = Version::parse(version_text)?;
    if !version.is_compatible_with(&FORMAT_VERSION) {
        return Err(UmdfError::Format(format!(
            "Unsupported format version {version} (tool is at {FORMAT_VERSION})"
        )));
    }

    let mut params = EncryptionParams::none();
    let mut block = TlvBlockReader::begin(&mut reader)?;
    while let Some((tag_byte, value, _)) = block.next_record()? {
        let tag = Tag::from_u8(tag_byte).ok_or_else(|| {
            UmdfError::Format(format!("Unknown primary header tag: {tag_byte}"))
        })?;
        match tag {
            Tag::EncryptionType => {
                params.kind = match EncryptionKind::from_u8(value_as_u8(tag_byte, &value)?)? {
                    EncryptionKind::None => EncryptionKindState::None,
                    EncryptionKind::Aes256Gcm => EncryptionKindState::Aes256Gcm,
                };
            }
            Tag::BaseSalt => params.base_salt = value,
            Tag::MemoryCost => params.memory_cost = value_as_u64(tag_byte, &value)?,
            Tag::TimeCost => params.time_cost = value_as_u32(tag_byte, &value)?,
            Tag::Parallelism => params.parallelism = value_as_u32(tag_byte, &value)?,
            other => {
                return Err(UmdfError::Format(format!(
                    "Header tag {other:?} is not valid in the primary header"
                )))
            }
        }
    }

    Ok(params)
}
