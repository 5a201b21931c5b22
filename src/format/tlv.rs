//! TLV primitives for header blocks.
//!
//! Every header block (primary header, module header, graph header) is a
//! stream of `{tag: u8, length: u32 LE, value: bytes}` records. The first
//! record is always `Tag::HeaderSize` carrying a u32 with the total block
//! length including itself; readers use it to bound the walk.
//!
//! Writers emit placeholder values for fields that are only known after
//! the payload is written, remember the returned value offsets, and patch
//! them in place via [`patch_bytes`].

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, UmdfError};

/// Byte length of the leading HeaderSize record: tag + len + u32 value.
pub const HEADER_SIZE_RECORD_LEN: u32 = 9;

// ── Tags ───────────────────────────────────────────────────────────

/// Header TLV tags. Values are stable across format versions; additions
/// use new numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    HeaderSize = 1,
    StringBufferSize = 2,
    MetadataSize = 3,
    DataSize = 4,
    IsCurrent = 5,
    PreviousVersion = 6,
    ModuleType = 7,
    SchemaPath = 8,
    MetadataCompression = 9,
    DataCompression = 10,
    EncryptionType = 11,
    ModuleSalt = 12,
    Iv = 13,
    AuthTag = 14,
    Endianness = 15,
    ModuleId = 16,
    CreatedAt = 17,
    ModifiedAt = 18,
    CreatedBy = 19,
    ModifiedBy = 20,
    BaseSalt = 21,
    MemoryCost = 22,
    TimeCost = 23,
    Parallelism = 24,
    EncounterSize = 25,
    LinkSize = 26,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::HeaderSize),
            2 => Some(Self::StringBufferSize),
            3 => Some(Self::MetadataSize),
            4 => Some(Self::DataSize),
            5 => Some(Self::IsCurrent),
            6 => Some(Self::PreviousVersion),
            7 => Some(Self::ModuleType),
            8 => Some(Self::SchemaPath),
            9 => Some(Self::MetadataCompression),
            10 => Some(Self::DataCompression),
            11 => Some(Self::EncryptionType),
            12 => Some(Self::ModuleSalt),
            13 => Some(Self::Iv),
            14 => Some(Self::AuthTag),
            15 => Some(Self::Endianness),
            16 => Some(Self::ModuleId),
            17 => Some(Self::CreatedAt),
            18 => Some(Self::ModifiedAt),
            19 => Some(Self::CreatedBy),
            20 => Some(Self::ModifiedBy),
            21 => Some(Self::BaseSalt),
            22 => Some(Self::MemoryCost),
            23 => Some(Self::TimeCost),
            24 => Some(Self::Parallelism),
            25 => Some(Self::EncounterSize),
            26 => Some(Self::LinkSize),
            _ => None,
        }
    }
}

// ── Writing ────────────────────────────────────────────────────────

/// Write one TLV record. Returns the absolute stream offset of the
/// *value* so the caller can patch it later.
pub fn write_tlv<W: Write + Seek>(out: &mut W, tag: Tag, value: &[u8]) -> Result<u64> {
    out.write_all(&[tag as u8])?;
    out.write_all(&(value.len() as u32).to_le_bytes())?;
    let value_offset = out.stream_position()?;
    out.write_all(value)?;
    Ok(value_offset)
}

pub fn write_tlv_u8<W: Write + Seek>(out: &mut W, tag: Tag, value: u8) -> Result<u64> {
    write_tlv(out, tag, &[value])
}

pub fn write_tlv_u32<W: Write + Seek>(out: &mut W, tag: Tag, value: u32) -> Result<u64> {
    write_tlv(out, tag, &value.to_le_bytes())
}

pub fn write_tlv_u64<W: Write + Seek>(out: &mut W, tag: Tag, value: u64) -> Result<u64> {
    write_tlv(out, tag, &value.to_le_bytes())
}

pub fn write_tlv_i64<W: Write + Seek>(out: &mut W, tag: Tag, value: i64) -> Result<u64> {
    write_tlv(out, tag, &value.to_le_bytes())
}

pub fn write_tlv_str<W: Write + Seek>(out: &mut W, tag: Tag, value: &str) -> Result<u64> {
    write_tlv(out, tag, value.as_bytes())
}

/// Overwrite `bytes` at an absolute offset, restoring the previous
/// stream position afterwards.
pub fn patch_bytes<W: Write + Seek>(out: &mut W, offset: u64, bytes: &[u8]) -> Result<()> {
    let saved = out.stream_position()?;
    out.seek(SeekFrom::Start(offset))?;
    out.write_all(bytes)?;
    out.seek(SeekFrom::Start(saved))?;
    Ok(())
}

// ── Reading ────────────────────────────────────────────────────────

/// Bounded walk over one TLV block. Consumes the leading HeaderSize
/// record on construction; `next` yields the remaining records until the
/// declared block length is exhausted.
pub struct TlvBlockReader<'a, R: Read> {
    inner: &'a mut R,
    block_len: u32,
    consumed: u32,
}

impl<'a, R: Read> std::fmt::Debug for TlvBlockReader<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlvBlockReader")
            .field("block_len", &self.block_len)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl<'a, R: Read> TlvBlockReader<'a, R> {
    /// Read the leading HeaderSize record and bind the walk to it.
    pub fn begin(inner: &'a mut R) -> Result<Self> {
        let (tag, len) = read_record_head(inner)?;
        if tag != Tag::HeaderSize as u8 {
            return Err(UmdfError::Format(
                "Header block must start with HeaderSize".into(),
            ));
        }
        if len != 4 {
            return Err(UmdfError::Format(format!(
                "Invalid HeaderSize length: {len}"
            )));
        }
        let block_len = read_u32(inner)?;
        if block_len < HEADER_SIZE_RECORD_LEN {
            return Err(UmdfError::Format(format!(
                "Declared header size too small: {block_len}"
            )));
        }
        Ok(Self {
            inner,
            block_len,
            consumed: HEADER_SIZE_RECORD_LEN,
        })
    }

    /// Total declared block length, including the HeaderSize record.
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    /// Next record as `(tag, value, value_offset)` where `value_offset`
    /// is relative to the block start. Returns `None` when the declared
    /// length is exactly consumed; over-runs are format errors.
    pub fn next_record(&mut self) -> Result<Option<(u8, Vec<u8>, u32)>> {
        if self.consumed == self.block_len {
            return Ok(None);
        }
        if self.consumed > self.block_len {
            return Err(UmdfError::Format("Header block length mismatch".into()));
        }
        let (tag, len) = read_record_head(self.inner)?;
        let value_offset = self.consumed + 5;
        let mut value = vec![0u8; len as usize];
        self.inner.read_exact(&mut value)?;
        self.consumed = self
            .consumed
            .checked_add(5 + len)
            .ok_or_else(|| UmdfError::Format("Header block length overflow".into()))?;
        if self.consumed > self.block_len {
            return Err(UmdfError::Format(
                "TLV record runs past declared header size".into(),
            ));
        }
        Ok(Some((tag, value, value_offset)))
    }
}

fn read_record_head<R: Read>(inner: &mut R) -> Result<(u8, u32)> {
    let mut tag = [0u8; 1];
    inner.read_exact(&mut tag)?;
    let len = read_u32(inner)?;
    Ok((tag[0], len))
}

fn read_u32<R: Read>(inner: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    inner.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

// ── Fixed-width value decoding ─────────────────────────────────────

pub fn value_as_u8(tag: u8, value: &[u8]) -> Result<u8> {
    if value.len() != 1 {
        return Err(UmdfError::Format(format!(
            "Tag {tag}: expected 1-byte value, got {}",
            value.len()
        )));
    }
    Ok(value[0])
}

pub fn value_as_u32(tag: u8, value: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = value
        .try_into()
        .map_err(|_| UmdfError::Format(format!("Tag {tag}: expected 4-byte value")))?;
    Ok(u32::from_le_bytes(arr))
}

pub fn value_as_u64(tag: u8, value: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = value
        .try_into()
        .map_err(|_| UmdfError::Format(format!("Tag {tag}: expected 8-byte value")))?;
    Ok(u64::from_le_bytes(arr))
}

pub fn value_as_i64(tag: u8, value: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = value
        .try_into()
        .map_err(|_| UmdfError::Format(format!("Tag {tag}: expected 8-byte value")))?;
    Ok(i64::from_le_bytes(arr))
}

pub fn value_as_str(tag: u8, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| UmdfError::Format(format!("Tag {tag}: value is not valid UTF-8")))
}
