//! Wire-level constants and primitive types shared across the container.
//!
//! Defines the file magic, format version, the module/compression/encryption
//! discriminators stored as single bytes on disk, and the audit timestamp
//! type. All multi-byte integers in the format are little-endian.

use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UmdfError};

// ── Constants ──────────────────────────────────────────────────────

/// Format version written into the magic line.
pub const FORMAT_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

/// File magic: `#UMDFv<major>.<minor>\n`.
pub const MAGIC_PREFIX: &[u8] = b"#UMDFv";

/// XREF block signature.
pub const XREF_SIGNATURE: [u8; 4] = *b"XREF";

/// Footer marker preceding the offset-to-current-XREF.
/// 12 bytes on disk, trailing NUL included.
pub const XREF_OFFSET_MARKER: [u8; 12] = *b"xrefoffset\n\0";

/// EOF marker, 8 bytes on disk, trailing NUL included.
pub const EOF_MARKER: [u8; 8] = *b"#EOUMDF\0";

/// Total footer size: marker + u64 offset + EOF marker.
pub const FOOTER_SIZE: usize = XREF_OFFSET_MARKER.len() + 8 + EOF_MARKER.len();

/// Expected XREF entry field widths: id, type, size, offset.
pub const XREF_FIELD_WIDTHS: [u8; 4] = [16, 1, 8, 8];

/// Argon2id defaults for newly created encrypted files.
/// Memory cost is in KiB.
pub const DEFAULT_MEMORY_COST: u64 = 65536;
pub const DEFAULT_TIME_COST: u32 = 3;
pub const DEFAULT_PARALLELISM: u32 = 2;

/// Base and per-module salt length in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce and tag lengths in bytes.
pub const IV_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 16;

// ── Version ────────────────────────────────────────────────────────

/// Semantic format version. Readers accept any file whose `major`
/// matches their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Parse `"1.0"` or `"1.0.3"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| UmdfError::Format(format!("Version missing {name} component")))?
                .parse::<u32>()
                .map_err(|_| UmdfError::Format(format!("Invalid version component: {s}")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = match parts.next() {
            Some(p) => p
                .parse::<u32>()
                .map_err(|_| UmdfError::Format(format!("Invalid version component: {s}")))?,
            None => 0,
        };
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    /// A file written at `self` is readable by a tool at `reader` iff
    /// the major versions match.
    pub fn is_compatible_with(&self, reader: &Version) -> bool {
        self.major == reader.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ── Module Type ────────────────────────────────────────────────────

/// Kind of module, stored as u8 in XREF entries and as a name string
/// in module header TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModuleType {
    FileHeader = 0,
    XrefTable = 1,
    Tabular = 2,
    Image = 3,
    Frame = 4,
}

impl ModuleType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::FileHeader),
            1 => Some(Self::XrefTable),
            2 => Some(Self::Tabular),
            3 => Some(Self::Image),
            4 => Some(Self::Frame),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileHeader => "file_header",
            Self::XrefTable => "xref_table",
            Self::Tabular => "tabular",
            Self::Image => "image",
            Self::Frame => "frame",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file_header" => Some(Self::FileHeader),
            "xref_table" => Some(Self::XrefTable),
            "tabular" => Some(Self::Tabular),
            "image" => Some(Self::Image),
            "frame" => Some(Self::Frame),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Compression Kind ───────────────────────────────────────────────

/// Compression applied to a module section or to image pixels.
/// Stored as u8 in header TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionKind {
    Raw = 1,
    Jpeg2000Lossless = 2,
    Png = 3,
    Zstd = 4,
}

impl CompressionKind {
    /// Decode from wire byte. Unknown values are a format error — they
    /// mean a newer writer produced the file.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Raw),
            2 => Ok(Self::Jpeg2000Lossless),
            3 => Ok(Self::Png),
            4 => Ok(Self::Zstd),
            other => Err(UmdfError::Format(format!(
                "Unknown compression kind: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Jpeg2000Lossless => "jpeg2000-lossless",
            Self::Png => "png",
            Self::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "jpeg2000_lossless" | "jpeg2000-lossless" => Some(Self::Jpeg2000Lossless),
            "png" => Some(Self::Png),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

// ── Encryption Kind ────────────────────────────────────────────────

/// Encryption applied to a module payload. Stored as u8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptionKind {
    None = 1,
    Aes256Gcm = 2,
}

impl EncryptionKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::None),
            2 => Ok(Self::Aes256Gcm),
            other => Err(UmdfError::Format(format!(
                "Unknown encryption kind: {other}"
            ))),
        }
    }
}

// ── Timestamp ──────────────────────────────────────────────────────

/// Signed epoch seconds with ISO-8601 UTC rendering. Stored as i64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(pub i64);

impl UtcTimestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_epoch_seconds(secs: i64) -> Self {
        Self(secs)
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.0
    }

    /// ISO-8601 UTC text, e.g. `2026-08-01T12:00:00Z`.
    pub fn to_iso8601(&self) -> String {
        match Utc.timestamp_opt(self.0, 0) {
            chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            _ => format!("epoch:{}", self.0),
        }
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Render the file magic line for the current format version.
pub fn magic_line() -> Vec<u8> {
    format!(
        "#UMDFv{}.{}\n",
        FORMAT_VERSION.major, FORMAT_VERSION.minor
    )
    .into_bytes()
}
