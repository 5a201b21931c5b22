//! Typed field tree parsed from JSON schema documents.
//!
//! A module schema declares `properties.metadata` and `properties.data`
//! sections; each property becomes a [`Field`] with a fixed on-disk
//! length. Rows are encoded as a presence bitmap followed by the present
//! fields' bytes in flattened order (see `schema::row`).
//!
//! Wire encodings per kind:
//! - integer/float: little-endian, width from `format`
//! - enum: ordinal, little-endian, width from `storage.type`
//! - fixed string: exactly `length` bytes, NUL-padded
//! - var string: `(offset: u64, length: u32)` handle into the string arena
//! - array: `actual_len: u16` then capacity for `max_items` items

use serde_json::Value;

use crate::error::{Result, UmdfError};
use crate::format::string_buffer::StringBuffer;
use crate::schema::resolver::SchemaResolver;

/// Bytes a var-string handle occupies in a row.
pub const VAR_STRING_LEN: usize = 12;

// ── Formats ────────────────────────────────────────────────────────

/// Integer storage format: signedness plus byte width (1, 2 or 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerFormat {
    pub signed: bool,
    pub byte_len: usize,
}

impl IntegerFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format {
            "uint8" => Ok(Self { signed: false, byte_len: 1 }),
            "uint16" => Ok(Self { signed: false, byte_len: 2 }),
            "uint32" => Ok(Self { signed: false, byte_len: 4 }),
            "int8" => Ok(Self { signed: true, byte_len: 1 }),
            "int16" => Ok(Self { signed: true, byte_len: 2 }),
            "int32" => Ok(Self { signed: true, byte_len: 4 }),
            other => Err(UmdfError::Schema(format!(
                "Unsupported integer format: {other}"
            ))),
        }
    }

    /// Inclusive value range representable at this width.
    fn value_range(&self) -> (i64, i64) {
        let bits = (self.byte_len * 8) as u32;
        if self.signed {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFormat {
    F32,
    F64,
}

impl FloatFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format {
            "float32" => Ok(Self::F32),
            "float64" => Ok(Self::F64),
            other => Err(UmdfError::Schema(format!(
                "Unsupported number format: {other}"
            ))),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

// ── Field tree ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FieldKind {
    Integer {
        format: IntegerFormat,
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Float {
        format: FloatFormat,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    /// Fixed-length string, NUL-padded on disk.
    FixedString { length: usize },
    /// Variable-length string stored in the module string arena.
    VarString,
    /// Closed value set stored as a little-endian ordinal.
    Enum { values: Vec<String>, storage: usize },
    Array {
        item: Box<Field>,
        min_items: usize,
        max_items: usize,
    },
    Object {
        children: Vec<Field>,
        required: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    /// Fixed on-disk byte length of one encoded value.
    pub fn byte_len(&self) -> usize {
        match &self.kind {
            FieldKind::Integer { format, .. } => format.byte_len,
            FieldKind::Float { format, .. } => format.byte_len(),
            FieldKind::FixedString { length } => *length,
            FieldKind::VarString => VAR_STRING_LEN,
            FieldKind::Enum { storage, .. } => *storage,
            FieldKind::Array {
                item, max_items, ..
            } => 2 + item.byte_len() * max_items,
            FieldKind::Object { children, .. } => {
                children.iter().map(Field::byte_len).sum()
            }
        }
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Check a JSON value against this field's type and constraints.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match &self.kind {
            FieldKind::Integer {
                format,
                minimum,
                maximum,
            } => {
                let v = value.as_i64().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected an integer, got {value}",
                        self.name
                    ))
                })?;
                if !format.signed && v < 0 {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}' is unsigned but got {v}",
                        self.name
                    )));
                }
                let (lo, hi) = format.value_range();
                if v < lo || v > hi {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}' value {v} does not fit its storage width",
                        self.name
                    )));
                }
                if let Some(min) = minimum {
                    if v < *min {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' value {v} below minimum {min}",
                            self.name
                        )));
                    }
                }
                if let Some(max) = maximum {
                    if v > *max {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' value {v} above maximum {max}",
                            self.name
                        )));
                    }
                }
                Ok(())
            }
            FieldKind::Float {
                minimum, maximum, ..
            } => {
                let v = value.as_f64().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected a number, got {value}",
                        self.name
                    ))
                })?;
                if let Some(min) = minimum {
                    if v < *min {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' value {v} below minimum {min}",
                            self.name
                        )));
                    }
                }
                if let Some(max) = maximum {
                    if v > *max {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' value {v} above maximum {max}",
                            self.name
                        )));
                    }
                }
                Ok(())
            }
            FieldKind::FixedString { length } => {
                let s = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected a string, got {value}",
                        self.name
                    ))
                })?;
                if s.len() > *length {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}' string of {} bytes exceeds fixed length {length}",
                        self.name,
                        s.len()
                    )));
                }
                Ok(())
            }
            FieldKind::VarString => {
                if !value.is_string() {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}' expected a string, got {value}",
                        self.name
                    )));
                }
                Ok(())
            }
            FieldKind::Enum { values, .. } => {
                let s = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected an enum string, got {value}",
                        self.name
                    ))
                })?;
                if !values.iter().any(|v| v == s) {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}': '{s}' is not a member of the enum",
                        self.name
                    )));
                }
                Ok(())
            }
            FieldKind::Array {
                item,
                min_items,
                max_items,
            } => {
                let items = value.as_array().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected an array, got {value}",
                        self.name
                    ))
                })?;
                if items.len() < *min_items || items.len() > *max_items {
                    return Err(UmdfError::Schema(format!(
                        "Field '{}' has {} items, outside [{min_items}, {max_items}]",
                        self.name,
                        items.len()
                    )));
                }
                for item_value in items {
                    item.validate(item_value)?;
                }
                Ok(())
            }
            FieldKind::Object { children, required } => {
                let obj = value.as_object().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}' expected an object, got {value}",
                        self.name
                    ))
                })?;
                for name in required {
                    if !obj.contains_key(name) || obj[name].is_null() {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' missing required member '{name}'",
                            self.name
                        )));
                    }
                }
                for key in obj.keys() {
                    if !children.iter().any(|c| &c.name == key) {
                        return Err(UmdfError::Schema(format!(
                            "Field '{}' contains undeclared member '{key}'",
                            self.name
                        )));
                    }
                }
                for child in children {
                    if let Some(member) = obj.get(&child.name) {
                        if !member.is_null() {
                            child.validate(member)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    // ── Encoding ───────────────────────────────────────────────────

    /// Encode a validated value into `buf` at `offset`. The slice must
    /// have `byte_len()` bytes available at the offset.
    pub fn encode(
        &self,
        value: &Value,
        buf: &mut [u8],
        offset: usize,
        strings: &mut StringBuffer,
    ) -> Result<()> {
        match &self.kind {
            FieldKind::Integer { format, .. } => {
                let v = value.as_i64().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected an integer", self.name))
                })?;
                let bytes = v.to_le_bytes();
                buf[offset..offset + format.byte_len]
                    .copy_from_slice(&bytes[..format.byte_len]);
                Ok(())
            }
            FieldKind::Float { format, .. } => {
                let v = value.as_f64().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected a number", self.name))
                })?;
                match format {
                    FloatFormat::F32 => {
                        buf[offset..offset + 4].copy_from_slice(&(v as f32).to_le_bytes());
                    }
                    FloatFormat::F64 => {
                        buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
                    }
                }
                Ok(())
            }
            FieldKind::FixedString { length } => {
                let s = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected a string", self.name))
                })?;
                let copy_len = s.len().min(*length);
                buf[offset..offset + copy_len].copy_from_slice(&s.as_bytes()[..copy_len]);
                for b in &mut buf[offset + copy_len..offset + length] {
                    *b = 0;
                }
                Ok(())
            }
            FieldKind::VarString => {
                let s = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected a string", self.name))
                })?;
                let start = strings.add(s);
                buf[offset..offset + 8].copy_from_slice(&start.to_le_bytes());
                buf[offset + 8..offset + 12]
                    .copy_from_slice(&(s.len() as u32).to_le_bytes());
                Ok(())
            }
            FieldKind::Enum { values, storage } => {
                let s = value.as_str().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected an enum string", self.name))
                })?;
                let ordinal = values.iter().position(|v| v == s).ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "Field '{}': '{s}' is not a member of the enum",
                        self.name
                    ))
                })? as u32;
                let bytes = ordinal.to_le_bytes();
                buf[offset..offset + storage].copy_from_slice(&bytes[..*storage]);
                Ok(())
            }
            FieldKind::Array { item, .. } => {
                let items = value.as_array().ok_or_else(|| {
                    UmdfError::Schema(format!("Field '{}' expected an array", self.name))
                })?;
                buf[offset..offset + 2]
                    .copy_from_slice(&(items.len() as u16).to_le_bytes());
                let item_len = item.byte_len();
                let mut item_offset = offset + 2;
                for item_value in items {
                    item.encode(item_value, buf, item_offset, strings)?;
                    item_offset += item_len;
                }
                // Remaining capacity stays zeroed.
                Ok(())
            }
            FieldKind::Object { .. } => Err(UmdfError::Schema(format!(
                "Object field '{}' must be encoded through its flattened leaves",
                self.name
            ))),
        }
    }

    // ── Decoding ───────────────────────────────────────────────────

    /// Decode a value from `buf` at `offset`.
    pub fn decode(&self, buf: &[u8], offset: usize, strings: &StringBuffer) -> Result<Value> {
        let end = offset + self.byte_len();
        if end > buf.len() {
            return Err(UmdfError::Format(format!(
                "Row truncated while decoding field '{}'",
                self.name
            )));
        }
        match &self.kind {
            FieldKind::Integer { format, .. } => {
                let mut raw = [0u8; 8];
                raw[..format.byte_len].copy_from_slice(&buf[offset..offset + format.byte_len]);
                let unsigned = u64::from_le_bytes(raw);
                let v = if format.signed {
                    // Sign-extend from the stored width.
                    let shift = 64 - (format.byte_len * 8) as u32;
                    ((unsigned << shift) as i64) >> shift
                } else {
                    unsigned as i64
                };
                Ok(Value::from(v))
            }
            FieldKind::Float { format, .. } => match format {
                FloatFormat::F32 => {
                    let v = f32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                    Ok(Value::from(v))
                }
                FloatFormat::F64 => {
                    let v = f64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                    Ok(Value::from(v))
                }
            },
            FieldKind::FixedString { length } => {
                let raw = &buf[offset..offset + length];
                let trimmed = match raw.iter().position(|&b| b == 0) {
                    Some(nul) => &raw[..nul],
                    None => raw,
                };
                let s = std::str::from_utf8(trimmed).map_err(|_| {
                    UmdfError::Format(format!(
                        "Field '{}' holds invalid UTF-8 on disk",
                        self.name
                    ))
                })?;
                Ok(Value::from(s))
            }
            FieldKind::VarString => {
                let start = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                let length = u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().unwrap());
                Ok(Value::from(strings.get(start, length)?))
            }
            FieldKind::Enum { values, storage } => {
                let mut raw = [0u8; 4];
                raw[..*storage].copy_from_slice(&buf[offset..offset + storage]);
                let ordinal = u32::from_le_bytes(raw) as usize;
                let member = values.get(ordinal).ok_or_else(|| {
                    UmdfError::Format(format!(
                        "Field '{}': enum ordinal {ordinal} out of range",
                        self.name
                    ))
                })?;
                Ok(Value::from(member.as_str()))
            }
            FieldKind::Array { item, max_items, .. } => {
                let actual =
                    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
                if actual > *max_items {
                    return Err(UmdfError::Format(format!(
                        "Field '{}': stored array length {actual} exceeds capacity {max_items}",
                        self.name
                    )));
                }
                let item_len = item.byte_len();
                let mut out = Vec::with_capacity(actual);
                let mut item_offset = offset + 2;
                for _ in 0..actual {
                    out.push(item.decode(buf, item_offset, strings)?);
                    item_offset += item_len;
                }
                Ok(Value::Array(out))
            }
            FieldKind::Object { .. } => Err(UmdfError::Schema(format!(
                "Object field '{}' must be decoded through its flattened leaves",
                self.name
            ))),
        }
    }
}

// ── Schema parsing ─────────────────────────────────────────────────

/// Parse one property definition into a [`Field`]. `$ref` definitions are
/// resolved through the guarded resolver relative to `base_schema_path`.
pub fn parse_field(
    name: &str,
    definition: &Value,
    resolver: &mut SchemaResolver,
    base_schema_path: &str,
) -> Result<Field> {
    // $ref wins over everything else in the definition.
    if let Some(reference) = definition.get("$ref") {
        let reference = reference.as_str().ok_or_else(|| {
            UmdfError::Schema(format!("Field '{name}': $ref must be a string"))
        })?;
        let canonical = resolver.begin_reference(reference, base_schema_path)?;
        let result = resolver.get_by_path(&canonical).and_then(|resolved| {
            let base = canonical.to_string_lossy().into_owned();
            parse_field(name, &resolved, resolver, &base)
        });
        resolver.end_reference();
        return result;
    }

    // Enums are recognized before the type switch.
    if let Some(values) = definition.get("enum") {
        let values: Vec<String> = values
            .as_array()
            .ok_or_else(|| UmdfError::Schema(format!("Field '{name}': enum must be an array")))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        UmdfError::Schema(format!("Field '{name}': enum members must be strings"))
                    })
            })
            .collect::<Result<_>>()?;
        if values.is_empty() {
            return Err(UmdfError::Schema(format!(
                "Field '{name}': enum must not be empty"
            )));
        }
        let storage = match definition
            .pointer("/storage/type")
            .and_then(Value::as_str)
            .unwrap_or("uint8")
        {
            "uint8" => 1,
            "uint16" => 2,
            "uint32" => 4,
            other => {
                return Err(UmdfError::Schema(format!(
                    "Field '{name}': unsupported enum storage type: {other}"
                )))
            }
        };
        return Ok(Field {
            name: name.to_owned(),
            kind: FieldKind::Enum { values, storage },
        });
    }

    let field_type = definition
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("string");

    match field_type {
        "integer" => {
            let format = definition
                .get("format")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    UmdfError::Schema(format!("Integer field '{name}' missing 'format'"))
                })?;
            Ok(Field {
                name: name.to_owned(),
                kind: FieldKind::Integer {
                    format: IntegerFormat::parse(format)?,
                    minimum: definition.get("minimum").and_then(Value::as_i64),
                    maximum: definition.get("maximum").and_then(Value::as_i64),
                },
            })
        }
        "number" => {
            let format = definition
                .get("format")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    UmdfError::Schema(format!("Number field '{name}' missing 'format'"))
                })?;
            Ok(Field {
                name: name.to_owned(),
                kind: FieldKind::Float {
                    format: FloatFormat::parse(format)?,
                    minimum: definition.get("minimum").and_then(Value::as_f64),
                    maximum: definition.get("maximum").and_then(Value::as_f64),
                },
            })
        }
        "string" => match definition.get("length") {
            Some(length) => {
                let length = length.as_u64().ok_or_else(|| {
                    UmdfError::Schema(format!(
                        "String field '{name}': 'length' must be a non-negative integer"
                    ))
                })? as usize;
                Ok(Field {
                    name: name.to_owned(),
                    kind: FieldKind::FixedString { length },
                })
            }
            None => Ok(Field {
                name: name.to_owned(),
                kind: FieldKind::VarString,
            }),
        },
        "object" => {
            let properties = definition
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    UmdfError::Schema(format!("Object field '{name}' missing 'properties'"))
                })?;
            let required: Vec<String> = match definition.get("required") {
                Some(Value::Array(names)) => names
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_owned).ok_or_else(|| {
                            UmdfError::Schema(format!(
                                "Object field '{name}': required entries must be strings"
                            ))
                        })
                    })
                    .collect::<Result<_>>()?,
                _ => Vec::new(),
            };
            for required_name in &required {
                if !properties.contains_key(required_name) {
                    return Err(UmdfError::Schema(format!(
                        "Object field '{name}': required member '{required_name}' not in properties"
                    )));
                }
            }
            let mut children = Vec::with_capacity(properties.len());
            for (child_name, child_def) in properties {
                children.push(parse_field(child_name, child_def, resolver, base_schema_path)?);
            }
            Ok(Field {
                name: name.to_owned(),
                kind: FieldKind::Object { children, required },
            })
        }
        "array" => {
            let items = definition.get("items").ok_or_else(|| {
                UmdfError::Schema(format!("Array field '{name}' missing 'items'"))
            })?;
            let min_items = definition
                .get("minItems")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    UmdfError::Schema(format!("Array field '{name}' missing 'minItems'"))
                })? as usize;
            let max_items = definition
                .get("maxItems")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    UmdfError::Schema(format!("Array field '{name}' missing 'maxItems'"))
                })? as usize;
            if max_items < min_items {
                return Err(UmdfError::Schema(format!(
                    "Array field '{name}': maxItems {max_items} below minItems {min_items}"
                )));
            }
            let item = parse_field("item", items, resolver, base_schema_path)?;
            match item.kind {
                FieldKind::Object { .. } | FieldKind::Array { .. } | FieldKind::VarString => {
                    Err(UmdfError::Schema(format!(
                        "Array field '{name}': unsupported item type"
                    )))
                }
                _ => Ok(Field {
                    name: name.to_owned(),
                    kind: FieldKind::Array {
                        item: Box::new(item),
                        min_items,
                        max_items,
                    },
                }),
            }
        }
        other => Err(UmdfError::Schema(format!(
            "Unsupported field type for '{name}': {other}"
        ))),
    }
}
