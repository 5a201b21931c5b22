//! Bitmap-prefixed row codec over a flattened field list.
//!
//! Object fields expand to `parent.child` leaves; every other top-level
//! field is a leaf itself. A row is `ceil(N/8)` presence-bitmap bytes
//! (bit i set iff leaf i is present) followed by the encoded bytes of the
//! present leaves only, in flattened order. Row length is therefore a
//! deterministic function of the bitmap, and decoding recomputes it
//! identically.

use serde_json::{Map, Value};

use crate::error::{Result, UmdfError};
use crate::format::string_buffer::StringBuffer;
use crate::schema::field::{Field, FieldKind};

/// One flattened leaf: a top-level scalar field, or an object member
/// addressed as `parent.child`.
#[derive(Debug)]
struct FlatLeaf<'a> {
    parent: Option<&'a str>,
    field: &'a Field,
}

/// Row encoder/decoder bound to a parsed field list.
#[derive(Debug)]
pub struct RowCodec<'a> {
    fields: &'a [Field],
    leaves: Vec<FlatLeaf<'a>>,
}

impl<'a> RowCodec<'a> {
    pub fn new(fields: &'a [Field]) -> Self {
        let mut leaves = Vec::new();
        for field in fields {
            match &field.kind {
                FieldKind::Object { children, .. } => {
                    for child in children {
                        leaves.push(FlatLeaf {
                            parent: Some(field.name.as_str()),
                            field: child,
                        });
                    }
                }
                _ => leaves.push(FlatLeaf {
                    parent: None,
                    field,
                }),
            }
        }
        Self { fields, leaves }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn bitmap_len(&self) -> usize {
        self.leaves.len().div_ceil(8)
    }

    fn leaf_value<'v>(&self, data: &'v Value, leaf: &FlatLeaf<'_>) -> Option<&'v Value> {
        let value = match leaf.parent {
            Some(parent) => {
                let parent_value = data.get(parent)?;
                if !parent_value.is_object() {
                    return None;
                }
                parent_value.get(&leaf.field.name)?
            }
            None => data.get(&leaf.field.name)?,
        };
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    }

    // ── Encoding ───────────────────────────────────────────────────

    /// Build one row from a JSON object. Checks `required` top-level
    /// names, validates every present leaf, and appends var-strings to
    /// the module string arena.
    pub fn encode_row(
        &self,
        data: &Value,
        required: &[String],
        strings: &mut StringBuffer,
    ) -> Result<Vec<u8>> {
        let obj = data.as_object().ok_or_else(|| {
            UmdfError::Schema(format!("Row value must be a JSON object, got {data}"))
        })?;

        for name in required {
            if !obj.contains_key(name) || obj[name].is_null() {
                return Err(UmdfError::Schema(format!(
                    "Row missing required field: {name}"
                )));
            }
        }

        // Unknown fields are rejected rather than silently dropped.
        for key in obj.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(UmdfError::Schema(format!(
                    "Row contains undeclared field: {key}"
                )));
            }
        }

        // Object fields validate as a unit first so required-member
        // violations surface before leaf-by-leaf encoding.
        for field in self.fields {
            if let FieldKind::Object { .. } = field.kind {
                if let Some(value) = obj.get(&field.name) {
                    if !value.is_null() {
                        field.validate(value)?;
                    }
                }
            }
        }

        let bitmap_len = self.bitmap_len();
        let mut bitmap = vec![0u8; bitmap_len];
        let mut payload_len = 0usize;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if self.leaf_value(data, leaf).is_some() {
                bitmap[i / 8] |= 1 << (i % 8);
                payload_len += leaf.field.byte_len();
            }
        }

        let mut row = vec![0u8; bitmap_len + payload_len];
        row[..bitmap_len].copy_from_slice(&bitmap);

        let mut offset = bitmap_len;
        for leaf in &self.leaves {
            if let Some(value) = self.leaf_value(data, leaf) {
                leaf.field.validate(value)?;
                leaf.field.encode(value, &mut row, offset, strings)?;
                offset += leaf.field.byte_len();
            }
        }
        debug_assert_eq!(offset, row.len());

        Ok(row)
    }

    // ── Decoding ───────────────────────────────────────────────────

    /// Row byte length implied by a presence bitmap.
    pub fn row_len(&self, bitmap: &[u8]) -> Result<usize> {
        let bitmap_len = self.bitmap_len();
        if bitmap.len() < bitmap_len {
            return Err(UmdfError::Format("Truncated row bitmap".into()));
        }
        let mut len = bitmap_len;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                len += leaf.field.byte_len();
            }
        }
        Ok(len)
    }

    /// Split a contiguous block of rows into raw row buffers. The block
    /// must contain whole rows only.
    pub fn split_rows(&self, mut bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut rows = Vec::new();
        if self.leaves.is_empty() && !bytes.is_empty() {
            return Err(UmdfError::Format(
                "Row block is non-empty but the schema has no fields".into(),
            ));
        }
        while !bytes.is_empty() {
            let len = self.row_len(bytes)?;
            if bytes.len() < len {
                return Err(UmdfError::Format(format!(
                    "Truncated row: need {len} bytes, have {}",
                    bytes.len()
                )));
            }
            rows.push(bytes[..len].to_vec());
            bytes = &bytes[len..];
        }
        Ok(rows)
    }

    /// Decode one row back to a JSON object. Absent leaves are omitted;
    /// nested leaves are reassembled under their parent object.
    pub fn decode_row(&self, row: &[u8], strings: &StringBuffer) -> Result<Value> {
        let bitmap_len = self.bitmap_len();
        if row.len() < bitmap_len {
            return Err(UmdfError::Format("Truncated row bitmap".into()));
        }
        let bitmap = &row[..bitmap_len];
        let expected = self.row_len(bitmap)?;
        if row.len() != expected {
            return Err(UmdfError::Format(format!(
                "Row length {} does not match its bitmap (expected {expected})",
                row.len()
            )));
        }

        let mut out = Map::new();
        let mut offset = bitmap_len;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) == 0 {
                continue;
            }
            let value = leaf.field.decode(row, offset, strings)?;
            offset += leaf.field.byte_len();
            match leaf.parent {
                Some(parent) => {
                    let entry = out
                        .entry(parent.to_owned())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(parent_obj) = entry {
                        parent_obj.insert(leaf.field.name.clone(), value);
                    }
                }
                None => {
                    out.insert(leaf.field.name.clone(), value);
                }
            }
        }

        Ok(Value::Object(out))
    }

    /// Decode a block of rows to a JSON array of row objects.
    pub fn decode_rows(&self, bytes: &[u8], strings: &StringBuffer) -> Result<Vec<Value>> {
        self.split_rows(bytes)?
            .iter()
            .map(|row| self.decode_row(row, strings))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::parse_field;
    use crate::schema::resolver::SchemaResolver;
    use serde_json::json;

    fn parse_fields(properties: Value) -> Vec<Field> {
        let mut resolver = SchemaResolver::new();
        properties
            .as_object()
            .unwrap()
            .iter()
            .map(|(name, def)| parse_field(name, def, &mut resolver, "schemas/test.json").unwrap())
            .collect()
    }

    fn patient_fields() -> Vec<Field> {
        parse_fields(json!({
            "age": {"type": "integer", "format": "uint8", "minimum": 0, "maximum": 120},
            "height_cm": {"type": "number", "format": "float32"},
            "name": {"type": "string"},
            "patient_id": {"type": "string", "length": 16}
        }))
    }

    #[test]
    fn test_row_roundtrip_all_present() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        assert_eq!(codec.leaf_count(), 4);
        assert_eq!(codec.bitmap_len(), 1);

        let mut strings = StringBuffer::new();
        let data = json!({
            "patient_id": "P0001",
            "name": "Jane Doe",
            "age": 30,
            "height_cm": 165.5
        });
        let row = codec.encode_row(&data, &[], &mut strings).unwrap();

        // bitmap(1) + age(1) + height(4) + name handle(12) + id(16)
        assert_eq!(row.len(), 1 + 1 + 4 + 12 + 16);
        assert_eq!(row[0], 0b1111);

        let decoded = codec.decode_row(&row, &strings).unwrap();
        assert_eq!(decoded["patient_id"], json!("P0001"));
        assert_eq!(decoded["name"], json!("Jane Doe"));
        assert_eq!(decoded["age"], json!(30));
        assert!((decoded["height_cm"].as_f64().unwrap() - 165.5).abs() < 1e-3);
    }

    #[test]
    fn test_row_absent_leaf_has_no_bytes() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let row = codec
            .encode_row(&json!({"age": 31}), &[], &mut strings)
            .unwrap();
        // bitmap + age only: no placeholder bytes for absent leaves.
        assert_eq!(row.len(), 1 + 1);
        assert_eq!(row[0], 0b0001);

        let decoded = codec.decode_row(&row, &strings).unwrap();
        assert_eq!(decoded, json!({"age": 31}));
        assert!(decoded.get("height_cm").is_none());
    }

    #[test]
    fn test_null_counts_as_absent() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let row = codec
            .encode_row(&json!({"age": 31, "height_cm": null}), &[], &mut strings)
            .unwrap();
        assert_eq!(row[0], 0b0001);
    }

    #[test]
    fn test_required_enforced() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let err = codec
            .encode_row(
                &json!({"age": 20}),
                &["patient_id".to_string()],
                &mut strings,
            )
            .unwrap_err();
        assert!(err.to_string().contains("required field: patient_id"));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let err = codec
            .encode_row(&json!({"age": "thirty"}), &[], &mut strings)
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));

        let err = codec
            .encode_row(&json!({"age": 121}), &[], &mut strings)
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));
    }

    #[test]
    fn test_nested_object_flattening() {
        let fields = parse_fields(json!({
            "vitals": {
                "type": "object",
                "properties": {
                    "pulse": {"type": "integer", "format": "uint8"},
                    "spo2": {"type": "integer", "format": "uint8"}
                },
                "required": ["pulse"]
            },
            "ward": {"type": "string", "length": 4}
        }));
        let codec = RowCodec::new(&fields);
        // vitals.pulse, vitals.spo2, ward
        assert_eq!(codec.leaf_count(), 3);

        let mut strings = StringBuffer::new();
        let row = codec
            .encode_row(
                &json!({"vitals": {"pulse": 72}, "ward": "ICU"}),
                &[],
                &mut strings,
            )
            .unwrap();

        let decoded = codec.decode_row(&row, &strings).unwrap();
        assert_eq!(decoded, json!({"vitals": {"pulse": 72}, "ward": "ICU"}));
    }

    #[test]
    fn test_nested_required_member_enforced() {
        let fields = parse_fields(json!({
            "vitals": {
                "type": "object",
                "properties": {
                    "pulse": {"type": "integer", "format": "uint8"},
                    "spo2": {"type": "integer", "format": "uint8"}
                },
                "required": ["pulse"]
            }
        }));
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let err = codec
            .encode_row(&json!({"vitals": {"spo2": 99}}), &[], &mut strings)
            .unwrap_err();
        assert!(err.to_string().contains("pulse"));
    }

    #[test]
    fn test_split_rows() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let row_a = codec
            .encode_row(&json!({"age": 30, "height_cm": 165.5}), &[], &mut strings)
            .unwrap();
        let row_b = codec.encode_row(&json!({"age": 31}), &[], &mut strings).unwrap();

        let mut block = row_a.clone();
        block.extend_from_slice(&row_b);

        let rows = codec.split_rows(&block).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row_a);
        assert_eq!(rows[1], row_b);
    }

    #[test]
    fn test_split_rows_truncated() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let row = codec
            .encode_row(&json!({"age": 30, "height_cm": 165.5}), &[], &mut strings)
            .unwrap();
        let err = codec.split_rows(&row[..row.len() - 1]).unwrap_err();
        assert!(matches!(err, UmdfError::Format(_)));
    }

    #[test]
    fn test_undeclared_field_rejected() {
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);
        let mut strings = StringBuffer::new();

        let err = codec
            .encode_row(&json!({"age": 30, "weight_kg": 60}), &[], &mut strings)
            .unwrap_err();
        assert!(err.to_string().contains("undeclared field: weight_kg"));
    }

    proptest::proptest! {
        /// Round-trip over arbitrary presence/value combinations:
        /// decode(encode(row)) == row, restricted to present leaves.
        #[test]
        fn prop_row_roundtrip(
            age in proptest::option::of(0u8..=120),
            height in proptest::option::of(0.0f32..300.0),
            name in proptest::option::of("[ -~]{0,24}"),
            patient_id in proptest::option::of("[A-Z0-9]{0,16}"),
        ) {
            let fields = patient_fields();
            let codec = RowCodec::new(&fields);
            let mut strings = StringBuffer::new();

            let mut data = Map::new();
            if let Some(age) = age {
                data.insert("age".into(), json!(age));
            }
            if let Some(height) = height {
                data.insert("height_cm".into(), json!(height));
            }
            if let Some(name) = name.clone() {
                data.insert("name".into(), json!(name));
            }
            if let Some(patient_id) = patient_id.clone() {
                data.insert("patient_id".into(), json!(patient_id));
            }
            let data = Value::Object(data);

            let row = codec.encode_row(&data, &[], &mut strings).unwrap();
            proptest::prop_assert_eq!(
                row.len(),
                codec.row_len(&row[..codec.bitmap_len()]).unwrap()
            );

            let decoded = codec.decode_row(&row, &strings).unwrap();
            proptest::prop_assert_eq!(decoded.get("age").cloned(), age.map(|a| json!(a)));
            proptest::prop_assert_eq!(
                decoded.get("height_cm").map(|v| v.as_f64().unwrap() as f32),
                height
            );
            proptest::prop_assert_eq!(
                decoded.get("name").cloned(),
                name.map(|n| json!(n))
            );
            proptest::prop_assert_eq!(
                decoded.get("patient_id").cloned(),
                patient_id.map(|p| json!(p))
            );
        }
    }

    #[test]
    fn test_bitmap_invariant() {
        // row.len() == bitmap_len + sum of present leaf lengths, for
        // every subset of present fields.
        let fields = patient_fields();
        let codec = RowCodec::new(&fields);

        let full = json!({
            "age": 1, "height_cm": 2.0, "name": "n", "patient_id": "p"
        });
        let keys = ["age", "height_cm", "name", "patient_id"];
        for mask in 0u32..16 {
            let mut data = Map::new();
            for (i, key) in keys.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    data.insert((*key).to_owned(), full[*key].clone());
                }
            }
            let mut strings = StringBuffer::new();
            let row = codec
                .encode_row(&Value::Object(data), &[], &mut strings)
                .unwrap();
            assert_eq!(row.len(), codec.row_len(&row[..codec.bitmap_len()]).unwrap());
        }
    }
}
