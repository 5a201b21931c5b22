//! Binary format layer: wire types, TLV records, the string arena,
//! the primary header and the cross-reference table.

pub mod primary_header;
pub mod string_buffer;
pub mod tlv;
pub mod types;
pub mod xref;
