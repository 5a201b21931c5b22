//! Cross-reference table: the container's index of module locations.
//!
//! Block layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     signature: b"XREF"
//! 4       1     is_current: u8 (1 = current, 0 = obsolete)
//! 5       4     entry count: u32
//! 9       4     field widths: [16, 1, 8, 8]
//! 13      8     module graph offset: u64
//! 21      4     module graph size: u32
//! 25      32    reserved, zeroed
//! 57      41×N  entries: (id: 16, type: u8, size: u64, offset: u64)
//! ```
//!
//! The block is followed at end-of-file by the footer: the 12-byte
//! `xrefoffset\n\0` marker, the u64 offset of the current XREF block,
//! and the 8-byte `#EOUMDF\0` EOF marker. Readers locate the XREF by
//! seeking `file_size - footer_size` and following the recorded offset;
//! the footer is the sole commit point of a writer session.

use std::io::{Read, Seek, SeekFrom, Write};

use uuid::Uuid;

use crate::error::{Result, UmdfError};
use crate::format::tlv::patch_bytes;
use crate::format::types::{
    ModuleType, EOF_MARKER, FOOTER_SIZE, XREF_FIELD_WIDTHS, XREF_OFFSET_MARKER, XREF_SIGNATURE,
};

/// Byte length of one serialized entry.
const ENTRY_LEN: usize = 16 + 1 + 8 + 8;

/// Offset of the `is_current` byte within the XREF block.
const IS_CURRENT_OFFSET: u64 = 4;

/// One module's location record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrefEntry {
    pub id: Uuid,
    pub module_type: u8,
    pub size: u64,
    pub offset: u64,
}

#[derive(Debug, Default)]
pub struct XrefTable {
    entries: Vec<XrefEntry>,
    /// Offset this table was written at (or loaded from).
    xref_offset: u64,
    module_graph_offset: u64,
    module_graph_size: u32,
}

impl XrefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. An existing entry with the same id is
    /// replaced in place, so an update-by-append never leaves two live
    /// entries for one module.
    pub fn add(&mut self, module_type: ModuleType, id: Uuid, offset: u64, size: u64) {
        let entry = XrefEntry {
            id,
            module_type: module_type as u8,
            size,
            offset,
        };
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn find(&self, id: Uuid) -> Option<&XrefEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> &[XrefEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.xref_offset = 0;
        self.module_graph_offset = 0;
        self.module_graph_size = 0;
    }

    pub fn xref_offset(&self) -> u64 {
        self.xref_offset
    }

    pub fn module_graph_offset(&self) -> u64 {
        self.module_graph_offset
    }

    pub fn module_graph_size(&self) -> u32 {
        self.module_graph_size
    }

    pub fn set_module_graph(&mut self, offset: u64, size: u32) {
        self.module_graph_offset = offset;
        self.module_graph_size = size;
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Append the XREF block and footer at the end of the stream and
    /// record the block offset.
    pub fn write_to<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        out.seek(SeekFrom::End(0))?;
        self.xref_offset = out.stream_position()?;

        out.write_all(&XREF_SIGNATURE)?;
        out.write_all(&[1u8])?; // current
        out.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        out.write_all(&XREF_FIELD_WIDTHS)?;
        out.write_all(&self.module_graph_offset.to_le_bytes())?;
        out.write_all(&self.module_graph_size.to_le_bytes())?;
        out.write_all(&[0u8; 32])?;

        for entry in &self.entries {
            out.write_all(entry.id.as_bytes())?;
            out.write_all(&[entry.module_type])?;
            out.write_all(&entry.size.to_le_bytes())?;
            out.write_all(&entry.offset.to_le_bytes())?;
        }

        out.write_all(&XREF_OFFSET_MARKER)?;
        out.write_all(&self.xref_offset.to_le_bytes())?;
        out.write_all(&EOF_MARKER)?;
        Ok(())
    }

    /// Flip this table's on-disk `is_current` byte to obsolete. Used on
    /// update sessions before the replacement block is appended.
    pub fn set_obsolete<W: Write + Seek>(&self, out: &mut W) -> Result<()> {
        patch_bytes(out, self.xref_offset + IS_CURRENT_OFFSET, &[0u8])
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Load the current XREF table by walking the footer at the end of
    /// the stream.
    pub fn load<R: Read + Seek>(input: &mut R) -> Result<Self> {
        let file_size = input.seek(SeekFrom::End(0))?;
        if file_size < FOOTER_SIZE as u64 {
            return Err(UmdfError::Format(
                "File too small to contain a valid footer".into(),
            ));
        }

        input.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        let mut marker = [0u8; 12];
        input.read_exact(&mut marker)?;
        if marker != XREF_OFFSET_MARKER {
            return Err(UmdfError::Format("Invalid xref offset marker".into()));
        }
        let mut offset_bytes = [0u8; 8];
        input.read_exact(&mut offset_bytes)?;
        let xref_offset = u64::from_le_bytes(offset_bytes);
        let mut eof = [0u8; 8];
        input.read_exact(&mut eof)?;
        if eof != EOF_MARKER {
            return Err(UmdfError::Format("Invalid EOF marker".into()));
        }

        if xref_offset >= file_size {
            return Err(UmdfError::Format(format!(
                "XREF offset {xref_offset} points past end of file"
            )));
        }
        input.seek(SeekFrom::Start(xref_offset))?;

        let mut signature = [0u8; 4];
        input.read_exact(&mut signature)?;
        if signature != XREF_SIGNATURE {
            return Err(UmdfError::Format("Missing XREF signature".into()));
        }

        let mut is_current = [0u8; 1];
        input.read_exact(&mut is_current)?;
        if is_current[0] == 0 {
            return Err(UmdfError::Format("Footer points at an obsolete XREF".into()));
        }

        let mut count_bytes = [0u8; 4];
        input.read_exact(&mut count_bytes)?;
        let count = u32::from_le_bytes(count_bytes);

        let mut widths = [0u8; 4];
        input.read_exact(&mut widths)?;
        if widths != XREF_FIELD_WIDTHS {
            return Err(UmdfError::Format(format!(
                "Unexpected XREF field widths: {widths:?}"
            )));
        }

        let mut graph_offset_bytes = [0u8; 8];
        input.read_exact(&mut graph_offset_bytes)?;
        let mut graph_size_bytes = [0u8; 4];
        input.read_exact(&mut graph_size_bytes)?;

        let mut reserved = [0u8; 32];
        input.read_exact(&mut reserved)?;

        let remaining = file_size - input.stream_position()?;
        if (count as u64) * ENTRY_LEN as u64 > remaining {
            return Err(UmdfError::Format("XREF entries truncated".into()));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut id = [0u8; 16];
            input.read_exact(&mut id)?;
            let mut module_type = [0u8; 1];
            input.read_exact(&mut module_type)?;
            let mut size = [0u8; 8];
            input.read_exact(&mut size)?;
            let mut offset = [0u8; 8];
            input.read_exact(&mut offset)?;
            entries.push(XrefEntry {
                id: Uuid::from_bytes(id),
                module_type: module_type[0],
                size: u64::from_le_bytes(size),
                offset: u64::from_le_bytes(offset),
            });
        }

        Ok(Self {
            entries,
            xref_offset,
            module_graph_offset: u64::from_le_bytes(graph_offset_bytes),
            module_graph_size: u32::from_le_bytes(graph_size_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_table() -> (XrefTable, Vec<Uuid>) {
        let mut table = XrefTable::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        table.add(ModuleType::Tabular, ids[0], 100, 50);
        table.add(ModuleType::Image, ids[1], 150, 500);
        table.add(ModuleType::Tabular, ids[2], 650, 42);
        table.set_module_graph(692, 80);
        (table, ids)
    }

    #[test]
    fn test_write_load_roundtrip() {
        let (mut table, ids) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();

        let loaded = XrefTable::load(&mut cur).unwrap();
        assert_eq!(loaded.entries().len(), 3);
        assert_eq!(loaded.entries(), table.entries());
        assert_eq!(loaded.xref_offset(), 0);
        assert_eq!(loaded.module_graph_offset(), 692);
        assert_eq!(loaded.module_graph_size(), 80);
        assert!(loaded.contains(ids[1]));
        assert_eq!(loaded.find(ids[2]).unwrap().offset, 650);
    }

    #[test]
    fn test_add_replaces_same_id() {
        let mut table = XrefTable::new();
        let id = Uuid::new_v4();
        table.add(ModuleType::Tabular, id, 100, 50);
        table.add(ModuleType::Tabular, id, 900, 60);

        assert_eq!(table.entries().len(), 1);
        let entry = table.find(id).unwrap();
        assert_eq!(entry.offset, 900);
        assert_eq!(entry.size, 60);
    }

    #[test]
    fn test_entry_order_preserved() {
        let (mut table, ids) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        let loaded = XrefTable::load(&mut cur).unwrap();
        let loaded_ids: Vec<Uuid> = loaded.entries().iter().map(|e| e.id).collect();
        assert_eq!(loaded_ids, ids);
    }

    #[test]
    fn test_footer_bytes() {
        let (mut table, _) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        let bytes = cur.into_inner();

        let footer = &bytes[bytes.len() - FOOTER_SIZE..];
        assert_eq!(&footer[..12], b"xrefoffset\n\0");
        assert_eq!(&footer[20..], b"#EOUMDF\0");
        let offset = u64::from_le_bytes(footer[12..20].try_into().unwrap());
        assert_eq!(offset, 0);
        assert_eq!(&bytes[offset as usize..offset as usize + 4], b"XREF");
    }

    #[test]
    fn test_set_obsolete_rejected_on_load() {
        let (mut table, _) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        table.set_obsolete(&mut cur).unwrap();

        let err = XrefTable::load(&mut cur).unwrap_err();
        assert!(err.to_string().contains("obsolete"));
    }

    #[test]
    fn test_second_table_wins() {
        // Simulate an update session: old block flipped obsolete, new
        // block appended, footer points at the new one.
        let (mut table, ids) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        table.set_obsolete(&mut cur).unwrap();

        let new_id = Uuid::new_v4();
        table.add(ModuleType::Tabular, new_id, 999, 10);
        table.write_to(&mut cur).unwrap();

        let loaded = XrefTable::load(&mut cur).unwrap();
        assert_eq!(loaded.entries().len(), 4);
        assert!(loaded.contains(new_id));
        assert!(loaded.contains(ids[0]));
        assert!(loaded.xref_offset() > 0);
    }

    #[test]
    fn test_truncated_file() {
        let err = XrefTable::load(&mut Cursor::new(vec![0u8; 10])).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_corrupt_markers() {
        let (mut table, _) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        let mut bytes = cur.into_inner();

        // Corrupt the EOF marker.
        let n = bytes.len();
        bytes[n - 1] = b'X';
        let err = XrefTable::load(&mut Cursor::new(bytes.clone())).unwrap_err();
        assert!(err.to_string().contains("Invalid EOF marker"));

        // Corrupt the offset marker.
        bytes[n - 1] = 0;
        bytes[n - FOOTER_SIZE] = b'y';
        let err = XrefTable::load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("Invalid xref offset marker"));
    }

    #[test]
    fn test_bad_widths() {
        let (mut table, _) = sample_table();
        let mut cur = Cursor::new(Vec::new());
        table.write_to(&mut cur).unwrap();
        let mut bytes = cur.into_inner();
        bytes[9] = 99; // first width byte
        let err = XrefTable::load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("field widths"));
    }

    #[test]
    fn test_remove() {
        let (mut table, ids) = sample_table();
        assert!(table.remove(ids[0]));
        assert!(!table.remove(ids[0]));
        assert_eq!(table.entries().len(), 2);
    }
}
