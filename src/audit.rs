//! Audit trail: the on-disk version history of a module.
//!
//! Every update appends a new module instance whose `PreviousVersion`
//! header field points at the superseded one. Walking that chain from
//! the current XREF offset yields the full history, newest first. The
//! module id must be identical at every stop; a mismatch means the file
//! is corrupt.

use std::io::Cursor;

use uuid::Uuid;

use crate::error::{Result, UmdfError};
use crate::format::types::{ModuleType, UtcTimestamp};
use crate::module::header::ModuleHeader;

/// One version of a module, as recorded in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTrail {
    pub module_offset: u64,
    pub module_size: u64,
    pub module_type: ModuleType,
    pub is_current: bool,
    pub created_at: UtcTimestamp,
    pub modified_at: UtcTimestamp,
    pub created_by: String,
    pub modified_by: String,
}

/// Walk the `PreviousVersion` chain starting at `start_offset` (the
/// current version's offset). `file` is the whole container's bytes.
pub fn walk_audit_trail(
    file: &[u8],
    module_id: Uuid,
    start_offset: u64,
) -> Result<Vec<ModuleTrail>> {
    let mut trail = Vec::new();
    let mut offset = start_offset;

    while offset != 0 {
        if offset as usize >= file.len() {
            return Err(UmdfError::Format(format!(
                "Audit trail offset {offset} points past end of file"
            )));
        }
        let mut cur = Cursor::new(&file[offset as usize..]);
        let header = ModuleHeader::read_from(&mut cur)?;

        if header.module_id != module_id {
            return Err(UmdfError::Format(format!(
                "Module id mismatch in audit trail: expected {module_id}, found {} at offset {offset}",
                header.module_id
            )));
        }

        trail.push(ModuleTrail {
            module_offset: offset,
            module_size: header.total_module_size(),
            module_type: header.module_type,
            is_current: header.is_current,
            created_at: header.created_at,
            modified_at: header.modified_at,
            created_by: header.created_by.clone(),
            modified_by: header.modified_by.clone(),
        });

        if header.previous_version >= offset && header.previous_version != 0 {
            // Versions only ever point backwards; anything else loops.
            return Err(UmdfError::Format(
                "Audit trail does not strictly descend".into(),
            ));
        }
        offset = header.previous_version;
    }

    Ok(trail)
}
