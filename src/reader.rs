//! Reader: memory-mapped access to a committed container file.
//!
//! Opening validates the primary header, loads the XREF via the footer,
//! and deserializes the module graph. Module payloads are loaded lazily
//! on first request, decoded from the mapped bytes at their XREF offset,
//! and cached by module id. Readers never take the writer's lock; they
//! see the consistent snapshot the footer commits to.

use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use memmap2::Mmap;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{walk_audit_trail, ModuleTrail};
use crate::crypto::EncryptionParams;
use crate::error::{Result, UmdfError};
use crate::format::primary_header::read_primary_header;
use crate::format::types::ModuleType;
use crate::format::xref::XrefTable;
use crate::graph::ModuleGraph;
use crate::module::{Module, ModuleData};
use crate::schema::resolver::SchemaResolver;

pub struct Reader {
    mmap: Mmap,
    params: EncryptionParams,
    xref: XrefTable,
    graph: ModuleGraph,
    resolver: SchemaResolver,
    cache: HashMap<Uuid, Module>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").finish_non_exhaustive()
    }
}

impl Reader {
    /// Open a committed container file read-only. Encrypted files
    /// require the password for any later module access.
    pub fn open_file(path: impl AsRef<Path>, password: Option<&str>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file) }?;

        let mut cur = Cursor::new(&mmap[..]);
        let mut params = read_primary_header(&mut cur)?;
        if params.is_encrypted() {
            match password {
                Some(password) => params.password = Some(password.to_owned()),
                None => {
                    return Err(UmdfError::Crypto(
                        "File is encrypted but no password provided".into(),
                    ))
                }
            }
        }

        let mut cur = Cursor::new(&mmap[..]);
        let xref = XrefTable::load(&mut cur)?;

        let graph_start = xref.module_graph_offset() as usize;
        let graph_end = graph_start + xref.module_graph_size() as usize;
        if graph_end > mmap.len() {
            return Err(UmdfError::Format(
                "Module graph block points past end of file".into(),
            ));
        }
        let graph = ModuleGraph::from_bytes(&mmap[graph_start..graph_end])?;

        Ok(Self {
            mmap,
            params,
            xref,
            graph,
            resolver: SchemaResolver::new(),
            cache: HashMap::new(),
        })
    }

    /// Ids of every module in the container, in XREF order.
    pub fn module_ids(&self) -> Vec<Uuid> {
        self.xref.entries().iter().map(|e| e.id).collect()
    }

    /// Summary of the container: module count, per-module type and id,
    /// and the encounter trees.
    pub fn file_info(&self) -> Value {
        let modules: Vec<Value> = self
            .xref
            .entries()
            .iter()
            .map(|entry| {
                let type_name = ModuleType::from_u8(entry.module_type)
                    .map(|t| t.as_str().to_owned())
                    .unwrap_or_else(|| format!("unknown({})", entry.module_type));
                json!({
                    "uuid": entry.id.to_string(),
                    "type": type_name,
                    "size": entry.size,
                    "offset": entry.offset,
                })
            })
            .collect();

        json!({
            "module_count": self.xref.entries().len(),
            "modules": modules,
            "graph": self.graph.to_json(),
        })
    }

    /// The encounter trees (chains plus variant/annotation fan-ins).
    pub fn encounter_tree(&self) -> Value {
        self.graph.to_json()
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    /// Load a module's content, decoding it on first access and caching
    /// by id.
    pub fn module_data(&mut self, module_id: Uuid) -> Result<ModuleData> {
        if let Some(module) = self.cache.get(&module_id) {
            return module.module_data();
        }

        let entry = *self
            .xref
            .find(module_id)
            .ok_or_else(|| UmdfError::State(format!("Module not found: {module_id}")))?;
        let module = self.load_module(entry.offset, entry.size, entry.module_type)?;
        let data = module.module_data()?;
        self.cache.insert(module_id, module);
        Ok(data)
    }

    /// Decode every module, skipping (and logging) individual failures
    /// so one corrupt module does not hide the rest.
    pub fn all_module_data(&mut self) -> Vec<(Uuid, ModuleData)> {
        let ids = self.module_ids();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.module_data(id) {
                Ok(data) => out.push((id, data)),
                Err(e) => {
                    tracing::warn!(module = %id, error = %e, "skipping unreadable module");
                }
            }
        }
        out
    }

    /// Version history of a module, newest first.
    pub fn audit_trail(&self, module_id: Uuid) -> Result<Vec<ModuleTrail>> {
        let entry = self
            .xref
            .find(module_id)
            .ok_or_else(|| UmdfError::State(format!("Module not found: {module_id}")))?;
        walk_audit_trail(&self.mmap, module_id, entry.offset)
    }

    /// Load the content of one historical version from an audit-trail
    /// entry. Not cached: superseded versions are usually one-off reads.
    pub fn audit_data(&mut self, trail: &ModuleTrail) -> Result<ModuleData> {
        let module = self.load_module(
            trail.module_offset,
            trail.module_size,
            trail.module_type as u8,
        )?;
        module.module_data()
    }

    /// Finish reading: releases the file mapping and drops every cached
    /// module. A later `open_file` sees a fresh snapshot.
    pub fn close_file(self) -> Result<()> {
        Ok(())
    }

    fn load_module(&mut self, offset: u64, size: u64, type_byte: u8) -> Result<Module> {
        let module_type = ModuleType::from_u8(type_byte).ok_or_else(|| {
            UmdfError::Format(format!("Unknown module type in XREF: {type_byte}"))
        })?;
        let start = offset as usize;
        let end = start
            .checked_add(size as usize)
            .ok_or_else(|| UmdfError::Format("Module extent overflow".into()))?;
        if end > self.mmap.len() {
            return Err(UmdfError::Format(format!(
                "Module at {offset} (+{size}) runs past end of file"
            )));
        }
        Module::from_bytes(
            &self.mmap[start..end],
            module_type,
            &self.params,
            &mut self.resolver,
        )
    }
}
