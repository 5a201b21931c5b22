//! Module graph: encounters and typed links between modules.
//!
//! The graph is a DAG. Encounters group modules into a linear
//! `BelongsTo` chain from a root; `VariantOf` and `Annotates` links form
//! fan-in trees onto any module. Every insertion runs a DFS cycle check
//! and is rejected (leaving the graph unchanged) if it would close a
//! loop. Serialization is a TLV header (`HeaderSize`, `EncounterSize`,
//! `LinkSize`) followed by fixed-width encounter triples and link
//! records; soft-deleted links are written but skipped on load, and the
//! cycle check re-runs while loading to catch corrupted or hand-edited
//! blocks.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, Write};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Result, UmdfError};
use crate::format::tlv::{
    patch_bytes, value_as_u32, write_tlv_u32, Tag, TlvBlockReader,
};

// ── Link types ─────────────────────────────────────────────────────

/// Kind of relationship between two modules. Stored as u8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkKind {
    BelongsTo = 0,
    VariantOf = 1,
    Annotates = 2,
}

impl LinkKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::BelongsTo),
            1 => Ok(Self::VariantOf),
            2 => Ok(Self::Annotates),
            other => Err(UmdfError::Format(format!("Unknown link kind: {other}"))),
        }
    }
}

/// A directed, typed link. `deleted` links stay in the serialized block
/// so later sessions observe the same tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLink {
    pub source: Uuid,
    pub target: Uuid,
    pub kind: LinkKind,
    pub deleted: bool,
}

/// An encounter: a session grouping modules in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encounter {
    pub id: Uuid,
    pub root: Option<Uuid>,
    pub last: Option<Uuid>,
}

/// Serialized widths: encounter triple and link record.
const ENCOUNTER_RECORD_LEN: u32 = 48;
const LINK_RECORD_LEN: u32 = 34;

// ── Graph ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ModuleGraph {
    links: Vec<ModuleLink>,
    encounters: HashMap<Uuid, Encounter>,
    /// Insertion order of encounters, for stable serialization.
    encounter_order: Vec<Uuid>,
    adjacency: HashMap<Uuid, Vec<usize>>,
    reverse_adjacency: HashMap<Uuid, Vec<usize>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Encounters ─────────────────────────────────────────────────

    pub fn create_encounter(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        self.encounters.insert(
            id,
            Encounter {
                id,
                root: None,
                last: None,
            },
        );
        self.encounter_order.push(id);
        id
    }

    pub fn encounter_exists(&self, encounter_id: Uuid) -> bool {
        self.encounters.contains_key(&encounter_id)
    }

    pub fn encounter(&self, encounter_id: Uuid) -> Option<&Encounter> {
        self.encounters.get(&encounter_id)
    }

    pub fn encounters(&self) -> impl Iterator<Item = &Encounter> {
        self.encounter_order
            .iter()
            .filter_map(|id| self.encounters.get(id))
    }

    /// Append a module to an encounter's chain. The first module
    /// becomes both root and last; later ones hang off the previous
    /// last via a `BelongsTo` link.
    pub fn add_module_to_encounter(&mut self, encounter_id: Uuid, module_id: Uuid) -> Result<()> {
        let encounter = self.encounters.get(&encounter_id).copied().ok_or_else(|| {
            UmdfError::State(format!("Encounter {encounter_id} not found"))
        })?;

        match encounter.last {
            None => {
                let entry = self.encounters.get_mut(&encounter_id).expect("checked above");
                entry.root = Some(module_id);
                entry.last = Some(module_id);
            }
            Some(last) => {
                self.add_link(last, module_id, LinkKind::BelongsTo)?;
                let entry = self.encounters.get_mut(&encounter_id).expect("checked above");
                entry.last = Some(module_id);
            }
        }
        Ok(())
    }

    /// Remove a module and all its incident links from an encounter.
    /// Removing the root clears the encounter; removing any other
    /// module falls the `last` pointer back to the root.
    pub fn remove_module_from_encounter(
        &mut self,
        encounter_id: Uuid,
        module_id: Uuid,
    ) -> Result<()> {
        if !self.encounters.contains_key(&encounter_id) {
            return Err(UmdfError::State(format!(
                "Encounter {encounter_id} not found"
            )));
        }

        self.links
            .retain(|link| link.source != module_id && link.target != module_id);
        self.rebuild_adjacency();

        let encounter = self.encounters.get_mut(&encounter_id).expect("checked above");
        if encounter.root == Some(module_id) {
            encounter.root = None;
            encounter.last = None;
        } else if encounter.last == Some(module_id) {
            encounter.last = encounter.root;
        }
        Ok(())
    }

    // ── Links ──────────────────────────────────────────────────────

    /// Insert a typed link after proving it keeps the graph acyclic.
    /// Rejection leaves the graph unchanged.
    pub fn add_link(&mut self, source: Uuid, target: Uuid, kind: LinkKind) -> Result<()> {
        if self.would_create_cycle(source, target) {
            return Err(UmdfError::Graph(format!(
                "Link {source} -> {target} would create a cycle"
            )));
        }
        let index = self.links.len();
        self.links.push(ModuleLink {
            source,
            target,
            kind,
            deleted: false,
        });
        self.adjacency.entry(source).or_default().push(index);
        self.reverse_adjacency.entry(target).or_default().push(index);
        Ok(())
    }

    /// Remove a link matching `(source, target, kind)` from the live
    /// graph.
    pub fn remove_link(&mut self, source: Uuid, target: Uuid, kind: LinkKind) -> bool {
        let before = self.links.len();
        self.links
            .retain(|l| !(l.source == source && l.target == target && l.kind == kind));
        if self.links.len() == before {
            return false;
        }
        self.rebuild_adjacency();
        true
    }

    pub fn outgoing(&self, module_id: Uuid) -> Vec<&ModuleLink> {
        self.adjacency
            .get(&module_id)
            .map(|indices| indices.iter().map(|&i| &self.links[i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming(&self, module_id: Uuid) -> Vec<&ModuleLink> {
        self.reverse_adjacency
            .get(&module_id)
            .map(|indices| indices.iter().map(|&i| &self.links[i]).collect())
            .unwrap_or_default()
    }

    pub fn links(&self) -> &[ModuleLink] {
        &self.links
    }

    /// DFS from `target` looking for `source`: a hit means the new edge
    /// would close a loop.
    fn would_create_cycle(&self, source: Uuid, target: Uuid) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![target];
        while let Some(current) = stack.pop() {
            if current == source {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(indices) = self.adjacency.get(&current) {
                for &i in indices {
                    stack.push(self.links[i].target);
                }
            }
        }
        false
    }

    fn rebuild_adjacency(&mut self) {
        self.adjacency.clear();
        self.reverse_adjacency.clear();
        for (index, link) in self.links.iter().enumerate() {
            if link.deleted {
                continue;
            }
            self.adjacency.entry(link.source).or_default().push(index);
            self.reverse_adjacency
                .entry(link.target)
                .or_default()
                .push(index);
        }
    }

    // ── Serialization ──────────────────────────────────────────────

    /// Serialize the graph block at the stream's current position.
    /// Returns its byte length.
    pub fn write_to<W: Write + Seek>(&self, out: &mut W) -> Result<u32> {
        let block_start = out.stream_position()?;

        let header_start = block_start;
        let header_size_pos = write_tlv_u32(out, Tag::HeaderSize, 0)?;
        let encounter_size_pos = write_tlv_u32(out, Tag::EncounterSize, 0)?;
        let link_size_pos = write_tlv_u32(out, Tag::LinkSize, 0)?;
        let header_end = out.stream_position()?;
        patch_bytes(
            out,
            header_size_pos,
            &((header_end - header_start) as u32).to_le_bytes(),
        )?;

        // Encounters without a root have no modules yet and are not
        // persisted; `last` falls back to the root.
        let mut encounter_size = 0u32;
        for encounter in self.encounters() {
            let Some(root) = encounter.root else { continue };
            let last = encounter.last.unwrap_or(root);
            out.write_all(encounter.id.as_bytes())?;
            out.write_all(root.as_bytes())?;
            out.write_all(last.as_bytes())?;
            encounter_size += ENCOUNTER_RECORD_LEN;
        }

        let mut link_size = 0u32;
        for link in &self.links {
            out.write_all(link.source.as_bytes())?;
            out.write_all(link.target.as_bytes())?;
            out.write_all(&[link.kind as u8, link.deleted as u8])?;
            link_size += LINK_RECORD_LEN;
        }

        patch_bytes(out, encounter_size_pos, &encounter_size.to_le_bytes())?;
        patch_bytes(out, link_size_pos, &link_size.to_le_bytes())?;

        let block_end = out.stream_position()?;
        Ok((block_end - block_start) as u32)
    }

    /// Load a graph block from a byte slice (as recorded in the XREF).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let mut encounter_size = 0u32;
        let mut link_size = 0u32;

        let mut block = TlvBlockReader::begin(&mut cur)?;
        while let Some((tag_byte, value, _)) = block.next_record()? {
            match Tag::from_u8(tag_byte) {
                Some(Tag::EncounterSize) => encounter_size = value_as_u32(tag_byte, &value)?,
                Some(Tag::LinkSize) => link_size = value_as_u32(tag_byte, &value)?,
                _ => {
                    return Err(UmdfError::Format(format!(
                        "Invalid module graph header tag: {tag_byte}"
                    )))
                }
            }
        }

        let mut graph = Self::new();

        if encounter_size % ENCOUNTER_RECORD_LEN != 0 {
            return Err(UmdfError::Format(
                "Encounter block length is not a whole number of records".into(),
            ));
        }
        for _ in 0..(encounter_size / ENCOUNTER_RECORD_LEN) {
            let id = read_uuid(&mut cur)?;
            let root = read_uuid(&mut cur)?;
            let last = read_uuid(&mut cur)?;
            graph.encounters.insert(
                id,
                Encounter {
                    id,
                    root: Some(root),
                    last: Some(last),
                },
            );
            graph.encounter_order.push(id);
        }

        if link_size % LINK_RECORD_LEN != 0 {
            return Err(UmdfError::Format(
                "Link block length is not a whole number of records".into(),
            ));
        }
        for _ in 0..(link_size / LINK_RECORD_LEN) {
            let source = read_uuid(&mut cur)?;
            let target = read_uuid(&mut cur)?;
            let mut flags = [0u8; 2];
            cur.read_exact(&mut flags)?;
            let kind = LinkKind::from_u8(flags[0])?;
            let deleted = flags[1] != 0;

            // Tombstones are dropped from the live graph on load.
            if deleted {
                continue;
            }
            // Re-running the cycle check catches corrupted blocks.
            graph.add_link(source, target, kind).map_err(|_| {
                UmdfError::Graph(format!(
                    "Cycle detected while reading links: {source} -> {target}"
                ))
            })?;
        }

        Ok(graph)
    }

    // ── Encounter tree export ──────────────────────────────────────

    /// Export every encounter as a chain of modules with their variant
    /// and annotation fan-ins, plus a flat link summary.
    pub fn to_json(&self) -> Value {
        let encounters: Vec<Value> = self
            .encounters()
            .filter_map(|e| self.encounter_to_json(e.id))
            .collect();

        json!({
            "encounters": encounters,
            "module_graph": {
                "encounter_count": self.encounters.len(),
                "link_count": self.links.iter().filter(|l| !l.deleted).count(),
            }
        })
    }

    /// One encounter as a JSON tree: the `BelongsTo` chain from the
    /// root, each node carrying `variant` / `annotated_by` fan-ins.
    /// Returns `None` for encounters with no modules.
    pub fn encounter_to_json(&self, encounter_id: Uuid) -> Option<Value> {
        let encounter = self.encounters.get(&encounter_id)?;
        let root = encounter.root?;

        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(root);
        while let Some(module_id) = current {
            // Insertion already rejects cycles; the visited set guards
            // hand-edited files.
            if !visited.insert(module_id) {
                break;
            }
            chain.push(self.module_to_json(module_id));
            if encounter.last == Some(module_id) {
                break;
            }
            current = self
                .outgoing(module_id)
                .iter()
                .find(|l| l.kind == LinkKind::BelongsTo)
                .map(|l| l.target);
        }

        Some(json!({
            "encounter_id": encounter_id.to_string(),
            "modules": chain,
        }))
    }

    fn module_to_json(&self, module_id: Uuid) -> Value {
        let mut node = json!({"id": module_id.to_string()});

        let variants: Vec<Value> = self
            .incoming(module_id)
            .iter()
            .filter(|l| l.kind == LinkKind::VariantOf)
            .map(|l| self.module_to_json(l.source))
            .collect();
        let annotations: Vec<Value> = self
            .incoming(module_id)
            .iter()
            .filter(|l| l.kind == LinkKind::Annotates)
            .map(|l| self.module_to_json(l.source))
            .collect();

        if !variants.is_empty() {
            node["variant"] = Value::Array(variants);
        }
        if !annotations.is_empty() {
            node["annotated_by"] = Value::Array(annotations);
        }
        node
    }
}

fn read_uuid<R: Read>(input: &mut R) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    input.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}
