//! Schema `$ref` resolution with cycle and depth guards.
//!
//! The resolver is an explicit value owned by the caller (the field
//! parser), not process-global state. It holds a cache of loaded schema
//! documents keyed by canonical path and a resolution stack of canonical
//! paths used to detect circular references.
//!
//! Reference spellings:
//! - `/a/b.json`   — project-root-relative (leading slash stripped)
//! - `./b.json`    — relative to the referencing schema's directory
//! - `../b.json`   — up one level from the referencing schema's directory
//! - `b.json`      — same as `./b.json`
//!
//! Tracking is by canonical path, so `./a.json` and `a.json` collide.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, UmdfError};

/// Hard ceiling on nested `$ref` expansion.
pub const MAX_REFERENCE_DEPTH: usize = 50;

#[derive(Debug, Default)]
pub struct SchemaResolver {
    cache: HashMap<PathBuf, Value>,
    stack: Vec<PathBuf>,
}

impl SchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the canonical path for `reference` as seen from `base`.
    pub fn resolve_relative(reference: &str, base: &str) -> PathBuf {
        if let Some(root_relative) = reference.strip_prefix('/') {
            return normalize(Path::new(root_relative));
        }

        let base_dir = Path::new(base).parent().unwrap_or_else(|| Path::new(""));
        let relative = reference
            .strip_prefix("./")
            .map(Path::new)
            .unwrap_or_else(|| Path::new(reference));
        normalize(&base_dir.join(relative))
    }

    /// Begin resolving a `$ref`: compute the canonical path, reject
    /// cycles and depth overflow, and push onto the stack. The caller
    /// must pair this with [`end_reference`](Self::end_reference).
    pub fn begin_reference(&mut self, reference: &str, base: &str) -> Result<PathBuf> {
        let canonical = Self::resolve_relative(reference, base);

        if self.stack.contains(&canonical) {
            let trace: Vec<String> = self
                .stack
                .iter()
                .map(|p| p.display().to_string())
                .chain(std::iter::once(canonical.display().to_string()))
                .collect();
            return Err(UmdfError::Resolution(format!(
                "Circular reference detected: {}",
                trace.join(" -> ")
            )));
        }

        if self.stack.len() >= MAX_REFERENCE_DEPTH {
            return Err(UmdfError::Resolution(format!(
                "Schema reference depth exceeded ({MAX_REFERENCE_DEPTH}) at {}",
                canonical.display()
            )));
        }

        self.stack.push(canonical.clone());
        Ok(canonical)
    }

    /// Pop the top of the resolution stack. No-op on an empty stack.
    pub fn end_reference(&mut self) {
        self.stack.pop();
    }

    /// Fetch a schema by canonical path: cache hit or load from disk.
    pub fn get_by_path(&mut self, canonical: &Path) -> Result<Value> {
        if let Some(cached) = self.cache.get(canonical) {
            return Ok(cached.clone());
        }

        let text = fs::read_to_string(canonical).map_err(|e| {
            UmdfError::Schema(format!(
                "Failed to open referenced schema {}: {e}",
                canonical.display()
            ))
        })?;
        let schema: Value = serde_json::from_str(&text)?;
        self.cache.insert(canonical.to_path_buf(), schema.clone());
        Ok(schema)
    }

    /// Drop the cache and stack. Long-lived processes call this to avoid
    /// stale reads of edited schema files.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.stack.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }
}

/// Lexical path normalization: resolves `.` and `..` without touching
/// the filesystem, so unsaved spellings of the same file still collide.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}
