//! Writer: atomic container sessions.
//!
//! All writes land in a `path.tmp` side file while an exclusive advisory
//! lock is held on `path`. Modules append in call order; the module
//! graph and a fresh XREF block are written wholesale at close, the temp
//! is validated end-to-end, and only then atomically renamed over the
//! target. Any failure before the rename removes the temp and leaves
//! the original untouched — the footer of the renamed file is the sole
//! commit point.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use uuid::Uuid;

use crate::crypto::EncryptionParams;
use crate::error::{Result, UmdfError};
use crate::format::primary_header::{read_primary_header, write_primary_header};
use crate::format::xref::XrefTable;
use crate::graph::{LinkKind, ModuleGraph};
use crate::module::header::ModuleHeader;
use crate::module::{Module, ModuleData};
use crate::schema::resolver::SchemaResolver;

// ── File lock ──────────────────────────────────────────────────────

/// Exclusive advisory lock on the target path, released on drop.
#[derive(Debug)]
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            UmdfError::State(format!(
                "File is already locked by another process: {}",
                path.display()
            ))
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ── Writer ─────────────────────────────────────────────────────────

pub struct Writer {
    file_path: PathBuf,
    temp_path: PathBuf,
    stream: File,
    _lock: FileLock,
    params: EncryptionParams,
    xref: XrefTable,
    graph: ModuleGraph,
    resolver: SchemaResolver,
    author: String,
    new_file: bool,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl Writer {
    /// Create a new container file. Fails if `path` already exists.
    /// With a password the file is AES-256-GCM encrypted under fresh
    /// Argon2id parameters.
    pub fn create_new_file(
        path: impl AsRef<Path>,
        author: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(UmdfError::State(format!(
                "Trying to create new file, but file already exists: {}",
                path.display()
            )));
        }

        // Touch the target so it can carry the lock.
        File::create(path)?;
        let lock = match FileLock::acquire(path) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(e);
            }
        };

        let temp_path = temp_path_for(path);
        let stream = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(e.into());
            }
        };

        let params = match password {
            Some(password) => EncryptionParams::generate(password),
            None => EncryptionParams::none(),
        };

        let mut writer = Self {
            file_path: path.to_path_buf(),
            temp_path,
            stream,
            _lock: lock,
            params,
            xref: XrefTable::new(),
            graph: ModuleGraph::new(),
            resolver: SchemaResolver::new(),
            author: author.to_owned(),
            new_file: true,
        };

        if let Err(e) = write_primary_header(&mut writer.stream, &writer.params) {
            writer.discard();
            return Err(e);
        }
        Ok(writer)
    }

    /// Open an existing container for modification. Encrypted files
    /// require the password up front.
    pub fn open_file(
        path: impl AsRef<Path>,
        author: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(UmdfError::State(format!(
                "File does not exist: {}",
                path.display()
            )));
        }
        if fs::metadata(path)?.len() == 0 {
            return Err(UmdfError::State(format!(
                "File is empty: {}",
                path.display()
            )));
        }

        let lock = FileLock::acquire(path)?;

        let temp_path = temp_path_for(path);
        if temp_path.exists() {
            fs::remove_file(&temp_path)?;
        }
        fs::copy(path, &temp_path)?;
        let stream = OpenOptions::new().read(true).write(true).open(&temp_path)?;

        let mut writer = Self {
            file_path: path.to_path_buf(),
            temp_path,
            stream,
            _lock: lock,
            params: EncryptionParams::none(),
            xref: XrefTable::new(),
            graph: ModuleGraph::new(),
            resolver: SchemaResolver::new(),
            author: author.to_owned(),
            new_file: false,
        };

        match writer.load_existing(password) {
            Ok(()) => Ok(writer),
            Err(e) => {
                writer.discard();
                Err(e)
            }
        }
    }

    fn load_existing(&mut self, password: Option<&str>) -> Result<()> {
        self.params = read_primary_header(&mut self.stream)?;
        if self.params.is_encrypted() {
            match password {
                Some(password) => self.params.password = Some(password.to_owned()),
                None => {
                    return Err(UmdfError::Crypto(
                        "File is encrypted but no password provided".into(),
                    ))
                }
            }
        }

        self.xref = XrefTable::load(&mut self.stream)?;

        let graph_offset = self.xref.module_graph_offset();
        let graph_size = self.xref.module_graph_size() as usize;
        self.stream.seek(SeekFrom::Start(graph_offset))?;
        let mut graph_bytes = vec![0u8; graph_size];
        self.stream.read_exact(&mut graph_bytes)?;
        self.graph = ModuleGraph::from_bytes(&graph_bytes)?;
        Ok(())
    }

    // ── Graph-scoped module creation ───────────────────────────────

    /// Start a new encounter.
    pub fn create_encounter(&mut self) -> Uuid {
        self.graph.create_encounter()
    }

    /// Append a module to an encounter's chain and write it. On write
    /// failure the graph edit is rolled back.
    pub fn add_module_to_encounter(
        &mut self,
        encounter_id: Uuid,
        schema_path: &str,
        module: &ModuleData,
    ) -> Result<Uuid> {
        if !self.graph.encounter_exists(encounter_id) {
            return Err(UmdfError::State(format!(
                "Encounter {encounter_id} not found"
            )));
        }

        let module_id = Uuid::new_v4();
        self.graph.add_module_to_encounter(encounter_id, module_id)?;

        if let Err(e) = self.append_module(schema_path, module_id, module) {
            self.graph
                .remove_module_from_encounter(encounter_id, module_id)?;
            return Err(e);
        }
        Ok(module_id)
    }

    /// Write a module linked to `parent` as a variant.
    pub fn add_variant_module(
        &mut self,
        parent_id: Uuid,
        schema_path: &str,
        module: &ModuleData,
    ) -> Result<Uuid> {
        self.add_linked_module(parent_id, schema_path, module, LinkKind::VariantOf)
    }

    /// Write a module linked to `parent` as an annotation.
    pub fn add_annotation(
        &mut self,
        parent_id: Uuid,
        schema_path: &str,
        module: &ModuleData,
    ) -> Result<Uuid> {
        self.add_linked_module(parent_id, schema_path, module, LinkKind::Annotates)
    }

    fn add_linked_module(
        &mut self,
        parent_id: Uuid,
        schema_path: &str,
        module: &ModuleData,
        kind: LinkKind,
    ) -> Result<Uuid> {
        if !self.xref.contains(parent_id) {
            return Err(UmdfError::State(format!(
                "Parent module does not exist: {parent_id}"
            )));
        }

        let module_id = Uuid::new_v4();
        self.graph.add_link(module_id, parent_id, kind)?;

        if let Err(e) = self.append_module(schema_path, module_id, module) {
            self.graph.remove_link(module_id, parent_id, kind);
            return Err(e);
        }
        Ok(module_id)
    }

    /// Replace a module's content by appending a new version. The old
    /// instance is demoted in place (`IsCurrent` byte) and linked from
    /// the new one's `PreviousVersion` pointer; its relationships are
    /// untouched. The demotion happens only after the replacement is
    /// fully on the stream, so a failed update leaves the old version
    /// current and the XREF unchanged.
    pub fn update_module(&mut self, module_id: Uuid, module: &ModuleData) -> Result<()> {
        let entry = *self
            .xref
            .find(module_id)
            .ok_or_else(|| UmdfError::State(format!("Module not found: {module_id}")))?;

        self.stream.seek(SeekFrom::Start(entry.offset))?;
        let mut old_header = ModuleHeader::read_from(&mut self.stream)?;

        let schema = self
            .resolver
            .get_by_path(Path::new(&old_header.schema_path))?;
        let mut replacement = Module::create(
            &old_header.schema_path,
            schema,
            module_id,
            &self.params,
            &mut self.resolver,
        )?;
        replacement.header.previous_version = entry.offset;
        replacement.add_metadata(&module.metadata)?;
        replacement.add_data(&module.data, &mut self.resolver)?;

        let start = self.stream.seek(SeekFrom::End(0))?;
        replacement.write_binary(
            start,
            &mut self.stream,
            &mut self.xref,
            &self.author,
            &self.params,
        )?;

        old_header.update_is_current(&mut self.stream, entry.offset, false)
    }

    fn append_module(
        &mut self,
        schema_path: &str,
        module_id: Uuid,
        module: &ModuleData,
    ) -> Result<()> {
        let schema = self.resolver.get_by_path(Path::new(schema_path))?;
        let mut new_module = Module::create(
            schema_path,
            schema,
            module_id,
            &self.params,
            &mut self.resolver,
        )?;
        new_module.add_metadata(&module.metadata)?;
        new_module.add_data(&module.data, &mut self.resolver)?;

        let start = self.stream.seek(SeekFrom::End(0))?;
        new_module.write_binary(
            start,
            &mut self.stream,
            &mut self.xref,
            &self.author,
            &self.params,
        )
    }

    // ── Session end ────────────────────────────────────────────────

    /// Discard every pending change: remove the temp, release the lock.
    /// The original file is never touched.
    pub fn cancel_then_close(mut self) -> Result<()> {
        self.discard();
        Ok(())
    }

    /// Commit the session: serialize the graph, demote the old XREF,
    /// append the new one, validate the temp, and atomically rename it
    /// over the target.
    pub fn close_file(mut self) -> Result<()> {
        if self.xref.is_empty() {
            // Nothing was written; an empty session leaves no trace.
            self.discard();
            return Ok(());
        }

        let result = self.commit();
        if result.is_err() {
            self.discard();
        }
        result
    }

    fn commit(&mut self) -> Result<()> {
        let graph_offset = self.stream.seek(SeekFrom::End(0))?;
        let graph_size = self.graph.write_to(&mut self.stream)?;
        self.xref.set_module_graph(graph_offset, graph_size);

        if !self.new_file {
            self.xref.set_obsolete(&mut self.stream)?;
        }
        self.xref.write_to(&mut self.stream)?;

        self.stream.flush()?;
        self.stream.sync_all()?;

        self.validate_temp()?;

        fs::rename(&self.temp_path, &self.file_path)?;
        tracing::debug!(path = %self.file_path.display(), "container committed");
        self.new_file = false;
        Ok(())
    }

    /// Re-open the finished temp and prove it loads end to end: primary
    /// header, XREF, and every module header.
    fn validate_temp(&mut self) -> Result<()> {
        let mut check = File::open(&self.temp_path)?;

        read_primary_header(&mut check)
            .map_err(|e| UmdfError::Format(format!("Temp validation failed on header: {e}")))?;

        let xref = XrefTable::load(&mut check)
            .map_err(|e| UmdfError::Format(format!("Temp validation failed on XREF: {e}")))?;

        for entry in xref.entries() {
            check.seek(SeekFrom::Start(entry.offset))?;
            ModuleHeader::read_from(&mut check).map_err(|e| {
                UmdfError::Format(format!(
                    "Temp validation failed on module {}: {e}",
                    entry.id
                ))
            })?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        if self.temp_path.exists() {
            let _ = fs::remove_file(&self.temp_path);
        }
        // A freshly touched, never-committed target is removed too.
        if let Ok(meta) = fs::metadata(&self.file_path) {
            if meta.len() == 0 {
                let _ = fs::remove_file(&self.file_path);
            }
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.umdf");
        fs::write(&path, b"occupied").unwrap();

        let err = Writer::create_new_file(&path, "tester", None).unwrap_err();
        assert!(matches!(err, UmdfError::State(_)));
        // Existing content untouched.
        assert_eq!(fs::read(&path).unwrap(), b"occupied");
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            Writer::open_file(dir.path().join("absent.umdf"), "tester", None).unwrap_err();
        assert!(matches!(err, UmdfError::State(_)));
    }

    #[test]
    fn test_empty_session_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.umdf");

        let writer = Writer::create_new_file(&path, "tester", None).unwrap();
        writer.close_file().unwrap();

        assert!(!path.exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_cancel_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.umdf");

        let writer = Writer::create_new_file(&path, "tester", None).unwrap();
        writer.cancel_then_close().unwrap();
        assert!(!path.exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.umdf");
        fs::write(&path, b"contents").unwrap();

        let held = FileLock::acquire(&path).unwrap();
        let err = FileLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("locked"));

        drop(held);
        FileLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_unknown_encounter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.umdf");
        let mut writer = Writer::create_new_file(&path, "tester", None).unwrap();

        let err = writer
            .add_module_to_encounter(
                Uuid::new_v4(),
                "schemas/none.json",
                &ModuleData {
                    metadata: serde_json::json!({}),
                    data: crate::module::ModulePayload::Tabular(serde_json::json!([])),
                },
            )
            .unwrap_err();
        assert!(matches!(err, UmdfError::State(_)));
        writer.cancel_then_close().unwrap();
    }

    fn write_patient_schema(dir: &Path) -> String {
        let schema = serde_json::json!({
            "module_type": "tabular",
            "properties": {
                "metadata": {
                    "properties": {"patient_id": {"type": "string", "length": 8}},
                    "required": ["patient_id"]
                },
                "data": {
                    "type": "object",
                    "properties": {
                        "age": {"type": "integer", "format": "uint8", "maximum": 120}
                    }
                }
            }
        });
        let path = dir.join("patient.json");
        fs::write(&path, schema.to_string()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn patient_module(age: u32) -> ModuleData {
        ModuleData {
            metadata: serde_json::json!({"patient_id": "P0001"}),
            data: crate::module::ModulePayload::Tabular(serde_json::json!([{"age": age}])),
        }
    }

    #[test]
    fn test_failed_update_leaves_old_version_current() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = write_patient_schema(dir.path());
        let path = dir.path().join("upd.umdf");

        let mut writer = Writer::create_new_file(&path, "author", None).unwrap();
        let encounter = writer.create_encounter();
        let module_id = writer
            .add_module_to_encounter(encounter, &schema_path, &patient_module(30))
            .unwrap();
        let offset = writer.xref.find(module_id).unwrap().offset;

        // The replacement fails validation; nothing on disk may change.
        let err = writer
            .update_module(module_id, &patient_module(200))
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));

        assert_eq!(writer.xref.find(module_id).unwrap().offset, offset);
        writer.stream.seek(SeekFrom::Start(offset)).unwrap();
        let header = ModuleHeader::read_from(&mut writer.stream).unwrap();
        assert!(header.is_current, "failed update must not demote the old version");

        // The module is still updatable afterwards.
        writer.update_module(module_id, &patient_module(31)).unwrap();
        writer.stream.seek(SeekFrom::Start(offset)).unwrap();
        let header = ModuleHeader::read_from(&mut writer.stream).unwrap();
        assert!(!header.is_current);
        writer.close_file().unwrap();
    }

    #[test]
    fn test_failed_module_write_rolls_back_graph_edge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rb.umdf");
        let mut writer = Writer::create_new_file(&path, "tester", None).unwrap();

        let encounter = writer.create_encounter();
        // Schema file does not exist: the write must fail and the chain
        // must stay empty.
        let err = writer
            .add_module_to_encounter(
                encounter,
                dir.path().join("missing.json").to_str().unwrap(),
                &ModuleData {
                    metadata: serde_json::json!({}),
                    data: crate::module::ModulePayload::Tabular(serde_json::json!([])),
                },
            )
            .unwrap_err();
        assert!(matches!(err, UmdfError::Schema(_)));

        let e = writer.graph.encounter(encounter).unwrap();
        assert_eq!(e.root, None);
        writer.cancel_then_close().unwrap();
    }
}
