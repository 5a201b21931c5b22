//! UMDF — a self-describing binary container for versioned medical data
//! modules.
//!
//! A container file holds typed modules (tabular rows or multi-frame
//! images), a cross-reference table mapping module ids to byte offsets,
//! and a module graph recording encounters and typed relationships.
//! Modules may be zstd-compressed and AES-256-GCM encrypted; updates
//! append new versions and leave an on-disk audit trail. All writes go
//! through an exclusive-locked temp side file that is validated and
//! atomically renamed at close.
//!
//! Typical write session:
//!
//! ```no_run
//! use umdf::{ModuleData, ModulePayload, Writer};
//!
//! # fn main() -> umdf::Result<()> {
//! let mut writer = Writer::create_new_file("visit.umdf", "dr-wells", None)?;
//! let encounter = writer.create_encounter();
//! let module = ModuleData {
//!     metadata: serde_json::json!({"patient_id": "P0001"}),
//!     data: ModulePayload::Tabular(serde_json::json!([{"age": 30}])),
//! };
//! writer.add_module_to_encounter(encounter, "schemas/patient.json", &module)?;
//! writer.close_file()?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod format;
pub mod graph;
pub mod module;
pub mod reader;
pub mod schema;
pub mod writer;

pub use audit::ModuleTrail;
pub use error::{Result, UmdfError};
pub use format::types::{CompressionKind, EncryptionKind, ModuleType, UtcTimestamp, Version};
pub use graph::{Encounter, LinkKind, ModuleGraph, ModuleLink};
pub use module::{Module, ModuleData, ModulePayload};
pub use reader::Reader;
pub use writer::Writer;
