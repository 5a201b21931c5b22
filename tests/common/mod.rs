//! Shared fixtures for integration tests: schema files written to a
//! temp directory, one per module kind.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::path::Path;

use serde_json::{json, Value};

/// Route library tracing to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn write_schema(dir: &Path, name: &str, schema: &Value) -> String {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(schema).unwrap()).unwrap();
    path.to_string_lossy().into_owned()
}

/// Tabular patient schema: fixed and variable strings in metadata,
/// bounded integer and float in the data rows.
pub fn patient_schema() -> Value {
    json!({
        "module_type": "tabular",
        "properties": {
            "metadata": {
                "properties": {
                    "patient_id": {"type": "string", "length": 16},
                    "name": {"type": "string"}
                },
                "required": ["patient_id", "name"]
            },
            "data": {
                "type": "object",
                "properties": {
                    "age": {"type": "integer", "format": "uint8", "minimum": 0, "maximum": 120},
                    "height_cm": {"type": "number", "format": "float32"}
                }
            }
        }
    })
}

/// Minimal tabular schema for annotation/variant modules.
pub fn note_schema() -> Value {
    json!({
        "module_type": "tabular",
        "properties": {
            "metadata": {
                "properties": {
                    "author": {"type": "string"}
                }
            },
            "data": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                }
            }
        }
    })
}

/// Image + frame schema pair. Returns the image schema path; the frame
/// schema lands next to it as `frame.json` so the `./frame.json`
/// reference resolves.
pub fn image_schema_pair(dir: &Path) -> String {
    let frame = json!({
        "module_type": "frame",
        "properties": {
            "metadata": {
                "properties": {
                    "frame_index": {"type": "integer", "format": "uint16"}
                },
                "required": ["frame_index"]
            }
        }
    });
    write_schema(dir, "frame.json", &frame);

    let image = json!({
        "module_type": "image",
        "properties": {
            "metadata": {
                "properties": {
                    "description": {"type": "string"},
                    "image_structure": {
                        "type": "object",
                        "properties": {
                            "dimensions": {
                                "type": "array",
                                "items": {"type": "integer", "format": "uint16"},
                                "minItems": 2,
                                "maxItems": 8
                            },
                            "dimension_names": {
                                "type": "array",
                                "items": {"type": "string", "length": 16},
                                "minItems": 0,
                                "maxItems": 8
                            },
                            "bit_depth": {"type": "integer", "format": "uint8"},
                            "channels": {"type": "integer", "format": "uint8"},
                            "encoding": {
                                "enum": ["raw", "png", "zstd"],
                                "storage": {"type": "uint8"}
                            }
                        },
                        "required": ["dimensions"]
                    }
                },
                "required": ["image_structure"]
            },
            "data": {
                "properties": {
                    "frames": {"$ref": "./frame.json"}
                }
            }
        }
    });
    write_schema(dir, "image.json", &image)
}
