//! Image module scenarios: N-dimensional frame collections, raw and
//! PNG-encoded pixels, frame metadata round-trips.

mod common;

use serde_json::json;
use umdf::{ModuleData, ModulePayload, Reader, UmdfError, Writer};

use common::image_schema_pair;

/// Deterministic 4x4 RGB pixels, distinct per frame.
fn frame_pixels(frame: usize) -> Vec<u8> {
    (0..4 * 4 * 3)
        .map(|i| ((i * 13 + frame * 41) % 256) as u8)
        .collect()
}

fn image_module(encoding: &str) -> ModuleData {
    let frames: Vec<ModuleData> = (0..6)
        .map(|i| ModuleData {
            metadata: json!({"frame_index": i}),
            data: ModulePayload::Binary(frame_pixels(i)),
        })
        .collect();

    ModuleData {
        metadata: json!({
            "description": "test series",
            "image_structure": {
                "dimensions": [4, 4, 2, 3],
                "dimension_names": ["x", "y", "slice", "time"],
                "bit_depth": 8,
                "channels": 3,
                "encoding": encoding
            }
        }),
        data: ModulePayload::Frames(frames),
    }
}

fn roundtrip(encoding: &str) -> ModuleData {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = image_schema_pair(dir.path());
    let file_path = dir.path().join("scan.umdf");

    let mut writer = Writer::create_new_file(&file_path, "radiologist", None).unwrap();
    let encounter = writer.create_encounter();
    let module_id = writer
        .add_module_to_encounter(encounter, &schema_path, &image_module(encoding))
        .unwrap();
    writer.close_file().unwrap();

    let mut reader = Reader::open_file(&file_path, None).unwrap();
    reader.module_data(module_id).unwrap()
}

#[test]
fn raw_frames_roundtrip() {
    let data = roundtrip("raw");

    let ModulePayload::Frames(frames) = &data.data else {
        panic!("expected frame payload");
    };
    assert_eq!(frames.len(), 6);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.metadata, json!([{"frame_index": i}]));
        let ModulePayload::Binary(pixels) = &frame.data else {
            panic!("expected pixel payload");
        };
        assert_eq!(pixels, &frame_pixels(i), "frame {i} pixels differ");
    }

    assert_eq!(
        data.metadata[0]["image_structure"]["dimensions"],
        json!([4, 4, 2, 3])
    );
    assert_eq!(data.metadata[0]["description"], json!("test series"));
}

#[test]
fn png_frames_roundtrip() {
    let data = roundtrip("png");

    let ModulePayload::Frames(frames) = &data.data else {
        panic!("expected frame payload");
    };
    assert_eq!(frames.len(), 6);
    for (i, frame) in frames.iter().enumerate() {
        let ModulePayload::Binary(pixels) = &frame.data else {
            panic!("expected pixel payload");
        };
        // Lossless codec: decoded pixels byte-identical.
        assert_eq!(pixels, &frame_pixels(i), "frame {i} pixels differ");
    }
}

#[test]
fn frame_count_mismatch_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = image_schema_pair(dir.path());
    let file_path = dir.path().join("short.umdf");

    let mut writer = Writer::create_new_file(&file_path, "radiologist", None).unwrap();
    let encounter = writer.create_encounter();

    let mut module = image_module("raw");
    if let ModulePayload::Frames(frames) = &mut module.data {
        frames.pop(); // 5 frames where the dimensions demand 6
    }
    let err = writer
        .add_module_to_encounter(encounter, &schema_path, &module)
        .unwrap_err();
    assert!(matches!(err, UmdfError::Schema(_)));
    assert!(err.to_string().contains("Expected 6 frames"));

    writer.cancel_then_close().unwrap();
}

#[test]
fn wrong_pixel_length_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = image_schema_pair(dir.path());
    let file_path = dir.path().join("badlen.umdf");

    let mut writer = Writer::create_new_file(&file_path, "radiologist", None).unwrap();
    let encounter = writer.create_encounter();

    let mut module = image_module("raw");
    if let ModulePayload::Frames(frames) = &mut module.data {
        frames[0].data = ModulePayload::Binary(vec![0u8; 7]);
    }
    let err = writer
        .add_module_to_encounter(encounter, &schema_path, &module)
        .unwrap_err();
    assert!(err.to_string().contains("pixel bytes"));

    writer.cancel_then_close().unwrap();
}

#[test]
fn encoding_not_in_schema_enum_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = image_schema_pair(dir.path());
    let file_path = dir.path().join("badenc.umdf");

    let mut writer = Writer::create_new_file(&file_path, "radiologist", None).unwrap();
    let encounter = writer.create_encounter();

    // jpeg2000-lossless is a known kind but the schema enum only admits
    // raw/png/zstd — and the enum field codec rejects it first.
    let mut module = image_module("raw");
    module.metadata["image_structure"]["encoding"] = json!("jpeg2000-lossless");
    let err = writer
        .add_module_to_encounter(encounter, &schema_path, &module)
        .unwrap_err();
    assert!(matches!(err, UmdfError::Schema(_)));

    writer.cancel_then_close().unwrap();
}

#[test]
fn encrypted_image_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = image_schema_pair(dir.path());
    let file_path = dir.path().join("scan-enc.umdf");

    let mut writer = Writer::create_new_file(&file_path, "radiologist", Some("pw")).unwrap();
    let encounter = writer.create_encounter();
    let module_id = writer
        .add_module_to_encounter(encounter, &schema_path, &image_module("raw"))
        .unwrap();
    writer.close_file().unwrap();

    let mut reader = Reader::open_file(&file_path, Some("pw")).unwrap();
    let data = reader.module_data(module_id).unwrap();
    let ModulePayload::Frames(frames) = &data.data else {
        panic!("expected frame payload");
    };
    assert_eq!(frames.len(), 6);
    let ModulePayload::Binary(pixels) = &frames[2].data else {
        panic!("expected pixel payload");
    };
    assert_eq!(pixels, &frame_pixels(2));
}
