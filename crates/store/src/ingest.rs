//! Reads the metric producer's per-slide JSON output.
//!
//! Two layouts are accepted:
//!
//! ```text
//! { "image_directory": "/data/slide-01", "tiles": { "0_0.webp": { "col": 0, "row": 0, ... } } }
//! { "0_0.webp": { "col": 0, "row": 0, ... } }
//! ```

use crate::error::{Result, StoreError};
use crate::types::TileRecord;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Measurements of one tile before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct TileDraft {
    pub image_filename: String,
    pub col: u32,
    pub row: u32,
    pub status: Option<String>,
    pub size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sharpness: Option<f64>,
    pub avg_brightness: Option<f64>,
    pub avg_saturation: Option<f64>,
    pub entropy: Option<f64>,
    pub edge_density: Option<f64>,
    pub foreground_ratio: Option<f64>,
    pub max_subject_area: Option<f64>,
    pub model_score: Option<f64>,
    pub model_classification: Option<String>,
}

impl TileDraft {
    pub fn new(image_filename: impl Into<String>, col: u32, row: u32) -> Self {
        Self {
            image_filename: image_filename.into(),
            col,
            row,
            status: None,
            size: None,
            width: None,
            height: None,
            sharpness: None,
            avg_brightness: None,
            avg_saturation: None,
            entropy: None,
            edge_density: None,
            foreground_ratio: None,
            max_subject_area: None,
            model_score: None,
            model_classification: None,
        }
    }

    pub(crate) fn into_record(self, id: u64, source_file_id: u64) -> TileRecord {
        TileRecord {
            id,
            source_file_id,
            image_filename: self.image_filename,
            status: self.status,
            col: self.col,
            row: self.row,
            size: self.size,
            width: self.width,
            height: self.height,
            sharpness: self.sharpness,
            avg_brightness: self.avg_brightness,
            avg_saturation: self.avg_saturation,
            entropy: self.entropy,
            edge_density: self.edge_density,
            foreground_ratio: self.foreground_ratio,
            max_subject_area: self.max_subject_area,
            model_score: self.model_score,
            model_classification: self.model_classification,
        }
    }
}

/// One parsed producer file, ready for `StoreBuilder::add_source`.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub json_filename: String,
    pub image_directory: String,
    pub tiles: Vec<TileDraft>,
    /// Entries dropped because they were malformed or had no coordinates.
    pub skipped: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ProducerAttributes {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    col: Option<i64>,
    #[serde(default)]
    row: Option<i64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default, alias = "laplacian")]
    sharpness: Option<f64>,
    #[serde(default)]
    avg_brightness: Option<f64>,
    #[serde(default)]
    avg_saturation: Option<f64>,
    #[serde(default)]
    entropy: Option<f64>,
    #[serde(default)]
    edge_density: Option<f64>,
    #[serde(default)]
    foreground_ratio: Option<f64>,
    #[serde(default)]
    max_subject_area: Option<f64>,
    #[serde(default)]
    model_score: Option<f64>,
    #[serde(default)]
    model_classification: Option<String>,
}

fn coordinate(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

/// Parse the bytes of one producer file. `json_filename` becomes the
/// source file's unique name.
pub fn parse_producer_json(json_filename: &str, bytes: &[u8]) -> Result<SourceBatch> {
    let invalid = |reason: String| StoreError::InvalidProducerFile {
        path: json_filename.to_string(),
        reason,
    };

    let root: Value = serde_json::from_slice(bytes).map_err(|err| invalid(err.to_string()))?;
    let Value::Object(mut root) = root else {
        return Err(invalid("top-level value must be an object".to_string()));
    };

    let (image_directory, entries) = match root.remove("tiles") {
        Some(Value::Object(tiles)) => {
            let dir = root
                .get("image_directory")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (dir, tiles)
        }
        Some(_) => return Err(invalid("'tiles' must be an object".to_string())),
        None => {
            root.remove("image_directory");
            (String::new(), root)
        }
    };

    let (tiles, skipped) = collect_tiles(json_filename, entries);
    Ok(SourceBatch {
        json_filename: json_filename.to_string(),
        image_directory,
        tiles,
        skipped,
    })
}

fn collect_tiles(json_filename: &str, entries: Map<String, Value>) -> (Vec<TileDraft>, usize) {
    let mut tiles = Vec::with_capacity(entries.len());
    let mut skipped = 0usize;

    for (name, attributes) in entries {
        if !attributes.is_object() {
            skipped += 1;
            continue;
        }
        let attrs: ProducerAttributes = match serde_json::from_value(attributes) {
            Ok(attrs) => attrs,
            Err(err) => {
                log::warn!("{json_filename}: skipping tile '{name}': {err}");
                skipped += 1;
                continue;
            }
        };
        let (Some(col), Some(row)) = (coordinate(attrs.col), coordinate(attrs.row)) else {
            log::debug!("{json_filename}: tile '{name}' has no grid coordinates");
            skipped += 1;
            continue;
        };

        tiles.push(TileDraft {
            image_filename: name,
            col,
            row,
            status: attrs.status,
            size: attrs.size,
            width: attrs.width,
            height: attrs.height,
            sharpness: attrs.sharpness,
            avg_brightness: attrs.avg_brightness,
            avg_saturation: attrs.avg_saturation,
            entropy: attrs.entropy,
            edge_density: attrs.edge_density,
            foreground_ratio: attrs.foreground_ratio,
            max_subject_area: attrs.max_subject_area,
            model_score: attrs.model_score,
            model_classification: attrs.model_classification,
        });
    }

    (tiles, skipped)
}

/// Read and parse one producer file from disk.
pub async fn read_source_file(path: impl AsRef<Path>) -> Result<SourceBatch> {
    let path = path.as_ref();
    let json_filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::InvalidProducerFile {
            path: path.display().to_string(),
            reason: "path has no file name".to_string(),
        })?;
    let bytes = tokio::fs::read(path).await?;
    parse_producer_json(&json_filename, &bytes)
}

/// Expand files and directories into the sorted list of `*.json` files to
/// ingest. Directories are walked recursively.
pub fn discover_json_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && is_json(entry.path()) {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            log::warn!("Ingest path not found: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    files
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn parses_wrapped_layout() {
        let raw = br#"{
            "image_directory": "/data/slide-01",
            "tiles": {
                "1_0.webp": {"status": "success", "col": 1, "row": 0, "size": 2048,
                             "laplacian": 88.5, "edge_density": 0.12},
                "0_0.webp": {"status": "success", "col": 0, "row": 0, "entropy": 4.2}
            }
        }"#;
        let batch = parse_producer_json("slide-01.json", raw).unwrap();
        assert_eq!(batch.image_directory, "/data/slide-01");
        assert_eq!(batch.skipped, 0);
        assert_eq!(batch.tiles.len(), 2);

        let first = &batch.tiles[0];
        assert_eq!(first.image_filename, "0_0.webp");
        assert_eq!(first.entropy, Some(4.2));

        let second = &batch.tiles[1];
        assert_eq!(second.sharpness, Some(88.5));
        assert_eq!(second.size, Some(2048));
    }

    #[test]
    fn parses_bare_layout_and_skips_tiles_without_coordinates() {
        let raw = br#"{
            "0_0.webp": {"col": 0, "row": 0, "avg_brightness": 120.0},
            "bad.webp": {"col": null, "row": null, "status": "error"},
            "neg.webp": {"col": -1, "row": 0},
            "noise": 3
        }"#;
        let batch = parse_producer_json("bare.json", raw).unwrap();
        assert_eq!(batch.image_directory, "");
        assert_eq!(batch.tiles.len(), 1);
        assert_eq!(batch.skipped, 3);
    }

    #[test]
    fn rejects_non_object_roots() {
        let err = parse_producer_json("x.json", b"[1,2]").unwrap_err();
        assert!(matches!(err, StoreError::InvalidProducerFile { .. }));
    }

    #[tokio::test]
    async fn discovers_json_files_recursively() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("batch/inner");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("a.json"), "{}").unwrap();
        std::fs::write(nested.join("b.JSON"), "{}").unwrap();
        std::fs::write(nested.join("notes.txt"), "").unwrap();

        let files = discover_json_files(&[temp.path().to_path_buf()]);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string(), "b.JSON".to_string()]);

        let batch = read_source_file(temp.path().join("a.json")).await.unwrap();
        assert_eq!(batch.json_filename, "a.json");
        assert!(batch.tiles.is_empty());
    }
}
