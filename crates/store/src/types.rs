use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::field::{FieldValue, TileField};

/// One measured tile. Metrics are fixed at ingestion; only the model
/// prediction fields are replaced, by `StoreBuilder::attach_predictions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub id: u64,
    pub source_file_id: u64,
    pub image_filename: String,
    #[serde(default)]
    pub status: Option<String>,
    pub col: u32,
    pub row: u32,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub sharpness: Option<f64>,
    #[serde(default)]
    pub avg_brightness: Option<f64>,
    #[serde(default)]
    pub avg_saturation: Option<f64>,
    #[serde(default)]
    pub entropy: Option<f64>,
    #[serde(default)]
    pub edge_density: Option<f64>,
    #[serde(default)]
    pub foreground_ratio: Option<f64>,
    #[serde(default)]
    pub max_subject_area: Option<f64>,
    #[serde(default)]
    pub model_score: Option<f64>,
    #[serde(default)]
    pub model_classification: Option<String>,
}

impl TileRecord {
    /// A record with coordinates and no measurements.
    pub fn new(id: u64, source_file_id: u64, image_filename: impl Into<String>, col: u32, row: u32) -> Self {
        Self {
            id,
            source_file_id,
            image_filename: image_filename.into(),
            status: None,
            col,
            row,
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
}

/// One ingested metric batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: u64,
    pub json_filename: String,
    #[serde(default)]
    pub image_directory: String,
    pub ingested_at: DateTime<Utc>,
    pub tile_count: usize,
    /// Model whose predictions fill `model_score`/`model_classification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_model: Option<String>,
}

/// A tile joined with its source file, the unit every field accessor and
/// condition works on.
#[derive(Debug, Clone, Copy)]
pub struct TileRef<'a> {
    pub record: &'a TileRecord,
    pub source: &'a SourceFile,
}

impl<'a> TileRef<'a> {
    pub fn new(record: &'a TileRecord, source: &'a SourceFile) -> Self {
        Self { record, source }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id
    }

    #[must_use]
    pub fn get(&self, field: TileField) -> FieldValue<'a> {
        field.extract(*self)
    }
}

/// Wire shape of a tile: every field in `TileField::ALL` order, nulls kept.
impl Serialize for TileRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(TileField::ALL.len()))?;
        for field in TileField::ALL {
            map.serialize_entry(field.as_str(), &self.get(field))?;
        }
        map.end()
    }
}
