use serde::{Serialize, Serializer};

use crate::types::TileRef;

/// Value type of a tile field. Decides which operators and literals a
/// condition may use against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
}

impl FieldKind {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Real)
    }
}

/// Every key a filter, sort, rule condition or export column may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TileField {
    Id,
    SourceFileId,
    JsonFilename,
    ImageFilename,
    Status,
    Col,
    Row,
    Size,
    Width,
    Height,
    Sharpness,
    AvgBrightness,
    AvgSaturation,
    Entropy,
    EdgeDensity,
    ForegroundRatio,
    MaxSubjectArea,
    ModelScore,
    ModelClassification,
}

impl TileField {
    pub const ALL: [TileField; 19] = [
        TileField::Id,
        TileField::SourceFileId,
        TileField::JsonFilename,
        TileField::ImageFilename,
        TileField::Status,
        TileField::Col,
        TileField::Row,
        TileField::Size,
        TileField::Width,
        TileField::Height,
        TileField::Sharpness,
        TileField::AvgBrightness,
        TileField::AvgSaturation,
        TileField::Entropy,
        TileField::EdgeDensity,
        TileField::ForegroundRatio,
        TileField::MaxSubjectArea,
        TileField::ModelScore,
        TileField::ModelClassification,
    ];

    /// Resolve a wire key. Accepts the producer's legacy names
    /// (`laplacian`, `webp_filename`, `size_bytes`).
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let field = match key.trim() {
            "id" => Self::Id,
            "source_file_id" => Self::SourceFileId,
            "json_filename" => Self::JsonFilename,
            "image_filename" | "webp_filename" => Self::ImageFilename,
            "status" => Self::Status,
            "col" => Self::Col,
            "row" => Self::Row,
            "size" | "size_bytes" => Self::Size,
            "width" => Self::Width,
            "height" => Self::Height,
            "sharpness" | "laplacian" => Self::Sharpness,
            "avg_brightness" => Self::AvgBrightness,
            "avg_saturation" => Self::AvgSaturation,
            "entropy" => Self::Entropy,
            "edge_density" => Self::EdgeDensity,
            "foreground_ratio" => Self::ForegroundRatio,
            "max_subject_area" => Self::MaxSubjectArea,
            "model_score" => Self::ModelScore,
            "model_classification" => Self::ModelClassification,
            _ => return None,
        };
        Some(field)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::SourceFileId => "source_file_id",
            Self::JsonFilename => "json_filename",
            Self::ImageFilename => "image_filename",
            Self::Status => "status",
            Self::Col => "col",
            Self::Row => "row",
            Self::Size => "size",
            Self::Width => "width",
            Self::Height => "height",
            Self::Sharpness => "sharpness",
            Self::AvgBrightness => "avg_brightness",
            Self::AvgSaturation => "avg_saturation",
            Self::Entropy => "entropy",
            Self::EdgeDensity => "edge_density",
            Self::ForegroundRatio => "foreground_ratio",
            Self::MaxSubjectArea => "max_subject_area",
            Self::ModelScore => "model_score",
            Self::ModelClassification => "model_classification",
        }
    }

    #[must_use]
    pub fn kind(self) -> FieldKind {
        match self {
            Self::Id
            | Self::SourceFileId
            | Self::Col
            | Self::Row
            | Self::Size
            | Self::Width
            | Self::Height => FieldKind::Integer,
            Self::JsonFilename | Self::ImageFilename | Self::Status | Self::ModelClassification => {
                FieldKind::Text
            }
            Self::Sharpness
            | Self::AvgBrightness
            | Self::AvgSaturation
            | Self::Entropy
            | Self::EdgeDensity
            | Self::ForegroundRatio
            | Self::MaxSubjectArea
            | Self::ModelScore => FieldKind::Real,
        }
    }

    pub fn extract<'a>(self, tile: TileRef<'a>) -> FieldValue<'a> {
        let r = tile.record;
        match self {
            Self::Id => FieldValue::Integer(r.id),
            Self::SourceFileId => FieldValue::Integer(r.source_file_id),
            Self::JsonFilename => FieldValue::Text(&tile.source.json_filename),
            Self::ImageFilename => FieldValue::Text(&r.image_filename),
            Self::Status => FieldValue::from_text(r.status.as_deref()),
            Self::Col => FieldValue::Integer(u64::from(r.col)),
            Self::Row => FieldValue::Integer(u64::from(r.row)),
            Self::Size => FieldValue::from_int(r.size),
            Self::Width => FieldValue::from_int(r.width.map(u64::from)),
            Self::Height => FieldValue::from_int(r.height.map(u64::from)),
            Self::Sharpness => FieldValue::from_real(r.sharpness),
            Self::AvgBrightness => FieldValue::from_real(r.avg_brightness),
            Self::AvgSaturation => FieldValue::from_real(r.avg_saturation),
            Self::Entropy => FieldValue::from_real(r.entropy),
            Self::EdgeDensity => FieldValue::from_real(r.edge_density),
            Self::ForegroundRatio => FieldValue::from_real(r.foreground_ratio),
            Self::MaxSubjectArea => FieldValue::from_real(r.max_subject_area),
            Self::ModelScore => FieldValue::from_real(r.model_score),
            Self::ModelClassification => FieldValue::from_text(r.model_classification.as_deref()),
        }
    }
}

impl std::fmt::Display for TileField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A borrowed field value. Integers and reals compare as `f64`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Null,
    Integer(u64),
    Real(f64),
    Text(&'a str),
}

impl<'a> FieldValue<'a> {
    fn from_int(value: Option<u64>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }

    fn from_real(value: Option<f64>) -> Self {
        value.map_or(Self::Null, Self::Real)
    }

    fn from_text(value: Option<&'a str>) -> Self {
        value.map_or(Self::Null, Self::Text)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Self::Integer(v) => Some(v as f64),
            Self::Real(v) => Some(v),
            Self::Null | Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&'a str> {
        match *self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Text rendering for tabular output; `None` for null.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match *self {
            Self::Null => None,
            Self::Integer(v) => Some(v.to_string()),
            Self::Real(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.to_string()),
        }
    }
}

impl Serialize for FieldValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(v) => serializer.serialize_u64(v),
            Self::Real(v) => serializer.serialize_f64(v),
            Self::Text(v) => serializer.serialize_str(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_canonical_key() {
        for field in TileField::ALL {
            assert_eq!(TileField::parse(field.as_str()), Some(field));
        }
    }

    #[test]
    fn parse_accepts_producer_aliases() {
        assert_eq!(TileField::parse("laplacian"), Some(TileField::Sharpness));
        assert_eq!(TileField::parse("webp_filename"), Some(TileField::ImageFilename));
        assert_eq!(TileField::parse("nope"), None);
    }

    #[test]
    fn kinds_split_numeric_and_text() {
        assert!(TileField::EdgeDensity.kind().is_numeric());
        assert!(TileField::Col.kind().is_numeric());
        assert!(!TileField::Status.kind().is_numeric());
    }
}
