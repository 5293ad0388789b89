//! Classifier output for already-ingested tiles.
//!
//! The batch predictor writes one CSV per slide:
//!
//! ```text
//! filepath,predicted_class,raw_score
//! D:\slides\slide-01\0_0.webp,marker,0.93
//! ```
//!
//! Rows are matched to tiles by the file name component of `filepath`.

use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::path::Path;

/// One classifier result for a tile image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub image_filename: String,
    pub classification: Option<String>,
    pub score: Option<f64>,
}

/// Every prediction one model made for one slide.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionBatch {
    pub model_name: String,
    pub predictions: Vec<Prediction>,
    /// Rows dropped for an empty path or an unparseable score.
    pub skipped: usize,
}

impl PredictionBatch {
    /// Later rows for the same image win.
    pub(crate) fn by_image(&self) -> HashMap<&str, &Prediction> {
        self.predictions
            .iter()
            .map(|p| (p.image_filename.as_str(), p))
            .collect()
    }
}

/// Result of `StoreBuilder::attach_predictions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionOutcome {
    pub source_file_id: u64,
    /// Tiles that received a prediction.
    pub matched: usize,
    /// Predictions whose image is not a tile of the source file.
    pub unmatched: usize,
}

const PATH_COLUMNS: &[&str] = &["filepath", "image_path", "webp_filename"];
const CLASS_COLUMNS: &[&str] = &["predicted_class", "classification"];
const SCORE_COLUMNS: &[&str] = &["raw_score", "score"];

/// Parse a prediction CSV. `origin` names the input in error messages.
pub fn parse_prediction_csv(origin: &str, model_name: &str, bytes: &[u8]) -> Result<PredictionBatch> {
    let invalid = |reason: String| StoreError::InvalidPredictionFile {
        path: origin.to_string(),
        reason,
    };

    let model_name = model_name.trim();
    if model_name.is_empty() {
        return Err(invalid("model name must be non-empty".to_string()));
    }
    let text = std::str::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?;
    let mut records = read_records(text).map_err(invalid)?.into_iter();

    let header = records
        .next()
        .ok_or_else(|| invalid("missing header row".to_string()))?;
    let column = |names: &[&str]| {
        header
            .iter()
            .position(|h| names.contains(&h.trim().trim_start_matches('\u{feff}')))
    };
    let path_col = column(PATH_COLUMNS)
        .ok_or_else(|| invalid(format!("no image path column (one of {PATH_COLUMNS:?})")))?;
    let class_col = column(CLASS_COLUMNS);
    let score_col = column(SCORE_COLUMNS);
    if class_col.is_none() && score_col.is_none() {
        return Err(invalid("no predicted_class or raw_score column".to_string()));
    }

    let mut predictions = Vec::new();
    let mut skipped = 0usize;
    for (line, record) in records.enumerate() {
        let cell = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let Some(image_filename) = cell(Some(path_col)).map(file_name) else {
            if record.iter().any(|v| !v.trim().is_empty()) {
                skipped += 1;
            }
            continue;
        };
        let score = match cell(score_col).map(str::parse::<f64>) {
            None => None,
            Some(Ok(score)) => Some(score),
            Some(Err(_)) => {
                log::warn!("{origin}: row {} has a non-numeric score", line + 2);
                skipped += 1;
                continue;
            }
        };
        predictions.push(Prediction {
            image_filename: image_filename.to_string(),
            classification: cell(class_col).map(str::to_string),
            score,
        });
    }

    Ok(PredictionBatch {
        model_name: model_name.to_string(),
        predictions,
        skipped,
    })
}

/// Read and parse one prediction CSV from disk.
pub async fn read_prediction_file(path: impl AsRef<Path>, model_name: &str) -> Result<PredictionBatch> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await?;
    parse_prediction_csv(&path.display().to_string(), model_name, &bytes)
}

/// Last component of a Windows or POSIX path.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// RFC 4180 records: quoted fields may hold commas, doubled quotes and
/// line breaks. CRLF and LF line endings are both accepted.
fn read_records(text: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if quoted {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn batch_predictor_output_is_parsed() {
        let csv = "filepath,predicted_class,raw_score\r\n\
                   D:\\slides\\s1\\0_0.webp,marker,0.93\r\n\
                   /mnt/slides/s1/1_0.webp,not_marker,0.12\r\n\
                   \r\n";
        let batch = parse_prediction_csv("s1.csv", " marker_v2 ", csv.as_bytes()).unwrap();
        assert_eq!(batch.model_name, "marker_v2");
        assert_eq!(batch.skipped, 0);
        assert_eq!(
            batch.predictions,
            vec![
                Prediction {
                    image_filename: "0_0.webp".to_string(),
                    classification: Some("marker".to_string()),
                    score: Some(0.93),
                },
                Prediction {
                    image_filename: "1_0.webp".to_string(),
                    classification: Some("not_marker".to_string()),
                    score: Some(0.12),
                },
            ]
        );
    }

    #[test]
    fn quoted_fields_and_renamed_columns() {
        let csv = "score,image_path,classification\n\
                   ,\"tiles/a,b.webp\",\"say \"\"hi\"\"\"\n\
                   oops,c.webp,x\n";
        let batch = parse_prediction_csv("p.csv", "m", csv.as_bytes()).unwrap();
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.predictions.len(), 1);
        assert_eq!(batch.predictions[0].image_filename, "a,b.webp");
        assert_eq!(batch.predictions[0].classification.as_deref(), Some("say \"hi\""));
        assert_eq!(batch.predictions[0].score, None);
    }

    #[test]
    fn unusable_files_are_rejected() {
        let no_path = parse_prediction_csv("p.csv", "m", b"name,score\na,1\n").unwrap_err();
        assert!(no_path.to_string().contains("no image path column"));

        let no_values = parse_prediction_csv("p.csv", "m", b"filepath\na.webp\n").unwrap_err();
        assert!(no_values.to_string().contains("no predicted_class or raw_score"));

        assert!(parse_prediction_csv("p.csv", "m", b"").is_err());
        assert!(parse_prediction_csv("p.csv", "  ", b"filepath,score\n").is_err());
        assert!(parse_prediction_csv("p.csv", "m", b"filepath,score\n\"a.webp,1\n").is_err());
    }
}
