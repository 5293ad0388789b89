use serde::Serialize;
use tilescope_store::{TileField, TileStore};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_source_files: usize,
    pub total_image_tiles: usize,
}

/// Descriptive statistics over the non-null values of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub percentile_25: f64,
    pub median_50: f64,
    pub percentile_75: f64,
    pub max: f64,
}

impl Distribution {
    /// All-zero for an empty sample; never produces NaN.
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.retain(|v| v.is_finite());
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);

        let (mean, std_dev) = mean_and_std_dev(&values);
        Self {
            count: values.len(),
            mean,
            std_dev,
            min: values[0],
            percentile_25: percentile(&values, 0.25),
            median_50: percentile(&values, 0.5),
            percentile_75: percentile(&values, 0.75),
            max: values[values.len() - 1],
        }
    }
}

/// Welford's update over values divided by the largest magnitude, so a sum
/// of large finite values cannot overflow. Population std-dev.
fn mean_and_std_dev(sorted: &[f64]) -> (f64, f64) {
    let scale = sorted[0].abs().max(sorted[sorted.len() - 1].abs());
    if scale == 0.0 {
        return (0.0, 0.0);
    }
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for (k, v) in sorted.iter().enumerate() {
        let x = v / scale;
        let delta = x - mean;
        mean += delta / (k + 1) as f64;
        m2 += delta * (x - mean);
    }
    let variance = (m2 / sorted.len() as f64).max(0.0);
    (mean * scale, variance.sqrt() * scale)
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty
/// and ascending.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = rank - lo as f64;
    sorted[lo] * (1.0 - t) + sorted[hi] * t
}

pub fn summary(store: &TileStore) -> Summary {
    Summary {
        total_source_files: store.source_files().len(),
        total_image_tiles: store.len(),
    }
}

pub fn distribution(store: &TileStore, metric: &str) -> Result<Distribution> {
    let field =
        TileField::parse(metric).ok_or_else(|| EngineError::InvalidFilterKey(metric.to_string()))?;
    if !field.kind().is_numeric() {
        return Err(EngineError::NonNumericMetric(metric.to_string()));
    }
    let values = store
        .tiles()
        .filter_map(|tile| tile.get(field).as_number())
        .collect();
    Ok(Distribution::from_values(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{store_with, tile};
    use pretty_assertions::assert_eq;

    #[test]
    fn linear_percentiles_on_one_to_ten() {
        let d = Distribution::from_values((1..=10).rev().map(f64::from).collect());
        assert_eq!(d.count, 10);
        assert_eq!(d.median_50, 5.5);
        assert_eq!(d.percentile_25, 3.25);
        assert_eq!(d.percentile_75, 7.75);
        assert_eq!((d.min, d.max), (1.0, 10.0));
        assert!((d.mean - 5.5).abs() < 1e-12);
        assert!((d.std_dev - 8.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn extreme_values_stay_finite() {
        let same = Distribution::from_values(vec![f64::MAX, f64::MAX]);
        assert_eq!(same.mean, f64::MAX);
        assert_eq!(same.std_dev, 0.0);

        let spread = Distribution::from_values(vec![-f64::MAX, f64::MAX, 0.0]);
        assert_eq!(spread.mean, 0.0);
        assert!(spread.std_dev.is_finite() && spread.std_dev > 0.0);
        assert!(spread.percentile_25.is_finite());
        assert_eq!(spread.median_50, 0.0);

        let json = serde_json::to_string(&spread).unwrap();
        assert!(!json.contains("null"), "{json}");
    }

    #[test]
    fn empty_and_single_samples() {
        assert_eq!(Distribution::from_values(Vec::new()), Distribution::default());
        assert_eq!(
            Distribution::from_values(vec![f64::NAN]),
            Distribution::default()
        );

        let one = Distribution::from_values(vec![4.0]);
        assert_eq!(one.count, 1);
        assert_eq!((one.percentile_25, one.median_50, one.max), (4.0, 4.0, 4.0));
        assert_eq!(one.std_dev, 0.0);
    }

    #[test]
    fn store_metrics_skip_nulls_and_reject_text() {
        let mut a = tile(0, 0);
        a.sharpness = Some(10.0);
        let mut b = tile(1, 0);
        b.sharpness = Some(30.0);
        let c = tile(2, 0);
        let store = store_with(vec![("a.json", vec![a, b]), ("b.json", vec![c])]);

        let d = distribution(&store, "laplacian").unwrap();
        assert_eq!((d.count, d.median_50), (2, 20.0));
        assert!((d.mean - 20.0).abs() < 1e-9);

        assert!(matches!(
            distribution(&store, "status").unwrap_err(),
            EngineError::NonNumericMetric(_)
        ));
        assert!(matches!(
            distribution(&store, "bogus").unwrap_err(),
            EngineError::InvalidFilterKey(_)
        ));
        assert_eq!(
            summary(&store),
            Summary {
                total_source_files: 2,
                total_image_tiles: 3
            }
        );
    }
}
