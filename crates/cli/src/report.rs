use anyhow::Result;
use std::io::Write;
use tilescope_engine::{escape_csv, ImageReport};

const HEADER: &str = "source_filename,total_tiles,rule_index,rule_name,match_count";

/// Flattens a per-image report into one CSV row per (file, classification).
/// Files with no tiles still get a row per classification with zero counts.
pub(crate) fn write_rule_report<W: Write>(reports: &[ImageReport], mut out: W) -> Result<usize> {
    writeln!(out, "{HEADER}")?;
    let mut rows = 0usize;
    for report in reports {
        let source = escape_csv(&report.json_filename);
        for detail in &report.rule_match_details {
            let name = detail
                .rule_name
                .as_deref()
                .map(escape_csv)
                .unwrap_or_default();
            writeln!(
                out,
                "{source},{},{},{name},{}",
                report.total_tiles, detail.rule_index, detail.count
            )?;
            rows += 1;
        }
    }
    out.flush()?;
    Ok(rows)
}
