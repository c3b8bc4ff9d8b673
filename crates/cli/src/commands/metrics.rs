//! Metrics export viewer

use anyhow::{Context, Result};
use loadpilot_lib::MetricsRecord;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    format_mbps, format_percent, format_timestamp, print_json, print_rows, print_warning,
    OutputFormat,
};

#[derive(Tabled)]
struct MetricsRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "CPU tgt")]
    cpu_target: String,
    #[tabled(rename = "CPU org")]
    cpu_organic: String,
    #[tabled(rename = "CPU syn")]
    cpu_synthetic: String,
    #[tabled(rename = "CPU tot")]
    cpu_total: String,
    #[tabled(rename = "BW tgt")]
    bw_target: String,
    #[tabled(rename = "BW org")]
    bw_organic: String,
    #[tabled(rename = "BW syn")]
    bw_synthetic: String,
    #[tabled(rename = "BW tot")]
    bw_total: String,
}

impl From<&MetricsRecord> for MetricsRow {
    fn from(r: &MetricsRecord) -> Self {
        Self {
            time: format_timestamp(r.timestamp),
            cpu_target: format_percent(r.cpu_target),
            cpu_organic: format_percent(r.cpu_organic),
            cpu_synthetic: format_percent(r.cpu_synthetic),
            cpu_total: format_percent(r.cpu_total),
            bw_target: format_mbps(r.bw_target),
            bw_organic: format_mbps(r.bw_organic),
            bw_synthetic: format_mbps(r.bw_synthetic),
            bw_total: format_mbps(r.bw_total),
        }
    }
}

/// Last `limit` records of the export, and how many lines were unreadable
pub fn read_tail(path: &Path, limit: usize) -> Result<(Vec<MetricsRecord>, usize)> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open metrics export {}", path.display()))?;

    let mut tail = VecDeque::with_capacity(limit);
    let mut skipped = 0;
    for line in BufReader::new(file).lines() {
        let line = line.context("Failed to read metrics export")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MetricsRecord>(&line) {
            Ok(record) => {
                if tail.len() == limit {
                    tail.pop_front();
                }
                if limit > 0 {
                    tail.push_back(record);
                }
            }
            Err(_) => skipped += 1,
        }
    }
    Ok((tail.into(), skipped))
}

/// Print the most recent export rows
pub fn show_metrics(path: &Path, limit: usize, format: OutputFormat) -> Result<()> {
    let (records, skipped) = read_tail(path, limit)?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Table => {
            let rows = records.iter().map(MetricsRow::from).collect();
            print_rows(rows, "No metrics recorded yet");
            if skipped > 0 {
                print_warning(&format!("{} malformed lines skipped", skipped));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(timestamp: i64) -> MetricsRecord {
        MetricsRecord {
            timestamp,
            cpu_target: 50.0,
            cpu_organic: 30.0,
            cpu_synthetic: 20.0,
            cpu_total: 50.0,
            bw_target: 100.0,
            bw_organic: 40.0,
            bw_synthetic: 60.0,
            bw_total: 100.0,
        }
    }

    #[test]
    fn test_read_tail_keeps_last_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for ts in 1..=5 {
            writeln!(file, "{}", serde_json::to_string(&record(ts)).unwrap()).unwrap();
        }
        writeln!(file, "not json").unwrap();

        let (records, skipped) = read_tail(file.path(), 2).unwrap();
        assert_eq!(records.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_read_tail_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_tail(&dir.path().join("absent.jsonl"), 10).is_err());
    }
}
