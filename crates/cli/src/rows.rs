//! Reading row records from JSON or JSON Lines files.

use std::path::Path;

use anyhow::{bail, Context, Result};
use dispatchq_core::RowRecord;
use serde_json::{Map, Value};

pub(crate) fn read_rows(path: &Path) -> Result<Vec<RowRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rows from {}", path.display()))?;
    parse_rows(&text).with_context(|| format!("parsing rows in {}", path.display()))
}

/// Parse a JSON array of objects, or one object per line.
pub(crate) fn parse_rows(text: &str) -> Result<Vec<RowRecord>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let rows: Vec<Map<String, Value>> =
            serde_json::from_str(trimmed).context("expected an array of objects")?;
        return rows.into_iter().map(record).collect();
    }

    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: Map<String, Value> = serde_json::from_str(line)
            .with_context(|| format!("line {}: expected a JSON object", i + 1))?;
        records.push(record(row).with_context(|| format!("line {}", i + 1))?);
    }
    Ok(records)
}

/// Cells become strings; nulls are left out.
fn record(row: Map<String, Value>) -> Result<RowRecord> {
    let mut record = RowRecord::new();
    for (key, value) in row {
        let cell = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(_) | Value::Object(_) => bail!("column {key:?} is not a scalar"),
        };
        record.insert(key, cell);
    }
    Ok(record)
}
