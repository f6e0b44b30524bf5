//! Recipient table ingestion and validation.
//!
//! Tables arrive as CSV with a header row. Cells are kept as strings; empty
//! cells become empty strings. Validation happens before any send so a
//! malformed table aborts the run with nothing delivered.

use crate::error::RunError;
use crate::types::{EMAIL_COLUMN, RecipientRow, RecipientTable};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use tracing::info;

const PREVIEW_ROWS: usize = 5;

/// Parse a CSV recipient table. Every record is padded or truncated to the
/// header width.
pub fn load_csv<R: Read>(reader: R) -> Result<RecipientTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let columns: Vec<String> = csv_reader
        .headers()
        .context("Failed to read recipient table header")?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (line, record) in csv_reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read recipient row {}", line + 1))?;
        let row = RecipientRow::new(
            columns
                .iter()
                .enumerate()
                .map(|(i, column)| (column.clone(), record.get(i).unwrap_or("").to_string())),
        );
        rows.push(row);
    }

    Ok(RecipientTable::new(columns, rows))
}

pub fn load_csv_path(path: &Path) -> Result<RecipientTable> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open recipient table {}", path.display()))?;
    let table = load_csv(file)?;
    info!(path = %path.display(), rows = table.len(), "Loaded recipient table");
    Ok(table)
}

/// Reject tables that cannot be sent at all.
pub fn validate(table: &RecipientTable) -> Result<(), RunError> {
    if !table.columns().iter().any(|c| c == EMAIL_COLUMN) {
        return Err(RunError::Validation(format!(
            "Recipient table must contain an '{}' column",
            EMAIL_COLUMN
        )));
    }

    let mut seen = std::collections::HashSet::new();
    if let Some(duplicate) = table.columns().iter().find(|c| !seen.insert(c.as_str())) {
        return Err(RunError::Validation(format!(
            "Duplicate column '{}' in recipient table",
            duplicate
        )));
    }

    Ok(())
}

/// Whether a row has a usable address: non-empty and containing `@`.
pub fn is_deliverable(row: &RecipientRow) -> bool {
    let email = row.email();
    !email.is_empty() && email.contains('@')
}

/// Indices of rows that take part in a run. Rows without a usable address
/// are excluded entirely and never counted.
pub fn deliverable(table: &RecipientTable) -> Vec<usize> {
    table
        .rows()
        .iter()
        .enumerate()
        .filter(|(_, row)| is_deliverable(row))
        .map(|(i, _)| i)
        .collect()
}

/// Shape of a table as shown before sending: columns, size and the first
/// few rows. Empty cells are reported as `null`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableAnalysis {
    pub columns: Vec<String>,
    pub row_count: usize,
    pub deliverable_count: usize,
    pub preview: Vec<serde_json::Map<String, serde_json::Value>>,
}

pub fn analyze(table: &RecipientTable) -> TableAnalysis {
    let preview = table
        .rows()
        .iter()
        .take(PREVIEW_ROWS)
        .map(|row| {
            row.fields()
                .map(|(column, value)| {
                    let value = if value.is_empty() {
                        serde_json::Value::Null
                    } else {
                        serde_json::Value::String(value.to_string())
                    };
                    (column.to_string(), value)
                })
                .collect()
        })
        .collect();

    TableAnalysis {
        columns: table.columns().to_vec(),
        row_count: table.len(),
        deliverable_count: deliverable(table).len(),
        preview,
    }
}
