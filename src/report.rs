use crate::types::{DeliveryResult, DeliveryStatus, FailureKind};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

const REPORT_HEADER: [&str; 4] = ["Email", "Status", "Error", "Timestamp"];

// ============================================================================
// RunSummary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub email: String,
    pub kind: FailureKind,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_link: Option<String>,
}

/// Outcome of a run as handed back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: &'static str,
    pub message: String,
    pub sent_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub errors: Vec<ErrorEntry>,
    /// Base64 of the CSV delivery report.
    pub report: String,
}

impl RunSummary {
    pub fn report_csv(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.report)
            .context("Report is not valid base64")
    }
}

/// Condense the results of a run. `total_count` is the number of
/// deliverable recipients in the session and can exceed `results.len()`
/// when the run was interrupted.
///
/// Cannot fail: a report that does not serialize is logged and left empty.
pub fn summarize(results: &[DeliveryResult], total_count: usize) -> RunSummary {
    let sent_count = results.iter().filter(|r| r.is_success()).count();
    let errors: Vec<ErrorEntry> = results
        .iter()
        .filter_map(|r| match &r.status {
            DeliveryStatus::Success => None,
            DeliveryStatus::Failed {
                kind,
                reason,
                help_link,
            } => Some(ErrorEntry {
                email: r.email.clone(),
                kind: *kind,
                error: reason.clone(),
                help_link: help_link.clone(),
            }),
        })
        .collect();

    let csv = export_csv(results).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build delivery report");
        Vec::new()
    });
    let total_count = total_count.max(results.len());

    RunSummary {
        status: "success",
        message: format!(
            "Successfully sent {} out of {} emails",
            sent_count, total_count
        ),
        sent_count,
        failed_count: errors.len(),
        total_count,
        errors,
        report: STANDARD.encode(csv),
    }
}

// ============================================================================
// CSV export
// ============================================================================

/// One line per result, in resolution order, under an
/// `Email,Status,Error,Timestamp` header.
pub fn export_csv(results: &[DeliveryResult]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(REPORT_HEADER)?;

    for result in results {
        let (status, error) = match &result.status {
            DeliveryStatus::Success => ("Success", String::new()),
            DeliveryStatus::Failed {
                reason, help_link, ..
            } => match help_link {
                Some(link) => ("Failed", format!("{} (see {})", reason, link)),
                None => ("Failed", reason.clone()),
            },
        };
        let timestamp = result.timestamp.to_rfc3339();
        writer.write_record([
            result.email.as_str(),
            status,
            error.as_str(),
            timestamp.as_str(),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush report: {}", e.error()))
}

pub fn report_file_name(date: NaiveDate) -> String {
    format!("email_report_{}.csv", date.format("%Y-%m-%d"))
}
