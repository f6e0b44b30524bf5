use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Column every recipient table must carry.
pub const EMAIL_COLUMN: &str = "Email";

/// One addressee: column name to cell value, in table column order.
/// Empty cells are stored as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRow {
    fields: Vec<(String, String)>,
}

impl RecipientRow {
    pub fn new<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// The trimmed `Email` cell, or an empty string when the column is absent.
    pub fn email(&self) -> &str {
        self.get(EMAIL_COLUMN).map(str::trim).unwrap_or("")
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Ordered recipient rows. A row's position is its identity for the
/// lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientTable {
    columns: Vec<String>,
    rows: Vec<RecipientRow>,
}

impl RecipientTable {
    pub fn new(columns: Vec<String>, rows: Vec<RecipientRow>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[RecipientRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&RecipientRow> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Identifies one bulk-send invocation for checkpoint and resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Derive an id from the moment the session started. Millisecond
    /// resolution, filesystem-safe.
    pub fn from_start_time(started_at: DateTime<Utc>) -> Self {
        Self(started_at.format("%Y%m%dT%H%M%S%3fZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("Session id must not be empty");
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "Invalid session id '{}': only ASCII letters, digits, '-' and '_' are allowed",
                s
            );
        }
        Ok(Self(s.to_string()))
    }
}

/// Why a single recipient could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    BodyTooLarge,
    AttachmentTooLarge,
    SizeRejectedByServer,
    InvalidAddress,
    TransportError,
}

impl FailureKind {
    /// Size failures are user-correctable and carry remediation guidance.
    pub fn is_size_related(self) -> bool {
        matches!(
            self,
            Self::BodyTooLarge | Self::AttachmentTooLarge | Self::SizeRejectedByServer
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BodyTooLarge => "BodyTooLarge",
            Self::AttachmentTooLarge => "AttachmentTooLarge",
            Self::SizeRejectedByServer => "SizeRejectedByServer",
            Self::InvalidAddress => "InvalidAddress",
            Self::TransportError => "TransportError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeliveryStatus {
    Success,
    #[serde(rename_all = "camelCase")]
    Failed {
        kind: FailureKind,
        reason: String,
        help_link: Option<String>,
    },
}

/// Outcome for one recipient row. Results are append-only within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub row: usize,
    pub email: String,
    #[serde(flatten)]
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryResult {
    pub fn success(row: usize, email: impl Into<String>) -> Self {
        Self {
            row,
            email: email.into(),
            status: DeliveryStatus::Success,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        row: usize,
        email: impl Into<String>,
        kind: FailureKind,
        reason: impl Into<String>,
        help_link: Option<String>,
    ) -> Self {
        Self {
            row,
            email: email.into(),
            status: DeliveryStatus::Failed {
                kind,
                reason: reason.into(),
                help_link,
            },
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, DeliveryStatus::Success)
    }
}
