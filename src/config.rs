use crate::attachments::SizeLimits;
use std::time::Duration;

pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_ROW_ATTACHMENT_COLUMN: &str = "PDF_Path";

/// Outbound relay connection settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Bounds connect, TLS handshake and every command round-trip.
    pub timeout: Duration,
}

impl SmtpSettings {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: DEFAULT_SMTP_HOST.to_string(),
            port: DEFAULT_SMTP_PORT,
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// When connections to the relay are opened and closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// One authenticated connection for the whole run, shared by every
    /// worker one send at a time, closed when the run drains.
    PerRun,
    /// A fresh connection per recipient, closed right after its send.
    PerRecipient,
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// 1 means strictly sequential; more means that many concurrent workers
    /// per batch.
    pub concurrency_limit: usize,
    pub batch_delay: Duration,
    pub per_email_delay: Duration,
    /// Upper bound on one batch. Recipients still in flight when it expires
    /// are put back for a later batch.
    pub batch_timeout: Duration,
    /// Save a checkpoint each time this many more recipients are resolved.
    pub checkpoint_every: usize,
    pub limits: SizeLimits,
    /// Gzip an attachment over the per-attachment ceiling before giving up.
    pub compress_oversized: bool,
    /// Column holding a per-recipient attachment path.
    pub row_attachment_column: String,
    /// `None` picks `PerRun` for sequential and `PerRecipient` for parallel.
    pub connection_policy: Option<ConnectionPolicy>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            batch_delay: Duration::from_secs(5),
            per_email_delay: Duration::from_secs(1),
            batch_timeout: Duration::from_secs(300),
            checkpoint_every: 5,
            limits: SizeLimits::default(),
            compress_oversized: true,
            row_attachment_column: DEFAULT_ROW_ATTACHMENT_COLUMN.to_string(),
            connection_policy: None,
        }
    }
}

impl SendConfig {
    pub fn is_sequential(&self) -> bool {
        self.concurrency_limit <= 1
    }

    pub fn effective_connection_policy(&self) -> ConnectionPolicy {
        self.connection_policy.unwrap_or(if self.is_sequential() {
            ConnectionPolicy::PerRun
        } else {
            ConnectionPolicy::PerRecipient
        })
    }

    /// Zero delays, for tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.batch_delay = Duration::ZERO;
        self.per_email_delay = Duration::ZERO;
        self
    }
}
