use crate::types::FailureKind;
use thiserror::Error;

/// Remediation page shown next to size-related failures.
pub const SIZE_LIMIT_HELP_URL: &str = "https://support.google.com/mail/?p=MaxSizeError";

/// A failure scoped to one recipient. Always recorded, never propagated past
/// the recipient boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Message body is {size} bytes, over the {limit} byte message limit")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("Attachment {name} exceeds the size limit ({size} bytes, limit {limit})")]
    AttachmentTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("Message too large: rejected by server: {0}")]
    SizeRejectedByServer(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{0}")]
    Transport(String),
}

impl SendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BodyTooLarge { .. } => FailureKind::BodyTooLarge,
            Self::AttachmentTooLarge { .. } => FailureKind::AttachmentTooLarge,
            Self::SizeRejectedByServer(_) => FailureKind::SizeRejectedByServer,
            Self::InvalidAddress { .. } => FailureKind::InvalidAddress,
            Self::Transport(_) => FailureKind::TransportError,
        }
    }

    pub fn help_link(&self) -> Option<&'static str> {
        self.kind().is_size_related().then_some(SIZE_LIMIT_HELP_URL)
    }
}

/// Envelope-level failures. Only these abort a run, and only before the
/// first send.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Could not set up outbound relay: {0}")]
    Setup(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
