//! Message assembly with size ceilings.
//!
//! The body goes in first, then the row attachment, then every global
//! attachment in order. The running size is the encoded size of the parts
//! already added, and it is checked after every addition so a message is
//! rejected at the first part that would push it over the ceiling.

use crate::error::SendError;
use flate2::Compression;
use flate2::write::GzEncoder;
use lettre::Message;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const MIB: usize = 1024 * 1024;
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_message_bytes: usize,
    pub max_attachment_bytes: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: 25 * MIB,
            max_attachment_bytes: 25 * MIB,
        }
    }
}

// ============================================================================
// Attachment
// ============================================================================

/// A named, immutable byte blob. Clones share the bytes, so every recipient
/// reads a global attachment from its first byte.
#[derive(Clone)]
pub struct Attachment {
    name: String,
    content_type: String,
    bytes: Arc<[u8]>,
    compressed: Arc<OnceCell<Attachment>>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl Attachment {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let content_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            name,
            content_type,
            bytes: bytes.into(),
            compressed: Arc::new(OnceCell::new()),
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::from_bytes(name, bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Gzipped copy, computed once and shared by every clone.
    async fn compressed(&self) -> std::io::Result<&Attachment> {
        self.compressed
            .get_or_try_init(|| {
                let name = self.name.clone();
                let bytes = Arc::clone(&self.bytes);
                async move {
                    tokio::task::spawn_blocking(move || compress(&name, &bytes))
                        .await
                        .map_err(std::io::Error::other)?
                }
            })
            .await
    }

    fn to_part(&self) -> SinglePart {
        let content_type = ContentType::parse(&self.content_type)
            .or_else(|_| ContentType::parse(OCTET_STREAM))
            .unwrap_or(ContentType::TEXT_PLAIN);
        MimeAttachment::new(self.name.clone()).body(self.bytes.to_vec(), content_type)
    }
}

/// Lossless gzip archive of a single file.
pub fn compress(name: &str, bytes: &[u8]) -> std::io::Result<Attachment> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::best());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    Ok(Attachment::from_bytes(format!("{}.gz", name), compressed))
}

pub fn parse_mailbox(address: &str) -> Result<Mailbox, SendError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| SendError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

// ============================================================================
// MessageAssembler
// ============================================================================

#[derive(Debug)]
pub struct AssembledMessage {
    pub message: Message,
    /// Exact size of the formatted message in bytes.
    pub size: usize,
    /// Names of the attachments actually included, in order.
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessageAssembler {
    limits: SizeLimits,
    compress_oversized: bool,
}

impl MessageAssembler {
    pub fn new(limits: SizeLimits, compress_oversized: bool) -> Self {
        Self {
            limits,
            compress_oversized,
        }
    }

    pub async fn build(
        &self,
        from: &Mailbox,
        to: &Mailbox,
        subject: &str,
        body: &str,
        row_attachment: Option<&Path>,
        globals: &[Attachment],
    ) -> Result<AssembledMessage, SendError> {
        let limit = self.limits.max_message_bytes;
        let body_part = SinglePart::html(body.to_string());
        let mut size = subject.len() + body_part.formatted().len();
        if size > limit {
            return Err(SendError::BodyTooLarge { size, limit });
        }

        let row_attachment = match row_attachment {
            Some(path) => load_row_attachment(path).await,
            None => None,
        };

        let mut multipart = MultiPart::mixed().singlepart(body_part);
        let mut included = Vec::new();

        for attachment in row_attachment.iter().chain(globals) {
            let attachment = self.within_attachment_limit(attachment).await?;
            let part = attachment.to_part();
            size += part.formatted().len();
            if size > limit {
                return Err(SendError::AttachmentTooLarge {
                    name: attachment.name().to_string(),
                    size,
                    limit,
                });
            }
            multipart = multipart.singlepart(part);
            included.push(attachment.name().to_string());
        }

        let message = Message::builder()
            .from(from.clone())
            .to(to.clone())
            .subject(subject)
            .multipart(multipart)
            .map_err(|e| SendError::InvalidAddress {
                address: to.to_string(),
                reason: e.to_string(),
            })?;

        // Headers and MIME boundaries are only known once the message exists.
        let size = message.formatted().len();
        if size > limit {
            return Err(match included.last().cloned() {
                Some(name) => SendError::AttachmentTooLarge { name, size, limit },
                None => SendError::BodyTooLarge { size, limit },
            });
        }

        Ok(AssembledMessage {
            message,
            size,
            attachments: included,
        })
    }

    /// The attachment itself, or its gzipped copy when the original is over
    /// the per-attachment ceiling and compression brings it under.
    async fn within_attachment_limit<'a>(
        &self,
        attachment: &'a Attachment,
    ) -> Result<Cow<'a, Attachment>, SendError> {
        let limit = self.limits.max_attachment_bytes;
        if attachment.size() <= limit {
            return Ok(Cow::Borrowed(attachment));
        }

        let too_large = |size| SendError::AttachmentTooLarge {
            name: attachment.name().to_string(),
            size,
            limit,
        };

        if !self.compress_oversized {
            return Err(too_large(attachment.size()));
        }

        match attachment.compressed().await {
            Ok(compressed) if compressed.size() <= limit => {
                debug!(
                    attachment = %attachment.name(),
                    original = attachment.size(),
                    compressed = compressed.size(),
                    "Compressed oversized attachment"
                );
                Ok(Cow::Owned(compressed.clone()))
            }
            Ok(compressed) => Err(too_large(compressed.size())),
            Err(e) => {
                warn!(attachment = %attachment.name(), error = %e, "Failed to compress attachment");
                Err(too_large(attachment.size()))
            }
        }
    }
}

/// Missing or unreadable row attachments are skipped, not fatal.
async fn load_row_attachment(path: &Path) -> Option<Attachment> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(path = %path.display(), "Row attachment not found, skipping");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot stat row attachment, skipping");
            return None;
        }
    }

    match Attachment::from_path(path).await {
        Ok(attachment) => Some(attachment),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read row attachment, skipping");
            None
        }
    }
}
