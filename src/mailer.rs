use crate::config::SmtpSettings;
use crate::error::SendError;
use anyhow::{Context, Result};
use lettre::message::Message;
use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, info};

// ============================================================================
// Relay / Connection traits
// ============================================================================

/// Outbound relay. Opening a connection authenticates it; a failure here is
/// a setup fault, not a per-recipient one.
#[allow(async_fn_in_trait)]
pub trait Relay: Send + Sync {
    type Connection: Connection;

    async fn open(&self) -> Result<Self::Connection>;
}

/// One authenticated connection. `send` is a single transaction with no
/// retry; every transport failure comes back as a [`SendError`].
#[allow(async_fn_in_trait)]
pub trait Connection: Send + Sized {
    async fn send(&mut self, message: &Message) -> Result<(), SendError>;

    async fn close(self);
}

// ============================================================================
// SmtpRelay
// ============================================================================

pub struct SmtpRelay {
    settings: SmtpSettings,
}

impl SmtpRelay {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SmtpSettings {
        &self.settings
    }

    /// Credential probe: open, authenticate and close one connection.
    pub async fn verify(&self) -> Result<()> {
        let connection = self.open().await?;
        connection.close().await;
        Ok(())
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let credentials = Credentials::new(
            self.settings.username.clone(),
            self.settings.password.clone(),
        );

        // A single pooled connection is reused for every send on this
        // transport and dropped with it.
        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.host)
                .with_context(|| format!("Invalid SMTP host {}", self.settings.host))?
                .port(self.settings.port)
                .credentials(credentials)
                .timeout(Some(self.settings.timeout))
                .pool_config(PoolConfig::new().max_size(1))
                .build(),
        )
    }
}

impl Relay for SmtpRelay {
    type Connection = SmtpConnection;

    async fn open(&self) -> Result<SmtpConnection> {
        let transport = self.transport()?;
        let connected = transport.test_connection().await.with_context(|| {
            format!(
                "Failed to connect or authenticate to {}:{}",
                self.settings.host, self.settings.port
            )
        })?;
        if !connected {
            anyhow::bail!(
                "SMTP server {}:{} did not accept the connection",
                self.settings.host,
                self.settings.port
            );
        }

        debug!(host = %self.settings.host, port = self.settings.port, "SMTP connection opened");
        Ok(SmtpConnection { transport, sent: 0 })
    }
}

pub struct SmtpConnection {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sent: usize,
}

impl Connection for SmtpConnection {
    async fn send(&mut self, message: &Message) -> Result<(), SendError> {
        let raw = message.formatted();
        let response = self
            .transport
            .send_raw(message.envelope(), &raw)
            .await
            .map_err(|e| {
                let code = e.status().map(|c| c.to_string());
                classify_rejection(code.as_deref(), &e.to_string())
            })?;

        self.sent += 1;
        info!(
            recipients = ?message.envelope().to(),
            code = %response.code(),
            bytes = raw.len(),
            "Email sent"
        );
        Ok(())
    }

    /// Drops the transport. lettre hands the idle pooled connection to a
    /// background task that sends QUIT, so nothing is awaited here. A process
    /// that exits immediately afterwards may close the socket before QUIT
    /// goes out.
    async fn close(self) {
        debug!(sent = self.sent, "SMTP connection closed");
        drop(self.transport);
    }
}

// ============================================================================
// Rejection classification
// ============================================================================

const SIZE_REJECTION_CODES: &[&str] = &["552", "523"];
const SIZE_REJECTION_PHRASES: &[&str] = &[
    "message too large",
    "message size",
    "size limit",
    "exceeded storage",
    "5.3.4",
    "too big",
];

/// Map a relay rejection onto the failure taxonomy. Oversized-content
/// rejections are user-correctable and kept apart from every other error.
pub fn classify_rejection(code: Option<&str>, message: &str) -> SendError {
    let lowered = message.to_lowercase();
    let size_code = code.is_some_and(|c| SIZE_REJECTION_CODES.contains(&c));
    let size_text = SIZE_REJECTION_PHRASES.iter().any(|p| lowered.contains(p));

    if size_code || size_text {
        SendError::SizeRejectedByServer(message.to_string())
    } else {
        SendError::Transport(message.to_string())
    }
}

// ============================================================================
// Test utilities
// ============================================================================
