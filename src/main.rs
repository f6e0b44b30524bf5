use anyhow::{Context, Result};
use bulkmail::attachments::Attachment;
use bulkmail::checkpoint::FileCheckpointStore;
use bulkmail::config::{
    DEFAULT_ROW_ATTACHMENT_COLUMN, DEFAULT_SMTP_HOST, DEFAULT_SMTP_PORT, SendConfig, SmtpSettings,
};
use bulkmail::mailer::SmtpRelay;
use bulkmail::recipients;
use bulkmail::report::report_file_name;
use bulkmail::scheduler::{BatchScheduler, CancelFlag, SendJob};
use bulkmail::template::Template;
use bulkmail::types::SessionId;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Send a personalized email to every row of a CSV file.
#[derive(Debug, Parser)]
#[command(name = "bulkmail", version)]
struct Args {
    /// CSV file with an `Email` column; other columns fill `{placeholders}`
    #[arg(long)]
    recipients: PathBuf,

    /// Subject template
    #[arg(long)]
    subject: String,

    /// File holding the HTML body template
    #[arg(long)]
    body: PathBuf,

    /// Attachment sent to every recipient (repeatable)
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,

    /// Column holding a per-recipient attachment path
    #[arg(long, default_value = DEFAULT_ROW_ATTACHMENT_COLUMN)]
    attachment_column: String,

    #[arg(long, env = "SMTP_USERNAME")]
    username: String,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    password: String,

    /// Sender address, defaults to the SMTP username
    #[arg(long, env = "EMAIL_FROM")]
    from: Option<String>,

    #[arg(long, env = "SMTP_HOST", default_value = DEFAULT_SMTP_HOST)]
    smtp_host: String,

    #[arg(long, env = "SMTP_PORT", default_value_t = DEFAULT_SMTP_PORT)]
    smtp_port: u16,

    /// 1 sends sequentially over one connection
    #[arg(long, env = "BULKMAIL_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    #[arg(long, env = "BULKMAIL_BATCH_DELAY_SECS", default_value_t = 5)]
    batch_delay_secs: u64,

    #[arg(long, env = "BULKMAIL_EMAIL_DELAY_SECS", default_value_t = 1)]
    email_delay_secs: u64,

    #[arg(long, env = "BULKMAIL_BATCH_TIMEOUT_SECS", default_value_t = 300)]
    batch_timeout_secs: u64,

    /// Do not gzip attachments over the size ceiling
    #[arg(long)]
    no_compress: bool,

    #[arg(long, env = "CHECKPOINT_DIR", default_value = ".bulkmail")]
    checkpoint_dir: PathBuf,

    /// Resume this session instead of starting a new one
    #[arg(long)]
    session: Option<String>,

    /// Where to write the CSV report, defaults to email_report_<date>.csv
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    let session_id = match &args.session {
        Some(id) => id.parse::<SessionId>()?,
        None => SessionId::from_start_time(Utc::now()),
    };
    info!(session = %session_id, "Pass --session {} to resume this run", session_id);

    let table = recipients::load_csv_path(&args.recipients)?;
    let body = tokio::fs::read_to_string(&args.body)
        .await
        .with_context(|| format!("Failed to read body template {}", args.body.display()))?;

    let mut attachments = Vec::with_capacity(args.attachments.len());
    for path in &args.attachments {
        let attachment = Attachment::from_path(path)
            .await
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        attachments.push(attachment);
    }

    let settings = SmtpSettings {
        host: args.smtp_host.clone(),
        port: args.smtp_port,
        ..SmtpSettings::new(args.username.clone(), args.password.clone())
    };
    let config = SendConfig {
        concurrency_limit: args.concurrency,
        batch_delay: Duration::from_secs(args.batch_delay_secs),
        per_email_delay: Duration::from_secs(args.email_delay_secs),
        batch_timeout: Duration::from_secs(args.batch_timeout_secs),
        compress_oversized: !args.no_compress,
        row_attachment_column: args.attachment_column.clone(),
        ..SendConfig::default()
    };

    let store = Arc::new(FileCheckpointStore::new(&args.checkpoint_dir));
    info!(dir = %store.dir().display(), "Checkpoints enabled");

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight sends");
            on_interrupt.cancel();
        }
    });

    let scheduler = BatchScheduler::new(Arc::new(SmtpRelay::new(settings)), store, config)
        .with_cancel_flag(cancel);

    let job = SendJob {
        session_id,
        table,
        template: Template::new(args.subject, body),
        attachments,
        from: args.from.unwrap_or(args.username),
    };
    let outcome = scheduler.run(job).await?;

    let report_path = args
        .report
        .unwrap_or_else(|| PathBuf::from(report_file_name(Utc::now().date_naive())));
    tokio::fs::write(&report_path, outcome.summary.report_csv()?)
        .await
        .with_context(|| format!("Failed to write report {}", report_path.display()))?;
    info!(path = %report_path.display(), "Report written");

    if outcome.interrupted {
        warn!(session = %outcome.session_id, "Run interrupted, resume with --session");
    }

    println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
    Ok(())
}
