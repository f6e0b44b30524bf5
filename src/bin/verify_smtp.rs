use anyhow::Result;
use bulkmail::config::{DEFAULT_SMTP_HOST, DEFAULT_SMTP_PORT, SmtpSettings};
use bulkmail::mailer::SmtpRelay;
use clap::Parser;

/// Check that the relay accepts the given credentials without sending mail.
#[derive(Debug, Parser)]
#[command(name = "bulkmail-verify")]
struct Args {
    #[arg(long, env = "SMTP_USERNAME")]
    username: String,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(long, env = "SMTP_HOST", default_value = DEFAULT_SMTP_HOST)]
    smtp_host: String,

    #[arg(long, env = "SMTP_PORT", default_value_t = DEFAULT_SMTP_PORT)]
    smtp_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let settings = SmtpSettings {
        host: args.smtp_host,
        port: args.smtp_port,
        ..SmtpSettings::new(args.username, args.password)
    };

    println!(
        "Verifying credentials for {} against {}:{}...",
        settings.username, settings.host, settings.port
    );
    let relay = SmtpRelay::new(settings);

    if let Err(e) = relay.verify().await {
        eprintln!("Verification failed: {:#}", e);
        std::process::exit(1);
    }

    println!("SMTP credentials verified");
    Ok(())
}
