//! Personalized bulk email over an authenticated SMTP relay, with per
//! recipient failure isolation and checkpointed resume.

pub mod attachments;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod mailer;
pub mod recipients;
pub mod report;
pub mod scheduler;
pub mod template;
pub mod types;

pub use error::{RunError, SendError};
pub use scheduler::{BatchScheduler, CancelFlag, RunOutcome, SchedulingMode, SendJob};
