//! Outbound email. The controller only sees [`EmailDispatcher`]; delivery is
//! attempted a bounded number of times through [`send_with_retry`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

mod smtp;
pub mod templates;
#[cfg(test)]
pub mod testing;

pub use smtp::{LogDispatcher, SmtpDispatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Worth another attempt (connection drop, 4xx reply).
    #[error("transient mail failure: {0}")]
    Transient(String),
    /// Retrying will not help (bad address, 5xx reply).
    #[error("permanent mail failure: {0}")]
    Permanent(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Sends `message`, retrying transient failures with exponential backoff.
/// Returns the last error once attempts are exhausted.
pub async fn send_with_retry(
    dispatcher: &dyn EmailDispatcher,
    message: &EmailMessage,
    policy: RetryPolicy,
) -> Result<(), MailError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match dispatcher.send(message).await {
            Ok(()) => {
                debug!(attempt, subject = %message.subject, "email sent");
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                let wait = policy.backoff_for(attempt);
                warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "email send failed; retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
