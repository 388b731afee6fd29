use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, warn};

use super::{EmailDispatcher, EmailMessage, MailError};
use crate::config::{SmtpConfig, SmtpTls};

#[derive(Clone)]
pub struct SmtpDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpDispatcher {
    pub fn new(cfg: &SmtpConfig, from: &str) -> anyhow::Result<Self> {
        let builder = match cfg.tls {
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .context("smtp relay")?,
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                .context("smtp starttls relay")?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host),
        };
        let mut builder = builder.port(cfg.port);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from: Mailbox = from.parse().context("parse MAIL_FROM")?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

fn classify(e: SmtpError) -> MailError {
    if e.is_permanent() {
        MailError::Permanent(e.to_string())
    } else {
        MailError::Transient(e.to_string())
    }
}

#[async_trait]
impl EmailDispatcher for SmtpDispatcher {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let to: Mailbox = message
            .recipient
            .parse()
            .map_err(|e| MailError::Permanent(format!("invalid recipient: {e}")))?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(message.html_body.clone())
            .map_err(|e| MailError::Permanent(e.to_string()))?;

        self.transport.send(email).await.map_err(classify)?;
        Ok(())
    }
}

/// Stands in for SMTP when none is configured: writes the message to the log.
#[derive(Clone, Default)]
pub struct LogDispatcher;

#[async_trait]
impl EmailDispatcher for LogDispatcher {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        warn!(recipient = %message.recipient, subject = %message.subject, "smtp not configured; email logged instead of sent");
        debug!(body = %message.html_body, "email body");
        Ok(())
    }
}
