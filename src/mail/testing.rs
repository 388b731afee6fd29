use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex,
};

use async_trait::async_trait;

use super::{EmailDispatcher, EmailMessage, MailError};

/// Keeps every delivered message; can be told to fail the next N attempts.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    attempts: AtomicU32,
    failures: Mutex<(u32, bool)>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32, transient: bool) {
        *self.failures.lock().unwrap() = (count, transient);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailDispatcher for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if failures.0 > 0 {
                failures.0 -= 1;
                return Err(if failures.1 {
                    MailError::Transient("connection reset".into())
                } else {
                    MailError::Permanent("mailbox unavailable".into())
                });
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
