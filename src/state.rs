use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{memory::MemoryUserStore, repo::PgUserStore, repo::UserStore};
use crate::config::AppConfig;
use crate::mail::{EmailDispatcher, LogDispatcher, RetryPolicy, SmtpDispatcher};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub mailer: Arc<dyn EmailDispatcher>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store = match &config.database_url {
            Some(url) => {
                let store = PgUserStore::connect(url, config.database_max_connections).await?;
                info!("using postgres user store");
                Arc::new(store) as Arc<dyn UserStore>
            }
            None => {
                warn!("DATABASE_URL not set; users are kept in memory and lost on restart");
                Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>
            }
        };

        let mailer = match &config.mail.smtp {
            Some(smtp) => {
                info!(host = %smtp.host, port = smtp.port, "using smtp dispatcher");
                Arc::new(SmtpDispatcher::new(smtp, &config.mail.from)?) as Arc<dyn EmailDispatcher>
            }
            None => {
                warn!("MAIL_SMTP_HOST not set; emails will only be logged");
                Arc::new(LogDispatcher) as Arc<dyn EmailDispatcher>
            }
        };

        Ok(Self::from_parts(store, mailer, config))
    }

    pub fn from_parts(
        store: Arc<dyn UserStore>,
        mailer: Arc<dyn EmailDispatcher>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    pub fn mail_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.mail.retry_attempts,
            initial_backoff: self.config.mail.retry_backoff(),
        }
    }

    /// In-memory state for tests; the concrete store and mailer are handed
    /// back so tests can inspect them.
    #[cfg(test)]
    pub fn fake_with(
        config: AppConfig,
    ) -> (
        Self,
        Arc<MemoryUserStore>,
        Arc<crate::mail::testing::RecordingMailer>,
    ) {
        let store = Arc::new(MemoryUserStore::new());
        let mailer = Arc::new(crate::mail::testing::RecordingMailer::new());
        let state = Self::from_parts(store.clone(), mailer.clone(), Arc::new(config));
        (state, store, mailer)
    }

    #[cfg(test)]
    pub fn fake() -> (
        Self,
        Arc<MemoryUserStore>,
        Arc<crate::mail::testing::RecordingMailer>,
    ) {
        Self::fake_with(AppConfig::for_tests())
    }
}
