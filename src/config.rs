use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthPolicy {
    /// When false, registration creates verified accounts and sends no email.
    pub otp_required: bool,
    pub otp_length: usize,
    pub otp_ttl_minutes: i64,
    pub password_min_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    Tls,
    Starttls,
    None,
}

impl std::str::FromStr for SmtpTls {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tls" => Ok(Self::Tls),
            "starttls" => Ok(Self::Starttls),
            "none" | "plain" => Ok(Self::None),
            other => anyhow::bail!("unknown MAIL_SMTP_TLS mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// `None` falls back to the log-only dispatcher.
    pub smtp: Option<SmtpConfig>,
    pub from: String,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl MailConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub frontend_url: Option<String>,
    pub jwt: JwtConfig,
    pub auth: AuthPolicy,
    pub mail: MailConfig,
}

fn var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var_opt(key).unwrap_or_else(|| default.to_string())
}

fn var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    var_opt(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn var_bool(key: &str, default: bool) -> bool {
    match var_opt(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: var_or("JWT_ISSUER", "reserve-auth"),
            audience: var_or("JWT_AUDIENCE", "reserve-auth-users"),
            ttl_minutes: var_parse("JWT_TTL_MINUTES", 60),
            cookie_secure: var_bool("COOKIE_SECURE", false),
        };
        anyhow::ensure!(!jwt.secret.is_empty(), "JWT_SECRET must not be empty");

        let auth = AuthPolicy {
            otp_required: var_bool("AUTH_OTP_REQUIRED", true),
            otp_length: var_parse("OTP_LENGTH", 6),
            otp_ttl_minutes: var_parse("OTP_TTL_MINUTES", 10),
            password_min_length: var_parse("AUTH_PASSWORD_MIN_LENGTH", 1),
        };
        anyhow::ensure!(auth.otp_length > 0, "OTP_LENGTH must be positive");

        let smtp = match var_opt("MAIL_SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: var_parse("MAIL_SMTP_PORT", 587),
                username: var_opt("MAIL_SMTP_USERNAME"),
                password: var_opt("MAIL_SMTP_PASSWORD"),
                tls: var_or("MAIL_SMTP_TLS", "starttls").parse()?,
            }),
            None => None,
        };
        let mail = MailConfig {
            smtp,
            from: var_or("MAIL_FROM", "no-reply@localhost"),
            retry_attempts: var_parse::<u32>("MAIL_RETRY_ATTEMPTS", 3).max(1),
            retry_backoff_ms: var_parse("MAIL_RETRY_BACKOFF_MS", 200),
        };

        Ok(Self {
            host: var_or("APP_HOST", "0.0.0.0"),
            port: var_parse("APP_PORT", 8080),
            database_url: var_opt("DATABASE_URL"),
            database_max_connections: var_parse("DATABASE_MAX_CONNECTIONS", 10),
            frontend_url: var_opt("FRONTEND_URL"),
            jwt,
            auth,
            mail,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: None,
            database_max_connections: 1,
            frontend_url: None,
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 5,
                cookie_secure: false,
            },
            auth: AuthPolicy {
                otp_required: true,
                otp_length: 6,
                otp_ttl_minutes: 10,
                password_min_length: 1,
            },
            mail: MailConfig {
                smtp: None,
                from: "no-reply@test.local".into(),
                retry_attempts: 3,
                retry_backoff_ms: 0,
            },
        }
    }
}
