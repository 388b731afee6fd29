use rand::{rngs::OsRng, Rng};
use time::{Duration, OffsetDateTime};

/// A freshly generated one-time code and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpCode {
    pub code: String,
    pub expires_at: OffsetDateTime,
}

pub fn generate(length: usize, ttl: Duration) -> OtpCode {
    let code = (0..length)
        .map(|_| char::from(b'0' + OsRng.gen_range(0..10u8)))
        .collect();
    OtpCode {
        code,
        expires_at: OffsetDateTime::now_utc() + ttl,
    }
}

/// True when `candidate` equals the stored code and the code has not expired.
pub fn matches(
    stored: Option<&str>,
    expires_at: Option<OffsetDateTime>,
    candidate: &str,
    now: OffsetDateTime,
) -> bool {
    match (stored, expires_at) {
        (Some(code), Some(exp)) => now < exp && code == candidate,
        _ => false,
    }
}
