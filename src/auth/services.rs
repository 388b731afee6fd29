use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{LoginRequest, RegisterRequest, ResendOtpRequest, UpdateUserRequest, VerifyOtpRequest},
        jwt::JwtKeys,
        otp, password,
        repo_types::{NewUser, User, UserChanges},
    },
    error::AppError,
    mail::{
        send_with_retry,
        templates::{otp_email, OtpPurpose},
    },
    state::AppState,
};

const INVALID_CREDENTIALS: &str = "Invalid email or password";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Blank strings count as absent.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn present_trimmed(value: Option<String>) -> Option<String> {
    present(value).map(|v| v.trim().to_string())
}

fn check_email(email: &str) -> Result<(), AppError> {
    if !is_valid_email(email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::validation("Invalid email"));
    }
    Ok(())
}

fn check_password(state: &AppState, password: &str) -> Result<(), AppError> {
    let min = state.config.auth.password_min_length;
    if password.chars().count() < min {
        return Err(AppError::validation(format!(
            "Password must be at least {min} characters"
        )));
    }
    Ok(())
}

fn new_otp(state: &AppState) -> otp::OtpCode {
    let policy = &state.config.auth;
    otp::generate(policy.otp_length, Duration::minutes(policy.otp_ttl_minutes))
}

/// Outcome of a registration: the stored user and whether it still awaits an OTP.
#[derive(Debug)]
pub struct Registration {
    pub user: User,
    pub verification_required: bool,
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub user: User,
    pub token: String,
}

pub fn issue_token(state: &AppState, user: &User) -> Result<String, AppError> {
    let keys = JwtKeys::from_ref(state);
    Ok(keys.sign(user.id, &user.email)?)
}

#[instrument(skip(state, req))]
pub async fn register(state: &AppState, req: RegisterRequest) -> Result<Registration, AppError> {
    let (Some(name), Some(email), Some(plain)) = (
        present_trimmed(req.name),
        present_trimmed(req.email),
        present(req.password),
    ) else {
        return Err(AppError::validation("Please fill all fields"));
    };
    let email = normalize_email(&email);
    check_email(&email)?;
    check_password(state, &plain)?;

    if state.store.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::Conflict("Email already exists".into()));
    }

    let password_hash = password::hash_password_blocking(plain).await?;
    let otp_required = state.config.auth.otp_required;
    let otp = otp_required.then(|| new_otp(state));

    // A concurrent registration can still win the race; the store's unique
    // email check turns that into the same Conflict.
    let user = state
        .store
        .insert(NewUser {
            id: Uuid::new_v4(),
            name,
            email,
            password_hash,
            otp: otp.clone(),
            email_verified_at: (!otp_required).then(OffsetDateTime::now_utc),
        })
        .await?;

    let Some(otp) = otp else {
        info!(user_id = %user.id, "user registered without otp");
        return Ok(Registration {
            user,
            verification_required: false,
        });
    };

    let message = otp_email(
        &user.email,
        &otp.code,
        state.config.auth.otp_ttl_minutes,
        OtpPurpose::Registration,
    );
    if let Err(e) = send_with_retry(state.mailer.as_ref(), &message, state.mail_retry()).await {
        if let Err(del) = state.store.delete(user.id).await {
            error!(error = %del, user_id = %user.id, "rollback of unverified user failed");
        }
        return Err(e.into());
    }

    info!(user_id = %user.id, "user registered; otp sent");
    Ok(Registration {
        user,
        verification_required: true,
    })
}

#[instrument(skip(state, req))]
pub async fn verify_otp(state: &AppState, req: VerifyOtpRequest) -> Result<User, AppError> {
    let (Some(email), Some(code)) = (present_trimmed(req.email), present_trimmed(req.otp)) else {
        return Err(AppError::validation("Email and OTP are required"));
    };
    let email = normalize_email(&email);

    let user = state
        .store
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    let verified = state
        .store
        .consume_otp(user.id, &code, OffsetDateTime::now_utc())
        .await?
        .ok_or_else(|| {
            warn!(user_id = %user.id, "invalid or expired otp");
            AppError::InvalidOtp
        })?;

    info!(user_id = %verified.id, "otp verified");
    Ok(verified)
}

#[instrument(skip(state, req))]
pub async fn resend_otp(state: &AppState, req: ResendOtpRequest) -> Result<(), AppError> {
    let Some(email) = present_trimmed(req.email) else {
        return Err(AppError::validation("Email is required to resend OTP"));
    };
    let email = normalize_email(&email);

    let user = state
        .store
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    let otp = new_otp(state);
    if !state.store.set_otp(user.id, Some(&otp)).await? {
        return Err(AppError::not_found("User not found"));
    }

    let message = otp_email(
        &user.email,
        &otp.code,
        state.config.auth.otp_ttl_minutes,
        OtpPurpose::Resend,
    );
    if let Err(e) = send_with_retry(state.mailer.as_ref(), &message, state.mail_retry()).await {
        error!(error = %e, user_id = %user.id, "otp resend failed; clearing otp");
        if let Err(clear) = state.store.set_otp(user.id, None).await {
            error!(error = %clear, user_id = %user.id, "clearing otp failed");
        }
        return Err(AppError::Delivery("Failed to send OTP. Please try again.".into()));
    }

    info!(user_id = %user.id, "otp resent");
    Ok(())
}

#[instrument(skip(state, req))]
pub async fn login(state: &AppState, req: LoginRequest) -> Result<LoginOutcome, AppError> {
    let (Some(email), Some(plain)) = (present_trimmed(req.email), present(req.password)) else {
        return Err(AppError::validation("Please provide email and password"));
    };
    let email = normalize_email(&email);

    let Some(user) = state.store.find_by_email(&email).await? else {
        password::verify_dummy_blocking(plain).await?;
        warn!(email = %email, "login unknown email");
        return Err(AppError::Auth(INVALID_CREDENTIALS.into()));
    };

    if !password::verify_password_blocking(plain, user.password_hash.clone()).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Auth(INVALID_CREDENTIALS.into()));
    }

    if state.config.auth.otp_required && !user.is_verified() {
        warn!(user_id = %user.id, "login before email verification");
        return Err(AppError::Auth("Email address not verified".into()));
    }

    let token = issue_token(state, &user)?;
    info!(user_id = %user.id, "user logged in");
    Ok(LoginOutcome { user, token })
}

#[instrument(skip(state, req))]
pub async fn update_user(
    state: &AppState,
    actor_id: Uuid,
    req: UpdateUserRequest,
) -> Result<User, AppError> {
    let name = present_trimmed(req.name);
    let email = present_trimmed(req.email).map(|e| normalize_email(&e));
    let plain = present(req.password);

    if name.is_none() && email.is_none() && plain.is_none() {
        return Err(AppError::validation("No data provided for update"));
    }
    if let Some(email) = &email {
        check_email(email)?;
    }
    let password_hash = match plain {
        Some(plain) => {
            check_password(state, &plain)?;
            Some(password::hash_password_blocking(plain).await?)
        }
        None => None,
    };

    let changes = UserChanges {
        name,
        email,
        password_hash,
    };
    let user = state
        .store
        .update(actor_id, &changes)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    info!(user_id = %user.id, "user updated");
    Ok(user)
}

#[instrument(skip(state))]
pub async fn delete_user(state: &AppState, actor_id: Uuid) -> Result<(), AppError> {
    if !state.store.delete(actor_id).await? {
        return Err(AppError::not_found("User not found"));
    }
    info!(user_id = %actor_id, "user deleted");
    Ok(())
}

#[instrument(skip(state))]
pub async fn profile(state: &AppState, actor_id: Uuid) -> Result<User, AppError> {
    state
        .store
        .find_by_id(actor_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}
