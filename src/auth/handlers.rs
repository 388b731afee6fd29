use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use axum_extra::extract::{
    cookie::{Cookie, CookieJar, SameSite},
    WithRejection,
};
use tracing::instrument;

use crate::{
    auth::{
        dto::{
            AuthResponse, LoginRequest, MessageResponse, PublicUser, RegisterRequest,
            RegisterResponse, ResendOtpRequest, UpdateUserRequest, UserResponse, VerifyOtpRequest,
        },
        extractors::{AuthUser, TOKEN_COOKIE},
        jwt,
        repo_types::User,
        services::{self, LoginOutcome},
    },
    error::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify-otp", get(verify_otp_query).post(verify_otp_body))
        .route("/auth/resend-otp", post(resend_otp))
        .route("/auth/update", put(update_user))
        .route("/auth/delete", delete(delete_user))
        .route("/auth/logout", post(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    let cfg = &state.config.jwt;
    let ttl = jwt::token_ttl(cfg);
    let same_site = if cfg.cookie_secure {
        SameSite::None
    } else {
        SameSite::Lax
    };
    Cookie::build((TOKEN_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(cfg.cookie_secure)
        .same_site(same_site)
        .max_age(time::Duration::seconds(ttl.as_secs() as i64))
        .build()
}

/// Expired, empty cookie. Added rather than removed so the client is told
/// even when the request came in with a bearer header only.
fn cleared_cookie() -> Cookie<'static> {
    Cookie::build((TOKEN_COOKIE, ""))
        .path("/")
        .http_only(true)
        .max_age(time::Duration::ZERO)
        .build()
}

fn session_response(
    state: &AppState,
    jar: CookieJar,
    user: &User,
    token: String,
    message: &str,
) -> (CookieJar, Json<AuthResponse>) {
    let jar = jar.add(session_cookie(state, token.clone()));
    (
        jar,
        Json(AuthResponse {
            success: true,
            message: message.into(),
            token,
            user: PublicUser::from(user),
        }),
    )
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<RegisterRequest>, AppError>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let reg = services::register(&state, payload).await?;
    let message = if reg.verification_required {
        "Verification code sent. Check your email."
    } else {
        "User registered successfully"
    };
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            message: message.into(),
            verification_required: reg.verification_required,
            user: PublicUser::from(&reg.user),
        }),
    ))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Json(payload), _): WithRejection<Json<LoginRequest>, AppError>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let LoginOutcome { user, token } = services::login(&state, payload).await?;
    Ok(session_response(&state, jar, &user, token, "Login successful"))
}

async fn verified_session(
    state: &AppState,
    jar: CookieJar,
    req: VerifyOtpRequest,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let user = services::verify_otp(state, req).await?;
    let token = services::issue_token(state, &user)?;
    Ok(session_response(state, jar, &user, token, "Email verified"))
}

#[instrument(skip(state, jar, query))]
pub async fn verify_otp_query(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Query(query), _): WithRejection<Query<VerifyOtpRequest>, AppError>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    verified_session(&state, jar, query).await
}

#[instrument(skip(state, jar, payload))]
pub async fn verify_otp_body(
    State(state): State<AppState>,
    jar: CookieJar,
    WithRejection(Json(payload), _): WithRejection<Json<VerifyOtpRequest>, AppError>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    verified_session(&state, jar, payload).await
}

#[instrument(skip(state, payload))]
pub async fn resend_otp(
    State(state): State<AppState>,
    WithRejection(Json(payload), _): WithRejection<Json<ResendOtpRequest>, AppError>,
) -> Result<Json<MessageResponse>, AppError> {
    services::resend_otp(&state, payload).await?;
    Ok(Json(MessageResponse::ok(
        "A new OTP has been sent to your email.",
    )))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    WithRejection(Json(payload), _): WithRejection<Json<UpdateUserRequest>, AppError>,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::update_user(&state, user_id, payload).await?;
    Ok(Json(UserResponse {
        success: true,
        message: "User updated successfully".into(),
        user: PublicUser::from(&user),
    }))
}

#[instrument(skip(state, jar))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    jar: CookieJar,
) -> Result<(CookieJar, Json<MessageResponse>), AppError> {
    services::delete_user(&state, user_id).await?;
    Ok((
        jar.add(cleared_cookie()),
        Json(MessageResponse::ok("User deleted successfully")),
    ))
}

pub async fn logout(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    (
        jar.add(cleared_cookie()),
        Json(MessageResponse::ok("Logged out")),
    )
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::profile(&state, user_id).await?;
    Ok(Json(UserResponse {
        success: true,
        message: "OK".into(),
        user: PublicUser::from(&user),
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{
            header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
            HeaderMap, Request,
        },
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{app::build_app, auth::repo::UserStore};

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn token_cookie(headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("token="))
            .map(|v| v.split(';').next().unwrap_or_default().to_string())
    }

    #[tokio::test]
    async fn full_account_lifecycle_over_http() {
        let (state, store, _) = AppState::fake();
        let app = build_app(state);

        let (status, _, body) = send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["verification_required"], true);
        assert_eq!(body["user"]["email"], "a@x.com");
        assert!(body.get("token").is_none());
        assert!(body["user"].get("password_hash").is_none());

        let code = store
            .find_by_email("a@x.com")
            .await
            .unwrap()
            .and_then(|u| u.otp)
            .unwrap();
        let (status, headers, body) = send(
            &app,
            Request::builder()
                .uri(format!("/api/v1/auth/verify-otp?email=a@x.com&otp={code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email_verified"], true);
        let token = body["token"].as_str().unwrap().to_string();
        let cookie = token_cookie(&headers).expect("session cookie set");

        let (status, _, body) = send(
            &app,
            Request::builder()
                .uri("/api/v1/me")
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "a");

        let mut update = json_req("PUT", "/api/v1/auth/update", json!({"name": "Alice"}));
        update.headers_mut().insert(COOKIE, cookie.parse().unwrap());
        let (status, _, body) = send(&app, update).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["name"], "Alice");

        let (status, headers, _) = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/auth/delete")
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(token_cookie(&headers).is_some());

        let (status, _, body) = send(
            &app,
            Request::builder()
                .uri("/api/v1/me")
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn login_sets_cookie_and_returns_token() {
        let (state, store, _) = AppState::fake();
        let app = build_app(state);
        send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        let code = store
            .find_by_email("a@x.com")
            .await
            .unwrap()
            .and_then(|u| u.otp)
            .unwrap();
        let (status, _, _) = send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/verify-otp",
                json!({"email": "a@x.com", "otp": code}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, headers, body) = send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/login",
                json!({"email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
        let raw = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("token="))
            .unwrap()
            .to_string();
        assert!(raw.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn login_errors_do_not_reveal_account_existence() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);
        send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;

        let wrong = send(
            &app,
            json_req("POST", "/api/v1/auth/login", json!({"email": "a@x.com", "password": "bad"})),
        )
        .await;
        let unknown = send(
            &app,
            json_req("POST", "/api/v1/auth/login", json!({"email": "no@x.com", "password": "bad"})),
        )
        .await;

        assert_eq!(wrong.0, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.0, unknown.0);
        assert_eq!(wrong.2, unknown.2);
        assert_eq!(wrong.2["kind"], "auth");
    }

    #[tokio::test]
    async fn duplicate_register_is_bad_request_conflict() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);
        let body = json!({"name": "a", "email": "a@x.com", "password": "pw"});
        send(&app, json_req("POST", "/api/v1/auth/register", body.clone())).await;
        let (status, _, body) = send(&app, json_req("POST", "/api/v1/auth/register", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "conflict");
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn register_with_missing_fields_is_validation_error() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);
        let (status, _, body) = send(
            &app,
            json_req("POST", "/api/v1/auth/register", json!({"email": "a@x.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn wrong_otp_is_bad_request() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);
        send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        let (status, headers, body) = send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/verify-otp",
                json!({"email": "a@x.com", "otp": "abc"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_otp");
        assert!(token_cookie(&headers).is_none());
    }

    #[tokio::test]
    async fn resend_delivery_failure_is_server_error() {
        let (state, _, mailer) = AppState::fake();
        let app = build_app(state);
        send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        mailer.fail_next(u32::MAX, false);
        let (status, _, body) = send(
            &app,
            json_req("POST", "/api/v1/auth/resend-otp", json!({"email": "a@x.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "delivery");
    }

    #[tokio::test]
    async fn protected_routes_require_a_valid_token() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);

        let (status, _, body) = send(
            &app,
            Request::builder().uri("/api/v1/me").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "invalid_token");

        let (status, _, _) = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/auth/delete")
                .header(AUTHORIZATION, "Bearer not.a.jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let (state, _, _) = AppState::fake();
        let app = build_app(state);
        let (status, headers, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/logout")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(token_cookie(&headers).is_some());
    }

    #[tokio::test]
    async fn malformed_bodies_get_the_error_envelope() {
        let (state, store, _) = AppState::fake();
        let app = build_app(state);

        let (status, _, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/register")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "validation");

        let (status, _, body) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/login")
                .body(Body::from(r#"{"email":"a@x.com","password":"pw"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, _, body) = send(
            &app,
            json_req("POST", "/api/v1/auth/resend-otp", json!({"email": 42})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert!(store.find_by_email("a@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_cookie_lives_as_long_as_the_token() {
        let mut cfg = crate::config::AppConfig::for_tests();
        cfg.jwt.ttl_minutes = 0;
        cfg.auth.otp_required = false;
        let (state, _, _) = AppState::fake_with(cfg);
        let app = build_app(state);
        send(
            &app,
            json_req(
                "POST",
                "/api/v1/auth/register",
                json!({"name": "a", "email": "a@x.com", "password": "pw"}),
            ),
        )
        .await;
        let (status, headers, _) = send(
            &app,
            json_req("POST", "/api/v1/auth/login", json!({"email": "a@x.com", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let raw = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("token="))
            .unwrap()
            .to_string();
        assert!(raw.contains("Max-Age=60"), "{raw}");
    }

    #[test]
    fn public_user_serialization_hides_secrets() {
        let now = time::OffsetDateTime::now_utc();
        let user = User {
            id: uuid::Uuid::new_v4(),
            name: "a".into(),
            email: "test@example.com".into(),
            password_hash: "secret-hash".into(),
            otp: Some("123456".into()),
            otp_expires_at: Some(now),
            email_verified_at: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&PublicUser::from(&user)).unwrap();
        assert!(json.contains("test@example.com"));
        assert!(!json.contains("secret-hash"));
        assert!(!json.contains("123456"));

        let raw = serde_json::to_string(&user).unwrap();
        assert!(!raw.contains("secret-hash"));
        assert!(!raw.contains("\"otp\""));
    }
}
