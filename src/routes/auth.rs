use super::AppState;
use crate::{
    auth::ForgotPasswordOutcome,
    error::AppError,
    models::{
        CompleteProfileRequest, ForgotPasswordRequest, GoogleCallbackRequest, LoginRequest,
        ResetPasswordRequest, SignUpRequest,
    },
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

const RESET_REQUESTED: &str = "If email exists, a reset code will be sent";

/// Register an email/password account.
///
/// - Method: `POST`
/// - Path: `/api/auth/signup`
/// - Body: `{name, email, password, isVendor?}`
/// - Response: 201 with the new user; sets the session cookie
pub(super) async fn sign_up(
    State(state): State<AppState>,
    Json(payload): Json<SignUpRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/auth/signup");
    let (user, token) = state.auth.sign_up(payload).await?;
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, state.auth.sessions().session_cookie(&token))],
        Json(json!({
            "message": "Account created. Please complete your profile.",
            "user": user,
        })),
    )
        .into_response())
}

pub(super) async fn complete_profile(
    State(state): State<AppState>,
    Json(payload): Json<CompleteProfileRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/auth/complete-profile");
    let (user, token) = state.auth.complete_profile(payload).await?;
    Ok((
        [(header::SET_COOKIE, state.auth.sessions().session_cookie(&token))],
        Json(json!({
            "message": "Profile completed successfully",
            "user": user,
        })),
    )
        .into_response())
}

/// Password login. `rememberMe` stretches the session to 30 days.
pub(super) async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/auth/login");
    let (user, token) = state.auth.login(payload).await?;
    Ok((
        [(header::SET_COOKIE, state.auth.sessions().session_cookie(&token))],
        Json(json!({
            "message": "Login successful",
            "user": user,
        })),
    )
        .into_response())
}

pub(super) async fn logout(State(state): State<AppState>) -> Response {
    (
        [(header::SET_COOKIE, state.auth.sessions().clear_cookie())],
        Json(json!({ "message": "Logout successful" })),
    )
        .into_response()
}

/// The session's user, read from the cookie or a bearer token.
pub(super) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = state.auth.sessions().extract_token(&headers);
    let user = state.auth.current_user(token.as_deref()).await?;
    Ok(Json(json!({ "user": user })))
}

pub(super) async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/auth/forgot-password");
    let body = match state.auth.forgot_password(payload).await? {
        ForgotPasswordOutcome::UnknownEmail | ForgotPasswordOutcome::Sent { dev_code: None } => {
            json!({ "message": RESET_REQUESTED })
        }
        ForgotPasswordOutcome::Sent {
            dev_code: Some(code),
        } => json!({ "message": RESET_REQUESTED, "resetCode": code }),
    };
    Ok(Json(body))
}

pub(super) async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/auth/reset-password");
    let user = state.auth.reset_password(payload).await?;
    Ok(Json(json!({
        "message": "Password reset successful",
        "user": { "id": user.id, "email": user.email },
    })))
}

/// Sign-in with an identity the frontend already verified with Google.
///
/// - Method: `POST`
/// - Path: `/api/auth/google/callback`
/// - Body: `{googleId, name, email}`
/// - Response: the user plus `needsProfileCompletion`; sets the session cookie
pub(super) async fn google_callback(
    State(state): State<AppState>,
    Json(payload): Json<GoogleCallbackRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/auth/google/callback");
    let (user, token) = state.auth.google_auth_callback(payload).await?;
    Ok((
        [(header::SET_COOKIE, state.auth.sessions().session_cookie(&token))],
        Json(json!({
            "message": "Google authentication successful",
            "needsProfileCompletion": !user.profile_complete,
            "user": {
                "id": user.id,
                "name": user.name,
                "email": user.email,
                "profileComplete": user.profile_complete,
            },
        })),
    )
        .into_response())
}
