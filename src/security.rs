use crate::{auth::AuthService, error::AppError, models::PublicUser};
use axum::{
    body::Body,
    extract::State,
    http::{self, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use cookie::{Cookie, SameSite, time::Duration as CookieDuration};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_SESSION_DAYS: i64 = 7;
pub const REMEMBER_ME_SESSION_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// A signed session token and the cookie lifetime that matches its expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub max_age_secs: i64,
}

/// Token signing keys plus the session cookie policy.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    cookie_name: String,
    secure_cookie: bool,
}

impl SessionKeys {
    pub fn new(secret: &str, cookie_name: impl Into<String>, secure_cookie: bool) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            cookie_name: cookie_name.into(),
            secure_cookie,
        }
    }

    pub fn issue(&self, user_id: &str, remember_me: bool) -> Result<IssuedToken, AppError> {
        let days = if remember_me {
            REMEMBER_ME_SESSION_DAYS
        } else {
            DEFAULT_SESSION_DAYS
        };
        self.issue_for(user_id, Duration::days(days))
    }

    pub fn issue_for(&self, user_id: &str, lifetime: Duration) -> Result<IssuedToken, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().simple().to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AppError::internal("Failed to issue session", err))?;
        Ok(IssuedToken {
            token,
            max_age_secs: lifetime.num_seconds(),
        })
    }

    /// Any verification failure (bad signature, wrong algorithm, expiry) is a 401.
    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!(target = "unimart.auth", error = %err, "token rejected");
                AppError::unauthorized("Invalid or expired token")
            })
    }

    pub fn session_cookie(&self, issued: &IssuedToken) -> HeaderValue {
        self.cookie_header(&issued.token, issued.max_age_secs)
    }

    pub fn clear_cookie(&self) -> HeaderValue {
        self.cookie_header("", 0)
    }

    fn cookie_header(&self, value: &str, max_age: i64) -> HeaderValue {
        let cookie = Cookie::build((self.cookie_name.clone(), value.to_string()))
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure_cookie)
            .path("/")
            .max_age(CookieDuration::seconds(max_age))
            .build();
        HeaderValue::from_str(&cookie.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("token=; Path=/; Max-Age=0"))
    }

    /// Session cookie first, then `Authorization: Bearer`.
    pub fn extract_token(&self, headers: &http::HeaderMap) -> Option<String> {
        cookie_value(headers, &self.cookie_name).or_else(|| bearer_token(headers))
    }
}

fn cookie_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value_trimmed().to_string())
        .filter(|value| !value.is_empty())
}

fn bearer_token(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|token| !token.is_empty())
}

/// Resolves the session into a [`PublicUser`] request extension or rejects the request.
pub async fn authenticate(
    State(auth): State<AuthService>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = auth.sessions().extract_token(request.headers()) else {
        debug!(target = "unimart.auth", path = %request.uri().path(), "no session token");
        return Err(AppError::unauthorized(
            "Access token required. Please login.",
        ));
    };
    let user = auth.current_user(Some(token.as_str())).await?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub fn vendor_gate(user: &PublicUser) -> Result<(), AppError> {
    if user.is_vendor {
        Ok(())
    } else {
        Err(AppError::forbidden("Vendor access required"))
    }
}

pub fn profile_gate(user: &PublicUser) -> Result<(), AppError> {
    if user.profile_complete {
        Ok(())
    } else {
        Err(AppError::forbidden("Please complete your profile first"))
    }
}

pub async fn require_vendor(request: Request<Body>, next: Next) -> Result<Response, AppError> {
    gate(request, next, vendor_gate).await
}

pub async fn require_complete_profile(
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    gate(request, next, profile_gate).await
}

async fn gate(
    request: Request<Body>,
    next: Next,
    check: fn(&PublicUser) -> Result<(), AppError>,
) -> Result<Response, AppError> {
    let Some(user) = request.extensions().get::<PublicUser>() else {
        return Err(AppError::unauthorized("Authentication required"));
    };
    if let Err(err) = check(user) {
        warn!(target = "unimart.auth", user_id = %user.id, reason = %err, "gate refused request");
        return Err(err);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn keys() -> SessionKeys {
        SessionKeys::new("test-secret", "token", false)
    }

    fn user(is_vendor: bool, profile_complete: bool) -> PublicUser {
        PublicUser {
            id: "u1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            school: String::new(),
            whatsapp_number: String::new(),
            is_vendor,
            profile_complete,
        }
    }

    #[test]
    fn issued_token_verifies_and_carries_subject() {
        let keys = keys();
        let issued = keys.issue("user-1", false).unwrap();
        assert_eq!(issued.max_age_secs, 7 * 24 * 60 * 60);
        let claims = keys.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.exp - claims.iat, issued.max_age_secs);
    }

    #[test]
    fn remember_me_extends_lifetime() {
        let issued = keys().issue("user-1", true).unwrap();
        assert_eq!(issued.max_age_secs, 30 * 24 * 60 * 60);
    }

    #[test]
    fn expired_and_tampered_tokens_fail_closed() {
        let keys = keys();
        let expired = keys.issue_for("user-1", Duration::seconds(-60)).unwrap();
        assert!(matches!(
            keys.verify(&expired.token),
            Err(AppError::Unauthorized(_))
        ));

        let foreign = SessionKeys::new("other-secret", "token", false)
            .issue("user-1", false)
            .unwrap();
        assert!(matches!(
            keys.verify(&foreign.token),
            Err(AppError::Unauthorized(_))
        ));
        assert!(keys.verify("not.a.jwt").is_err());
    }

    #[test]
    fn cookie_takes_precedence_over_bearer() {
        let keys = keys();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("theme=dark; token=from-cookie"),
        );
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(keys.extract_token(&headers).as_deref(), Some("from-cookie"));

        headers.remove(http::header::COOKIE);
        assert_eq!(keys.extract_token(&headers).as_deref(), Some("from-header"));

        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(keys.extract_token(&headers).is_none());
    }

    #[test]
    fn bearer_scheme_needs_a_separator() {
        let keys = keys();
        let mut headers = HeaderMap::new();
        for raw in ["Bearerabc.def.ghi", "Bearer", "Bearer   ", "bearer"] {
            headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static(raw));
            assert!(keys.extract_token(&headers).is_none(), "{raw:?}");
        }
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer abc.def.ghi"),
        );
        assert_eq!(keys.extract_token(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn quoted_and_repeated_cookie_headers_are_read() {
        let keys = keys();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("token=\"abc\""));
        assert_eq!(keys.extract_token(&headers).as_deref(), Some("abc"));

        headers.insert(http::header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(http::header::COOKIE, HeaderValue::from_static("token=later"));
        assert_eq!(keys.extract_token(&headers).as_deref(), Some("later"));

        headers.insert(http::header::COOKIE, HeaderValue::from_static("token="));
        assert!(keys.extract_token(&headers).is_none());
    }

    #[test]
    fn cookie_policy_attributes() {
        let secure = SessionKeys::new("s", "token", true);
        let issued = IssuedToken {
            token: "abc".into(),
            max_age_secs: 60,
        };
        let cookie = secure.session_cookie(&issued);
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("token=abc;"));
        assert!(cookie.contains("Max-Age=60"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Secure"));

        let cleared = keys().clear_cookie();
        let cleared = cleared.to_str().unwrap();
        assert!(cleared.starts_with("token=;"));
        assert!(cleared.contains("Max-Age=0"));
        assert!(cleared.contains("Path=/"));
        assert!(!cleared.contains("Secure"));
    }

    #[test]
    fn gates_are_pure_predicates() {
        assert!(vendor_gate(&user(true, false)).is_ok());
        assert!(matches!(
            vendor_gate(&user(false, true)),
            Err(AppError::Forbidden(_))
        ));
        assert!(profile_gate(&user(true, true)).is_ok());
        assert!(matches!(
            profile_gate(&user(true, false)),
            Err(AppError::Forbidden(_))
        ));
    }
}
