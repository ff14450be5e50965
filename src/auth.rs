//! Account flows: signup, profile completion, login, password reset and social login.
//!
//! The service returns users plus freshly issued tokens; setting the cookie is left to the
//! HTTP layer via [`SessionKeys`].

use crate::{
    config::Environment,
    error::AppError,
    mailer::{Mailer, reset_code_email},
    models::{
        CompleteProfileRequest, ForgotPasswordRequest, GoogleCallbackRequest, LoginRequest,
        PublicUser, ResetPasswordRequest, ResetTicket, SignUpRequest, User, new_object_id,
        required,
    },
    security::{IssuedToken, SessionKeys},
    store::{ResetCodeStore, StoreError, UserStore},
};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

/// Minimum password length.
pub const MIN_PASSWORD_LENGTH: usize = 8;

pub const RESET_CODE_TTL_MINUTES: i64 = 10;

/// A reset ticket is discarded once this many codes have been checked against it.
pub const MAX_RESET_ATTEMPTS: u32 = 5;

const INVALID_CREDENTIALS: &str = "Invalid email or password";
const INVALID_RESET_CODE: &str = "Invalid or expired reset code";

static WHATSAPP_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\+234|0)[0-9]{10}$").expect("whatsapp pattern"));

/// Removes all whitespace and checks the Nigerian mobile format (`+234` or `0` then 10 digits).
pub fn normalize_whatsapp_number(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    WHATSAPP_NUMBER.is_match(&compact).then_some(compact)
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub fn hash_secret(secret: &str) -> Result<String, AppError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|err| AppError::internal("Something went wrong", err))?;
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::internal("Something went wrong", err))
}

/// `false` for a mismatch and for a stored hash that does not parse.
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!(target = "unimart.auth", error = %err, "unparseable stored hash");
            false
        }
    }
}

fn generate_reset_code() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}

/// Result of a password-reset request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgotPasswordOutcome {
    /// No account for the email; nothing was sent.
    UnknownEmail,
    /// A code was sent. The code itself is only returned outside production.
    Sent { dev_code: Option<String> },
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tickets: Arc<dyn ResetCodeStore>,
    mailer: Arc<dyn Mailer>,
    sessions: SessionKeys,
    environment: Environment,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        tickets: Arc<dyn ResetCodeStore>,
        mailer: Arc<dyn Mailer>,
        sessions: SessionKeys,
        environment: Environment,
    ) -> Self {
        Self {
            users,
            tickets,
            mailer,
            sessions,
            environment,
        }
    }

    pub fn sessions(&self) -> &SessionKeys {
        &self.sessions
    }

    pub async fn sign_up(
        &self,
        request: SignUpRequest,
    ) -> Result<(PublicUser, IssuedToken), AppError> {
        let (Some(name), Some(email), Some(password)) = (
            required(&request.name),
            required(&request.email),
            request.password.as_deref().filter(|p| !p.is_empty()),
        ) else {
            return Err(AppError::validation(
                "Name, email, and password are required",
            ));
        };
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AppError::validation(
                "Password must be at least 8 characters",
            ));
        }

        let email = normalize_email(email);
        if self.users.find_user_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict("Email already registered".into()));
        }

        let now = Utc::now();
        let user = User {
            id: new_object_id(),
            name: name.to_string(),
            email,
            password: Some(hash_secret(password)?),
            google_id: None,
            school: String::new(),
            whatsapp_number: String::new(),
            is_vendor: request.is_vendor.unwrap_or(true),
            profile_complete: false,
            created_at: now,
            updated_at: now,
        };
        let user = self.users.insert_user(user).await.map_err(|err| match err {
            StoreError::Conflict(_) => AppError::Conflict("Email already registered".into()),
            other => other.into(),
        })?;
        info!(target = "unimart.auth", user_id = %user.id, "account created");

        let token = self.sessions.issue(&user.id, false)?;
        Ok((user.public(), token))
    }

    pub async fn complete_profile(
        &self,
        request: CompleteProfileRequest,
    ) -> Result<(PublicUser, IssuedToken), AppError> {
        let (Some(email), Some(school), Some(raw_number)) = (
            required(&request.email),
            required(&request.school),
            required(&request.whatsapp_number),
        ) else {
            return Err(AppError::validation(
                "Email, school, and WhatsApp number are required",
            ));
        };
        let Some(whatsapp_number) = normalize_whatsapp_number(raw_number) else {
            return Err(AppError::validation("Invalid WhatsApp number format"));
        };

        let Some(mut user) = self
            .users
            .find_user_by_email(&normalize_email(email))
            .await?
        else {
            return Err(AppError::not_found("User not found"));
        };
        user.school = school.to_string();
        user.whatsapp_number = whatsapp_number;
        user.profile_complete = true;
        user.updated_at = Utc::now();
        let user = self.users.update_user(user).await?;
        info!(target = "unimart.auth", user_id = %user.id, "profile completed");

        let token = self.sessions.issue(&user.id, false)?;
        Ok((user.public(), token))
    }

    /// Unknown email, social-only account and wrong password all produce the same error.
    pub async fn login(
        &self,
        request: LoginRequest,
    ) -> Result<(PublicUser, IssuedToken), AppError> {
        let (Some(email), Some(password)) = (
            required(&request.email),
            request.password.as_deref().filter(|p| !p.is_empty()),
        ) else {
            return Err(AppError::validation("Email and password are required"));
        };

        let user = self.users.find_user_by_email(&normalize_email(email)).await?;
        let Some(user) = user.filter(|user| {
            user.password
                .as_deref()
                .is_some_and(|hash| verify_secret(password, hash))
        }) else {
            return Err(AppError::unauthorized(INVALID_CREDENTIALS));
        };

        if !user.profile_complete {
            return Err(AppError::IncompleteProfile { email: user.email });
        }

        let token = self.sessions.issue(&user.id, request.remember_me)?;
        info!(
            target = "unimart.auth",
            user_id = %user.id,
            remember_me = request.remember_me,
            "login"
        );
        Ok((user.public(), token))
    }

    /// Resolves a session token to its user. Missing or unverifiable tokens are 401, a token
    /// whose subject has been deleted is 404.
    pub async fn current_user(&self, token: Option<&str>) -> Result<PublicUser, AppError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(AppError::unauthorized("Not authenticated"));
        };
        let claims = self.sessions.verify(token)?;
        match self.users.find_user(&claims.sub).await? {
            Some(user) => Ok(user.public()),
            None => Err(AppError::not_found("User not found")),
        }
    }

    pub async fn forgot_password(
        &self,
        request: ForgotPasswordRequest,
    ) -> Result<ForgotPasswordOutcome, AppError> {
        let Some(email) = required(&request.email) else {
            return Err(AppError::validation("Email is required"));
        };
        let email = normalize_email(email);
        if self.users.find_user_by_email(&email).await?.is_none() {
            return Ok(ForgotPasswordOutcome::UnknownEmail);
        }

        let code = generate_reset_code();
        self.tickets
            .put_ticket(ResetTicket {
                email: email.clone(),
                code_hash: hash_secret(&code)?,
                expires_at: Utc::now() + Duration::minutes(RESET_CODE_TTL_MINUTES),
                attempts: 0,
            })
            .await?;

        if let Err(err) = self.mailer.send(reset_code_email(&email, &code)).await {
            if let Err(cleanup) = self.tickets.remove_ticket(&email).await {
                warn!(target = "unimart.auth", error = %cleanup, "failed to discard reset ticket");
            }
            return Err(err.into());
        }
        info!(target = "unimart.auth", "reset code sent");

        let dev_code = (!self.environment.is_production()).then_some(code);
        Ok(ForgotPasswordOutcome::Sent { dev_code })
    }

    pub async fn reset_password(&self, request: ResetPasswordRequest) -> Result<User, AppError> {
        let (Some(email), Some(code), Some(new_password)) = (
            required(&request.email),
            required(&request.code),
            request.new_password.as_deref().filter(|p| !p.is_empty()),
        ) else {
            return Err(AppError::validation(
                "Email, code, and new password are required",
            ));
        };
        if new_password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AppError::validation(
                "Password must be at least 8 characters",
            ));
        }

        let email = normalize_email(email);
        // Every verification first claims an attempt, so concurrent guesses share the limit.
        let Some(ticket) = self
            .tickets
            .claim_attempt(&email, MAX_RESET_ATTEMPTS)
            .await?
        else {
            return Err(AppError::validation(INVALID_RESET_CODE));
        };
        if ticket.expires_at <= Utc::now() {
            self.tickets.remove_ticket(&email).await?;
            return Err(AppError::validation(INVALID_RESET_CODE));
        }
        if !verify_secret(code, &ticket.code_hash) {
            if ticket.attempts >= MAX_RESET_ATTEMPTS {
                warn!(target = "unimart.auth", "reset ticket discarded after repeated failures");
                self.tickets.remove_ticket(&email).await?;
            }
            return Err(AppError::validation(INVALID_RESET_CODE));
        }
        if !self.tickets.take_ticket(&email, &ticket.code_hash).await? {
            return Err(AppError::validation(INVALID_RESET_CODE));
        }

        let Some(mut user) = self.users.find_user_by_email(&email).await? else {
            return Err(AppError::validation(INVALID_RESET_CODE));
        };
        user.password = Some(hash_secret(new_password)?);
        user.updated_at = Utc::now();
        let user = self.users.update_user(user).await?;
        info!(target = "unimart.auth", user_id = %user.id, "password reset");
        Ok(user)
    }

    /// Links the Google id to an existing email-matched account, or creates a new vendor
    /// account that still needs profile completion.
    pub async fn google_auth_callback(
        &self,
        request: GoogleCallbackRequest,
    ) -> Result<(User, IssuedToken), AppError> {
        let (Some(google_id), Some(name), Some(email)) = (
            required(&request.google_id),
            required(&request.name),
            required(&request.email),
        ) else {
            return Err(AppError::validation(
                "Google ID, name, and email are required",
            ));
        };
        let email = normalize_email(email);

        let user = match self.users.find_user_by_email(&email).await? {
            Some(mut user) if user.google_id.is_none() => {
                user.google_id = Some(google_id.to_string());
                user.updated_at = Utc::now();
                let user = self.users.update_user(user).await?;
                info!(target = "unimart.auth", user_id = %user.id, "google account linked");
                user
            }
            Some(user) => user,
            None => {
                let now = Utc::now();
                let user = self
                    .users
                    .insert_user(User {
                        id: new_object_id(),
                        name: name.to_string(),
                        email,
                        password: None,
                        google_id: Some(google_id.to_string()),
                        school: String::new(),
                        whatsapp_number: String::new(),
                        is_vendor: true,
                        profile_complete: false,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;
                info!(target = "unimart.auth", user_id = %user.id, "account created via google");
                user
            }
        };

        let token = self.sessions.issue(&user.id, false)?;
        Ok((user, token))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::mailer::testing::RecordingMailer;
    use crate::store::MemoryStore;

    pub struct AuthHarness {
        pub store: MemoryStore,
        pub mailer: Arc<RecordingMailer>,
        pub auth: AuthService,
    }

    pub fn harness_with(mailer: RecordingMailer, environment: Environment) -> AuthHarness {
        let store = MemoryStore::new();
        let mailer = Arc::new(mailer);
        let auth = AuthService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            mailer.clone(),
            SessionKeys::new("test-secret", "token", false),
            environment,
        );
        AuthHarness {
            store,
            mailer,
            auth,
        }
    }

    pub fn harness() -> AuthHarness {
        harness_with(RecordingMailer::default(), Environment::Development)
    }

    pub fn signup(name: &str, email: &str) -> SignUpRequest {
        SignUpRequest {
            name: Some(name.into()),
            email: Some(email.into()),
            password: Some("password123".into()),
            is_vendor: None,
        }
    }

    pub fn profile(email: &str) -> CompleteProfileRequest {
        CompleteProfileRequest {
            email: Some(email.into()),
            school: Some("University of Lagos".into()),
            whatsapp_number: Some("080 1234 5678".into()),
        }
    }

    /// Signs up and completes the profile, returning the ready-to-sell vendor.
    pub async fn vendor(auth: &AuthService, email: &str) -> PublicUser {
        auth.sign_up(signup("Vendor", email)).await.expect("signup");
        let (user, _) = auth.complete_profile(profile(email)).await.expect("profile");
        user
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::mailer::testing::RecordingMailer;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn login(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
            remember_me: false,
        }
    }

    #[test]
    fn whatsapp_numbers_are_normalized() {
        assert_eq!(
            normalize_whatsapp_number("080 1234 5678").as_deref(),
            Some("08012345678")
        );
        assert_eq!(
            normalize_whatsapp_number("+234 801 234 5678").as_deref(),
            Some("+2348012345678")
        );
        assert!(normalize_whatsapp_number("0801234567").is_none());
        assert!(normalize_whatsapp_number("+1 415 555 0100").is_none());
        assert!(normalize_whatsapp_number("0801234567a").is_none());
    }

    #[test]
    fn secrets_round_trip_through_argon2() {
        let hash = hash_secret("password123").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_secret("password123", &hash));
        assert!(!verify_secret("password124", &hash));
        assert!(!verify_secret("password123", "not-a-hash"));
    }

    #[tokio::test]
    async fn sign_up_creates_incomplete_vendor_with_hashed_password() {
        let h = harness();
        let (user, token) = h.auth.sign_up(signup("Ada", " Ada@Example.com ")).await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert!(user.is_vendor);
        assert!(!user.profile_complete);
        assert!(user.school.is_empty());
        assert_eq!(token.max_age_secs, 7 * 24 * 60 * 60);

        let stored = h.store.find_user(&user.id).await.unwrap().unwrap();
        let hash = stored.password.expect("hash stored");
        assert_ne!(hash, "password123");
        assert!(verify_secret("password123", &hash));
    }

    #[tokio::test]
    async fn sign_up_validates_and_rejects_duplicates() {
        let h = harness();
        let mut short = signup("Ada", "ada@example.com");
        short.password = Some("short".into());
        assert!(matches!(
            h.auth.sign_up(short).await,
            Err(AppError::Validation(_))
        ));
        let mut missing = signup("Ada", "ada@example.com");
        missing.name = Some("   ".into());
        assert!(matches!(
            h.auth.sign_up(missing).await,
            Err(AppError::Validation(_))
        ));

        h.auth.sign_up(signup("Ada", "ada@example.com")).await.unwrap();
        assert!(matches!(
            h.auth.sign_up(signup("Other", "ADA@example.com")).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn complete_profile_is_idempotent() {
        let h = harness();
        h.auth.sign_up(signup("Ada", "ada@example.com")).await.unwrap();
        let (first, _) = h.auth.complete_profile(profile("ada@example.com")).await.unwrap();
        let (second, _) = h.auth.complete_profile(profile("ada@example.com")).await.unwrap();
        assert!(first.profile_complete && second.profile_complete);
        assert_eq!(second.whatsapp_number, "08012345678");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn complete_profile_rejects_bad_numbers_and_unknown_emails() {
        let h = harness();
        h.auth.sign_up(signup("Ada", "ada@example.com")).await.unwrap();
        let mut bad = profile("ada@example.com");
        bad.whatsapp_number = Some("12345".into());
        assert!(matches!(
            h.auth.complete_profile(bad).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.auth.complete_profile(profile("ghost@example.com")).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn login_requires_completed_profile() {
        let h = harness();
        h.auth.sign_up(signup("Ada", "ada@example.com")).await.unwrap();
        let err = h
            .auth
            .login(login("ada@example.com", "password123"))
            .await
            .expect_err("incomplete");
        assert!(matches!(
            err,
            AppError::IncompleteProfile { ref email } if email == "ada@example.com"
        ));

        h.auth.complete_profile(profile("ada@example.com")).await.unwrap();
        let (user, token) = h
            .auth
            .login(login("ada@example.com", "password123"))
            .await
            .unwrap();
        assert!(user.profile_complete);
        assert_eq!(token.max_age_secs, 7 * 24 * 60 * 60);

        let mut remember = login("ada@example.com", "password123");
        remember.remember_me = true;
        let (_, token) = h.auth.login(remember).await.unwrap();
        assert_eq!(token.max_age_secs, 30 * 24 * 60 * 60);
    }

    #[tokio::test]
    async fn login_failures_do_not_reveal_account_existence() {
        let h = harness();
        vendor(&h.auth, "ada@example.com").await;
        let wrong = h
            .auth
            .login(login("ada@example.com", "wrongpassword"))
            .await
            .expect_err("wrong password");
        let unknown = h
            .auth
            .login(login("nobody@example.com", "password123"))
            .await
            .expect_err("unknown email");
        assert_eq!(wrong.status(), unknown.status());
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn social_only_accounts_cannot_password_login() {
        let h = harness();
        h.auth
            .google_auth_callback(GoogleCallbackRequest {
                google_id: Some("g-1".into()),
                name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
            })
            .await
            .unwrap();
        let err = h
            .auth
            .login(login("ada@example.com", "password123"))
            .await
            .expect_err("no password");
        assert!(matches!(err, AppError::Unauthorized(ref m) if m == INVALID_CREDENTIALS));
    }

    #[tokio::test]
    async fn current_user_distinguishes_missing_token_and_deleted_subject() {
        let h = harness();
        assert!(matches!(
            h.auth.current_user(None).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            h.auth.current_user(Some("garbage")).await,
            Err(AppError::Unauthorized(_))
        ));

        let (user, token) = h.auth.sign_up(signup("Ada", "ada@example.com")).await.unwrap();
        let found = h.auth.current_user(Some(token.token.as_str())).await.unwrap();
        assert_eq!(found.id, user.id);

        h.store.remove_user(&user.id).await;
        assert!(matches!(
            h.auth.current_user(Some(token.token.as_str())).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn forgot_password_is_silent_for_unknown_emails() {
        let h = harness();
        let outcome = h
            .auth
            .forgot_password(ForgotPasswordRequest {
                email: Some("ghost@example.com".into()),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ForgotPasswordOutcome::UnknownEmail);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn reset_code_is_verified_and_single_use() {
        let h = harness();
        vendor(&h.auth, "ada@example.com").await;
        let outcome = h
            .auth
            .forgot_password(ForgotPasswordRequest {
                email: Some("ada@example.com".into()),
            })
            .await
            .unwrap();
        let ForgotPasswordOutcome::Sent {
            dev_code: Some(code),
        } = outcome
        else {
            panic!("expected a dev code, got {outcome:?}");
        };
        assert_eq!(code.len(), 6);
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html.contains(&code));

        let reset = |code: &str| ResetPasswordRequest {
            email: Some("ada@example.com".into()),
            code: Some(code.into()),
            new_password: Some("new-password".into()),
        };
        let wrong = if code == "123456" { "654321" } else { "123456" };
        assert!(matches!(
            h.auth.reset_password(reset(wrong)).await,
            Err(AppError::Validation(ref m)) if m == INVALID_RESET_CODE
        ));

        let user = h.auth.reset_password(reset(&code)).await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert!(h.auth.login(login("ada@example.com", "new-password")).await.is_ok());
        assert!(matches!(
            h.auth.reset_password(reset(&code)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn expired_or_exhausted_tickets_are_rejected() {
        let h = harness();
        vendor(&h.auth, "ada@example.com").await;
        h.store
            .put_ticket(ResetTicket {
                email: "ada@example.com".into(),
                code_hash: hash_secret("111111").unwrap(),
                expires_at: Utc::now() - Duration::minutes(1),
                attempts: 0,
            })
            .await
            .unwrap();
        let request = |code: &str| ResetPasswordRequest {
            email: Some("ada@example.com".into()),
            code: Some(code.into()),
            new_password: Some("new-password".into()),
        };
        assert!(h.auth.reset_password(request("111111")).await.is_err());
        assert!(h.store.find_ticket("ada@example.com").await.unwrap().is_none());

        h.store
            .put_ticket(ResetTicket {
                email: "ada@example.com".into(),
                code_hash: hash_secret("222222").unwrap(),
                expires_at: Utc::now() + Duration::minutes(10),
                attempts: MAX_RESET_ATTEMPTS - 1,
            })
            .await
            .unwrap();
        assert!(h.auth.reset_password(request("000000")).await.is_err());
        assert!(h.store.find_ticket("ada@example.com").await.unwrap().is_none());
        assert!(h.auth.reset_password(request("222222")).await.is_err());
    }

    fn reset_request(code: &str) -> ResetPasswordRequest {
        ResetPasswordRequest {
            email: Some("ada@example.com".into()),
            code: Some(code.into()),
            new_password: Some("new-password".into()),
        }
    }

    /// Memory tickets that count how many claims were granted a verification.
    struct CountingTickets {
        inner: MemoryStore,
        checked: AtomicUsize,
    }

    #[async_trait]
    impl ResetCodeStore for CountingTickets {
        async fn put_ticket(&self, ticket: ResetTicket) -> Result<(), StoreError> {
            self.inner.put_ticket(ticket).await
        }

        async fn find_ticket(&self, email: &str) -> Result<Option<ResetTicket>, StoreError> {
            self.inner.find_ticket(email).await
        }

        async fn remove_ticket(&self, email: &str) -> Result<(), StoreError> {
            self.inner.remove_ticket(email).await
        }

        async fn claim_attempt(
            &self,
            email: &str,
            max_attempts: u32,
        ) -> Result<Option<ResetTicket>, StoreError> {
            let claimed = self.inner.claim_attempt(email, max_attempts).await?;
            if claimed.is_some() {
                self.checked.fetch_add(1, Ordering::SeqCst);
            }
            Ok(claimed)
        }

        async fn take_ticket(&self, email: &str, code_hash: &str) -> Result<bool, StoreError> {
            self.inner.take_ticket(email, code_hash).await
        }
    }

    async fn ticketed_service(code: &str) -> (AuthService, MemoryStore, Arc<CountingTickets>) {
        let store = MemoryStore::new();
        let tickets = Arc::new(CountingTickets {
            inner: store.clone(),
            checked: AtomicUsize::new(0),
        });
        let auth = AuthService::new(
            Arc::new(store.clone()),
            tickets.clone(),
            Arc::new(RecordingMailer::default()),
            SessionKeys::new("test-secret", "token", false),
            Environment::Development,
        );
        vendor(&auth, "ada@example.com").await;
        store
            .put_ticket(ResetTicket {
                email: "ada@example.com".into(),
                code_hash: hash_secret(code).unwrap(),
                expires_at: Utc::now() + Duration::minutes(10),
                attempts: 0,
            })
            .await
            .unwrap();
        (auth, store, tickets)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_wrong_guesses_share_the_attempt_limit() {
        let (auth, store, tickets) = ticketed_service("222222").await;
        let guesses = (0..40).map(|i| {
            let auth = auth.clone();
            tokio::spawn(async move {
                auth.reset_password(reset_request(&format!("{:06}", 300_000 + i)))
                    .await
            })
        });
        for outcome in join_all(guesses).await {
            assert!(matches!(
                outcome.unwrap(),
                Err(AppError::Validation(ref m)) if m == INVALID_RESET_CODE
            ));
        }

        let checked = tickets.checked.load(Ordering::SeqCst);
        assert!(checked <= MAX_RESET_ATTEMPTS as usize, "{checked} codes were checked");
        assert!(store.find_ticket("ada@example.com").await.unwrap().is_none());
        assert!(auth.reset_password(reset_request("222222")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn a_correct_code_resets_the_password_once() {
        let (auth, store, _) = ticketed_service("222222").await;
        let resets = (0..4).map(|_| {
            let auth = auth.clone();
            tokio::spawn(async move { auth.reset_password(reset_request("222222")).await })
        });
        let succeeded = join_all(resets)
            .await
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(Ok(_))))
            .count();

        assert_eq!(succeeded, 1);
        assert!(store.find_ticket("ada@example.com").await.unwrap().is_none());
        assert!(auth.login(login("ada@example.com", "new-password")).await.is_ok());
    }

    #[tokio::test]
    async fn reset_rejects_short_passwords_before_checking_code() {
        let h = harness();
        let err = h
            .auth
            .reset_password(ResetPasswordRequest {
                email: Some("ada@example.com".into()),
                code: Some("123456".into()),
                new_password: Some("short".into()),
            })
            .await
            .expect_err("short");
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("8 characters")));
    }

    #[tokio::test]
    async fn mail_failure_is_upstream_and_discards_ticket() {
        let h = harness_with(RecordingMailer::failing(), Environment::Production);
        vendor(&h.auth, "ada@example.com").await;
        let err = h
            .auth
            .forgot_password(ForgotPasswordRequest {
                email: Some("ada@example.com".into()),
            })
            .await
            .expect_err("mail down");
        assert!(matches!(err, AppError::Upstream { .. }));
        assert!(h.store.find_ticket("ada@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn production_never_returns_the_code() {
        let h = harness_with(RecordingMailer::default(), Environment::Production);
        vendor(&h.auth, "ada@example.com").await;
        let outcome = h
            .auth
            .forgot_password(ForgotPasswordRequest {
                email: Some("ada@example.com".into()),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ForgotPasswordOutcome::Sent { dev_code: None });
    }

    #[tokio::test]
    async fn google_callback_links_existing_account() {
        let h = harness();
        let existing = vendor(&h.auth, "ada@example.com").await;
        let (user, _) = h
            .auth
            .google_auth_callback(GoogleCallbackRequest {
                google_id: Some("g-42".into()),
                name: Some("Ada L".into()),
                email: Some("ada@example.com".into()),
            })
            .await
            .unwrap();
        assert_eq!(user.id, existing.id);
        assert_eq!(user.google_id.as_deref(), Some("g-42"));
        assert!(user.profile_complete);
        assert!(user.password.is_some());
    }

    #[tokio::test]
    async fn google_callback_creates_incomplete_vendor() {
        let h = harness();
        let (user, token) = h
            .auth
            .google_auth_callback(GoogleCallbackRequest {
                google_id: Some("g-7".into()),
                name: Some("Bola".into()),
                email: Some("bola@example.com".into()),
            })
            .await
            .unwrap();
        assert!(user.is_vendor);
        assert!(!user.profile_complete);
        assert!(user.password.is_none());
        assert!(h.auth.current_user(Some(token.token.as_str())).await.is_ok());
    }
}
