use crate::http::build_client;
use crate::metrics::UpstreamTimer;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail delivery is not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<(), MailError>;
}

pub fn reset_code_email(to: &str, code: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: "Reset Your Password".to_string(),
        html: format!(
            "<h2>Password Reset Request</h2>\
             <p>You requested to reset your password. Here is your verification code:</p>\
             <h3 style=\"font-size: 24px; letter-spacing: 2px; background: #f4f4f4; padding: 10px; text-align: center;\">{code}</h3>\
             <p>This code will expire in 10 minutes.</p>\
             <p>If you didn't request this, you can safely ignore this email.</p>"
        ),
    }
}

/// Resend transactional email API.
pub struct ResendMailer {
    http: Client,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl ResendMailer {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        let from = std::env::var("MAIL_FROM")
            .unwrap_or_else(|_| "Unimart <noreply@unimart.app>".to_string());
        Some(Self {
            http: build_client("mail"),
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        let body = SendEmailRequest {
            from: &self.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
        };
        let timer = UpstreamTimer::start("mail", "send");
        let outcome = match self
            .http
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(MailError::Request(format!("HTTP {}", response.status()))),
            Err(err) => Err(MailError::Request(err.to_string())),
        };
        timer.finish(outcome.is_ok());
        outcome
    }
}

/// Development stand-in: logs the recipient and subject instead of delivering.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<(), MailError> {
        info!(
            target = "unimart.mail",
            to = %email.to,
            subject = %email.subject,
            "mail delivery skipped (no RESEND_API_KEY)"
        );
        Ok(())
    }
}

/// Used in production when no mail provider is configured, so resets fail loudly.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _email: Email) -> Result<(), MailError> {
        Err(MailError::NotConfigured)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<Email>>,
        pub fail: bool,
    }

    impl RecordingMailer {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Email> {
            self.sent.lock().map(|g| g.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: Email) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Request("HTTP 503".into()));
            }
            self.sent.lock().expect("sent lock").push(email);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_email_mentions_code_and_validity() {
        let email = reset_code_email("a@example.com", "123456");
        assert_eq!(email.to, "a@example.com");
        assert!(email.html.contains("123456"));
        assert!(email.html.contains("10 minutes"));
    }

    #[tokio::test]
    async fn disabled_mailer_refuses() {
        let err = DisabledMailer
            .send(reset_code_email("a@example.com", "1"))
            .await
            .expect_err("disabled");
        assert!(matches!(err, MailError::NotConfigured));
    }
}
