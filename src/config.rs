use std::env;
use thiserror::Error;
use tracing::warn;

const DEV_JWT_SECRET: &str = "unimart-development-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.trim().eq_ignore_ascii_case("production") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// What an update does with stored images when the client omits `existingImages` entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OmittedImagesPolicy {
    #[default]
    Keep,
    Clear,
}

impl OmittedImagesPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "keep" => Some(Self::Keep),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set in production")]
    MissingJwtSecret,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    pub jwt_secret: String,
    pub cookie_name: String,
    pub frontend_url: String,
    pub body_limit: usize,
    pub omitted_images: OmittedImagesPolicy,
    pub media_folder: String,
    pub metrics_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_env();
        let jwt_secret = match env::var("JWT_SECRET").ok().filter(|s| !s.trim().is_empty()) {
            Some(secret) => secret,
            None if environment.is_production() => return Err(ConfigError::MissingJwtSecret),
            None => {
                warn!(
                    target = "unimart.config",
                    "JWT_SECRET not set; using the development signing key"
                );
                DEV_JWT_SECRET.to_string()
            }
        };
        let omitted_images = match env::var("OMITTED_IMAGES_POLICY") {
            Ok(raw) => OmittedImagesPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(
                    target = "unimart.config",
                    value = %raw,
                    "unknown OMITTED_IMAGES_POLICY; keeping stored images"
                );
                OmittedImagesPolicy::Keep
            }),
            Err(_) => OmittedImagesPolicy::default(),
        };

        Ok(Self {
            environment,
            port: env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(5000),
            jwt_secret,
            cookie_name: env::var("SESSION_COOKIE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "token".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "https://unimartz.vercel.app".to_string()),
            body_limit: env::var("REQUEST_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(50 * 1024 * 1024),
            omitted_images,
            media_folder: env::var("MEDIA_FOLDER")
                .ok()
                .map(|v| v.trim_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "unimart/products".to_string()),
            metrics_key: env::var("METRICS_KEY").ok(),
        })
    }

    /// Configuration used by unit tests: development mode, fixed secret, default policies.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Development,
            port: 0,
            jwt_secret: "test-secret".to_string(),
            cookie_name: "token".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            body_limit: 1024 * 1024,
            omitted_images: OmittedImagesPolicy::Keep,
            media_folder: "unimart/products".to_string(),
            metrics_key: None,
        }
    }
}
