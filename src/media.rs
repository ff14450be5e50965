use crate::http::build_client;
use crate::metrics::UpstreamTimer;
use crate::models::{MAX_PRODUCT_IMAGES, ProductImage};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("missing media host credentials in env")]
    MissingCredentials,
    #[error("invalid image payload: {0}")]
    InvalidPayload(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("media host rejected request: {0}")]
    Rejected(String),
}

/// External image host. Uploads return the public URL and the handle needed to delete later.
#[async_trait]
pub trait MediaHost: Send + Sync {
    async fn upload(&self, payload: &str, folder: &str) -> Result<ProductImage, MediaError>;
    async fn destroy(&self, public_id: &str) -> Result<(), MediaError>;
}

/// Accepts a bare base64 string or a `data:` URL and returns a JPEG data URL.
pub fn normalize_payload(raw: &str) -> Result<String, MediaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MediaError::InvalidPayload("no image provided".into()));
    }
    let data = match trimmed.split_once("base64,") {
        Some((_, data)) => data,
        None => trimmed,
    };
    BASE64
        .decode(data)
        .map_err(|err| MediaError::InvalidPayload(err.to_string()))?;
    Ok(format!("data:image/jpeg;base64,{data}"))
}

/// Uploads up to [`MAX_PRODUCT_IMAGES`] payloads concurrently, preserving input order.
///
/// The batch is all-or-nothing: on any failure the images that did upload are released
/// again and the first error is returned.
pub async fn upload_batch(
    host: &dyn MediaHost,
    payloads: &[String],
    folder: &str,
) -> Result<Vec<ProductImage>, MediaError> {
    let timer = UpstreamTimer::start("media", "upload_batch");
    let results = join_all(
        payloads
            .iter()
            .take(MAX_PRODUCT_IMAGES)
            .map(|payload| host.upload(payload, folder)),
    )
    .await;
    timer.finish(results.iter().all(Result::is_ok));

    let mut uploaded = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(image) => uploaded.push(image),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        None => Ok(uploaded),
        Some(err) => {
            if !uploaded.is_empty() {
                release_all(host, &uploaded).await;
            }
            Err(err)
        }
    }
}

/// Best-effort concurrent release. Every image is attempted; failures are logged and counted.
pub async fn release_all(host: &dyn MediaHost, images: &[ProductImage]) -> usize {
    let outcomes = join_all(images.iter().map(|image| async move {
        let result = host.destroy(&image.public_id).await;
        (image, result)
    }))
    .await;

    let mut failures = 0;
    for (image, result) in outcomes {
        match result {
            Ok(()) => info!(
                target = "unimart.media",
                public_id = %image.public_id,
                "image released"
            ),
            Err(err) => {
                failures += 1;
                warn!(
                    target = "unimart.media",
                    public_id = %image.public_id,
                    error = %err,
                    "image release failed"
                );
            }
        }
    }
    failures
}

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl CloudinaryConfig {
    pub fn from_env() -> Option<Self> {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            cloud_name: read("CLOUDINARY_CLOUD_NAME")?,
            api_key: read("CLOUDINARY_API_KEY")?,
            api_secret: read("CLOUDINARY_API_SECRET")?,
        })
    }
}

/// Cloudinary upload API client using signed requests (SHA-256 signatures).
pub struct CloudinaryClient {
    http: Client,
    config: Option<CloudinaryConfig>,
    root: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

impl CloudinaryClient {
    pub fn new(config: Option<CloudinaryConfig>) -> Self {
        Self {
            http: build_client("media"),
            config,
            root: "https://api.cloudinary.com/v1_1".to_string(),
        }
    }

    fn credentials(&self) -> Result<&CloudinaryConfig, MediaError> {
        self.config.as_ref().ok_or(MediaError::MissingCredentials)
    }

    fn endpoint(&self, cloud_name: &str, action: &str) -> String {
        format!("{}/{}/image/{}", self.root, cloud_name, action)
    }

    async fn signed_post<T: for<'de> Deserialize<'de>>(
        &self,
        action: &str,
        signed: &[(&str, String)],
        extra: &[(&str, String)],
    ) -> Result<T, MediaError> {
        let config = self.credentials()?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let mut params: Vec<(&str, String)> = signed.to_vec();
        params.push(("timestamp", timestamp));
        let signature = sign_params(&params, &config.api_secret);
        params.push(("api_key", config.api_key.clone()));
        params.push(("signature", signature));
        params.extend(extra.iter().cloned());

        let response = self
            .http
            .post(self.endpoint(&config.cloud_name, action))
            .form(&params)
            .send()
            .await
            .map_err(|err| MediaError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MediaError::Rejected(format!("HTTP {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|err| MediaError::Request(err.to_string()))
    }
}

#[async_trait]
impl MediaHost for CloudinaryClient {
    async fn upload(&self, payload: &str, folder: &str) -> Result<ProductImage, MediaError> {
        let file = normalize_payload(payload)?;
        let uploaded: UploadResponse = self
            .signed_post("upload", &[("folder", folder.to_string())], &[("file", file)])
            .await?;
        Ok(ProductImage {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
        })
    }

    async fn destroy(&self, public_id: &str) -> Result<(), MediaError> {
        if public_id.trim().is_empty() {
            return Err(MediaError::InvalidPayload("public id required".into()));
        }
        let outcome: DestroyResponse = self
            .signed_post("destroy", &[("public_id", public_id.to_string())], &[])
            .await?;
        match outcome.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(MediaError::Rejected(other.to_string())),
        }
    }
}

/// `sha256("k1=v1&k2=v2" + secret)` over the parameters sorted by key.
fn sign_params(params: &[(&str, String)], secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
