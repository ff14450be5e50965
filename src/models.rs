use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Products never carry more images than this.
pub const MAX_PRODUCT_IMAGES: usize = 3;

static OBJECT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("object id pattern"));

/// Fresh 24-hex-character identifier for users and products.
pub fn new_object_id() -> String {
    let bytes: [u8; 12] = rand::random();
    hex::encode(bytes)
}

pub fn is_object_id(candidate: &str) -> bool {
    OBJECT_ID.is_match(candidate)
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Argon2 PHC string. Absent for accounts created through social login.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub google_id: Option<String>,
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub whatsapp_number: String,
    pub is_vendor: bool,
    pub profile_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            school: self.school.clone(),
            whatsapp_number: self.whatsapp_number.clone(),
            is_vendor: self.is_vendor,
            profile_complete: self.profile_complete,
        }
    }

    pub fn vendor_summary(&self) -> VendorSummary {
        VendorSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            whatsapp_number: self.whatsapp_number.clone(),
            school: self.school.clone(),
        }
    }
}

/// User fields that are safe to hand back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub school: String,
    pub whatsapp_number: String,
    pub is_vendor: bool,
    pub profile_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSummary {
    pub id: String,
    pub name: String,
    pub email: String,
    pub whatsapp_number: String,
    pub school: String,
}

/// An image stored at the media host. `public_id` is the host-side handle used to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductImage {
    pub url: String,
    pub public_id: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    #[serde(default)]
    pub images: Vec<ProductImage>,
    #[serde(default)]
    pub main_image: Option<String>,
    pub school: String,
    pub vendor_id: String,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Replaces the image list and keeps `main_image` pointing at the first entry.
    pub fn set_images(&mut self, mut images: Vec<ProductImage>) {
        images.truncate(MAX_PRODUCT_IMAGES);
        self.main_image = images.first().map(|image| image.url.clone());
        self.images = images;
    }
}

/// A product as returned to clients, with the owning vendor embedded when it was resolved.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub vendor: Option<VendorSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetTicket {
    pub email: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

/// Price as submitted by clients: a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PriceInput {
    Number(f64),
    Text(String),
}

impl PriceInput {
    /// Finite, non-negative price or `None`.
    pub fn parse(&self) -> Option<f64> {
        let value = match self {
            PriceInput::Number(value) => *value,
            PriceInput::Text(raw) => raw.trim().parse::<f64>().ok()?,
        };
        (value.is_finite() && value >= 0.0).then_some(value)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub is_vendor: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteProfileRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub whatsapp_number: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgotPasswordRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCallbackRequest {
    #[serde(default)]
    pub google_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<PriceInput>,
    #[serde(default)]
    pub category: Option<String>,
    /// Raw image payloads, typically `data:image/...;base64,` URLs.
    #[serde(default)]
    pub images: Option<Vec<String>>,
}

/// Image entry as echoed back by the client. Either field may be missing on malformed input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub public_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<PriceInput>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_available: Option<bool>,
    /// `None` when the field is absent from the body, `Some(vec![])` for an explicit empty list.
    #[serde(default)]
    pub existing_images: Option<Vec<SubmittedImage>>,
    #[serde(default, alias = "newImages")]
    pub images: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub error: Option<String>,
}

/// Trimmed, non-empty value of an optional text field.
pub fn required(field: &Option<String>) -> Option<&str> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
