use super::AppState;
use crate::{
    error::AppError,
    models::{CreateProductRequest, ProductView, PublicUser, UpdateProductRequest},
};
use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

fn listing(products: Vec<ProductView>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "Products retrieved successfully",
        "count": products.len(),
        "products": products,
    }))
}

/// Create a listing for the calling vendor.
///
/// - Method: `POST`
/// - Path: `/api/products/create`
/// - Auth: session; vendor with a completed profile
/// - Body: `{name, description, price, category, images?}` where `images` are base64 payloads
/// - Response: 201 `{message, product}`
pub(super) async fn create(
    State(state): State<AppState>,
    Extension(vendor): Extension<PublicUser>,
    Json(payload): Json<CreateProductRequest>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/api/products/create");
    let product = state.products.create(&vendor, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Product created successfully",
            "product": product,
        })),
    )
        .into_response())
}

pub(super) async fn my_products(
    State(state): State<AppState>,
    Extension(vendor): Extension<PublicUser>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products/my-products");
    let products = state.products.vendor_products(&vendor).await?;
    Ok(Json(json!({
        "message": "Vendor products retrieved successfully",
        "count": products.len(),
        "products": products,
    })))
}

pub(super) async fn get_by_id(
    State(state): State<AppState>,
    Extension(vendor): Extension<PublicUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let product = state.products.get_by_id(&vendor, &id).await?;
    Ok(Json(json!({
        "message": "Product retrieved successfully",
        "product": product,
    })))
}

/// Partial update with image reconciliation.
///
/// - Method: `PUT`
/// - Path: `/api/products/{id}`
/// - Body: any of `name, description, price, category, isAvailable`, plus
///   `existingImages` (`[{url, publicId}]` to keep) and `images`/`newImages` (payloads to add)
pub(super) async fn update(
    State(state): State<AppState>,
    Extension(vendor): Extension<PublicUser>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateProductRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products/{id}");
    let product = state.products.update(&vendor, &id, payload).await?;
    Ok(Json(json!({
        "message": "Product updated successfully",
        "product": product,
    })))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Extension(vendor): Extension<PublicUser>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products/{id}");
    state.products.delete(&vendor, &id).await?;
    Ok(Json(json!({
        "message": "Product and images deleted successfully",
    })))
}

pub(super) async fn all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products");
    Ok(listing(state.products.all_products().await?))
}

pub(super) async fn by_school(
    State(state): State<AppState>,
    Path(school): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products/school/{school}");
    Ok(listing(state.products.products_by_school(&school).await?))
}

pub(super) async fn by_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/api/products/category/{category}");
    Ok(listing(state.products.products_by_category(&category).await?))
}
