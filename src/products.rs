use crate::{
    config::OmittedImagesPolicy,
    error::AppError,
    media::{self, MediaHost},
    models::{
        CreateProductRequest, MAX_PRODUCT_IMAGES, Product, ProductImage, ProductView, PublicUser,
        SubmittedImage, UpdateProductRequest, is_object_id, new_object_id, required,
    },
    store::{ProductFilter, ProductStore, UserStore},
};
use chrono::Utc;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{info, warn};

/// Entries from `existingImages` that name an image currently attached to the product.
///
/// Entries missing a url or public id are dropped, duplicates collapse onto their first
/// occurrence and client order is preserved. The stored pair is used, not the echoed one.
pub fn kept_images(submitted: &[SubmittedImage], stored: &[ProductImage]) -> Vec<ProductImage> {
    let by_public_id: HashMap<&str, &ProductImage> = stored
        .iter()
        .map(|image| (image.public_id.as_str(), image))
        .collect();
    let mut seen = HashSet::new();
    submitted
        .iter()
        .filter(|entry| required(&entry.url).is_some())
        .filter_map(|entry| required(&entry.public_id))
        .filter_map(|public_id| by_public_id.get(public_id).copied())
        .filter(|image| seen.insert(image.public_id.clone()))
        .cloned()
        .collect()
}

/// Kept images first, then new uploads in upload order, capped at [`MAX_PRODUCT_IMAGES`].
/// Returns the final list and the uploads that did not fit.
pub fn merge_images(
    kept: Vec<ProductImage>,
    uploaded: Vec<ProductImage>,
) -> (Vec<ProductImage>, Vec<ProductImage>) {
    let mut combined = kept;
    combined.extend(uploaded);
    let overflow = if combined.len() > MAX_PRODUCT_IMAGES {
        combined.split_off(MAX_PRODUCT_IMAGES)
    } else {
        Vec::new()
    };
    (combined, overflow)
}

/// Path segments encode spaces as underscores (`University_of_Lagos`).
pub fn decode_segment(segment: &str) -> String {
    segment.replace('_', " ").trim().to_string()
}

fn parse_product_id(id: &str) -> Result<(), AppError> {
    if is_object_id(id) {
        Ok(())
    } else {
        Err(AppError::validation("Invalid product ID format"))
    }
}

#[derive(Clone)]
pub struct ProductService {
    products: Arc<dyn ProductStore>,
    users: Arc<dyn UserStore>,
    media: Arc<dyn MediaHost>,
    media_folder: String,
    omitted_images: OmittedImagesPolicy,
}

impl ProductService {
    pub fn new(
        products: Arc<dyn ProductStore>,
        users: Arc<dyn UserStore>,
        media: Arc<dyn MediaHost>,
        media_folder: impl Into<String>,
        omitted_images: OmittedImagesPolicy,
    ) -> Self {
        Self {
            products,
            users,
            media,
            media_folder: media_folder.into(),
            omitted_images,
        }
    }

    fn folder_for(&self, vendor_id: &str) -> String {
        format!("{}/{}", self.media_folder, vendor_id)
    }

    /// Loads the product and checks that `vendor` owns it.
    async fn owned_product(&self, vendor: &PublicUser, id: &str) -> Result<Product, AppError> {
        parse_product_id(id)?;
        let Some(product) = self.products.find_product(id).await? else {
            return Err(AppError::not_found("Product not found"));
        };
        if product.vendor_id != vendor.id {
            warn!(
                target = "unimart.products",
                product_id = %id,
                user_id = %vendor.id,
                "ownership check failed"
            );
            return Err(AppError::forbidden("Unauthorized"));
        }
        Ok(product)
    }

    async fn with_vendor(&self, product: Product) -> Result<ProductView, AppError> {
        let vendor = self
            .users
            .find_user(&product.vendor_id)
            .await?
            .map(|user| user.vendor_summary());
        Ok(ProductView { product, vendor })
    }

    /// Image upload failures never block the listing: the product is created without images.
    pub async fn create(
        &self,
        vendor: &PublicUser,
        request: CreateProductRequest,
    ) -> Result<Product, AppError> {
        let (Some(name), Some(description), Some(price), Some(category)) = (
            required(&request.name),
            required(&request.description),
            request.price.as_ref(),
            required(&request.category),
        ) else {
            return Err(AppError::validation(
                "Name, description, price, and category are required",
            ));
        };
        let Some(price) = price.parse() else {
            return Err(AppError::validation("Price must be a positive number"));
        };

        let payloads = request.images.unwrap_or_default();
        let images = if payloads.is_empty() {
            Vec::new()
        } else {
            match media::upload_batch(self.media.as_ref(), &payloads, &self.folder_for(&vendor.id))
                .await
            {
                Ok(images) => images,
                Err(err) => {
                    warn!(
                        target = "unimart.products",
                        user_id = %vendor.id,
                        error = %err,
                        "image upload failed; creating product without images"
                    );
                    Vec::new()
                }
            }
        };

        let now = Utc::now();
        let mut product = Product {
            id: new_object_id(),
            name: name.to_string(),
            description: description.to_string(),
            price,
            category: category.to_string(),
            images: Vec::new(),
            main_image: None,
            school: vendor.school.clone(),
            vendor_id: vendor.id.clone(),
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        product.set_images(images);

        let product = match self.products.insert_product(product.clone()).await {
            Ok(product) => product,
            Err(err) => {
                media::release_all(self.media.as_ref(), &product.images).await;
                return Err(err.into());
            }
        };
        info!(
            target = "unimart.products",
            product_id = %product.id,
            images = product.images.len(),
            "product created"
        );
        Ok(product)
    }

    /// Reconciles kept and newly uploaded images, applies the supplied fields and persists
    /// once. A failed upload aborts the whole update.
    pub async fn update(
        &self,
        vendor: &PublicUser,
        id: &str,
        request: UpdateProductRequest,
    ) -> Result<ProductView, AppError> {
        let current = self.owned_product(vendor, id).await?;

        let price = match &request.price {
            Some(raw) => Some(
                raw.parse()
                    .ok_or_else(|| AppError::validation("Price must be a positive number"))?,
            ),
            None => None,
        };

        let kept = match (&request.existing_images, self.omitted_images) {
            (Some(submitted), _) => kept_images(submitted, &current.images),
            (None, OmittedImagesPolicy::Keep) => current.images.clone(),
            (None, OmittedImagesPolicy::Clear) => Vec::new(),
        };

        // Only upload what can still fit next to the kept images.
        let room = MAX_PRODUCT_IMAGES.saturating_sub(kept.len());
        let payloads = request.images.clone().unwrap_or_default();
        let payloads = &payloads[..payloads.len().min(room)];
        let uploaded = if payloads.is_empty() {
            Vec::new()
        } else {
            media::upload_batch(self.media.as_ref(), payloads, &self.folder_for(&vendor.id))
                .await
                .map_err(|err| {
                    warn!(
                        target = "unimart.products",
                        product_id = %id,
                        error = %err,
                        "image upload failed; update aborted"
                    );
                    AppError::from(err)
                })?
        };
        let (images, overflow) = merge_images(kept, uploaded.clone());

        let mut product = current.clone();
        if let Some(name) = required(&request.name) {
            product.name = name.to_string();
        }
        if let Some(description) = required(&request.description) {
            product.description = description.to_string();
        }
        if let Some(category) = required(&request.category) {
            product.category = category.to_string();
        }
        if let Some(price) = price {
            product.price = price;
        }
        if let Some(is_available) = request.is_available {
            product.is_available = is_available;
        }
        product.set_images(images);
        product.updated_at = Utc::now();

        let product = match self.products.update_product(product).await {
            Ok(product) => product,
            Err(err) => {
                media::release_all(self.media.as_ref(), &uploaded).await;
                return Err(err.into());
            }
        };

        let retained: HashSet<&str> = product
            .images
            .iter()
            .map(|image| image.public_id.as_str())
            .collect();
        let mut released: Vec<ProductImage> = current
            .images
            .iter()
            .filter(|image| !retained.contains(image.public_id.as_str()))
            .cloned()
            .collect();
        released.extend(overflow);
        if !released.is_empty() {
            media::release_all(self.media.as_ref(), &released).await;
        }

        info!(
            target = "unimart.products",
            product_id = %product.id,
            images = product.images.len(),
            released = released.len(),
            "product updated"
        );
        self.with_vendor(product).await
    }

    /// Releases every attached image (best effort) and then removes the record.
    pub async fn delete(&self, vendor: &PublicUser, id: &str) -> Result<(), AppError> {
        let product = self.owned_product(vendor, id).await?;

        if !product.images.is_empty() {
            let failures = media::release_all(self.media.as_ref(), &product.images).await;
            if failures > 0 {
                warn!(
                    target = "unimart.products",
                    product_id = %id,
                    failures,
                    "some images could not be released"
                );
            }
        }

        if !self.products.delete_product(id).await? {
            return Err(AppError::not_found("Product not found"));
        }
        info!(target = "unimart.products", product_id = %id, "product deleted");
        Ok(())
    }

    pub async fn get_by_id(&self, vendor: &PublicUser, id: &str) -> Result<ProductView, AppError> {
        let product = self.owned_product(vendor, id).await?;
        self.with_vendor(product).await
    }

    /// All of the caller's listings, available or not, newest first.
    pub async fn vendor_products(&self, vendor: &PublicUser) -> Result<Vec<Product>, AppError> {
        let filter = ProductFilter {
            vendor_id: Some(vendor.id.clone()),
            ..ProductFilter::default()
        };
        Ok(self.products.list_products(&filter).await?)
    }

    pub async fn all_products(&self) -> Result<Vec<ProductView>, AppError> {
        self.public_listing(ProductFilter::available()).await
    }

    pub async fn products_by_school(&self, segment: &str) -> Result<Vec<ProductView>, AppError> {
        self.public_listing(ProductFilter {
            school: Some(decode_segment(segment)),
            ..ProductFilter::available()
        })
        .await
    }

    pub async fn products_by_category(
        &self,
        segment: &str,
    ) -> Result<Vec<ProductView>, AppError> {
        self.public_listing(ProductFilter {
            category: Some(decode_segment(segment)),
            ..ProductFilter::available()
        })
        .await
    }

    /// Available products with their vendors embedded. Listings whose vendor no longer
    /// exists are left out.
    async fn public_listing(&self, filter: ProductFilter) -> Result<Vec<ProductView>, AppError> {
        let products = self.products.list_products(&filter).await?;
        let mut vendor_ids: Vec<String> = products.iter().map(|p| p.vendor_id.clone()).collect();
        vendor_ids.sort();
        vendor_ids.dedup();
        let vendors: HashMap<String, _> = self
            .users
            .find_users(&vendor_ids)
            .await?
            .into_iter()
            .map(|user| (user.id.clone(), user.vendor_summary()))
            .collect();

        let total = products.len();
        let views: Vec<ProductView> = products
            .into_iter()
            .filter_map(|product| {
                let vendor = vendors.get(&product.vendor_id)?.clone();
                Some(ProductView {
                    product,
                    vendor: Some(vendor),
                })
            })
            .collect();
        if views.len() < total {
            warn!(
                target = "unimart.products",
                orphaned = total - views.len(),
                "dropped listings with unresolved vendors"
            );
        }
        Ok(views)
    }
}
