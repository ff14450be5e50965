//! Persistence seams. Services only see these traits; `main` picks the backend.

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::models::{Product, ResetTicket, User};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique field (email, google id) is already taken.
    #[error("{0}")]
    Conflict(String),
    #[error("record not found")]
    Missing,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Filter for product listings. Results are always ordered newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductFilter {
    pub vendor_id: Option<String>,
    pub school: Option<String>,
    pub category: Option<String>,
    pub available_only: bool,
}

impl ProductFilter {
    pub fn available() -> Self {
        Self {
            available_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, product: &Product) -> bool {
        self.vendor_id
            .as_deref()
            .is_none_or(|vendor| product.vendor_id == vendor)
            && self.school.as_deref().is_none_or(|s| product.school == s)
            && self.category.as_deref().is_none_or(|c| product.category == c)
            && (!self.available_only || product.is_available)
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    /// Users for the given ids; ids that do not resolve are simply absent from the result.
    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, StoreError>;
    async fn insert_user(&self, user: User) -> Result<User, StoreError>;
    /// Replaces the stored record with the same id.
    async fn update_user(&self, user: User) -> Result<User, StoreError>;
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_product(&self, id: &str) -> Result<Option<Product>, StoreError>;
    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;
    async fn insert_product(&self, product: Product) -> Result<Product, StoreError>;
    /// Replaces the stored record with the same id.
    async fn update_product(&self, product: Product) -> Result<Product, StoreError>;
    /// Returns whether a record was removed.
    async fn delete_product(&self, id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ResetCodeStore: Send + Sync {
    /// Stores the ticket, replacing any earlier ticket for the same email.
    async fn put_ticket(&self, ticket: ResetTicket) -> Result<(), StoreError>;
    async fn find_ticket(&self, email: &str) -> Result<Option<ResetTicket>, StoreError>;
    async fn remove_ticket(&self, email: &str) -> Result<(), StoreError>;
    /// Counts one verification attempt against the ticket and returns it with the new count.
    /// A ticket that has already used `max_attempts` is removed instead and `None` returned.
    /// Concurrent callers never observe the same count.
    async fn claim_attempt(
        &self,
        email: &str,
        max_attempts: u32,
    ) -> Result<Option<ResetTicket>, StoreError>;
    /// Removes the ticket only if it still carries `code_hash`. At most one caller wins.
    async fn take_ticket(&self, email: &str, code_hash: &str) -> Result<bool, StoreError>;
}
