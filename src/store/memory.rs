use super::{ProductFilter, ProductStore, ResetCodeStore, StoreError, UserStore};
use crate::models::{Product, ResetTicket, User};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Process-local store used for tests and for local runs without Supabase.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<Mutex<HashMap<String, User>>>,
    products: Arc<Mutex<HashMap<String, Product>>>,
    tickets: Arc<Mutex<HashMap<String, ResetTicket>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a user without touching their products, leaving orphaned listings behind.
    #[cfg(test)]
    pub async fn remove_user(&self, id: &str) {
        self.users.lock().await.remove(id);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().await.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let guard = self.users.lock().await;
        Ok(guard.values().find(|user| user.email == email).cloned())
    }

    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, StoreError> {
        let guard = self.users.lock().await;
        Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        let mut guard = self.users.lock().await;
        if guard.values().any(|existing| existing.email == user.email) {
            return Err(StoreError::Conflict("Email already registered".into()));
        }
        if let Some(google_id) = &user.google_id
            && guard
                .values()
                .any(|existing| existing.google_id.as_ref() == Some(google_id))
        {
            return Err(StoreError::Conflict("Google account already linked".into()));
        }
        guard.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn update_user(&self, user: User) -> Result<User, StoreError> {
        let mut guard = self.users.lock().await;
        let Some(slot) = guard.get_mut(&user.id) else {
            return Err(StoreError::Missing);
        };
        *slot = user.clone();
        Ok(user)
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn find_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.products.lock().await.get(id).cloned())
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let guard = self.products.lock().await;
        let mut products: Vec<Product> = guard
            .values()
            .filter(|product| filter.matches(product))
            .cloned()
            .collect();
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(products)
    }

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError> {
        self.products
            .lock()
            .await
            .insert(product.id.clone(), product.clone());
        Ok(product)
    }

    async fn update_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut guard = self.products.lock().await;
        let Some(slot) = guard.get_mut(&product.id) else {
            return Err(StoreError::Missing);
        };
        *slot = product.clone();
        Ok(product)
    }

    async fn delete_product(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.products.lock().await.remove(id).is_some())
    }
}

#[async_trait]
impl ResetCodeStore for MemoryStore {
    async fn put_ticket(&self, ticket: ResetTicket) -> Result<(), StoreError> {
        self.tickets
            .lock()
            .await
            .insert(ticket.email.clone(), ticket);
        Ok(())
    }

    async fn find_ticket(&self, email: &str) -> Result<Option<ResetTicket>, StoreError> {
        Ok(self.tickets.lock().await.get(email).cloned())
    }

    async fn remove_ticket(&self, email: &str) -> Result<(), StoreError> {
        self.tickets.lock().await.remove(email);
        Ok(())
    }

    async fn claim_attempt(
        &self,
        email: &str,
        max_attempts: u32,
    ) -> Result<Option<ResetTicket>, StoreError> {
        let mut guard = self.tickets.lock().await;
        let exhausted = match guard.get(email) {
            Some(ticket) => ticket.attempts >= max_attempts,
            None => return Ok(None),
        };
        if exhausted {
            guard.remove(email);
            return Ok(None);
        }
        Ok(guard.get_mut(email).map(|ticket| {
            ticket.attempts += 1;
            ticket.clone()
        }))
    }

    async fn take_ticket(&self, email: &str, code_hash: &str) -> Result<bool, StoreError> {
        let mut guard = self.tickets.lock().await;
        if guard.get(email).is_some_and(|ticket| ticket.code_hash == code_hash) {
            guard.remove(email);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
