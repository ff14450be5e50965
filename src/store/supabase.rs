use super::{ProductFilter, ProductStore, ResetCodeStore, StoreError, UserStore};
use crate::http::build_client;
use crate::models::{Product, ResetTicket, User};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use urlencoding::encode;

const USERS: &str = "users";
const PRODUCTS: &str = "products";
const RESET_TICKETS: &str = "password_resets";
const CLAIM_RETRIES: usize = 8;

/// PostgREST-backed store. Table layout lives in `docs/schema.sql`.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client("store"),
        })
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{}/rest/v1/{}", self.base_url, table)
        } else {
            format!("{}/rest/v1/{}?{}", self.base_url, table, query)
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>, StoreError> {
        let request = self.authed(self.http.get(self.table_url(table, query)));
        let response = send(request).await?;
        decode(response).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut rows = self.select(table, &format!("{query}&limit=1")).await?;
        Ok(rows.pop())
    }

    async fn insert<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
        upsert: bool,
    ) -> Result<T, StoreError> {
        let prefer = if upsert {
            "return=representation,resolution=merge-duplicates"
        } else {
            "return=representation"
        };
        let request = self
            .authed(self.http.post(self.table_url(table, "")))
            .header("Prefer", prefer)
            .json(row);
        let response = send(request).await?;
        let mut rows: Vec<T> = decode(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("empty insert representation".into()))
    }

    async fn patch<T: Serialize + DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
        row: &T,
    ) -> Result<T, StoreError> {
        let mut rows: Vec<T> = self
            .patch_where(table, &format!("id=eq.{}", encode(id)), row)
            .await?;
        rows.pop().ok_or(StoreError::Missing)
    }

    /// PATCH every row matching `query`; an empty result means nothing matched.
    async fn patch_where<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
        body: &B,
    ) -> Result<Vec<T>, StoreError> {
        let request = self
            .authed(self.http.patch(self.table_url(table, query)))
            .header("Prefer", "return=representation")
            .json(body);
        let response = send(request).await?;
        decode(response).await
    }

    async fn delete_where(&self, table: &str, query: &str) -> Result<usize, StoreError> {
        let request = self
            .authed(self.http.delete(self.table_url(table, query)))
            .header("Prefer", "return=representation");
        let response = send(request).await?;
        let rows: Vec<serde_json::Value> = decode(response).await?;
        Ok(rows.len())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|err| StoreError::Request(err.to_string()))?;
    let status = response.status();
    if status == StatusCode::CONFLICT {
        return Err(StoreError::Conflict("Email already registered".into()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Request(format!("HTTP {status}: {body}")));
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

/// PostgREST query string for a product filter, newest first.
fn product_query(filter: &ProductFilter) -> String {
    let mut query = String::from("select=*&order=createdAt.desc");
    if let Some(vendor) = &filter.vendor_id {
        query.push_str(&format!("&vendorId=eq.{}", encode(vendor)));
    }
    if let Some(school) = &filter.school {
        query.push_str(&format!("&school=eq.{}", encode(school)));
    }
    if let Some(category) = &filter.category {
        query.push_str(&format!("&category=eq.{}", encode(category)));
    }
    if filter.available_only {
        query.push_str("&isAvailable=is.true");
    }
    query
}

fn id_list(ids: &[String]) -> String {
    let joined = ids
        .iter()
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("select=*&id=in.({})", encode(&joined))
}

#[async_trait]
impl UserStore for SupabaseStore {
    async fn find_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        self.select_one(USERS, &format!("select=*&id=eq.{}", encode(id)))
            .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.select_one(USERS, &format!("select=*&email=eq.{}", encode(email)))
            .await
    }

    async fn find_users(&self, ids: &[String]) -> Result<Vec<User>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(USERS, &id_list(ids)).await
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        self.insert(USERS, &user, false).await
    }

    async fn update_user(&self, user: User) -> Result<User, StoreError> {
        self.patch(USERS, &user.id, &user).await
    }
}

#[async_trait]
impl ProductStore for SupabaseStore {
    async fn find_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        self.select_one(PRODUCTS, &format!("select=*&id=eq.{}", encode(id)))
            .await
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        self.select(PRODUCTS, &product_query(filter)).await
    }

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError> {
        self.insert(PRODUCTS, &product, false).await
    }

    async fn update_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut row = serde_json::to_value(&product)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        // An absent key would leave the previous main image in place.
        if let Some(fields) = row.as_object_mut() {
            fields
                .entry("mainImage")
                .or_insert(serde_json::Value::Null);
        }
        let stored: serde_json::Value = self.patch(PRODUCTS, &product.id, &row).await?;
        serde_json::from_value(stored).map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn delete_product(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .delete_where(PRODUCTS, &format!("id=eq.{}", encode(id)))
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ResetCodeStore for SupabaseStore {
    async fn put_ticket(&self, ticket: ResetTicket) -> Result<(), StoreError> {
        self.insert(RESET_TICKETS, &ticket, true).await.map(|_| ())
    }

    async fn find_ticket(&self, email: &str) -> Result<Option<ResetTicket>, StoreError> {
        self.select_one(
            RESET_TICKETS,
            &format!("select=*&email=eq.{}", encode(email)),
        )
        .await
    }

    async fn remove_ticket(&self, email: &str) -> Result<(), StoreError> {
        self.delete_where(RESET_TICKETS, &format!("email=eq.{}", encode(email)))
            .await
            .map(|_| ())
    }

    /// Compare-and-swap on `attempts`: the PATCH only matches while the count is still the
    /// one that was read, so two claims can never share a count.
    async fn claim_attempt(
        &self,
        email: &str,
        max_attempts: u32,
    ) -> Result<Option<ResetTicket>, StoreError> {
        for _ in 0..CLAIM_RETRIES {
            let Some(ticket) = self.find_ticket(email).await? else {
                return Ok(None);
            };
            if ticket.attempts >= max_attempts {
                self.remove_ticket(email).await?;
                return Ok(None);
            }
            let mut claimed: Vec<ResetTicket> = self
                .patch_where(
                    RESET_TICKETS,
                    &claim_query(email, ticket.attempts),
                    &serde_json::json!({ "attempts": ticket.attempts + 1 }),
                )
                .await?;
            if let Some(ticket) = claimed.pop() {
                return Ok(Some(ticket));
            }
        }
        Err(StoreError::Request(
            "reset ticket changed on every claim attempt".into(),
        ))
    }

    async fn take_ticket(&self, email: &str, code_hash: &str) -> Result<bool, StoreError> {
        let removed = self
            .delete_where(RESET_TICKETS, &take_query(email, code_hash))
            .await?;
        Ok(removed > 0)
    }
}

fn claim_query(email: &str, attempts: u32) -> String {
    format!("email=eq.{}&attempts=eq.{attempts}", encode(email))
}

fn take_query(email: &str, code_hash: &str) -> String {
    format!(
        "email=eq.{}&codeHash=eq.{}",
        encode(email),
        encode(code_hash)
    )
}
