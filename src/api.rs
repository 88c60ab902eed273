//! Canonical store client over a PostgREST-style REST/RPC API.
//!
//! Tables live under `{url}/rest/v1/<table>` and stored procedures under
//! `{url}/rest/v1/rpc/<fn>`. Every request carries the `apikey` and
//! `Authorization: Bearer` headers.

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::analytics::DateRange;
use crate::config::StoreConfig;
use crate::crew::{CrewActivity, CrewSessionRecord, CrewStatus};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CompletedOrder, NewOrder, OrderSummary, Product, StockAdjustmentRecord, StockChange,
};
use crate::store::CanonicalStore;

/// Attempts of the compare-and-set stock decrement before giving up.
const CAS_ATTEMPTS: usize = 3;

const PRODUCT_COLUMNS: &str = "id,name,stock_quantity,is_out_of_stock";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the store base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_store_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Pull the most useful message out of a PostgREST error body.
fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str);
        let details = json
            .get("details")
            .or_else(|| json.get("hint"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        match (message, details) {
            (Some(m), Some(d)) => return format!("{m}: {d}"),
            (Some(m), None) => return m.to_string(),
            _ => {}
        }
    }
    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected response")
            .to_string()
    } else {
        body.trim().to_string()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    client: Client,
    base: String,
    api_key: String,
}

#[derive(Deserialize)]
struct IdRow {
    id: String,
}

impl SupabaseStore {
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        if config.anon_key.trim().is_empty() {
            return Err(StoreError::Config("store API key is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: normalize_store_url(&config.url),
            api_key: config.anon_key.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
    }

    /// Send and return the JSON body, or `Null` for empty responses.
    async fn send(&self, req: RequestBuilder) -> StoreResult<Value> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: error_detail(status, &body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> StoreResult<Vec<T>> {
        let req = self.request(Method::GET, &self.table_url(table)).query(query);
        let body = self.send(req).await?;
        if body.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(body)?)
    }

    /// Insert one or more rows and return the stored representation.
    async fn insert_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        rows: &Value,
    ) -> StoreResult<Vec<T>> {
        let req = self
            .request(Method::POST, &self.table_url(table))
            .header("Prefer", "return=representation")
            .json(rows);
        let body = self.send(req).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn patch_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: &[(&str, String)],
        patch: &Value,
    ) -> StoreResult<Vec<T>> {
        let req = self
            .request(Method::PATCH, &self.table_url(table))
            .query(filter)
            .header("Prefer", "return=representation")
            .json(patch);
        let body = self.send(req).await?;
        if body.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn rpc(&self, function: &str, args: Value) -> StoreResult<Value> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base);
        let req = self.request(Method::POST, &url).json(&args);
        self.send(req).await.map_err(|e| match e {
            StoreError::Status { status, body } if status < 500 => StoreError::Rpc {
                function: function.to_string(),
                message: body,
            },
            other => other,
        })
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl CanonicalStore for SupabaseStore {
    async fn ping(&self) -> StoreResult<()> {
        self.get_rows::<Value>("products", &[("select", "id".into()), ("limit", "1".into())])
            .await
            .map(|_| ())
    }

    async fn get_product(&self, product_id: &str) -> StoreResult<Option<Product>> {
        let rows: Vec<Product> = self
            .get_rows(
                "products",
                &[("select", PRODUCT_COLUMNS.into()), ("id", eq(product_id))],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_order(&self, order: &NewOrder) -> StoreResult<String> {
        let mut header = serde_json::to_value(order)?;
        let mut items = match header.as_object_mut().and_then(|obj| obj.remove("items")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        let inserted: Vec<IdRow> = self.insert_rows("orders", &header).await?;
        let order_id = inserted
            .into_iter()
            .next()
            .map(|row| row.id)
            .ok_or_else(|| StoreError::Decode("order insert returned no row".into()))?;

        for row in &mut items {
            if let Some(obj) = row.as_object_mut() {
                obj.insert("order_id".into(), Value::String(order_id.clone()));
            }
        }

        if let Err(e) = self
            .insert_rows::<Value>("order_items", &Value::Array(items))
            .await
        {
            // Roll the header back so the order is not left without items.
            warn!(order_id = %order_id, error = %e, "order items insert failed, removing header");
            let delete = self
                .request(Method::DELETE, &self.table_url("orders"))
                .query(&[("id", eq(&order_id))]);
            if let Err(cleanup) = self.send(delete).await {
                warn!(order_id = %order_id, error = %cleanup, "failed to remove orphaned order header");
                return Err(StoreError::IncompleteOrder {
                    order_id,
                    source: Box::new(e),
                });
            }
            return Err(e);
        }

        info!(order_id = %order_id, items = order.items.len(), "order inserted");
        Ok(order_id)
    }

    async fn decrement_stock(&self, product_id: &str, quantity: i64) -> StoreResult<StockChange> {
        for attempt in 1..=CAS_ATTEMPTS {
            let product = self
                .get_product(product_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
            let previous = product.stock_quantity;
            let resulting = previous - quantity;
            if resulting < 0 {
                return Err(StoreError::Conflict(format!(
                    "{} has {previous} in stock, {quantity} requested",
                    product.name
                )));
            }

            let updated: Vec<Product> = self
                .patch_rows(
                    "products",
                    &[
                        ("id", eq(product_id)),
                        ("stock_quantity", eq(&previous.to_string())),
                    ],
                    &json!({ "stock_quantity": resulting, "is_out_of_stock": resulting == 0 }),
                )
                .await?;
            if !updated.is_empty() {
                return Ok(StockChange {
                    previous,
                    resulting,
                });
            }
            debug!(product_id, attempt, "stock changed underneath decrement, retrying");
        }
        Err(StoreError::Conflict(format!(
            "stock for {product_id} kept changing during decrement"
        )))
    }

    async fn set_stock(&self, product_id: &str, stock_quantity: i64) -> StoreResult<Product> {
        let rows: Vec<Product> = self
            .patch_rows(
                "products",
                &[("id", eq(product_id)), ("select", PRODUCT_COLUMNS.into())],
                &json!({ "stock_quantity": stock_quantity, "is_out_of_stock": stock_quantity == 0 }),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))
    }

    async fn record_stock_adjustment(&self, record: &StockAdjustmentRecord) -> StoreResult<()> {
        let row = serde_json::to_value(record)?;
        let req = self
            .request(Method::POST, &self.table_url("stock_adjustments"))
            .header("Prefer", "return=minimal")
            .json(&row);
        self.send(req).await.map(|_| ())
    }

    async fn fetch_completed_orders(&self, range: &DateRange) -> StoreResult<Vec<CompletedOrder>> {
        let start = range.start.to_rfc3339_opts(SecondsFormat::Millis, true);
        let end = range.end.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.get_rows(
            "orders",
            &[
                (
                    "select",
                    "id,created_at,total_amount,total_commission,order_items(product_id,product_name,quantity,subtotal)"
                        .into(),
                ),
                ("status", eq("completed")),
                ("created_at", format!("gte.{start}")),
                ("created_at", format!("lte.{end}")),
                ("order", "created_at.asc".into()),
            ],
        )
        .await
    }

    async fn fetch_recent_orders(&self, limit: usize) -> StoreResult<Vec<OrderSummary>> {
        self.get_rows(
            "orders",
            &[
                ("select", "id,customer_name,status,total_amount,created_at".into()),
                ("order", "created_at.desc".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn start_crew_session(&self, user_id: &str) -> StoreResult<String> {
        let result = self
            .rpc("start_crew_session", json!({ "p_user_id": user_id }))
            .await?;
        match result {
            Value::String(id) => Ok(id),
            Value::Object(ref obj) => obj
                .get("id")
                .or_else(|| obj.get("session_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::Decode("start_crew_session returned no id".into())),
            other => Err(StoreError::Decode(format!(
                "start_crew_session returned {other}"
            ))),
        }
    }

    async fn end_crew_session(&self, user_id: &str) -> StoreResult<()> {
        self.rpc("end_crew_session", json!({ "p_user_id": user_id }))
            .await
            .map(|_| ())
    }

    async fn update_crew_activity(
        &self,
        user_id: &str,
        activity_type: &str,
        details: &Value,
    ) -> StoreResult<()> {
        self.rpc(
            "update_crew_activity",
            json!({
                "p_user_id": user_id,
                "p_activity_type": activity_type,
                "p_details": details,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_crew_online_status(&self) -> StoreResult<Vec<CrewStatus>> {
        let result = self.rpc("get_crew_online_status", json!({})).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(result)?)
    }

    async fn cleanup_stale_crew_sessions(&self) -> StoreResult<u64> {
        let result = self.rpc("cleanup_stale_crew_sessions", json!({})).await?;
        Ok(result.as_u64().unwrap_or(0))
    }

    async fn fetch_crew_sessions(&self, limit: usize) -> StoreResult<Vec<CrewSessionRecord>> {
        self.get_rows(
            "crew_sessions",
            &[
                ("select", "*".into()),
                ("order", "session_start.desc".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn fetch_crew_activities(&self, limit: usize) -> StoreResult<Vec<CrewActivity>> {
        self.get_rows(
            "crew_activity_logs",
            &[
                ("select", "*".into()),
                ("order", "created_at.desc".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}
