//! Boundary contract with the canonical store.
//!
//! The engine and the realtime manager are generic over this trait; the
//! production implementation is `api::SupabaseStore`.

use async_trait::async_trait;
use serde_json::Value;

use crate::analytics::DateRange;
use crate::crew::{CrewActivity, CrewSessionRecord, CrewStatus};
use crate::error::StoreResult;
use crate::models::{
    CompletedOrder, NewOrder, OrderSummary, Product, StockAdjustmentRecord, StockChange,
};

#[async_trait]
pub trait CanonicalStore: Send + Sync + 'static {
    /// Lightweight reachability probe.
    async fn ping(&self) -> StoreResult<()>;

    async fn get_product(&self, product_id: &str) -> StoreResult<Option<Product>>;

    /// Insert the order header and its line items as one unit. Returns the
    /// store-assigned order id.
    ///
    /// If the header was written but cannot be undone after the items fail,
    /// this returns `StoreError::IncompleteOrder` carrying the header id.
    async fn insert_order(&self, order: &NewOrder) -> StoreResult<String>;

    /// Conditionally decrement stock. Fails with `StoreError::Conflict` when
    /// the result would be negative; never clamps.
    async fn decrement_stock(&self, product_id: &str, quantity: i64) -> StoreResult<StockChange>;

    /// Overwrite the stock level (and the derived out-of-stock flag).
    async fn set_stock(&self, product_id: &str, stock_quantity: i64) -> StoreResult<Product>;

    async fn record_stock_adjustment(&self, record: &StockAdjustmentRecord) -> StoreResult<()>;

    async fn fetch_completed_orders(&self, range: &DateRange) -> StoreResult<Vec<CompletedOrder>>;

    async fn fetch_recent_orders(&self, limit: usize) -> StoreResult<Vec<OrderSummary>>;

    // -- crew session procedures -------------------------------------------

    /// Returns the new session id.
    async fn start_crew_session(&self, user_id: &str) -> StoreResult<String>;

    async fn end_crew_session(&self, user_id: &str) -> StoreResult<()>;

    async fn update_crew_activity(
        &self,
        user_id: &str,
        activity_type: &str,
        details: &Value,
    ) -> StoreResult<()>;

    async fn get_crew_online_status(&self) -> StoreResult<Vec<CrewStatus>>;

    /// Close sessions whose owner never ended them. Returns how many closed.
    async fn cleanup_stale_crew_sessions(&self) -> StoreResult<u64>;

    async fn fetch_crew_sessions(&self, limit: usize) -> StoreResult<Vec<CrewSessionRecord>>;

    async fn fetch_crew_activities(&self, limit: usize) -> StoreResult<Vec<CrewActivity>>;
}
