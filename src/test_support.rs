//! In-memory fakes for the canonical store and changefeed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::analytics::DateRange;
use crate::changefeed::{ChangeEvent, Changefeed, Family, Subscription};
use crate::crew::{CrewActivity, CrewSessionRecord, CrewStatus};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CompletedOrder, NewOrder, OrderSummary, Product, StockAdjustmentRecord, StockChange,
};
use crate::store::CanonicalStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub user_id: String,
    pub activity_type: String,
    pub details: Value,
    pub at: Instant,
}

#[derive(Default)]
pub struct MemoryState {
    pub unreachable: bool,
    pub products: HashMap<String, Product>,
    pub orders: Vec<(String, NewOrder)>,
    pub adjustments: Vec<StockAdjustmentRecord>,
    pub completed: Vec<CompletedOrder>,
    pub recent: Vec<OrderSummary>,
    pub crew_status: Vec<CrewStatus>,
    pub crew_sessions: Vec<CrewSessionRecord>,
    pub crew_activities: Vec<CrewActivity>,
    pub activity_calls: Vec<ActivityCall>,
    pub started_sessions: Vec<String>,
    pub ended_sessions: Vec<String>,
    pub cleanup_calls: usize,
    pub product_reads: usize,
    pub recent_reads: usize,
    /// Decrements of this product fail with a server error.
    pub fail_decrement_for: Option<String>,
    /// Order inserts fail with a client error.
    pub reject_inserts: bool,
    /// Order inserts keep the header but lose the items.
    pub orphan_inserts: bool,
    pub fail_cleanup: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, id: &str, name: &str, stock: i64) -> Self {
        self.state().products.insert(
            id.to_string(),
            Product {
                id: id.to_string(),
                name: name.to_string(),
                stock_quantity: stock,
                is_out_of_stock: stock == 0,
            },
        );
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn stock(&self, id: &str) -> Option<i64> {
        self.state().products.get(id).map(|p| p.stock_quantity)
    }

    fn check(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let state = self.state();
        if state.unreachable {
            return Err(StoreError::Unreachable("connection refused".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check().map(|_| ())
    }

    async fn get_product(&self, product_id: &str) -> StoreResult<Option<Product>> {
        let mut state = self.check()?;
        state.product_reads += 1;
        Ok(state.products.get(product_id).cloned())
    }

    async fn insert_order(&self, order: &NewOrder) -> StoreResult<String> {
        let mut state = self.check()?;
        if state.reject_inserts {
            return Err(StoreError::Status {
                status: 400,
                body: "insert rejected".into(),
            });
        }
        let id = format!("ord-{}", state.orders.len() + 1);
        state.orders.push((id.clone(), order.clone()));
        if state.orphan_inserts {
            return Err(StoreError::IncompleteOrder {
                order_id: id,
                source: Box::new(StoreError::Unreachable("connection reset".into())),
            });
        }
        Ok(id)
    }

    async fn decrement_stock(&self, product_id: &str, quantity: i64) -> StoreResult<StockChange> {
        let mut state = self.check()?;
        if state.fail_decrement_for.as_deref() == Some(product_id) {
            return Err(StoreError::Status {
                status: 500,
                body: "decrement failed".into(),
            });
        }
        let product = state
            .products
            .get_mut(product_id)
            .ok_or_else(|| StoreError::NotFound(product_id.to_string()))?;
        let previous = product.stock_quantity;
        let resulting = previous - quantity;
        if resulting < 0 {
            return Err(StoreError::Conflict(format!("{product_id} would go negative")));
        }
        product.stock_quantity = resulting;
        product.is_out_of_stock = resulting == 0;
        Ok(StockChange {
            previous,
            resulting,
        })
    }

    async fn set_stock(&self, product_id: &str, stock_quantity: i64) -> StoreResult<Product> {
        let mut state = self.check()?;
        let product = state
            .products
            .get_mut(product_id)
            .ok_or_else(|| StoreError::NotFound(product_id.to_string()))?;
        product.stock_quantity = stock_quantity;
        product.is_out_of_stock = stock_quantity == 0;
        Ok(product.clone())
    }

    async fn record_stock_adjustment(&self, record: &StockAdjustmentRecord) -> StoreResult<()> {
        self.check()?.adjustments.push(record.clone());
        Ok(())
    }

    async fn fetch_completed_orders(&self, range: &DateRange) -> StoreResult<Vec<CompletedOrder>> {
        let state = self.check()?;
        Ok(state
            .completed
            .iter()
            .filter(|o| range.contains(o.created_at))
            .cloned()
            .collect())
    }

    async fn fetch_recent_orders(&self, limit: usize) -> StoreResult<Vec<OrderSummary>> {
        let mut state = self.check()?;
        state.recent_reads += 1;
        Ok(state.recent.iter().take(limit).cloned().collect())
    }

    async fn start_crew_session(&self, user_id: &str) -> StoreResult<String> {
        let mut state = self.check()?;
        state.started_sessions.push(user_id.to_string());
        let id = format!("session-{}", state.started_sessions.len());
        state.crew_sessions.push(CrewSessionRecord {
            id: id.clone(),
            user_id: user_id.to_string(),
            full_name: None,
            session_start: Utc::now(),
            session_end: None,
            last_activity: None,
        });
        Ok(id)
    }

    async fn end_crew_session(&self, user_id: &str) -> StoreResult<()> {
        self.check()?.ended_sessions.push(user_id.to_string());
        Ok(())
    }

    async fn update_crew_activity(
        &self,
        user_id: &str,
        activity_type: &str,
        details: &Value,
    ) -> StoreResult<()> {
        self.check()?.activity_calls.push(ActivityCall {
            user_id: user_id.to_string(),
            activity_type: activity_type.to_string(),
            details: details.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn get_crew_online_status(&self) -> StoreResult<Vec<CrewStatus>> {
        Ok(self.check()?.crew_status.clone())
    }

    async fn cleanup_stale_crew_sessions(&self) -> StoreResult<u64> {
        let mut state = self.check()?;
        state.cleanup_calls += 1;
        if state.fail_cleanup {
            return Err(StoreError::Rpc {
                function: "cleanup_stale_crew_sessions".into(),
                message: "permission denied".into(),
            });
        }
        Ok(0)
    }

    async fn fetch_crew_sessions(&self, limit: usize) -> StoreResult<Vec<CrewSessionRecord>> {
        Ok(self.check()?.crew_sessions.iter().take(limit).cloned().collect())
    }

    async fn fetch_crew_activities(&self, limit: usize) -> StoreResult<Vec<CrewActivity>> {
        Ok(self.check()?.crew_activities.iter().take(limit).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Changefeed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeScript {
    Fail,
    Succeed,
}

#[derive(Default)]
struct FeedState {
    script: VecDeque<SubscribeScript>,
    /// Outcome once the script is exhausted.
    fail_by_default: bool,
    calls: Vec<Instant>,
    families: Vec<Vec<Family>>,
    senders: Vec<mpsc::Sender<ChangeEvent>>,
}

#[derive(Default)]
pub struct MemoryFeed {
    state: Mutex<FeedState>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: &[SubscribeScript], fail_by_default: bool) -> Self {
        let feed = Self::default();
        {
            let mut state = feed.lock();
            state.script = script.iter().copied().collect();
            state.fail_by_default = fail_by_default;
        }
        feed
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Times at which `subscribe` was called.
    pub fn calls(&self) -> Vec<Instant> {
        self.lock().calls.clone()
    }

    pub fn last_families(&self) -> Option<Vec<Family>> {
        self.lock().families.last().cloned()
    }

    /// Deliver an event on the newest subscription.
    pub fn emit(&self, event: ChangeEvent) -> bool {
        let sender = self.lock().senders.last().cloned();
        sender.is_some_and(|tx| tx.try_send(event).is_ok())
    }

    /// End every open subscription stream.
    pub fn drop_streams(&self) {
        self.lock().senders.clear();
    }

    /// Subscriptions still held by their owner.
    pub fn open_streams(&self) -> usize {
        self.lock().senders.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Whether the newest subscription has been released by its owner.
    pub fn last_released(&self) -> bool {
        self.lock().senders.last().is_some_and(|tx| tx.is_closed())
    }
}

#[async_trait]
impl Changefeed for MemoryFeed {
    async fn subscribe(&self, families: &[Family]) -> StoreResult<Subscription> {
        let mut state = self.lock();
        state.calls.push(Instant::now());
        state.families.push(families.to_vec());
        let fail_by_default = state.fail_by_default;
        let outcome = state.script.pop_front().unwrap_or(if fail_by_default {
            SubscribeScript::Fail
        } else {
            SubscribeScript::Succeed
        });
        match outcome {
            SubscribeScript::Fail => Err(StoreError::Subscribe("channel error".into())),
            SubscribeScript::Succeed => {
                let (tx, rx) = mpsc::channel(64);
                state.senders.push(tx);
                Ok(Subscription::new(rx, CancellationToken::new()))
            }
        }
    }
}
