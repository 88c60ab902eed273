//! Order and inventory reconciliation engine.
//!
//! Orders are verified against and committed to the canonical store when it
//! is reachable, and admitted into the durable offline queue when it is not.
//! `sync` later replays queued orders in submission order; an order whose
//! stock is gone by then is parked as a conflict and never retried on its
//! own.
//!
//! The online commit is two-phase: the order (header and items) is inserted
//! as one unit, then stock is decremented per product with a conditional
//! update at the store. A failure between the two phases is surfaced as
//! `EngineError::PartialCommit` and logged with enough context to repair the
//! stock by hand; the order is not re-queued since it already exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::{self, DateRange, SalesAnalytics};
use crate::config::EngineConfig;
use crate::connectivity::Connectivity;
use crate::db::DbState;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::models::{
    AdjustmentReason, NewOrder, OrderId, OrderOutcome, OrderRequest, QueuedOrder,
    QueuedOrderStatus, StockAdjustmentRecord, StockConflict,
};
use crate::notifications::Notification;
use crate::queue::OfflineQueue;
use crate::store::CanonicalStore;

// ---------------------------------------------------------------------------
// Sync report
// ---------------------------------------------------------------------------

/// Outcome of one `sync` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Queue entries replayed against the store.
    pub attempted: usize,
    /// `(local_id, remote_id)` of committed entries, now removed from the queue.
    pub synced: Vec<(String, String)>,
    /// `(local_id, conflict messages)` of entries parked as conflicts.
    pub conflicted: Vec<(String, Vec<String>)>,
    /// `(local_id, error)` of entries left pending for a later pass.
    pub failed: Vec<(String, String)>,
    /// `(local_id, remote_id)` of entries committed with an incomplete stock
    /// update. Removed from the queue.
    pub partial: Vec<(String, String)>,
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Notifications describing this pass, for `ConnectionManager::publish`.
    pub fn notifications(&self) -> Vec<Notification> {
        let mut out = Vec::new();
        if !self.synced.is_empty() {
            out.push(Notification::system(
                "Offline orders synced",
                format!("{} offline order(s) were submitted", self.synced.len()),
            ));
        }
        for (local_id, conflicts) in &self.conflicted {
            out.push(
                Notification::system(
                    "Order needs attention",
                    format!(
                        "Order {local_id} could not be submitted: {}",
                        conflicts.join(", ")
                    ),
                )
                .with_data(serde_json::json!({ "local_id": local_id, "conflicts": conflicts })),
            );
        }
        for (local_id, remote_id) in &self.partial {
            out.push(
                Notification::system(
                    "Stock update incomplete",
                    format!("Order {remote_id} was submitted but its stock was not fully updated"),
                )
                .with_data(serde_json::json!({ "local_id": local_id, "order_id": remote_id })),
            );
        }
        if !self.failed.is_empty() {
            out.push(Notification::system(
                "Sync incomplete",
                format!("{} order(s) will be retried", self.failed.len()),
            ));
        }
        out
    }
}

/// Releases the sync flag when a pass ends, including on panic.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Online commit
// ---------------------------------------------------------------------------

enum CommitResult {
    Committed(String),
    Rejected(Vec<StockConflict>),
}

enum CommitError {
    /// Nothing was written; the order can safely go to the offline queue.
    /// Failures after the order row exists never take this path.
    Unreachable(StoreError),
    Failed(EngineError),
}

impl From<StoreError> for CommitError {
    fn from(err: StoreError) -> Self {
        if err.is_unreachable() {
            CommitError::Unreachable(err)
        } else {
            CommitError::Failed(err.into())
        }
    }
}

/// Requested quantity per product, in first-seen order.
struct Demand<'a> {
    product_id: &'a str,
    product_name: &'a str,
    quantity: i64,
}

fn aggregate_demand(req: &OrderRequest) -> Vec<Demand<'_>> {
    let mut demand: Vec<Demand<'_>> = Vec::new();
    for line in &req.items {
        match demand.iter_mut().find(|d| d.product_id == line.product_id) {
            Some(d) => d.quantity += line.quantity,
            None => demand.push(Demand {
                product_id: &line.product_id,
                product_name: &line.product_name,
                quantity: line.quantity,
            }),
        }
    }
    demand
}

fn validate(req: &OrderRequest) -> EngineResult<()> {
    if req.items.is_empty() {
        return Err(EngineError::InvalidInput("order has no items".into()));
    }
    for line in &req.items {
        if line.product_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("order item without product".into()));
        }
        if line.quantity <= 0 {
            return Err(EngineError::InvalidInput(format!(
                "quantity for {} must be positive",
                line.product_name
            )));
        }
        if line.unit_price.is_sign_negative() || line.unit_commission.is_sign_negative() {
            return Err(EngineError::InvalidInput(format!(
                "price for {} must not be negative",
                line.product_name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct OrderEngine<S: CanonicalStore> {
    store: Arc<S>,
    queue: OfflineQueue,
    connectivity: Connectivity,
    config: EngineConfig,
    syncing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl<S: CanonicalStore> OrderEngine<S> {
    /// Build an engine over `store`, loading the durable queue from `db`.
    pub fn new(store: Arc<S>, db: Arc<DbState>, config: EngineConfig) -> EngineResult<Self> {
        let queue = OfflineQueue::load(db, config.queue_slot.clone())?;
        Ok(Self {
            store,
            queue,
            connectivity: Connectivity::default(),
            config,
            syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        })
    }

    /// Share an existing connectivity signal (e.g. one fed by the platform).
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- orders -------------------------------------------------------------

    /// Submit an order. Online it is verified and committed; if the store
    /// cannot be reached it is admitted to the offline queue instead.
    pub async fn process_order(&self, req: OrderRequest) -> EngineResult<OrderOutcome> {
        validate(&req)?;

        if self.connectivity.is_online() {
            match self.commit_online(&req).await {
                Ok(CommitResult::Committed(order_id)) => {
                    return Ok(OrderOutcome::Committed(OrderId::Remote(order_id)));
                }
                Ok(CommitResult::Rejected(conflicts)) => {
                    info!(
                        conflicts = conflicts.len(),
                        "Order rejected: insufficient stock"
                    );
                    return Ok(OrderOutcome::Rejected(conflicts));
                }
                Err(CommitError::Unreachable(e)) => {
                    warn!(error = %e, "Canonical store unreachable, queueing order offline");
                    self.connectivity.mark_unreachable();
                }
                Err(CommitError::Failed(e)) => return Err(e),
            }
        }

        self.enqueue_offline(req)
    }

    fn enqueue_offline(&self, req: OrderRequest) -> EngineResult<OrderOutcome> {
        let order_id = OrderId::new_local();
        let entry = QueuedOrder::from_request(order_id.as_str().to_string(), req, Utc::now());
        let total = entry.total_amount;
        if let Err(e) = self.queue.append(entry) {
            error!(local_id = %order_id, error = %e, "Failed to persist offline order");
            return Err(e.into());
        }
        info!(
            local_id = %order_id,
            total = %total,
            pending = self.pending_orders_count(),
            "Order queued offline"
        );
        Ok(OrderOutcome::Queued(order_id))
    }

    /// Verify stock for every product in parallel, then insert and decrement.
    async fn commit_online(&self, req: &OrderRequest) -> Result<CommitResult, CommitError> {
        let demand = aggregate_demand(req);

        let reads = join_all(demand.iter().map(|d| self.store.get_product(d.product_id))).await;

        let mut conflicts = Vec::new();
        for (d, read) in demand.iter().zip(reads) {
            match read? {
                None => conflicts.push(StockConflict {
                    product_id: d.product_id.to_string(),
                    product_name: d.product_name.to_string(),
                    requested: d.quantity,
                    available: None,
                }),
                Some(product) if product.stock_quantity < d.quantity => {
                    conflicts.push(StockConflict {
                        product_id: d.product_id.to_string(),
                        product_name: product.name,
                        requested: d.quantity,
                        available: Some(product.stock_quantity),
                    })
                }
                Some(_) => {}
            }
        }
        if !conflicts.is_empty() {
            return Ok(CommitResult::Rejected(conflicts));
        }

        let order = NewOrder::from_request(req);
        let order_id = self.store.insert_order(&order).await?;

        for d in &demand {
            let change = match self.store.decrement_stock(d.product_id, d.quantity).await {
                Ok(change) => change,
                Err(source) => {
                    return Err(self.partial_commit(&order_id, d, source));
                }
            };
            let record = StockAdjustmentRecord {
                product_id: d.product_id.to_string(),
                quantity_delta: -d.quantity,
                reason: AdjustmentReason::Order,
                resulting_stock: change.resulting,
                order_id: Some(order_id.clone()),
            };
            if let Err(source) = self.store.record_stock_adjustment(&record).await {
                return Err(self.partial_commit(&order_id, d, source));
            }
            debug!(
                order_id = %order_id,
                product_id = d.product_id,
                quantity_delta = -d.quantity,
                resulting_stock = change.resulting,
                "Stock decremented"
            );
        }

        info!(
            order_id = %order_id,
            total = %order.total_amount,
            items = order.items.len(),
            "Order committed"
        );
        Ok(CommitResult::Committed(order_id))
    }

    fn partial_commit(&self, order_id: &str, d: &Demand<'_>, source: StoreError) -> CommitError {
        error!(
            order_id,
            product_id = d.product_id,
            quantity_delta = -d.quantity,
            error = %source,
            "Order committed but stock update failed; stock is overstated at the store"
        );
        if source.is_unreachable() {
            self.connectivity.mark_unreachable();
        }
        CommitError::Failed(EngineError::PartialCommit {
            order_id: order_id.to_string(),
            product_id: d.product_id.to_string(),
            source,
        })
    }

    // -- reconciliation -----------------------------------------------------

    /// Replay pending queue entries against the store, oldest first.
    ///
    /// Only one pass runs at a time; a call made while another is running
    /// returns a skipped report immediately.
    pub async fn sync(&self) -> SyncReport {
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            debug!("Sync already in progress, skipping");
            return SyncReport::skipped();
        };

        if let Err(e) = self.queue.flush_settled() {
            warn!(error = %e, "Offline queue still cannot be written");
        }

        let pending: Vec<QueuedOrder> = self
            .queue
            .snapshot()
            .into_iter()
            .filter(|o| o.status == QueuedOrderStatus::Pending)
            .collect();

        let mut report = SyncReport::default();
        if !pending.is_empty() {
            info!(pending = pending.len(), "Syncing offline orders");
        }

        for entry in pending {
            report.attempted += 1;
            let local_id = entry.local_id.clone();

            match self.commit_online(&entry.to_request()).await {
                Ok(CommitResult::Committed(remote_id)) => {
                    info!(local_id = %local_id, order_id = %remote_id, "Offline order synced");
                    let settled = self.queue.settle(&local_id);
                    report.synced.push((local_id, remote_id));
                    if let Err(e) = settled {
                        error!(error = %e, "Offline queue cannot be written, stopping sync pass");
                        break;
                    }
                }
                Ok(CommitResult::Rejected(conflicts)) => {
                    let messages: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
                    if let Err(e) = self.queue.mark_conflict(&local_id, messages.clone()) {
                        error!(local_id = %local_id, error = %e, "Failed to mark order as conflicted");
                        report.failed.push((local_id, e.to_string()));
                        break;
                    }
                    warn!(local_id = %local_id, conflicts = ?messages, "Offline order conflicts with current stock");
                    report.conflicted.push((local_id, messages));
                }
                Err(CommitError::Unreachable(e)) => {
                    warn!(local_id = %local_id, error = %e, "Store unreachable, stopping sync pass");
                    self.connectivity.mark_unreachable();
                    break;
                }
                Err(CommitError::Failed(e)) => match e.committed_order_id() {
                    // The store holds the order; replaying it would duplicate it.
                    Some(order_id) => {
                        let order_id = order_id.to_string();
                        let settled = self.queue.settle(&local_id);
                        report.partial.push((local_id, order_id));
                        if let Err(e) = settled {
                            error!(error = %e, "Offline queue cannot be written, stopping sync pass");
                            break;
                        }
                    }
                    None => {
                        warn!(local_id = %local_id, error = %e, "Offline order sync failed, will retry");
                        report.failed.push((local_id, e.to_string()));
                    }
                },
            }
        }

        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced.len(),
                conflicted = report.conflicted.len(),
                failed = report.failed.len(),
                "Sync pass finished"
            );
        }
        report
    }

    /// Probe the store on an interval and sync whenever connectivity comes
    /// back while orders are pending. Each finished pass is handed to
    /// `on_report`.
    pub fn spawn_connectivity_loop<F>(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        on_report: F,
    ) -> JoinHandle<()>
    where
        F: Fn(SyncReport) + Send + Sync + 'static,
    {
        let engine = Arc::clone(self);
        let mut changes = self.connectivity.subscribe();

        tokio::spawn(async move {
            let poll = engine.config.connectivity_poll;
            info!(interval_ms = poll.as_millis() as u64, "Connectivity loop started");
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous_online: Option<bool> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Connectivity loop stopped");
                        return;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let reachable = engine.store.ping().await.is_ok();
                        engine.connectivity.observe_probe(reachable);
                    }
                }

                let online = *changes.borrow_and_update();
                if online && previous_online != Some(true) && engine.pending_orders_count() > 0 {
                    info!("Connectivity restored; syncing offline orders");
                    let report = engine.sync().await;
                    if !report.skipped {
                        on_report(report);
                    }
                }
                previous_online = Some(online);
            }
        })
    }

    // -- inventory ----------------------------------------------------------

    fn ensure_online(&self) -> EngineResult<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(EngineError::Offline)
        }
    }

    fn online_error(&self, err: StoreError) -> EngineError {
        if err.is_unreachable() {
            self.connectivity.mark_unreachable();
            EngineError::Offline
        } else {
            err.into()
        }
    }

    /// Increase stock by `quantity`. Returns the new level.
    pub async fn add_stock(
        &self,
        product_id: &str,
        quantity: i64,
        reason: AdjustmentReason,
    ) -> EngineResult<i64> {
        if reason == AdjustmentReason::Order {
            return Err(EngineError::InvalidInput(
                "stock additions must be a restock or adjustment".into(),
            ));
        }
        if quantity <= 0 {
            return Err(EngineError::InvalidInput(
                "quantity to add must be positive".into(),
            ));
        }
        self.ensure_online()?;

        let product = self
            .store
            .get_product(product_id)
            .await
            .map_err(|e| self.online_error(e))?
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        let updated = self
            .store
            .set_stock(product_id, product.stock_quantity + quantity)
            .await
            .map_err(|e| self.online_error(e))?;

        self.record_adjustment(product_id, quantity, reason, updated.stock_quantity)
            .await?;
        info!(
            product_id,
            quantity_delta = quantity,
            reason = reason.as_str(),
            resulting_stock = updated.stock_quantity,
            "Stock added"
        );
        Ok(updated.stock_quantity)
    }

    /// Apply a signed manual correction, clamping the result at zero. The
    /// audit record carries the delta actually applied.
    pub async fn adjust_stock(&self, product_id: &str, delta: i64) -> EngineResult<i64> {
        if delta == 0 {
            return Err(EngineError::InvalidInput("adjustment must be non-zero".into()));
        }
        self.ensure_online()?;

        let product = self
            .store
            .get_product(product_id)
            .await
            .map_err(|e| self.online_error(e))?
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        let new_stock = (product.stock_quantity + delta).max(0);
        let effective = new_stock - product.stock_quantity;

        let updated = self
            .store
            .set_stock(product_id, new_stock)
            .await
            .map_err(|e| self.online_error(e))?;
        self.record_adjustment(
            product_id,
            effective,
            AdjustmentReason::Adjustment,
            updated.stock_quantity,
        )
        .await?;

        if effective != delta {
            warn!(product_id, requested = delta, applied = effective, "Stock adjustment clamped at zero");
        }
        info!(product_id, quantity_delta = effective, resulting_stock = updated.stock_quantity, "Stock adjusted");
        Ok(updated.stock_quantity)
    }

    async fn record_adjustment(
        &self,
        product_id: &str,
        quantity_delta: i64,
        reason: AdjustmentReason,
        resulting_stock: i64,
    ) -> EngineResult<()> {
        let record = StockAdjustmentRecord {
            product_id: product_id.to_string(),
            quantity_delta,
            reason,
            resulting_stock,
            order_id: None,
        };
        self.store.record_stock_adjustment(&record).await.map_err(|e| {
            error!(
                product_id,
                quantity_delta,
                reason = reason.as_str(),
                error = %e,
                "Stock changed but the adjustment record was not written"
            );
            self.online_error(e)
        })
    }

    // -- reporting ----------------------------------------------------------

    pub async fn get_sales_analytics(&self, range: DateRange) -> EngineResult<SalesAnalytics> {
        if range.start > range.end {
            return Err(EngineError::InvalidInput(
                "range start is after its end".into(),
            ));
        }
        self.ensure_online()?;
        let orders = self
            .store
            .fetch_completed_orders(&range)
            .await
            .map_err(|e| self.online_error(e))?;
        Ok(analytics::aggregate(
            &orders,
            &range,
            self.config.top_products_limit,
        ))
    }

    // -- queue inspection ---------------------------------------------------

    pub fn pending_orders_count(&self) -> usize {
        self.queue.count_with_status(QueuedOrderStatus::Pending)
    }

    /// Entries parked as conflicts, awaiting manual resolution.
    pub fn conflicted_orders(&self) -> Vec<QueuedOrder> {
        self.queue
            .snapshot()
            .into_iter()
            .filter(|o| o.status == QueuedOrderStatus::Conflict)
            .collect()
    }

    pub fn queued_orders(&self) -> Vec<QueuedOrder> {
        self.queue.snapshot()
    }

    /// Drop every conflicted entry. They are never resubmitted.
    pub fn clear_resolved_conflicts(&self) -> EngineResult<usize> {
        let removed = self.queue.remove_with_status(QueuedOrderStatus::Conflict)?;
        if removed > 0 {
            info!(removed, "Cleared conflicted offline orders");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{CompletedOrder, CompletedOrderItem, OrderLineRequest};
    use crate::test_support::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn line(id: &str, name: &str, qty: i64) -> OrderLineRequest {
        OrderLineRequest::new(id, name, qty, Decimal::from(10), Decimal::new(50, 2))
    }

    fn order(items: Vec<OrderLineRequest>) -> OrderRequest {
        OrderRequest::new("Ana", "555-0100", items)
    }

    fn engine_with(store: MemoryStore) -> (Arc<OrderEngine<MemoryStore>>, Arc<DbState>) {
        let db = Arc::new(db::open_in_memory_for_test());
        let engine =
            OrderEngine::new(Arc::new(store), db.clone(), EngineConfig::default()).unwrap();
        (Arc::new(engine), db)
    }

    #[tokio::test]
    async fn online_order_decrements_stock_exactly() {
        let store = MemoryStore::new()
            .with_product("a", "A", 10)
            .with_product("b", "B", 5);
        let (engine, _db) = engine_with(store);

        let outcome = engine
            .process_order(order(vec![line("a", "A", 3), line("b", "B", 2), line("a", "A", 1)]))
            .await
            .unwrap();

        assert_eq!(outcome, OrderOutcome::Committed(OrderId::Remote("ord-1".into())));
        let store = engine.store();
        assert_eq!(store.stock("a"), Some(6));
        assert_eq!(store.stock("b"), Some(3));

        let state = store.state();
        // one stock read per distinct product
        assert_eq!(state.product_reads, 2);
        let deltas: Vec<(&str, i64, i64)> = state
            .adjustments
            .iter()
            .map(|r| (r.product_id.as_str(), r.quantity_delta, r.resulting_stock))
            .collect();
        assert_eq!(deltas, vec![("a", -4, 6), ("b", -2, 3)]);
        assert!(state
            .adjustments
            .iter()
            .all(|r| r.reason == AdjustmentReason::Order && r.order_id.as_deref() == Some("ord-1")));
    }

    #[tokio::test]
    async fn conflicts_list_every_item_and_write_nothing() {
        let store = MemoryStore::new()
            .with_product("a", "A", 1)
            .with_product("b", "B", 0)
            .with_product("c", "C", 5);
        let (engine, _db) = engine_with(store);

        let outcome = engine
            .process_order(order(vec![
                line("a", "A", 2),
                line("b", "B", 1),
                line("c", "C", 1),
                line("d", "D", 1),
            ]))
            .await
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(
            outcome.conflict_messages(),
            vec!["A (only 1 available)", "B (only 0 available)", "D (not found)"]
        );
        let store = engine.store();
        assert_eq!(store.stock("a"), Some(1));
        assert_eq!(store.stock("c"), Some(5));
        let state = store.state();
        assert!(state.orders.is_empty());
        assert!(state.adjustments.is_empty());
    }

    #[tokio::test]
    async fn offline_orders_are_queued_pending() {
        let store = MemoryStore::new().with_product("a", "A", 10);
        store.set_reachable(false);
        let (engine, db) = engine_with(store);
        engine.connectivity().set_platform_online(false);

        for _ in 0..3 {
            let outcome = engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();
            let id = outcome.order_id().unwrap();
            assert!(!id.is_committed());
            assert!(id.as_str().starts_with("local-"));
        }

        assert_eq!(engine.pending_orders_count(), 3);
        assert!(engine.store().state().orders.is_empty());

        let reloaded = OfflineQueue::load(db, EngineConfig::default().queue_slot).unwrap();
        assert_eq!(reloaded.count_with_status(QueuedOrderStatus::Pending), 3);
    }

    #[tokio::test]
    async fn unreachable_store_routes_order_offline() {
        let store = MemoryStore::new().with_product("a", "A", 10);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        assert!(engine.connectivity().is_online());

        let outcome = engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        assert!(matches!(outcome, OrderOutcome::Queued(OrderId::Local(_))));
        assert!(!engine.connectivity().is_online());
    }

    #[tokio::test]
    async fn commission_is_exact() {
        let store = MemoryStore::new().with_product("a", "A", 10).with_product("b", "B", 10);
        let (engine, _db) = engine_with(store);

        let req = order(vec![
            OrderLineRequest::new("a", "A", 3, Decimal::new(1999, 2), Decimal::new(10, 2)),
            OrderLineRequest::new("b", "B", 7, Decimal::new(450, 2), Decimal::new(35, 2)),
        ]);
        engine.process_order(req).await.unwrap();

        let state = engine.store().state();
        let (_, stored) = &state.orders[0];
        assert_eq!(stored.total_commission, Decimal::new(275, 2));
        assert_eq!(stored.total_amount, Decimal::new(9147, 2));
    }

    #[tokio::test]
    async fn sync_gives_earlier_orders_first_claim_on_stock() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.connectivity().set_platform_online(false);

        let first = engine.process_order(order(vec![line("a", "A", 3)])).await.unwrap();
        let second = engine.process_order(order(vec![line("a", "A", 3)])).await.unwrap();
        assert_eq!(engine.pending_orders_count(), 2);

        engine.store().set_reachable(true);
        engine.connectivity().set_platform_online(true);
        let report = engine.sync().await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.synced[0].0, first.order_id().unwrap().as_str());
        assert_eq!(
            report.conflicted,
            vec![(
                second.order_id().unwrap().to_string(),
                vec!["A (only 2 available)".to_string()]
            )]
        );
        assert_eq!(engine.store().stock("a"), Some(2));

        let queued = engine.queued_orders();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, QueuedOrderStatus::Conflict);
        assert_eq!(queued[0].conflicts, vec!["A (only 2 available)"]);
        assert_eq!(engine.pending_orders_count(), 0);

        // conflicts are never retried automatically
        let again = engine.sync().await;
        assert_eq!(again.attempted, 0);
        assert_eq!(engine.store().state().orders.len(), 1);
        assert!(engine.last_sync().is_some());
    }

    #[tokio::test]
    async fn sync_stops_when_store_goes_away() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);

        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();
        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        let report = engine.sync().await;
        assert_eq!(report.attempted, 1);
        assert!(report.synced.is_empty());
        assert_eq!(engine.pending_orders_count(), 2);
    }

    #[tokio::test]
    async fn overlapping_sync_is_skipped() {
        let (engine, _db) = engine_with(MemoryStore::new());
        let _running = SyncGuard::acquire(&engine.syncing).unwrap();

        let report = engine.sync().await;
        assert!(report.skipped);
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn sync_guard_is_released_after_pass() {
        let (engine, _db) = engine_with(MemoryStore::new());
        assert!(!engine.sync().await.skipped);
        assert!(!engine.sync().await.skipped);
    }

    #[tokio::test]
    async fn persistence_failure_rejects_order_and_keeps_queue() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let (engine, db) = engine_with(store);
        engine.connectivity().set_platform_online(false);

        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE local_settings")
            .unwrap();

        let err = engine
            .process_order(order(vec![line("a", "A", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(engine.queued_orders().len(), 1);
    }

    #[tokio::test]
    async fn failed_decrement_after_insert_is_partial_commit() {
        let store = MemoryStore::new()
            .with_product("a", "A", 5)
            .with_product("b", "B", 5);
        store.state().fail_decrement_for = Some("b".into());
        let (engine, _db) = engine_with(store);

        let err = engine
            .process_order(order(vec![line("a", "A", 1), line("b", "B", 1)]))
            .await
            .unwrap_err();

        match err {
            EngineError::PartialCommit {
                order_id,
                product_id,
                ..
            } => {
                assert_eq!(order_id, "ord-1");
                assert_eq!(product_id, "b");
            }
            other => panic!("expected partial commit, got {other:?}"),
        }
        assert_eq!(engine.store().stock("a"), Some(4));
        assert_eq!(engine.store().stock("b"), Some(5));
        assert!(engine.queued_orders().is_empty());
    }

    #[tokio::test]
    async fn partial_commit_during_sync_leaves_queue() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        engine.store().set_reachable(true);
        engine.store().state().fail_decrement_for = Some("a".into());
        let report = engine.sync().await;

        assert_eq!(report.partial.len(), 1);
        assert_eq!(report.partial[0].1, "ord-1");
        assert!(engine.queued_orders().is_empty());
        assert_eq!(report.notifications().len(), 1);
    }

    fn move_slot_table(db: &DbState, from: &str, to: &str) {
        db.conn
            .lock()
            .unwrap()
            .execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
            .unwrap();
    }

    #[tokio::test]
    async fn synced_order_is_not_replayed_when_queue_write_fails() {
        let store = MemoryStore::new().with_product("a", "A", 10);
        store.set_reachable(false);
        let (engine, db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        engine.store().set_reachable(true);
        move_slot_table(&db, "local_settings", "local_settings_moved");

        let first = engine.sync().await;
        assert_eq!(first.synced.len(), 1);
        assert!(first.failed.is_empty());
        assert_eq!(engine.pending_orders_count(), 0);

        let second = engine.sync().await;
        assert_eq!(second.attempted, 0);
        assert_eq!(engine.store().state().orders.len(), 1);
        assert_eq!(engine.store().stock("a"), Some(9));

        move_slot_table(&db, "local_settings_moved", "local_settings");
        engine.sync().await;
        assert!(engine.queued_orders().is_empty());
        let reloaded = OfflineQueue::load(db, EngineConfig::default().queue_slot).unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn orphaned_header_is_not_queued_offline() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.state().orphan_inserts = true;
        let (engine, _db) = engine_with(store);

        let err = engine
            .process_order(order(vec![line("a", "A", 1)]))
            .await
            .unwrap_err();

        assert_eq!(err.committed_order_id(), Some("ord-1"));
        assert!(engine.queued_orders().is_empty());
        assert!(engine.connectivity().is_online());
        assert_eq!(engine.store().stock("a"), Some(5));
    }

    #[tokio::test]
    async fn orphaned_header_during_sync_is_reported_once() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        engine.store().set_reachable(true);
        engine.store().state().orphan_inserts = true;
        let report = engine.sync().await;

        assert_eq!(report.partial.len(), 1);
        assert_eq!(report.partial[0].1, "ord-1");
        assert!(report.failed.is_empty());
        assert!(engine.queued_orders().is_empty());

        engine.sync().await;
        assert_eq!(engine.store().state().orders.len(), 1);
    }

    #[tokio::test]
    async fn store_rejection_keeps_entry_pending() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 1)])).await.unwrap();

        engine.store().set_reachable(true);
        engine.store().state().reject_inserts = true;
        let report = engine.sync().await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(engine.pending_orders_count(), 1);
    }

    #[tokio::test]
    async fn invalid_orders_are_rejected_up_front() {
        let (engine, _db) = engine_with(MemoryStore::new());
        let err = engine.process_order(order(vec![])).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let err = engine
            .process_order(order(vec![line("a", "A", 0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(engine.queued_orders().is_empty());
    }

    #[tokio::test]
    async fn add_stock_records_restock() {
        let store = MemoryStore::new().with_product("a", "A", 0);
        let (engine, _db) = engine_with(store);

        let level = engine.add_stock("a", 12, AdjustmentReason::Restock).await.unwrap();
        assert_eq!(level, 12);

        let state = engine.store().state();
        assert!(!state.products["a"].is_out_of_stock);
        assert_eq!(
            state.adjustments,
            vec![StockAdjustmentRecord {
                product_id: "a".into(),
                quantity_delta: 12,
                reason: AdjustmentReason::Restock,
                resulting_stock: 12,
                order_id: None,
            }]
        );
    }

    #[tokio::test]
    async fn add_stock_validates_and_requires_connectivity() {
        let store = MemoryStore::new().with_product("a", "A", 1);
        let (engine, _db) = engine_with(store);

        assert!(matches!(
            engine.add_stock("a", 1, AdjustmentReason::Order).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.add_stock("a", 0, AdjustmentReason::Restock).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.add_stock("zzz", 1, AdjustmentReason::Restock).await,
            Err(EngineError::Store(StoreError::NotFound(_)))
        ));

        engine.connectivity().set_platform_online(false);
        assert!(matches!(
            engine.add_stock("a", 1, AdjustmentReason::Adjustment).await,
            Err(EngineError::Offline)
        ));
        assert_eq!(engine.store().stock("a"), Some(1));
    }

    #[tokio::test]
    async fn adjust_stock_clamps_at_zero() {
        let store = MemoryStore::new().with_product("a", "A", 3);
        let (engine, _db) = engine_with(store);

        let level = engine.adjust_stock("a", -5).await.unwrap();
        assert_eq!(level, 0);

        let state = engine.store().state();
        assert!(state.products["a"].is_out_of_stock);
        assert_eq!(state.adjustments[0].quantity_delta, -3);
        assert_eq!(state.adjustments[0].reason, AdjustmentReason::Adjustment);
    }

    #[tokio::test]
    async fn sales_analytics_reads_completed_orders() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2026, 10, 10, 9, 0, 0).unwrap();
        store.state().completed.push(CompletedOrder {
            id: "o1".into(),
            created_at: at,
            total_amount: Decimal::from(30),
            total_commission: Decimal::new(150, 2),
            items: vec![CompletedOrderItem {
                product_id: "a".into(),
                product_name: "A".into(),
                quantity: 3,
                subtotal: Decimal::from(30),
            }],
        });
        let (engine, _db) = engine_with(store);
        let range = DateRange::last_days(30, Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap());

        let stats = engine.get_sales_analytics(range).await.unwrap();
        assert_eq!(stats.total_orders, 1);
        assert_eq!(stats.top_products[0].quantity, 3);

        engine.connectivity().set_platform_online(false);
        assert!(matches!(
            engine.get_sales_analytics(range).await,
            Err(EngineError::Offline)
        ));
    }

    #[tokio::test]
    async fn clearing_conflicts_never_resubmits() {
        let store = MemoryStore::new().with_product("a", "A", 1);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 2)])).await.unwrap();
        engine.process_order(order(vec![line("a", "A", 5)])).await.unwrap();

        engine.store().set_reachable(true);
        let report = engine.sync().await;
        assert_eq!(report.conflicted.len(), 2);
        assert_eq!(engine.conflicted_orders().len(), 2);

        assert_eq!(engine.clear_resolved_conflicts().unwrap(), 2);
        assert!(engine.queued_orders().is_empty());
        assert!(engine.store().state().orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_loop_syncs_when_store_returns() {
        let store = MemoryStore::new().with_product("a", "A", 5);
        store.set_reachable(false);
        let (engine, _db) = engine_with(store);
        engine.process_order(order(vec![line("a", "A", 2)])).await.unwrap();
        assert_eq!(engine.pending_orders_count(), 1);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = engine.spawn_connectivity_loop(shutdown.clone(), move |report| {
            let _ = tx.send(report);
        });

        // still unreachable: the probe keeps connectivity down
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rx.try_recv().is_err());
        assert!(!engine.connectivity().is_online());

        engine.store().set_reachable(true);
        let report = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.synced.len(), 1);
        assert_eq!(engine.store().stock("a"), Some(3));
        assert_eq!(engine.pending_orders_count(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn report_notifications_summarise_pass() {
        let report = SyncReport {
            attempted: 3,
            synced: vec![("local-1".into(), "ord-1".into())],
            conflicted: vec![("local-2".into(), vec!["A (only 2 available)".into()])],
            failed: vec![("local-3".into(), "HTTP 400".into())],
            ..SyncReport::default()
        };
        let titles: Vec<String> = report.notifications().into_iter().map(|n| n.title).collect();
        assert_eq!(
            titles,
            vec!["Offline orders synced", "Order needs attention", "Sync incomplete"]
        );
        assert!(SyncReport::skipped().notifications().is_empty());
    }
}
