//! Order, queue, and stock types shared by the engine and the store client.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Order requests
// ---------------------------------------------------------------------------

/// One line of a prospective order. Immutable once handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    #[serde(default)]
    pub unit_commission: Decimal,
}

impl OrderLineRequest {
    pub fn new(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        quantity: i64,
        unit_price: Decimal,
        unit_commission: Decimal,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            unit_price,
            unit_commission,
        }
    }

    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }

    pub fn commission(&self) -> Decimal {
        self.unit_commission * Decimal::from(self.quantity)
    }
}

/// A prospective order as submitted by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub items: Vec<OrderLineRequest>,
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl OrderRequest {
    pub fn new(
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        items: Vec<OrderLineRequest>,
    ) -> Self {
        Self {
            items,
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            ..Default::default()
        }
    }

    pub fn total_amount(&self) -> Decimal {
        self.items.iter().map(OrderLineRequest::subtotal).sum()
    }

    pub fn total_commission(&self) -> Decimal {
        self.items.iter().map(OrderLineRequest::commission).sum()
    }
}

// ---------------------------------------------------------------------------
// Order identity
// ---------------------------------------------------------------------------

/// Prefix of synthetic ids. Canonical ids are UUIDs and never start with it.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// An order id is either synthetic (queued locally, not yet committed) or
/// issued by the canonical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OrderId {
    Local(String),
    Remote(String),
}

impl OrderId {
    /// Synthesize a fresh local id: `local-<unix-ms>-<8 hex>`.
    pub fn new_local() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        OrderId::Local(format!(
            "{LOCAL_ID_PREFIX}{}-{}",
            Utc::now().timestamp_millis(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderId::Local(id) | OrderId::Remote(id) => id,
        }
    }

    /// True once the order exists at the canonical store.
    pub fn is_committed(&self) -> bool {
        matches!(self, OrderId::Remote(_))
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Durable queue records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedOrderStatus {
    Pending,
    /// Accepted by the store, but its removal has not reached disk yet.
    /// Held in memory only; never written to the slot and never replayed.
    Synced,
    Conflict,
}

/// An order accepted while the canonical store was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOrder {
    pub local_id: String,
    pub items: Vec<OrderLineRequest>,
    pub total_amount: Decimal,
    pub total_commission: Decimal,
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub status: QueuedOrderStatus,
    /// Conflict messages from the last reconciliation attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

impl QueuedOrder {
    pub fn from_request(local_id: String, req: OrderRequest, submitted_at: DateTime<Utc>) -> Self {
        let total_amount = req.total_amount();
        let total_commission = req.total_commission();
        Self {
            local_id,
            items: req.items,
            total_amount,
            total_commission,
            customer_name: req.customer_name,
            customer_phone: req.customer_phone,
            branch_id: req.branch_id,
            pickup_time: req.pickup_time,
            payment_method: req.payment_method,
            payment_reference: req.payment_reference,
            payment_attachment_url: req.payment_attachment_url,
            user_id: req.user_id,
            submitted_at,
            status: QueuedOrderStatus::Pending,
            conflicts: Vec::new(),
        }
    }

    /// Rebuild the request this entry was queued from, for replay.
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            items: self.items.clone(),
            customer_name: self.customer_name.clone(),
            customer_phone: self.customer_phone.clone(),
            branch_id: self.branch_id.clone(),
            pickup_time: self.pickup_time,
            payment_method: self.payment_method.clone(),
            payment_reference: self.payment_reference.clone(),
            payment_attachment_url: self.payment_attachment_url.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Products and stock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub stock_quantity: i64,
    #[serde(default)]
    pub is_out_of_stock: bool,
}

/// Result of a conditional stock decrement at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub previous: i64,
    pub resulting: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    Order,
    Restock,
    Adjustment,
}

impl AdjustmentReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentReason::Order => "order",
            AdjustmentReason::Restock => "restock",
            AdjustmentReason::Adjustment => "adjustment",
        }
    }
}

/// Append-only audit entry for every stock movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustmentRecord {
    pub product_id: String,
    pub quantity_delta: i64,
    pub reason: AdjustmentReason,
    pub resulting_stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// One item that cannot be filled from current stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockConflict {
    pub product_id: String,
    pub product_name: String,
    pub requested: i64,
    /// `None` when the product does not exist at the store.
    pub available: Option<i64>,
}

impl fmt::Display for StockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.available {
            Some(n) => write!(f, "{} (only {} available)", self.product_name, n),
            None => write!(f, "{} (not found)", self.product_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of `OrderEngine::process_order`.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    /// Committed at the canonical store.
    Committed(OrderId),
    /// Accepted into the durable local queue.
    Queued(OrderId),
    /// Not committed; every insufficient item is listed.
    Rejected(Vec<StockConflict>),
}

impl OrderOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, OrderOutcome::Rejected(_))
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            OrderOutcome::Committed(id) | OrderOutcome::Queued(id) => Some(id),
            OrderOutcome::Rejected(_) => None,
        }
    }

    pub fn conflicts(&self) -> &[StockConflict] {
        match self {
            OrderOutcome::Rejected(c) => c,
            _ => &[],
        }
    }

    pub fn conflict_messages(&self) -> Vec<String> {
        self.conflicts().iter().map(ToString::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Store write shapes
// ---------------------------------------------------------------------------

/// Order header plus items, inserted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrder {
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub total_amount: Decimal,
    pub total_commission: Decimal,
    pub status: String,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub commission: Decimal,
}

impl NewOrder {
    pub fn from_request(req: &OrderRequest) -> Self {
        Self {
            customer_name: req.customer_name.clone(),
            customer_phone: req.customer_phone.clone(),
            branch_id: req.branch_id.clone(),
            pickup_time: req.pickup_time,
            payment_method: req.payment_method.clone(),
            payment_reference: req.payment_reference.clone(),
            payment_attachment_url: req.payment_attachment_url.clone(),
            user_id: req.user_id.clone(),
            total_amount: req.total_amount(),
            total_commission: req.total_commission(),
            status: "pending".to_string(),
            items: req
                .items
                .iter()
                .map(|line| NewOrderItem {
                    product_id: line.product_id.clone(),
                    product_name: line.product_name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    subtotal: line.subtotal(),
                    commission: line.commission(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store read shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOrderItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub subtotal: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOrder {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub total_amount: Decimal,
    #[serde(default)]
    pub total_commission: Decimal,
    #[serde(default, alias = "order_items")]
    pub items: Vec<CompletedOrderItem>,
}

/// Row used for the order-family snapshot delivered after change events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: String,
    #[serde(default)]
    pub customer_name: String,
    pub status: String,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
}
