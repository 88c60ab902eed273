//! Error types for the engine, the canonical store boundary, and the
//! realtime manager.
//!
//! Stock conflicts are deliberately absent: an order that cannot be filled is
//! an expected business outcome and travels as `OrderOutcome::Rejected`.

use thiserror::Error;

/// Failures talking to the canonical store (REST, RPC, or changefeed).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all (connect failure, timeout, DNS).
    #[error("Canonical store unreachable: {0}")]
    Unreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The store answered with a non-success HTTP status.
    #[error("Canonical store error (HTTP {status}): {body}")]
    Status { status: u16, body: String },

    #[error("RPC {function} failed: {message}")]
    Rpc { function: String, message: String },

    /// A conditional write lost against a concurrent writer or would have
    /// driven stock negative.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Store not configured: {0}")]
    Config(String),

    /// The order header was written but its items were not, and the header
    /// could not be removed. Never treated as unreachable: the order exists.
    #[error("Order {order_id} was created without its items: {source}")]
    IncompleteOrder {
        order_id: String,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Whether this failure means "no connectivity" rather than "the store
    /// rejected the request". Unreachable orders are routed to the offline
    /// queue instead of failing.
    pub fn is_unreachable(&self) -> bool {
        match self {
            StoreError::Unreachable(_) => true,
            StoreError::Status { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            return StoreError::Unreachable(err.to_string());
        }
        if err.is_decode() {
            return StoreError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return StoreError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        StoreError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Failures of the local SQLite layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by `OrderEngine`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable queue could not be written. The order was NOT accepted.
    #[error("Failed to persist offline queue: {0}")]
    Persistence(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An online-only operation was attempted without connectivity.
    #[error("Canonical store is offline")]
    Offline,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The order header was written but a stock decrement (or its audit
    /// record) was not. Stock for `product_id` is overstated at the store.
    #[error("Order {order_id} committed but stock update for {product_id} failed: {source}")]
    PartialCommit {
        order_id: String,
        product_id: String,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    /// Id of the order already present at the store, if this failure
    /// happened after it was written.
    pub fn committed_order_id(&self) -> Option<&str> {
        match self {
            EngineError::PartialCommit { order_id, .. } => Some(order_id.as_str()),
            EngineError::Store(StoreError::IncompleteOrder { order_id, .. }) => Some(order_id.as_str()),
            _ => None,
        }
    }
}

/// Errors surfaced by `ConnectionManager`.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No active crew session")]
    NoActiveSession,
}

pub type EngineResult<T> = Result<T, EngineError>;
pub type StoreResult<T> = Result<T, StoreError>;
