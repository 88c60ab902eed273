//! Order Sync Core
//!
//! Offline-resilient order and inventory reconciliation for the ordering
//! front end, plus the realtime connection manager that streams order and
//! crew changes from the canonical store.
//!
//! ```ignore
//! let config = Config::load()?;
//! let _log_guard = logging::init_logging(&logging::default_log_dir())?;
//!
//! let db = Arc::new(db::init(&config.data_dir)?);
//! let store = Arc::new(SupabaseStore::new(&config.store)?);
//! let engine = Arc::new(OrderEngine::new(store.clone(), db, config.engine.clone())?);
//!
//! let manager = ConnectionManager::new(
//!     store,
//!     Arc::new(SupabaseChangefeed::new(&config.store)),
//!     config.realtime.clone(),
//! );
//! manager.initialize().await;
//! ```

pub mod analytics;
pub mod api;
pub mod changefeed;
pub mod config;
pub mod connectivity;
pub mod crew;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod queue;
pub mod realtime;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test_support;

pub use analytics::{DateRange, SalesAnalytics};
pub use api::SupabaseStore;
pub use changefeed::{ChangeEvent, Changefeed, Family, SupabaseChangefeed};
pub use config::Config;
pub use connectivity::Connectivity;
pub use engine::{OrderEngine, SyncReport};
pub use error::{EngineError, ManagerError, StoreError};
pub use models::{OrderId, OrderLineRequest, OrderOutcome, OrderRequest};
pub use notifications::{Notification, NotificationType};
pub use realtime::{ConnectionManager, ConnectionState, ConnectionStatus, RealtimeCallbacks};
pub use store::CanonicalStore;
