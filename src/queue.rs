//! Durable local queue of orders accepted while offline.
//!
//! The queue is one JSON array stored in a single local slot and fully
//! overwritten on every mutation. Mutations are applied to a copy, flushed,
//! and only then swapped into memory, so a failed flush leaves both the
//! in-memory and on-disk queue at the previous state.
//!
//! `settle` is the one exception. An entry the store has already accepted
//! must never be replayed, so when its removal cannot be flushed it stays in
//! memory as `Synced` and is purged by the next successful write.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::db::{self, DbState};
use crate::error::DbError;
use crate::models::{QueuedOrder, QueuedOrderStatus};

pub struct OfflineQueue {
    db: Arc<DbState>,
    slot: String,
    orders: Mutex<Vec<QueuedOrder>>,
}

impl OfflineQueue {
    /// Load the queue from `slot`. A missing slot is an empty queue; an
    /// unreadable slot is an error so queued orders are never silently lost.
    pub fn load(db: Arc<DbState>, slot: impl Into<String>) -> Result<Self, DbError> {
        let slot = slot.into();
        let orders: Vec<QueuedOrder> = match db::read_local_json(&db, &slot) {
            Ok(orders) => orders.unwrap_or_default(),
            Err(e) => {
                error!(slot = %slot, error = %e, "Offline queue slot is unreadable");
                return Err(e);
            }
        };
        if !orders.is_empty() {
            info!(
                slot = %slot,
                count = orders.len(),
                "Loaded offline queue"
            );
        }
        Ok(Self {
            db,
            slot,
            orders: Mutex::new(orders),
        })
    }

    /// Copy of the current queue, in submission order.
    pub fn snapshot(&self) -> Vec<QueuedOrder> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.orders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_with_status(&self, status: QueuedOrderStatus) -> usize {
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| o.status == status)
            .count()
    }

    pub fn append(&self, order: QueuedOrder) -> Result<(), DbError> {
        let local_id = order.local_id.clone();
        self.mutate(|orders| orders.push(order))?;
        debug!(local_id = %local_id, "Appended order to offline queue");
        Ok(())
    }

    /// Remove an entry by local id. Returns the removed entry, if any.
    pub fn remove(&self, local_id: &str) -> Result<Option<QueuedOrder>, DbError> {
        self.mutate(|orders| {
            let idx = orders.iter().position(|o| o.local_id == local_id)?;
            Some(orders.remove(idx))
        })
    }

    /// Mark an entry as conflicting and keep its conflict messages.
    pub fn mark_conflict(&self, local_id: &str, conflicts: Vec<String>) -> Result<bool, DbError> {
        self.mutate(|orders| match orders.iter_mut().find(|o| o.local_id == local_id) {
            Some(order) => {
                order.status = QueuedOrderStatus::Conflict;
                order.conflicts = conflicts;
                true
            }
            None => false,
        })
    }

    /// Remove every entry with `status`. Returns how many were removed.
    pub fn remove_with_status(&self, status: QueuedOrderStatus) -> Result<usize, DbError> {
        self.mutate(|orders| {
            let before = orders.len();
            orders.retain(|o| o.status != status);
            before - orders.len()
        })
    }

    /// Drop an entry the store has accepted.
    ///
    /// On a failed flush the entry is kept in memory as `Synced` so it is not
    /// replayed, and the error is returned. The disk still holds it as
    /// pending until a later write succeeds.
    pub fn settle(&self, local_id: &str) -> Result<(), DbError> {
        let mut guard = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        next.retain(|o| o.local_id != local_id && o.status != QueuedOrderStatus::Synced);
        match db::write_local_json(&self.db, &self.slot, &next) {
            Ok(()) => {
                *guard = next;
                Ok(())
            }
            Err(e) => {
                if let Some(order) = guard.iter_mut().find(|o| o.local_id == local_id) {
                    order.status = QueuedOrderStatus::Synced;
                }
                warn!(local_id, error = %e, "Committed order kept in memory until the queue can be flushed");
                Err(e)
            }
        }
    }

    /// Retry the flush for entries left behind by a failed `settle`.
    pub fn flush_settled(&self) -> Result<usize, DbError> {
        if self.count_with_status(QueuedOrderStatus::Synced) == 0 {
            return Ok(0);
        }
        let purged = self.mutate(|orders| {
            orders
                .iter()
                .filter(|o| o.status == QueuedOrderStatus::Synced)
                .count()
        })?;
        info!(purged, "Flushed settled orders from the offline queue");
        Ok(purged)
    }

    /// Apply `f` to a copy, purge settled entries, flush, then swap.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<QueuedOrder>) -> R) -> Result<R, DbError> {
        let mut guard = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        let out = f(&mut next);
        next.retain(|o| o.status != QueuedOrderStatus::Synced);
        db::write_local_json(&self.db, &self.slot, &next)?;
        *guard = next;
        Ok(out)
    }
}
