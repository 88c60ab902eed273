//! Realtime connection manager.
//!
//! Keeps exactly one changefeed subscription covering every monitored
//! family, reconnects with exponential backoff, and runs the crew heartbeat
//! and stale-session janitor. Each change is turned into a `Notification`
//! and the affected family's snapshot is re-read and handed to its handler.
//!
//! State machine:
//!
//! ```text
//! disconnected -> connecting -> connected
//!                     ^             | subscribe error / timeout / stream end
//!                     |             v
//!                     +------ reconnecting(n)   (sleep base * 2^(n-1))
//!
//! reconnecting(max) -> disconnected (terminal until the next initialize)
//! ```

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::changefeed::{ChangeEvent, Changefeed, Family};
use crate::config::RealtimeConfig;
use crate::crew::{CrewActivity, CrewSession, CrewStatus};
use crate::error::ManagerError;
use crate::models::OrderSummary;
use crate::notifications::Notification;
use crate::store::CanonicalStore;

pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Handlers registered by the presentation layer. At most one per kind.
#[derive(Clone, Default)]
pub struct RealtimeCallbacks {
    notification: Option<Handler<Notification>>,
    order_update: Option<Handler<Vec<OrderSummary>>>,
    crew_status: Option<Handler<Vec<CrewStatus>>>,
    crew_sessions: Option<Handler<Vec<CrewSession>>>,
    crew_activities: Option<Handler<Vec<CrewActivity>>>,
    connection_change: Option<Handler<bool>>,
}

impl RealtimeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notification(mut self, f: impl Fn(Notification) + Send + Sync + 'static) -> Self {
        self.notification = Some(Arc::new(f));
        self
    }

    pub fn on_order_update(
        mut self,
        f: impl Fn(Vec<OrderSummary>) + Send + Sync + 'static,
    ) -> Self {
        self.order_update = Some(Arc::new(f));
        self
    }

    pub fn on_crew_status(mut self, f: impl Fn(Vec<CrewStatus>) + Send + Sync + 'static) -> Self {
        self.crew_status = Some(Arc::new(f));
        self
    }

    pub fn on_crew_sessions(
        mut self,
        f: impl Fn(Vec<CrewSession>) + Send + Sync + 'static,
    ) -> Self {
        self.crew_sessions = Some(Arc::new(f));
        self
    }

    pub fn on_crew_activities(
        mut self,
        f: impl Fn(Vec<CrewActivity>) + Send + Sync + 'static,
    ) -> Self {
        self.crew_activities = Some(Arc::new(f));
        self
    }

    pub fn on_connection_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.connection_change = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempt: u32,
}

/// `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared<S, F> {
    store: Arc<S>,
    feed: Arc<F>,
    config: RealtimeConfig,
    state: Mutex<ConnectionState>,
    callbacks: RwLock<RealtimeCallbacks>,
    crew_user: Mutex<Option<String>>,
    /// Cancels the current subscription supervisor.
    connection: Mutex<Option<CancellationToken>>,
    /// Cancels the heartbeat and janitor.
    timers: Mutex<Option<CancellationToken>>,
}

impl<S: CanonicalStore, F: Changefeed> Shared<S, F> {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, status: ConnectionStatus, reconnect_attempt: u32) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState {
            status,
            reconnect_attempt,
        };
    }

    /// Set `status` unless `token` was cancelled. Checked under the state
    /// lock so a concurrent `disconnect` always has the last word.
    fn set_state_if_live(
        &self,
        token: &CancellationToken,
        status: ConnectionStatus,
        reconnect_attempt: u32,
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if token.is_cancelled() {
            return false;
        }
        *state = ConnectionState {
            status,
            reconnect_attempt,
        };
        true
    }

    fn crew_user(&self) -> Option<String> {
        self.crew_user.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Clone a handler out so it is never called under the lock.
    fn handler<T>(&self, pick: impl FnOnce(&RealtimeCallbacks) -> Option<Handler<T>>) -> Option<Handler<T>> {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        pick(&callbacks)
    }

    fn notify(&self, notification: Notification) {
        if let Some(handler) = self.handler(|c| c.notification.clone()) {
            handler(notification);
        }
    }

    fn emit_connection(&self, connected: bool) {
        if let Some(handler) = self.handler(|c| c.connection_change.clone()) {
            handler(connected);
        }
    }

    async fn dispatch(&self, event: ChangeEvent) {
        debug!(table = %event.table, event_type = ?event.event_type, "Realtime change");
        self.notify(Notification::from_change_event(&event));
        if let Some(family) = event.family() {
            self.refresh(family).await;
        }
    }

    /// Re-read one family and deliver it, if anyone is listening.
    async fn refresh(&self, family: Family) {
        let limit = self.config.snapshot_limit;
        let result = match family {
            Family::Orders => match self.handler(|c| c.order_update.clone()) {
                Some(h) => self.store.fetch_recent_orders(limit).await.map(|rows| h(rows)),
                None => Ok(()),
            },
            Family::CrewStatus => match self.handler(|c| c.crew_status.clone()) {
                Some(h) => self.store.get_crew_online_status().await.map(|rows| h(rows)),
                None => Ok(()),
            },
            Family::CrewSessions => match self.handler(|c| c.crew_sessions.clone()) {
                Some(h) => self.store.fetch_crew_sessions(limit).await.map(|rows| {
                    let now = Utc::now();
                    h(rows
                        .into_iter()
                        .map(|r| CrewSession::from_record(r, now))
                        .collect())
                }),
                None => Ok(()),
            },
            Family::CrewActivity => match self.handler(|c| c.crew_activities.clone()) {
                Some(h) => self.store.fetch_crew_activities(limit).await.map(|rows| h(rows)),
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!(table = family.table(), error = %e, "Failed to refresh snapshot");
        }
    }

    async fn refresh_all(&self) {
        for family in Family::ALL {
            self.refresh(family).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Owns the subscription: connect, pump, reconnect with backoff.
async fn supervise<S: CanonicalStore, F: Changefeed>(
    shared: Arc<Shared<S, F>>,
    token: CancellationToken,
    first_result: oneshot::Sender<bool>,
) {
    let mut first_result = Some(first_result);
    let mut attempt: u32 = 0;
    let mut has_connected = false;
    let max_attempts = shared.config.max_reconnect_attempts.max(1);

    loop {
        if token.is_cancelled() {
            return;
        }
        shared.set_state(ConnectionStatus::Connecting, attempt);

        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            r = tokio::time::timeout(
                shared.config.subscribe_timeout,
                shared.feed.subscribe(&Family::ALL),
            ) => r,
        };

        let failure = match subscribed {
            Ok(Ok(mut subscription)) => {
                if !shared.set_state_if_live(&token, ConnectionStatus::Connected, 0) {
                    return;
                }
                attempt = 0;
                info!(reconnect = has_connected, "Realtime connected");
                if let Some(tx) = first_result.take() {
                    let _ = tx.send(true);
                }
                shared.emit_connection(true);
                if has_connected {
                    shared.refresh_all().await;
                }
                has_connected = true;

                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        event = subscription.next() => match event {
                            Some(event) => shared.dispatch(event).await,
                            None => break,
                        },
                    }
                }
                if token.is_cancelled() {
                    return;
                }
                shared.emit_connection(false);
                "subscription stream closed".to_string()
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "subscribe timed out".to_string(),
        };

        if let Some(tx) = first_result.take() {
            let _ = tx.send(false);
        }
        if token.is_cancelled() {
            return;
        }

        attempt += 1;
        if attempt >= max_attempts {
            shared.set_state(ConnectionStatus::Disconnected, attempt);
            warn!(attempt, error = %failure, "Realtime connection lost, giving up");
            shared.notify(
                Notification::system(
                    "Realtime connection lost",
                    format!("Live updates stopped after {attempt} failed attempts"),
                )
                .with_data(json!({ "attempts": attempt, "error": failure })),
            );
            return;
        }

        let delay = backoff_delay(shared.config.reconnect_base, attempt);
        shared.set_state(ConnectionStatus::Reconnecting, attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Realtime subscription failed, reconnecting"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn heartbeat_loop<S: CanonicalStore, F: Changefeed>(
    shared: Arc<Shared<S, F>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip immediate tick

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if token.is_cancelled() || shared.state().status != ConnectionStatus::Connected {
            continue;
        }
        let Some(user_id) = shared.crew_user() else {
            continue;
        };
        let details = json!({ "timestamp": Utc::now().to_rfc3339() });
        if let Err(e) = shared
            .store
            .update_crew_activity(&user_id, "heartbeat", &details)
            .await
        {
            warn!(user_id = %user_id, error = %e, "Crew heartbeat failed");
        }
    }
}

async fn janitor_loop<S: CanonicalStore, F: Changefeed>(
    shared: Arc<Shared<S, F>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(shared.config.janitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match shared.store.cleanup_stale_crew_sessions().await {
            Ok(0) => {}
            Ok(closed) => info!(closed, "Closed stale crew sessions"),
            Err(e) => warn!(error = %e, "Stale crew session cleanup failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager<S: CanonicalStore, F: Changefeed> {
    inner: Arc<Shared<S, F>>,
}

impl<S: CanonicalStore, F: Changefeed> ConnectionManager<S, F> {
    pub fn new(store: Arc<S>, feed: Arc<F>, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                store,
                feed,
                config,
                state: Mutex::new(ConnectionState::default()),
                callbacks: RwLock::new(RealtimeCallbacks::default()),
                crew_user: Mutex::new(None),
                connection: Mutex::new(None),
                timers: Mutex::new(None),
            }),
        }
    }

    /// Open the subscription, replacing any previous one. Returns whether
    /// the first attempt succeeded; retries continue in the background.
    pub async fn initialize(&self) -> bool {
        let token = CancellationToken::new();
        let previous = self
            .inner
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.ensure_timers();

        let (tx, rx) = oneshot::channel();
        tokio::spawn(supervise(Arc::clone(&self.inner), token, tx));
        rx.await.unwrap_or(false)
    }

    fn ensure_timers(&self) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        tokio::spawn(heartbeat_loop(Arc::clone(&self.inner), token.child_token()));
        tokio::spawn(janitor_loop(Arc::clone(&self.inner), token.child_token()));
        debug!(
            heartbeat_secs = self.inner.config.heartbeat_interval.as_secs(),
            janitor_secs = self.inner.config.janitor_interval.as_secs(),
            "Realtime timers started"
        );
        *timers = Some(token);
    }

    /// Replace all handlers.
    pub fn set_callbacks(&self, callbacks: RealtimeCallbacks) {
        *self.inner.callbacks.write().unwrap_or_else(|e| e.into_inner()) = callbacks;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
    }

    /// Forward an externally built notification to the handler.
    pub fn publish(&self, notification: Notification) {
        self.inner.notify(notification);
    }

    /// Cancel the subscription and both timers.
    pub fn disconnect(&self) {
        self.cancel_tasks();
        self.inner.set_state(ConnectionStatus::Disconnected, 0);
        self.inner.emit_connection(false);
        info!("Realtime disconnected");
    }

    /// `disconnect` and drop every handler and the crew user.
    pub fn destroy(&self) {
        self.disconnect();
        *self.inner.callbacks.write().unwrap_or_else(|e| e.into_inner()) =
            RealtimeCallbacks::default();
        *self.inner.crew_user.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn cancel_tasks(&self) {
        let connection = self
            .inner
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = connection {
            token.cancel();
        }
        let timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = timers {
            token.cancel();
        }
    }

    // -- crew ---------------------------------------------------------------

    pub fn crew_user(&self) -> Option<String> {
        self.inner.crew_user()
    }

    pub async fn get_crew_status(&self) -> Result<Vec<CrewStatus>, ManagerError> {
        Ok(self.inner.store.get_crew_online_status().await?)
    }

    pub async fn get_crew_sessions(&self) -> Result<Vec<CrewSession>, ManagerError> {
        let records = self
            .inner
            .store
            .fetch_crew_sessions(self.inner.config.snapshot_limit)
            .await?;
        let now = Utc::now();
        Ok(records
            .into_iter()
            .map(|r| CrewSession::from_record(r, now))
            .collect())
    }

    pub async fn get_crew_activities(&self) -> Result<Vec<CrewActivity>, ManagerError> {
        Ok(self
            .inner
            .store
            .fetch_crew_activities(self.inner.config.snapshot_limit)
            .await?)
    }

    /// Start a session and remember `user_id` for heartbeats.
    pub async fn start_crew_session(&self, user_id: &str) -> Result<String, ManagerError> {
        let session_id = self.inner.store.start_crew_session(user_id).await?;
        *self.inner.crew_user.lock().unwrap_or_else(|e| e.into_inner()) = Some(user_id.to_string());
        info!(user_id, session_id = %session_id, "Crew session started");
        Ok(session_id)
    }

    pub async fn end_crew_session(&self) -> Result<(), ManagerError> {
        let user_id = self.crew_user().ok_or(ManagerError::NoActiveSession)?;
        self.inner.store.end_crew_session(&user_id).await?;
        let mut current = self.inner.crew_user.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(user_id.as_str()) {
            *current = None;
        }
        info!(user_id = %user_id, "Crew session ended");
        Ok(())
    }

    pub async fn update_crew_activity(
        &self,
        activity_type: &str,
        details: Value,
    ) -> Result<(), ManagerError> {
        let user_id = self.crew_user().ok_or(ManagerError::NoActiveSession)?;
        self.inner
            .store
            .update_crew_activity(&user_id, activity_type, &details)
            .await?;
        Ok(())
    }
}

impl<S: CanonicalStore, F: Changefeed> Drop for ConnectionManager<S, F> {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}
