//! Typed notifications handed to the presentation layer.
//!
//! Notifications are built per observed change (or per engine report) and
//! ownership moves to the registered handler immediately; nothing here keeps
//! history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::changefeed::{ChangeEvent, ChangeKind, Family};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    CrewStatus,
    CrewActivity,
    CrewSession,
    OrderUpdate,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl Notification {
    pub fn new(kind: NotificationType, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
            is_read: false,
        }
    }

    pub fn system(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationType::System, title, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Build the notification for one changefeed event.
    pub fn from_change_event(event: &ChangeEvent) -> Self {
        let row = event.row();
        let data = serde_json::json!({
            "event_type": event.event_type,
            "table": event.table,
            "record": row,
        });

        let (kind, title, message) = match event.family() {
            Some(Family::Orders) => order_text(event.event_type, row),
            Some(Family::CrewStatus) => {
                let name = crew_name(row);
                let online = row.get("is_online").and_then(Value::as_bool).unwrap_or(false);
                if online {
                    (NotificationType::CrewStatus, "Crew online".to_string(), format!("{name} is online"))
                } else {
                    (NotificationType::CrewStatus, "Crew offline".to_string(), format!("{name} went offline"))
                }
            }
            Some(Family::CrewSessions) => {
                let name = crew_name(row);
                let ended = row.get("session_end").is_some_and(|v| !v.is_null());
                match (event.event_type, ended) {
                    (ChangeKind::Insert, _) => (
                        NotificationType::CrewSession,
                        "Crew session started".to_string(),
                        format!("{name} started a session"),
                    ),
                    (ChangeKind::Update, true) => (
                        NotificationType::CrewSession,
                        "Crew session ended".to_string(),
                        format!("{name} ended their session"),
                    ),
                    (ChangeKind::Update, false) => (
                        NotificationType::CrewSession,
                        "Crew session updated".to_string(),
                        format!("{name}'s session was updated"),
                    ),
                    (ChangeKind::Delete, _) => (
                        NotificationType::CrewSession,
                        "Crew session removed".to_string(),
                        format!("A session for {name} was removed"),
                    ),
                }
            }
            Some(Family::CrewActivity) => {
                let name = crew_name(row);
                let activity = row
                    .get("activity_type")
                    .and_then(Value::as_str)
                    .unwrap_or("activity");
                (
                    NotificationType::CrewActivity,
                    "Crew activity".to_string(),
                    format!("{name}: {activity}"),
                )
            }
            None => (
                NotificationType::System,
                "Data changed".to_string(),
                format!("{} {}", event.table, kind_label(event.event_type)),
            ),
        };

        Self::new(kind, title, message).with_data(data)
    }
}

fn order_text(kind: ChangeKind, row: &Value) -> (NotificationType, String, String) {
    let id = row.get("id").and_then(Value::as_str).unwrap_or("");
    let short: String = id.chars().take(8).collect();
    let (title, message) = match kind {
        ChangeKind::Insert => {
            let customer = row
                .get("customer_name")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("A customer");
            ("New order".to_string(), format!("{customer} placed order {short}"))
        }
        ChangeKind::Update => {
            let status = row.get("status").and_then(Value::as_str).unwrap_or("updated");
            ("Order updated".to_string(), format!("Order {short} is now {status}"))
        }
        ChangeKind::Delete => ("Order removed".to_string(), format!("Order {short} was removed")),
    };
    (NotificationType::OrderUpdate, title, message)
}

fn crew_name(row: &Value) -> String {
    row.get("full_name")
        .and_then(Value::as_str)
        .or_else(|| row.get("user_id").and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("A crew member")
        .to_string()
}

fn kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Insert => "inserted",
        ChangeKind::Update => "updated",
        ChangeKind::Delete => "deleted",
    }
}
