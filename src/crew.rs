//! Crew presence records and session duration formatting.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Row returned by the `get_crew_online_status` procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewStatus {
    pub user_id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_session_id: Option<String>,
}

/// Raw `crew_sessions` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewSessionRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub session_start: DateTime<Utc>,
    #[serde(default)]
    pub session_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Session with its computed, human-readable duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrewSession {
    pub id: String,
    pub user_id: String,
    pub full_name: Option<String>,
    pub session_start: DateTime<Utc>,
    pub session_end: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub duration: String,
}

impl CrewSession {
    /// Active sessions run until `now`; ended ones until their last activity
    /// (falling back to the end timestamp).
    pub fn from_record(record: CrewSessionRecord, now: DateTime<Utc>) -> Self {
        let is_active = record.session_end.is_none();
        let until = if is_active {
            now
        } else {
            record
                .last_activity
                .or(record.session_end)
                .unwrap_or(record.session_start)
        };
        let duration = format_duration(until - record.session_start);
        Self {
            id: record.id,
            user_id: record.user_id,
            full_name: record.full_name,
            session_start: record.session_start,
            session_end: record.session_end,
            last_activity: record.last_activity,
            is_active,
            duration,
        }
    }
}

/// `crew_activity_logs` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewActivity {
    pub id: String,
    pub user_id: String,
    pub activity_type: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// `2h 5m`, or `45m` under an hour. Negative spans read as `0m`.
pub fn format_duration(span: Duration) -> String {
    let minutes = span.num_minutes().max(0);
    let hours = minutes / 60;
    let rest = minutes % 60;
    if hours > 0 {
        format!("{hours}h {rest}m")
    } else {
        format!("{rest}m")
    }
}
