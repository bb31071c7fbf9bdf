use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkywatchError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("other: {0}")]
    Other(String),
}

/// Classification of a persisted change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Handle,
    Profile,
    Combined,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Handle => "handle",
            ChangeKind::Profile => "profile",
            ChangeKind::Combined => "combined",
        }
    }
}

/// Candidate change record before persistence. Only the fields that
/// actually transitioned are populated; the rest stay None.
#[derive(Debug, Clone, Default)]
pub struct NewChange {
    pub did: String,
    pub handle: Option<String>,
    pub old_handle: Option<String>,
    pub new_handle: Option<String>,
    pub old_display_name: Option<String>,
    pub new_display_name: Option<String>,
    pub old_avatar: Option<String>,
    pub new_avatar: Option<String>,
}

/// A persisted row from profile_changes. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileChange {
    pub id: i64,
    pub did: String,
    pub handle: Option<String>,
    pub old_handle: Option<String>,
    pub new_handle: Option<String>,
    pub old_display_name: Option<String>,
    pub new_display_name: Option<String>,
    pub old_avatar: Option<String>,
    pub new_avatar: Option<String>,
    pub change_type: String,
    pub changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent change insert.
#[derive(Debug)]
pub enum ChangeOutcome {
    Inserted(ProfileChange),
    Duplicate(ProfileChange),
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoredFollow {
    pub user_did: String,
    pub follow_did: String,
    pub follow_handle: String,
    pub rkey: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringUser {
    pub did: String,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillState {
    pub user_did: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
