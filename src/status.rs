//! Snapshot aggregation and fan-out. Subscribers (the UI WebSocket
//! bridge, the HTTP status endpoint) register via broadcast receivers
//! and only ever see whole snapshots, never deltas.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::db;
use crate::main_stream::MainStream;
use crate::temp_streams::TempStreamManager;
use crate::types::SkywatchError;

#[derive(Debug, Clone, Serialize)]
pub struct MainStreamStatus {
    pub running: bool,
    pub monitored_dids: usize,
    pub has_valid_cursor: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TempPoolStatus {
    pub active: usize,
    pub max: usize,
    pub queue_length: usize,
    pub available_slots: usize,
    pub active_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserBackfillStatus {
    pub did: String,
    pub handle: Option<String>,
    pub monitored_count: i64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub has_completed_backfill: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub main_stream: MainStreamStatus,
    pub temp_pool: TempPoolStatus,
    pub users: Vec<UserBackfillStatus>,
    pub backfilling_users: Vec<String>,
}

/// Lighter notification on cursor movement; subscribers debounce.
#[derive(Debug, Clone, Serialize)]
pub struct CursorUpdate {
    pub timestamp: Option<String>,
    pub is_in_backfill: bool,
}

pub struct StatusSources {
    pub main: Arc<MainStream>,
    pub temps: Arc<TempStreamManager>,
    pub pool: Pool,
}

pub struct StatusBroadcaster {
    status_tx: broadcast::Sender<StatusSnapshot>,
    cursor_tx: broadcast::Sender<CursorUpdate>,
    sources: OnceLock<StatusSources>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(64);
        let (cursor_tx, _) = broadcast::channel(256);
        Self {
            status_tx,
            cursor_tx,
            sources: OnceLock::new(),
        }
    }

    /// Wire the snapshot sources once at composition time.
    pub fn register_sources(&self, sources: StatusSources) {
        if self.sources.set(sources).is_err() {
            debug!("status sources already registered");
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_cursor(&self) -> broadcast::Receiver<CursorUpdate> {
        self.cursor_tx.subscribe()
    }

    /// Assemble and push a full snapshot. A failure to read state logs
    /// and skips the broadcast rather than shipping a partial view.
    pub async fn broadcast_status(&self) {
        let Some(sources) = self.sources.get() else {
            return;
        };
        match self.build_snapshot(sources).await {
            Ok(snapshot) => {
                let _ = self.status_tx.send(snapshot);
            }
            Err(e) => debug!("status snapshot failed: {e}"),
        }
    }

    async fn build_snapshot(
        &self,
        sources: &StatusSources,
    ) -> Result<StatusSnapshot, SkywatchError> {
        let main_stream = sources.main.status();
        let temp_pool = sources.temps.status();
        let backfilling_users = temp_pool.active_users.clone();

        let mut users = Vec::new();
        for user in db::monitoring::monitoring_users(&sources.pool).await? {
            let state = db::monitoring::backfill_state(&sources.pool, &user.did).await?;
            let monitored_count =
                db::follows::monitored_count_for_user(&sources.pool, &user.did).await?;
            let (last_started_at, last_completed_at) = state
                .map(|s| (s.last_started_at, s.last_completed_at))
                .unwrap_or((None, None));
            let has_completed_backfill = matches!(
                (last_started_at, last_completed_at),
                (Some(started), Some(completed)) if completed >= started
            );
            users.push(UserBackfillStatus {
                did: user.did,
                handle: user.handle,
                monitored_count,
                last_started_at,
                last_completed_at,
                has_completed_backfill,
            });
        }

        Ok(StatusSnapshot {
            main_stream,
            temp_pool,
            users,
            backfilling_users,
        })
    }

    pub fn broadcast_cursor(&self, cursor_us: Option<i64>, is_in_backfill: bool) {
        let timestamp = cursor_us.and_then(micros_to_rfc3339);
        let _ = self.cursor_tx.send(CursorUpdate {
            timestamp,
            is_in_backfill,
        });
    }
}

pub fn micros_to_rfc3339(us: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_micros(us).map(|dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_to_rfc3339() {
        let formatted = micros_to_rfc3339(1_700_000_000_000_000).unwrap();
        assert!(formatted.starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn test_cursor_update_serialization() {
        let update = CursorUpdate {
            timestamp: micros_to_rfc3339(1_700_000_000_000_000),
            is_in_backfill: true,
        };
        let value = serde_json::to_value(&update).unwrap();
        assert!(value["timestamp"].is_string());
        assert_eq!(value["is_in_backfill"], true);

        let update = CursorUpdate {
            timestamp: None,
            is_in_backfill: false,
        };
        let value = serde_json::to_value(&update).unwrap();
        assert!(value["timestamp"].is_null());
    }

    #[tokio::test]
    async fn test_broadcast_without_sources_is_silent() {
        let broadcaster = StatusBroadcaster::new();
        let mut cursor_rx = broadcaster.subscribe_cursor();
        broadcaster.broadcast_status().await;
        broadcaster.broadcast_cursor(Some(1_700_000_000_000_000), false);
        let update = cursor_rx.recv().await.unwrap();
        assert!(!update.is_in_backfill);
    }
}
