//! The single long-lived jetstream connection covering every monitored
//! DID. Owns the resume cursor, backfill detection, DID-set
//! reconciliation and the reconnect policy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use deadpool_postgres::Pool;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{BACKFILL_THRESHOLD, RECONNECT_BACKOFF_CAP, UPTIME_FOR_VALID_CURSOR};
use crate::db;
use crate::dispatcher::{BackfillRequest, Dispatcher, StreamSource};
use crate::follow_graph;
use crate::jetstream;
use crate::resolver::HandleResolver;
use crate::status::{self, MainStreamStatus, StatusBroadcaster};
use crate::types::SkywatchError;
use crate::SHUTDOWN;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
struct StreamState {
    running: bool,
    connected: bool,
    last_cursor: Option<i64>,
    start_time_ms: Option<i64>,
    started_at: Option<Instant>,
    in_backfill: bool,
    backfill_lag_secs: Option<i64>,
    wanted_dids: Vec<String>,
    current_host: Option<String>,
    attempt: u32,
}

impl StreamState {
    fn has_valid_cursor(&self) -> bool {
        self.running
            && self.connected
            && self.last_cursor.is_some()
            && self
                .started_at
                .is_some_and(|t| t.elapsed() >= UPTIME_FOR_VALID_CURSOR)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorInfo {
    pub cursor_us: Option<i64>,
    pub timestamp: Option<String>,
    pub is_in_backfill: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UptimeInfo {
    pub running: bool,
    pub uptime_secs: Option<u64>,
    pub connected_host: Option<String>,
}

enum StreamExit {
    Reconcile,
    Closed,
}

/// min(2^attempt seconds, cap); attempt 0 reconnects immediately.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(2u64.saturating_pow(attempt.min(16))).min(RECONNECT_BACKOFF_CAP)
}

/// A seeded cursor at or beyond the threshold behind wall clock means
/// the stream starts by replaying history.
pub(crate) fn cursor_lag_is_backfill(now_us: i64, cursor_us: i64) -> bool {
    now_us.saturating_sub(cursor_us) >= BACKFILL_THRESHOLD.as_micros() as i64
}

/// Monitoring users lead the wanted list so the subscription cap can
/// never truncate them; targets follow, minus the ignore list.
pub(crate) fn assemble_wanted_dids(
    users: Vec<String>,
    targets: Vec<String>,
    ignored: &HashSet<String>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut wanted = Vec::with_capacity(users.len() + targets.len());
    for did in users.into_iter().chain(targets) {
        if ignored.contains(&did) {
            continue;
        }
        if seen.insert(did.clone()) {
            wanted.push(did);
        }
    }
    wanted
}

pub struct MainStream {
    pool: Pool,
    resolver: Arc<HandleResolver>,
    status: Arc<StatusBroadcaster>,
    hosts: Vec<String>,
    appview_url: String,
    http_client: reqwest::Client,
    state: Mutex<StreamState>,
    reconnect: Notify,
    reconcile_lock: tokio::sync::Mutex<()>,
    reconcile_pending: AtomicBool,
    reconcile_tx: mpsc::UnboundedSender<String>,
    backfill_tx: mpsc::UnboundedSender<BackfillRequest>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MainStream {
    pub fn new(
        pool: Pool,
        resolver: Arc<HandleResolver>,
        status: Arc<StatusBroadcaster>,
        hosts: Vec<String>,
        appview_url: String,
        reconcile_tx: mpsc::UnboundedSender<String>,
        backfill_tx: mpsc::UnboundedSender<BackfillRequest>,
    ) -> Result<Self, SkywatchError> {
        if hosts.is_empty() {
            return Err(SkywatchError::Config("no jetstream hosts configured".to_string()));
        }
        let http_client = reqwest::Client::builder()
            .timeout(*crate::config::HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            pool,
            resolver,
            status,
            hosts,
            appview_url,
            http_client,
            state: Mutex::new(StreamState::default()),
            reconnect: Notify::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
            reconcile_pending: AtomicBool::new(false),
            reconcile_tx,
            backfill_tx,
            task: Mutex::new(None),
        })
    }

    /// Bring the stream up: follow-sync bootstrap, DID gathering, then
    /// the connection loop. `cursor` seeds resume; None tails live.
    pub async fn start(self: &Arc<Self>, cursor: Option<i64>) -> Result<(), SkywatchError> {
        if self.state.lock().unwrap().running {
            return Err(SkywatchError::Other("main stream already running".to_string()));
        }

        if let Err(e) = self.bootstrap_follows().await {
            warn!("follow sync bootstrap failed: {e}");
        }

        let wanted = self.gather_wanted_dids().await?;
        info!("starting main stream with {} monitored DIDs", wanted.len());

        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
            state.attempt = 0;
            state.last_cursor = cursor;
            state.start_time_ms = Some(Utc::now().timestamp_millis());
            state.started_at = Some(Instant::now());
            state.wanted_dids = wanted;
            if let Some(cursor) = cursor {
                if cursor_lag_is_backfill(jetstream::now_micros(), cursor) {
                    let lag_secs = (jetstream::now_micros() - cursor) / 1_000_000;
                    state.in_backfill = true;
                    state.backfill_lag_secs = Some(lag_secs);
                    info!("starting in backfill mode, cursor lag {lag_secs}s");
                }
            }
        }

        let stream = Arc::clone(self);
        let handle = tokio::spawn(async move {
            stream.run().await;
        });
        *self.task.lock().unwrap() = Some(handle);

        self.status.broadcast_status().await;
        Ok(())
    }

    /// Tear the stream down and persist the resume marker. The reader
    /// task is asked to exit and given time to finish the event in
    /// flight; only a hung connect gets aborted.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.reconnect.notify_one();

        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                warn!("main stream task did not exit in time, aborting");
                task.abort();
            }
        }

        let cursor = {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.current_host = None;
            state.start_time_ms = None;
            state.started_at = None;
            state.in_backfill = false;
            state.backfill_lag_secs = None;
            state.last_cursor.take()
        };

        if let Err(e) = db::save_stop_state(&self.pool, cursor).await {
            error!("failed to persist stop state: {e}");
        }

        self.status.broadcast_status().await;
        info!("main stream stopped at cursor {cursor:?}");
    }

    /// Recompute the wanted DID set and, when it changed, reconnect
    /// immediately. Serialized; concurrent requests coalesce into at
    /// most one pending re-run.
    pub async fn reload_dids_now(&self, source: &str) {
        let Ok(_guard) = self.reconcile_lock.try_lock() else {
            self.reconcile_pending.store(true, Ordering::Relaxed);
            debug!("reconcile already in flight, coalescing request from {source}");
            return;
        };

        loop {
            if let Err(e) = self.reconcile_once(source).await {
                error!("DID reconciliation failed ({source}): {e}");
            }
            if !self.reconcile_pending.swap(false, Ordering::Relaxed) {
                break;
            }
        }
    }

    async fn reconcile_once(&self, source: &str) -> Result<(), SkywatchError> {
        let wanted = self.gather_wanted_dids().await?;

        let changed = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return Ok(());
            }
            if state.wanted_dids == wanted {
                false
            } else {
                state.wanted_dids = wanted;
                state.attempt = 0;
                true
            }
        };

        if changed {
            info!("monitored DID set changed ({source}), reconnecting");
            self.reconnect.notify_one();
            self.status.broadcast_status().await;
        } else {
            debug!("monitored DID set unchanged ({source})");
        }
        Ok(())
    }

    async fn gather_wanted_dids(&self) -> Result<Vec<String>, SkywatchError> {
        let users: Vec<String> = db::monitoring::monitoring_users(&self.pool)
            .await?
            .into_iter()
            .map(|user| user.did)
            .collect();
        let targets = db::follows::monitored_follow_targets(&self.pool).await?;
        let ignored = db::monitoring::ignored_set(&self.pool).await?;
        Ok(assemble_wanted_dids(users, targets, &ignored))
    }

    /// Seed monitored_follows from the appview follow graph. Per-user
    /// failures are logged and skipped; bootstrap is never fatal.
    async fn bootstrap_follows(&self) -> Result<(), SkywatchError> {
        let users = db::monitoring::monitoring_users(&self.pool).await?;
        for user in &users {
            let follows =
                follow_graph::fetch_all_follows(&self.http_client, &self.appview_url, &user.did)
                    .await;
            info!("follow sync: {} follows {} accounts", user.did, follows.len());
            if let Err(e) = db::follows::sync_follows(&self.pool, &user.did, &follows).await {
                warn!("follow sync failed for {}: {e}", user.did);
            }
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut dispatcher = Dispatcher::new(
            self.pool.clone(),
            Arc::clone(&self.resolver),
            StreamSource::Main,
            self.reconcile_tx.clone(),
            self.backfill_tx.clone(),
        );

        loop {
            if SHUTDOWN.load(Ordering::Relaxed) {
                break;
            }
            let (running, dids, cursor) = {
                let state = self.state.lock().unwrap();
                (state.running, state.wanted_dids.clone(), state.last_cursor)
            };
            if !running {
                break;
            }

            if dids.is_empty() {
                info!("no monitored DIDs, main stream idle");
                self.status.broadcast_status().await;
                self.reconnect.notified().await;
                continue;
            }

            let host = jetstream::pick_host(&self.hosts).to_string();
            let url = jetstream::subscribe_url(&host, cursor);
            info!("connecting to {host} with cursor {cursor:?}");

            let exit = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _response)) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.attempt = 0;
                        state.connected = true;
                        state.current_host = Some(host.clone());
                    }
                    match self.stream_events(socket, &dids, &mut dispatcher).await {
                        Ok(exit) => exit,
                        Err(e) => {
                            warn!("stream error on {host}: {e}");
                            StreamExit::Closed
                        }
                    }
                }
                Err(e) => {
                    error!("connection to {host} failed: {e}");
                    StreamExit::Closed
                }
            };

            let running = {
                let mut state = self.state.lock().unwrap();
                state.connected = false;
                state.current_host = None;
                state.running
            };
            if !running || SHUTDOWN.load(Ordering::Relaxed) {
                break;
            }
            self.status.broadcast_status().await;

            if matches!(exit, StreamExit::Reconcile) {
                debug!("reconnecting immediately with updated DID set");
                continue;
            }

            let attempt = {
                let mut state = self.state.lock().unwrap();
                state.attempt += 1;
                state.attempt
            };
            let delay = reconnect_delay(attempt);
            info!("reconnecting in {delay:?} (attempt {attempt})");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect.notified() => {
                    debug!("backoff cut short by DID reload");
                }
            }
        }

        debug!("main stream loop exited");
    }

    async fn stream_events(
        &self,
        socket: Socket,
        dids: &[String],
        dispatcher: &mut Dispatcher,
    ) -> Result<StreamExit, SkywatchError> {
        let (mut write, mut read) = socket.split();

        let hello = jetstream::options_message(dids)?;
        write.send(Message::Text(hello)).await?;
        debug!("sent subscriber options for {} DIDs", dids.len());

        self.status.broadcast_status().await;

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text, dispatcher).await,
                        Some(Ok(Message::Close(frame))) => {
                            info!("websocket closed: {frame:?}");
                            return Ok(StreamExit::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(StreamExit::Closed),
                    }
                }
                _ = self.reconnect.notified() => {
                    return Ok(StreamExit::Reconcile);
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, dispatcher: &mut Dispatcher) {
        let message = match jetstream::read(text) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                warn!("skipping malformed frame: {e}");
                return;
            }
        };

        let in_backfill = self.state.lock().unwrap().in_backfill;
        match dispatcher.handle_event(&message, in_backfill).await {
            Ok(()) => self.advance_cursor(message.time_us()).await,
            Err(e) => error!("event handling failed for {}: {e}", message.did()),
        }
    }

    /// The cursor only moves once an event is fully handled; failures
    /// leave it behind so the event is re-delivered after reconnect.
    async fn advance_cursor(&self, time_us: i64) {
        let (flipped, in_backfill) = {
            let mut state = self.state.lock().unwrap();
            if state.last_cursor.map_or(true, |cursor| time_us > cursor) {
                state.last_cursor = Some(time_us);
            }
            let mut flipped = None;
            if state.in_backfill {
                if let Some(start_ms) = state.start_time_ms {
                    if time_us / 1000 >= start_ms {
                        state.in_backfill = false;
                        flipped = Some(state.backfill_lag_secs.take());
                    }
                }
            }
            (flipped, state.in_backfill)
        };

        if let Some(initial_lag) = flipped {
            match initial_lag {
                Some(lag_secs) => info!("backfill caught up to live stream (initial lag {lag_secs}s)"),
                None => info!("backfill caught up to live stream"),
            }
            self.status.broadcast_status().await;
        }
        self.status.broadcast_cursor(Some(time_us), in_backfill);
    }

    pub fn get_cursor_info(&self) -> CursorInfo {
        let state = self.state.lock().unwrap();
        CursorInfo {
            cursor_us: state.last_cursor,
            timestamp: state.last_cursor.and_then(status::micros_to_rfc3339),
            is_in_backfill: state.in_backfill,
        }
    }

    pub fn get_uptime_info(&self) -> UptimeInfo {
        let state = self.state.lock().unwrap();
        UptimeInfo {
            running: state.running,
            uptime_secs: state.started_at.map(|t| t.elapsed().as_secs()),
            connected_host: state.current_host.clone(),
        }
    }

    /// Running, connected, and holding a cursor that has had time to
    /// settle. The temp-pool resume scan keys off this.
    pub fn is_running_with_cursor(&self) -> bool {
        self.state.lock().unwrap().has_valid_cursor()
    }

    pub fn status(&self) -> MainStreamStatus {
        let state = self.state.lock().unwrap();
        MainStreamStatus {
            running: state.running && state.connected,
            monitored_dids: state.wanted_dids.len(),
            has_valid_cursor: state.has_valid_cursor(),
        }
    }

    pub async fn recommended_start_cursor(pool: &Pool) -> Result<Option<i64>, SkywatchError> {
        db::recommended_start_cursor(pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay() {
        assert_eq!(reconnect_delay(0), Duration::ZERO);
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(5), RECONNECT_BACKOFF_CAP);
        assert_eq!(reconnect_delay(30), RECONNECT_BACKOFF_CAP);
    }

    #[test]
    fn test_backfill_boundary() {
        let now = 1_700_000_000_000_000i64;
        let minute = 60 * 1_000_000i64;
        // exactly sixty seconds behind counts as backfill
        assert!(cursor_lag_is_backfill(now, now - minute));
        assert!(cursor_lag_is_backfill(now, now - minute - 1));
        assert!(!cursor_lag_is_backfill(now, now - minute + 1));
        assert!(!cursor_lag_is_backfill(now, now));
    }

    #[test]
    fn test_assemble_wanted_dids_users_first() {
        let users = vec!["did:plc:u1".to_string(), "did:plc:u2".to_string()];
        let targets = vec!["did:plc:a".to_string(), "did:plc:u1".to_string()];
        let ignored = HashSet::new();

        let wanted = assemble_wanted_dids(users, targets, &ignored);
        assert_eq!(
            wanted,
            vec![
                "did:plc:u1".to_string(),
                "did:plc:u2".to_string(),
                "did:plc:a".to_string(),
            ]
        );
    }

    #[test]
    fn test_assemble_wanted_dids_filters_ignored() {
        let users = vec!["did:plc:u1".to_string()];
        let targets = vec!["did:plc:a".to_string(), "did:plc:bad".to_string()];
        let ignored: HashSet<String> = ["did:plc:bad".to_string()].into_iter().collect();

        let wanted = assemble_wanted_dids(users, targets, &ignored);
        assert_eq!(wanted, vec!["did:plc:u1".to_string(), "did:plc:a".to_string()]);
    }

    #[test]
    fn test_assemble_wanted_dids_dedupes() {
        let users = vec!["did:plc:u1".to_string(), "did:plc:u1".to_string()];
        let targets = vec!["did:plc:u1".to_string()];
        let wanted = assemble_wanted_dids(users, targets, &HashSet::new());
        assert_eq!(wanted, vec!["did:plc:u1".to_string()]);
    }
}
