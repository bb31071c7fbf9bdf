use std::sync::LazyLock;
use std::time::Duration;

/// Jetstream caps wantedDids per subscription; surplus entries are
/// dropped with a warning.
pub const MAX_WANTED_DIDS: usize = 10_000;

/// A start cursor at least this far behind wall clock puts the main
/// stream into backfill mode.
pub const BACKFILL_THRESHOLD: Duration = Duration::from_secs(60);

/// Reconnect backoff is min(2^attempt seconds, this cap).
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub const DB_RETRY_ATTEMPTS: u32 = 3;
pub const DB_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// A cursor only counts as valid once the stream has been up this long.
pub const UPTIME_FOR_VALID_CURSOR: Duration = Duration::from_secs(30);

/// Jetstream retains roughly 24h of events; stop cursors older than this
/// cannot be resumed from.
pub const RESUME_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const HANDLE_CACHE_CAPACITY: usize = 10_000;

pub const FOLLOWS_PAGE_LIMIT: u32 = 100;
pub const FOLLOWS_MAX_PAGES: usize = 100;

/// Delay before the single retry of the boot-time backfill resume scan.
pub const TEMP_RESUME_RETRY_DELAY: Duration = Duration::from_secs(30);

pub static TEMP_STREAM_LIMIT: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("TEMP_STREAM_LIMIT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(50)
});

/// Hard timeout for outbound HTTPS calls (resolver, follow graph).
pub static HTTP_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    let secs = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    Duration::from_secs(secs)
});

pub static PLC_DIRECTORY_URL: LazyLock<String> = LazyLock::new(|| {
    std::env::var("PLC_DIRECTORY_URL").unwrap_or_else(|_| "https://plc.directory".to_string())
});

pub static APPVIEW_URL: LazyLock<String> = LazyLock::new(|| {
    std::env::var("APPVIEW_URL").unwrap_or_else(|_| "https://public.api.bsky.app".to_string())
});

pub static DB_POOL_SIZE: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("DB_POOL_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(20)
});
