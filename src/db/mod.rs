//! Database operations. All writes from the streams go through here;
//! duplicate detection at write time is the synchronization point
//! between the main stream and temporary backfill streams.

pub mod changes;
pub mod follows;
pub mod monitoring;

use std::future::Future;

use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::config::{DB_POOL_SIZE, DB_RETRY_ATTEMPTS, DB_RETRY_BASE_DELAY, RESUME_WINDOW};
use crate::types::SkywatchError;

pub fn create_pool(database_url: &str) -> Result<Pool, SkywatchError> {
    let mut pg_config = PgConfig::new();
    pg_config.url = Some(database_url.to_string());
    pg_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pg_config.pool = Some(PoolConfig {
        max_size: *DB_POOL_SIZE,
        ..Default::default()
    });

    pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| SkywatchError::Other(format!("pool creation failed: {e}")))
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool) -> Result<(), SkywatchError> {
    let client = pool.get().await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS profile_changes (
                id BIGSERIAL PRIMARY KEY,
                did TEXT NOT NULL,
                handle TEXT,
                old_handle TEXT,
                new_handle TEXT,
                old_display_name TEXT,
                new_display_name TEXT,
                old_avatar TEXT,
                new_avatar TEXT,
                change_type TEXT NOT NULL,
                changed_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_profile_changes_did ON profile_changes (did)",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_profile_changes_changed_at ON profile_changes (changed_at DESC)",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_profile_changes_handle ON profile_changes (handle)",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_profile_changes_change_type ON profile_changes (change_type)",
            &[],
        )
        .await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS monitored_follows (
                user_did TEXT NOT NULL,
                follow_did TEXT NOT NULL,
                follow_handle TEXT NOT NULL DEFAULT '',
                rkey TEXT NOT NULL DEFAULT '',
                added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_did, follow_did)
            )
            "#,
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_monitored_follows_follow_did ON monitored_follows (follow_did)",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_monitored_follows_user_did ON monitored_follows (user_did)",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_monitored_follows_user_rkey ON monitored_follows (user_did, rkey)",
            &[],
        )
        .await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_users (
                did TEXT PRIMARY KEY,
                handle TEXT,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_backfill_state (
                user_did TEXT PRIMARY KEY,
                last_started_at TIMESTAMPTZ,
                last_completed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS ignored_users (
                did TEXT PRIMARY KEY,
                added_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;

    info!("database migrations completed");
    Ok(())
}

/// Retry a persistence operation with exponential backoff. The final
/// failure is returned so callers can leave the cursor alone and let the
/// event be re-delivered.
pub async fn with_retry<T, F, Fut>(op: &str, f: F) -> Result<T, SkywatchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SkywatchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= DB_RETRY_ATTEMPTS {
                    return Err(e);
                }
                let delay = DB_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!("{op} failed (attempt {attempt}/{DB_RETRY_ATTEMPTS}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub const SETTING_STOP_CURSOR: &str = "stop_cursor";
pub const SETTING_STOP_TIME: &str = "stop_time";

pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt("SELECT value FROM system_settings WHERE key = $1", &[&key])
        .await?;
    Ok(row.map(|r| r.get(0)))
}

pub async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<(), SkywatchError> {
    let client = pool.get().await?;
    client
        .execute(
            r#"
            INSERT INTO system_settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
            &[&key, &value],
        )
        .await?;
    Ok(())
}

/// Persist the graceful-shutdown marker the next boot resumes from.
pub async fn save_stop_state(pool: &Pool, cursor: Option<i64>) -> Result<(), SkywatchError> {
    if let Some(cursor) = cursor {
        set_setting(pool, SETTING_STOP_CURSOR, &cursor.to_string()).await?;
    }
    set_setting(pool, SETTING_STOP_TIME, &Utc::now().to_rfc3339()).await?;
    Ok(())
}

/// The stored stop cursor, but only while the upstream still retains it.
pub async fn recommended_start_cursor(pool: &Pool) -> Result<Option<i64>, SkywatchError> {
    let Some(cursor) = get_setting(pool, SETTING_STOP_CURSOR).await? else {
        return Ok(None);
    };
    let Some(stop_time) = get_setting(pool, SETTING_STOP_TIME).await? else {
        return Ok(None);
    };
    let Ok(stop_time) = DateTime::parse_from_rfc3339(&stop_time) else {
        return Ok(None);
    };

    let age = Utc::now().signed_duration_since(stop_time.with_timezone(&Utc));
    if age.num_seconds() > RESUME_WINDOW.as_secs() as i64 {
        return Ok(None);
    }

    Ok(cursor.parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, SkywatchError> = with_retry("test op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SkywatchError::Other("transient".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, SkywatchError> = with_retry("test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SkywatchError::Other("permanent".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), DB_RETRY_ATTEMPTS);
    }
}
