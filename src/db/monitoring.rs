//! Monitoring users, the ignore list, and per-user backfill state.

use std::collections::HashSet;

use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::types::{BackfillState, MonitoringUser, SkywatchError};

pub async fn monitoring_users(pool: &Pool) -> Result<Vec<MonitoringUser>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT did, handle FROM monitoring_users WHERE enabled ORDER BY created_at, did",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| MonitoringUser {
            did: row.get(0),
            handle: row.get(1),
        })
        .collect())
}

pub async fn is_monitoring_user(pool: &Pool, did: &str) -> Result<bool, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT 1 FROM monitoring_users WHERE did = $1 AND enabled",
            &[&did],
        )
        .await?;
    Ok(row.is_some())
}

pub async fn is_ignored(pool: &Pool, did: &str) -> Result<bool, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt("SELECT 1 FROM ignored_users WHERE did = $1", &[&did])
        .await?;
    Ok(row.is_some())
}

pub async fn ignored_set(pool: &Pool) -> Result<HashSet<String>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client.query("SELECT did FROM ignored_users", &[]).await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Ignoring a DID also purges its recorded changes; both happen in one
/// transaction so no change row for an ignored DID survives the commit.
pub async fn add_ignored(pool: &Pool, did: &str) -> Result<(), SkywatchError> {
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;
    txn.execute(
        "INSERT INTO ignored_users (did) VALUES ($1) ON CONFLICT (did) DO NOTHING",
        &[&did],
    )
    .await?;
    txn.execute("DELETE FROM profile_changes WHERE did = $1", &[&did])
        .await?;
    txn.commit().await?;
    Ok(())
}

pub async fn remove_ignored(pool: &Pool, did: &str) -> Result<bool, SkywatchError> {
    let client = pool.get().await?;
    let deleted = client
        .execute("DELETE FROM ignored_users WHERE did = $1", &[&did])
        .await?;
    Ok(deleted > 0)
}

fn row_to_backfill_state(row: &Row) -> BackfillState {
    BackfillState {
        user_did: row.get(0),
        last_started_at: row.get(1),
        last_completed_at: row.get(2),
        updated_at: row.get(3),
    }
}

/// A null last_completed_at marks the backfill as in flight.
pub async fn mark_backfill_started(pool: &Pool, user_did: &str) -> Result<(), SkywatchError> {
    let client = pool.get().await?;
    client
        .execute(
            r#"
            INSERT INTO monitoring_backfill_state (user_did, last_started_at, last_completed_at, updated_at)
            VALUES ($1, NOW(), NULL, NOW())
            ON CONFLICT (user_did) DO UPDATE SET
                last_started_at = NOW(),
                last_completed_at = NULL,
                updated_at = NOW()
            "#,
            &[&user_did],
        )
        .await?;
    Ok(())
}

pub async fn mark_backfill_completed(pool: &Pool, user_did: &str) -> Result<(), SkywatchError> {
    let client = pool.get().await?;
    client
        .execute(
            r#"
            INSERT INTO monitoring_backfill_state (user_did, last_started_at, last_completed_at, updated_at)
            VALUES ($1, NOW(), NOW(), NOW())
            ON CONFLICT (user_did) DO UPDATE SET
                last_completed_at = NOW(),
                updated_at = NOW()
            "#,
            &[&user_did],
        )
        .await?;
    Ok(())
}

pub async fn backfill_state(
    pool: &Pool,
    user_did: &str,
) -> Result<Option<BackfillState>, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            r#"
            SELECT user_did, last_started_at, last_completed_at, updated_at
            FROM monitoring_backfill_state
            WHERE user_did = $1
            "#,
            &[&user_did],
        )
        .await?;
    Ok(row.map(|r| row_to_backfill_state(&r)))
}

/// Backfills that started but never completed, including ones whose last
/// completion predates the last start (interrupted restarts).
pub async fn incomplete_backfills(pool: &Pool) -> Result<Vec<BackfillState>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT user_did, last_started_at, last_completed_at, updated_at
            FROM monitoring_backfill_state
            WHERE last_started_at IS NOT NULL
              AND (last_completed_at IS NULL OR last_completed_at < last_started_at)
            ORDER BY last_started_at
            "#,
            &[],
        )
        .await?;
    Ok(rows.iter().map(row_to_backfill_state).collect())
}

/// Remove every trace of a monitoring user, in one transaction. Invoked
/// by the registration layer when a user disables monitoring.
pub async fn purge_user(pool: &Pool, user_did: &str) -> Result<(), SkywatchError> {
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;
    txn.execute(
        "DELETE FROM monitored_follows WHERE user_did = $1",
        &[&user_did],
    )
    .await?;
    txn.execute(
        "DELETE FROM monitoring_backfill_state WHERE user_did = $1",
        &[&user_did],
    )
    .await?;
    txn.execute("DELETE FROM monitoring_users WHERE did = $1", &[&user_did])
        .await?;
    txn.commit().await?;
    Ok(())
}
