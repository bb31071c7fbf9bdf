//! monitored_follows operations. The (user_did, follow_did) pair is the
//! primary key; the rkey is the only reliable handle on unfollow events.

use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::follow_graph::FollowEntry;
use crate::types::{MonitoredFollow, SkywatchError};

fn row_to_follow(row: &Row) -> MonitoredFollow {
    MonitoredFollow {
        user_did: row.get(0),
        follow_did: row.get(1),
        follow_handle: row.get(2),
        rkey: row.get(3),
        added_at: row.get(4),
    }
}

pub async fn follow_exists(
    pool: &Pool,
    user_did: &str,
    follow_did: &str,
) -> Result<bool, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT 1 FROM monitored_follows WHERE user_did = $1 AND follow_did = $2",
            &[&user_did, &follow_did],
        )
        .await?;
    Ok(row.is_some())
}

/// Insert or refresh one follow pair. An empty incoming rkey (bootstrap
/// rows) never clobbers a known one.
pub async fn upsert_follow(
    pool: &Pool,
    user_did: &str,
    follow_did: &str,
    follow_handle: &str,
    rkey: &str,
) -> Result<(), SkywatchError> {
    let client = pool.get().await?;
    client
        .execute(
            r#"
            INSERT INTO monitored_follows (user_did, follow_did, follow_handle, rkey)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_did, follow_did) DO UPDATE SET
                follow_handle = EXCLUDED.follow_handle,
                rkey = CASE WHEN EXCLUDED.rkey = '' THEN monitored_follows.rkey ELSE EXCLUDED.rkey END
            "#,
            &[&user_did, &follow_did, &follow_handle, &rkey],
        )
        .await?;
    Ok(())
}

/// Remove a follow by its record key, returning the unfollowed subject.
pub async fn delete_follow_by_rkey(
    pool: &Pool,
    user_did: &str,
    rkey: &str,
) -> Result<Option<String>, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "DELETE FROM monitored_follows WHERE user_did = $1 AND rkey = $2 RETURNING follow_did",
            &[&user_did, &rkey],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}

pub async fn is_followed_by_any(pool: &Pool, follow_did: &str) -> Result<bool, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            "SELECT 1 FROM monitored_follows WHERE follow_did = $1 LIMIT 1",
            &[&follow_did],
        )
        .await?;
    Ok(row.is_some())
}

pub async fn follows_for_user(
    pool: &Pool,
    user_did: &str,
) -> Result<Vec<MonitoredFollow>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT user_did, follow_did, follow_handle, rkey, added_at
            FROM monitored_follows
            WHERE user_did = $1
            ORDER BY follow_did
            "#,
            &[&user_did],
        )
        .await?;
    Ok(rows.iter().map(row_to_follow).collect())
}

pub async fn follow_dids_for_user(
    pool: &Pool,
    user_did: &str,
) -> Result<Vec<String>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT follow_did FROM monitored_follows WHERE user_did = $1 ORDER BY follow_did",
            &[&user_did],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

/// Every distinct DID followed by at least one monitoring user.
pub async fn monitored_follow_targets(pool: &Pool) -> Result<Vec<String>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT DISTINCT follow_did FROM monitored_follows ORDER BY follow_did",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

pub async fn monitored_count_for_user(pool: &Pool, user_did: &str) -> Result<i64, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM monitored_follows WHERE user_did = $1",
            &[&user_did],
        )
        .await?;
    Ok(row.get(0))
}

/// Reconcile one user's persisted rows against the authoritative follow
/// list from the appview: delete rows no longer present, upsert the
/// rest. One transaction, so readers never see a half-applied sync.
pub async fn sync_follows(
    pool: &Pool,
    user_did: &str,
    entries: &[FollowEntry],
) -> Result<(), SkywatchError> {
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;

    let keep: Vec<&str> = entries.iter().map(|entry| entry.did.as_str()).collect();
    txn.execute(
        "DELETE FROM monitored_follows WHERE user_did = $1 AND follow_did <> ALL($2)",
        &[&user_did, &keep],
    )
    .await?;

    for entry in entries {
        txn.execute(
            r#"
            INSERT INTO monitored_follows (user_did, follow_did, follow_handle)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_did, follow_did) DO UPDATE SET follow_handle = EXCLUDED.follow_handle
            "#,
            &[&user_did, &entry.did, &entry.handle],
        )
        .await?;
    }

    txn.commit().await?;
    Ok(())
}
