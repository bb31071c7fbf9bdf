//! Change record persistence: idempotent inserts with write-time
//! duplicate detection and ignore-list enforcement.

use chrono::Utc;
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::db::monitoring;
use crate::types::{ChangeKind, ChangeOutcome, NewChange, ProfileChange, SkywatchError};

fn row_to_change(row: &Row) -> ProfileChange {
    ProfileChange {
        id: row.get(0),
        did: row.get(1),
        handle: row.get(2),
        old_handle: row.get(3),
        new_handle: row.get(4),
        old_display_name: row.get(5),
        new_display_name: row.get(6),
        old_avatar: row.get(7),
        new_avatar: row.get(8),
        change_type: row.get(9),
        changed_at: row.get(10),
        created_at: row.get(11),
    }
}

/// Classify a candidate by the transitions it carries. A handle
/// transition requires both sides non-empty; any populated profile field
/// counts as a profile transition.
pub fn classify_change(change: &NewChange) -> ChangeKind {
    let handle_transition = matches!(
        (&change.old_handle, &change.new_handle),
        (Some(old), Some(new)) if !old.is_empty() && !new.is_empty()
    );
    let profile_transition = change.old_display_name.is_some()
        || change.new_display_name.is_some()
        || change.old_avatar.is_some()
        || change.new_avatar.is_some();

    match (handle_transition, profile_transition) {
        (true, true) => ChangeKind::Combined,
        (true, false) => ChangeKind::Handle,
        _ => ChangeKind::Profile,
    }
}

/// A stored row is a duplicate of the candidate when the whole
/// (did, old_*, new_*) six-tuple matches. IS NOT DISTINCT FROM makes two
/// NULLs compare equal; a NULL never matches a value.
pub async fn find_duplicate(
    pool: &Pool,
    change: &NewChange,
) -> Result<Option<ProfileChange>, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            r#"
            SELECT id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            FROM profile_changes
            WHERE did = $1
              AND old_display_name IS NOT DISTINCT FROM $2
              AND new_display_name IS NOT DISTINCT FROM $3
              AND old_avatar IS NOT DISTINCT FROM $4
              AND new_avatar IS NOT DISTINCT FROM $5
              AND old_handle IS NOT DISTINCT FROM $6
              AND new_handle IS NOT DISTINCT FROM $7
            ORDER BY id
            LIMIT 1
            "#,
            &[
                &change.did,
                &change.old_display_name,
                &change.new_display_name,
                &change.old_avatar,
                &change.new_avatar,
                &change.old_handle,
                &change.new_handle,
            ],
        )
        .await?;
    Ok(row.map(|r| row_to_change(&r)))
}

/// Idempotent insert: the ignore check and the duplicate probe happen in
/// the same call, so replayed events collapse onto the stored row. Two
/// racing inserts of identical content can still both land; the
/// deduplicating reader hides that case.
pub async fn insert_change(
    pool: &Pool,
    change: &NewChange,
) -> Result<ChangeOutcome, SkywatchError> {
    if monitoring::is_ignored(pool, &change.did).await? {
        return Ok(ChangeOutcome::Ignored);
    }

    if let Some(existing) = find_duplicate(pool, change).await? {
        return Ok(ChangeOutcome::Duplicate(existing));
    }

    let change_type = classify_change(change).as_str();
    let client = pool.get().await?;
    let row = client
        .query_one(
            r#"
            INSERT INTO profile_changes
                (did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            "#,
            &[
                &change.did,
                &change.handle,
                &change.old_handle,
                &change.new_handle,
                &change.old_display_name,
                &change.new_display_name,
                &change.old_avatar,
                &change.new_avatar,
                &change_type,
                &Utc::now(),
            ],
        )
        .await?;

    Ok(ChangeOutcome::Inserted(row_to_change(&row)))
}

/// The most recent recorded handle for a DID, preferring new_handle and
/// falling back to the handle column.
pub async fn last_known_handle(pool: &Pool, did: &str) -> Result<Option<String>, SkywatchError> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            r#"
            SELECT COALESCE(new_handle, handle)
            FROM profile_changes
            WHERE did = $1 AND COALESCE(new_handle, handle) IS NOT NULL
            ORDER BY changed_at DESC, id DESC
            LIMIT 1
            "#,
            &[&did],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Recent changes, newest first. Keeps the lowest id per identical
/// six-tuple so the concurrent double-insert window never reaches
/// readers.
pub async fn recent_changes(pool: &Pool, limit: i64) -> Result<Vec<ProfileChange>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY did, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar
                    ORDER BY id
                ) AS rn
                FROM profile_changes
            ) deduped
            WHERE rn = 1
            ORDER BY changed_at DESC
            LIMIT $1
            "#,
            &[&limit],
        )
        .await?;
    Ok(rows.iter().map(row_to_change).collect())
}

/// Recent changes of one kind, newest first.
pub async fn recent_changes_by_type(
    pool: &Pool,
    change_type: &str,
    limit: i64,
) -> Result<Vec<ProfileChange>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            FROM profile_changes
            WHERE change_type = $1
            ORDER BY changed_at DESC, id DESC
            LIMIT $2
            "#,
            &[&change_type, &limit],
        )
        .await?;
    Ok(rows.iter().map(row_to_change).collect())
}

/// Changes whose current or new handle matches, newest first.
pub async fn changes_for_handle(
    pool: &Pool,
    handle: &str,
    limit: i64,
) -> Result<Vec<ProfileChange>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            FROM profile_changes
            WHERE handle = $1 OR new_handle = $1
            ORDER BY changed_at DESC, id DESC
            LIMIT $2
            "#,
            &[&handle, &limit],
        )
        .await?;
    Ok(rows.iter().map(row_to_change).collect())
}

/// Changes for one DID, newest first.
pub async fn changes_for_did(
    pool: &Pool,
    did: &str,
    limit: i64,
) -> Result<Vec<ProfileChange>, SkywatchError> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"
            SELECT id, did, handle, old_handle, new_handle, old_display_name, new_display_name, old_avatar, new_avatar, change_type, changed_at, created_at
            FROM profile_changes
            WHERE did = $1
            ORDER BY changed_at DESC, id DESC
            LIMIT $2
            "#,
            &[&did, &limit],
        )
        .await?;
    Ok(rows.iter().map(row_to_change).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_change() -> NewChange {
        NewChange {
            did: "did:plc:a".to_string(),
            handle: Some("new.alice.example".to_string()),
            old_handle: Some("old.alice.example".to_string()),
            new_handle: Some("new.alice.example".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_handle_only() {
        assert_eq!(classify_change(&handle_change()), ChangeKind::Handle);
    }

    #[test]
    fn test_classify_profile_only() {
        let change = NewChange {
            did: "did:plc:b".to_string(),
            old_display_name: Some("Bob".to_string()),
            new_display_name: Some("Bobby".to_string()),
            ..Default::default()
        };
        assert_eq!(classify_change(&change), ChangeKind::Profile);
    }

    #[test]
    fn test_classify_avatar_only() {
        let change = NewChange {
            did: "did:plc:b".to_string(),
            old_avatar: Some("cid1".to_string()),
            new_avatar: Some("cid2".to_string()),
            ..Default::default()
        };
        assert_eq!(classify_change(&change), ChangeKind::Profile);
    }

    #[test]
    fn test_classify_combined() {
        let mut change = handle_change();
        change.old_display_name = Some("Alice".to_string());
        change.new_display_name = Some("Alicia".to_string());
        assert_eq!(classify_change(&change), ChangeKind::Combined);
    }

    #[test]
    fn test_classify_empty_handle_side_is_profile() {
        // a discovery-shaped handle pair does not count as a transition
        let change = NewChange {
            did: "did:plc:c".to_string(),
            old_handle: Some(String::new()),
            new_handle: Some("c.test".to_string()),
            new_display_name: Some("C".to_string()),
            ..Default::default()
        };
        assert_eq!(classify_change(&change), ChangeKind::Profile);
    }
}
