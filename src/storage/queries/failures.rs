//! Sync failure records.

use rusqlite::{params, OptionalExtension, Row};

use super::{json, tag, timestamp};
use crate::domain::{AccountId, EmailId, FailureStatus, SyncFailure};
use crate::storage::database::{Database, Result};

const COLUMNS: &str = "account_id, item_key, error, attempt, status, updated_at";

fn item_key(item_id: Option<&EmailId>) -> String {
    item_id.map(|id| id.0.clone()).unwrap_or_default()
}

/// Inserts or replaces the failure for `(account, item)`.
pub async fn upsert(db: &Database, failure: &SyncFailure) -> Result<()> {
    let failure = failure.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO sync_failures (account_id, item_key, error, attempt, status, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_id, item_key) DO UPDATE SET
                error = excluded.error,
                attempt = excluded.attempt,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                failure.account_id.as_str(),
                item_key(failure.item_id.as_ref()),
                serde_json::to_string(&failure.error)?,
                failure.attempt,
                failure.status.as_str(),
                failure.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves the failure for `(account, item)`.
pub async fn get(
    db: &Database,
    account_id: &AccountId,
    item_id: Option<&EmailId>,
) -> Result<Option<SyncFailure>> {
    let account_id = account_id.clone();
    let key = item_key(item_id);

    db.with_conn(move |conn| {
        let sql = format!("SELECT {COLUMNS} FROM sync_failures WHERE account_id = ?1 AND item_key = ?2");
        Ok(conn
            .query_row(&sql, params![account_id.as_str(), key], row_to_failure)
            .optional()?)
    })
    .await
}

/// Lists an account's failures, or every failure when `account_id` is `None`.
pub async fn list(db: &Database, account_id: Option<&AccountId>) -> Result<Vec<SyncFailure>> {
    let account_id = account_id.cloned();

    db.with_conn(move |conn| {
        let (sql, args) = match &account_id {
            Some(id) => (
                format!("SELECT {COLUMNS} FROM sync_failures WHERE account_id = ?1 ORDER BY updated_at, item_key"),
                vec![id.0.clone()],
            ),
            None => (
                format!("SELECT {COLUMNS} FROM sync_failures ORDER BY account_id, updated_at, item_key"),
                Vec::new(),
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_failure)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Removes the failure for `(account, item)`. Returns whether one existed.
pub async fn delete(db: &Database, account_id: &AccountId, item_id: Option<&EmailId>) -> Result<bool> {
    let account_id = account_id.clone();
    let key = item_key(item_id);

    db.with_conn(move |conn| {
        let n = conn.execute(
            "DELETE FROM sync_failures WHERE account_id = ?1 AND item_key = ?2",
            params![account_id.as_str(), key],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Removes every failure for an account.
pub async fn delete_for_account(db: &Database, account_id: &AccountId) -> Result<usize> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        Ok(conn.execute(
            "DELETE FROM sync_failures WHERE account_id = ?1",
            [account_id.as_str()],
        )?)
    })
    .await
}

fn row_to_failure(row: &Row<'_>) -> rusqlite::Result<SyncFailure> {
    let key: String = row.get(1)?;
    let error: String = row.get(2)?;
    let status: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(SyncFailure {
        account_id: AccountId(row.get(0)?),
        item_id: (!key.is_empty()).then(|| EmailId(key)),
        error: json(2, &error)?,
        attempt: row.get(3)?,
        status: tag(4, &status, FailureStatus::parse)?,
        updated_at: timestamp(5, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClassifiedError, ErrorKind};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn failure(account: &str, item: Option<&str>, attempt: u32, status: FailureStatus) -> SyncFailure {
        SyncFailure {
            account_id: AccountId::from(account),
            item_id: item.map(EmailId::from),
            error: ClassifiedError::new(ErrorKind::Transient, "HTTP 503 Service Unavailable")
                .with_status(503)
                .with_retry_after_ms(2_000),
            attempt,
            status,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_attempt_and_status() {
        let db = Database::open_in_memory().await.unwrap();

        upsert(&db, &failure("a1", None, 1, FailureStatus::Pending)).await.unwrap();
        let latest = failure("a1", None, 3, FailureStatus::Exhausted);
        upsert(&db, &latest).await.unwrap();

        let stored = get(&db, &AccountId::from("a1"), None).await.unwrap().unwrap();
        assert_eq!(stored, latest);
        assert_eq!(list(&db, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn item_and_account_failures_are_distinct() {
        let db = Database::open_in_memory().await.unwrap();
        let account = AccountId::from("a1");
        let item = EmailId::from("e1");

        upsert(&db, &failure("a1", None, 1, FailureStatus::Pending)).await.unwrap();
        upsert(&db, &failure("a1", Some("e1"), 1, FailureStatus::Permanent)).await.unwrap();
        upsert(&db, &failure("a2", None, 1, FailureStatus::Pending)).await.unwrap();

        assert_eq!(list(&db, Some(&account)).await.unwrap().len(), 2);

        assert!(delete(&db, &account, Some(&item)).await.unwrap());
        assert!(!delete(&db, &account, Some(&item)).await.unwrap());
        assert!(get(&db, &account, None).await.unwrap().is_some());

        assert_eq!(delete_for_account(&db, &account).await.unwrap(), 1);
        assert_eq!(list(&db, None).await.unwrap().len(), 1);
    }
}
