//! Per-account sync state records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{tag, timestamp};
use crate::domain::{Account, AccountId, Cursor, ProviderType, SyncStatus};
use crate::storage::database::{Database, Result};

const COLUMNS: &str = "account_id, provider, cursor, last_sync_at, status";

/// Creates the record for `account` unless one already exists.
///
/// Returns the stored record, which keeps its cursor when it pre-existed.
pub async fn ensure(db: &Database, account: &Account) -> Result<Account> {
    let account = account.clone();

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT OR IGNORE INTO sync_state (
                account_id, provider, cursor, last_sync_at, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                account.id.as_str(),
                account.provider.as_str(),
                account.cursor.as_ref().map(Cursor::as_str),
                account.last_sync_at.map(|t| t.to_rfc3339()),
                account.status.as_str(),
                now,
            ],
        )?;

        let sql = format!("SELECT {COLUMNS} FROM sync_state WHERE account_id = ?1");
        Ok(tx.query_row(&sql, [account.id.as_str()], row_to_account)?)
    })
    .await
}

/// Retrieves the record for an account.
pub async fn get(db: &Database, account_id: &AccountId) -> Result<Option<Account>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {COLUMNS} FROM sync_state WHERE account_id = ?1");
        Ok(conn
            .query_row(&sql, [account_id.as_str()], row_to_account)
            .optional()?)
    })
    .await
}

/// Retrieves every record, ordered by account id.
pub async fn get_all(db: &Database) -> Result<Vec<Account>> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {COLUMNS} FROM sync_state ORDER BY account_id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_account)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Updates the status only.
pub async fn set_status(db: &Database, account_id: &AccountId, status: SyncStatus) -> Result<()> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE sync_state SET status = ?2, updated_at = ?3 WHERE account_id = ?1",
            params![account_id.as_str(), status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })
    .await
}

/// Records a successful pass: new cursor, sync time and `success` status.
///
/// A `None` cursor keeps the stored one.
pub async fn advance_cursor(
    db: &Database,
    account_id: &AccountId,
    cursor: Option<&Cursor>,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    let account_id = account_id.clone();
    let cursor = cursor.cloned();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            UPDATE sync_state
            SET cursor = COALESCE(?2, cursor), last_sync_at = ?3, status = ?4, updated_at = ?5
            WHERE account_id = ?1
            "#,
            params![
                account_id.as_str(),
                cursor.as_ref().map(Cursor::as_str),
                synced_at.to_rfc3339(),
                SyncStatus::Success.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Deletes the record. Returns whether one existed.
pub async fn delete(db: &Database, account_id: &AccountId) -> Result<bool> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let n = conn.execute(
            "DELETE FROM sync_state WHERE account_id = ?1",
            [account_id.as_str()],
        )?;
        Ok(n > 0)
    })
    .await
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let provider: String = row.get(1)?;
    let cursor: Option<String> = row.get(2)?;
    let last_sync_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;

    Ok(Account {
        id: AccountId(row.get(0)?),
        provider: tag(1, &provider, ProviderType::parse)?,
        cursor: cursor.map(Cursor),
        last_sync_at: last_sync_at.map(|s| timestamp(3, &s)).transpose()?,
        status: SyncStatus::parse(&status),
    })
}
