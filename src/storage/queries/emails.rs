//! Mail item document queries.
//!
//! Every write is an upsert keyed by item id, so replaying a batch after a
//! crash leaves the same rows behind.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{json, timestamp};
use crate::domain::{AccountId, Address, EmailId, EmailQuery, LabelId, MailItem, ThreadId};
use crate::storage::database::{Database, Result};

const COLUMNS: &str = r#"
    id, account_id, thread_id, from_address, from_name, subject, snippet, body,
    labels, is_read, is_starred, is_deleted, has_local_changes, server_updated_at
"#;

/// Inserts or replaces one item.
pub async fn upsert(db: &Database, item: &MailItem) -> Result<()> {
    let item = item.clone();
    db.with_conn(move |conn| upsert_with(conn, &item)).await
}

/// Inserts or replaces several items in one transaction.
pub async fn upsert_many(db: &Database, items: Vec<MailItem>) -> Result<usize> {
    db.transaction(move |tx| {
        for item in &items {
            upsert_with(tx, item)?;
        }
        Ok(items.len())
    })
    .await
}

fn upsert_with(conn: &Connection, item: &MailItem) -> Result<()> {
    let labels = serde_json::to_string(&item.labels)?;
    conn.execute(
        r#"
        INSERT INTO emails (
            id, account_id, thread_id, from_address, from_name, subject, snippet, body,
            labels, is_read, is_starred, is_deleted, has_local_changes, server_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            account_id = excluded.account_id,
            thread_id = excluded.thread_id,
            from_address = excluded.from_address,
            from_name = excluded.from_name,
            subject = excluded.subject,
            snippet = excluded.snippet,
            body = excluded.body,
            labels = excluded.labels,
            is_read = excluded.is_read,
            is_starred = excluded.is_starred,
            is_deleted = excluded.is_deleted,
            has_local_changes = excluded.has_local_changes,
            server_updated_at = excluded.server_updated_at
        "#,
        params![
            item.id.as_str(),
            item.account_id.as_str(),
            item.thread_id.as_str(),
            item.from.email,
            item.from.name,
            item.subject,
            item.snippet,
            item.body,
            labels,
            item.is_read,
            item.is_starred,
            item.is_deleted,
            item.has_local_changes,
            item.server_updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Retrieves an item by id, tombstones included.
pub async fn get_by_id(db: &Database, id: &EmailId) -> Result<Option<MailItem>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {COLUMNS} FROM emails WHERE id = ?1");
        Ok(conn.query_row(&sql, [id.as_str()], row_to_item).optional()?)
    })
    .await
}

/// Retrieves live items matching `query`, newest first.
pub async fn find(db: &Database, query: &EmailQuery) -> Result<Vec<MailItem>> {
    let query = query.clone();

    db.with_conn(move |conn| {
        let mut clauses = vec!["is_deleted = 0".to_string()];
        let mut args: Vec<String> = Vec::new();

        if let Some(account_id) = &query.account_id {
            args.push(account_id.0.clone());
            clauses.push(format!("account_id = ?{}", args.len()));
        }
        if let Some(label) = &query.label {
            args.push(label.0.clone());
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(emails.labels) WHERE json_each.value = ?{})",
                args.len()
            ));
        }
        if query.unread_only {
            clauses.push("is_read = 0".to_string());
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM emails WHERE {} ORDER BY server_updated_at DESC, id",
            clauses.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_item)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Counts live items for an account.
pub async fn count_for_account(db: &Database, account_id: &AccountId) -> Result<i64> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE account_id = ?1 AND is_deleted = 0",
            [account_id.as_str()],
            |row| row.get(0),
        )?)
    })
    .await
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<MailItem> {
    let labels: String = row.get(8)?;
    let updated: String = row.get(13)?;

    Ok(MailItem {
        id: EmailId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        thread_id: ThreadId(row.get(2)?),
        from: Address {
            email: row.get(3)?,
            name: row.get(4)?,
        },
        subject: row.get(5)?,
        snippet: row.get(6)?,
        body: row.get(7)?,
        labels: json::<Vec<LabelId>>(8, &labels)?,
        is_read: row.get(9)?,
        is_starred: row.get(10)?,
        is_deleted: row.get(11)?,
        has_local_changes: row.get(12)?,
        server_updated_at: timestamp(13, &updated)?,
    })
}
