//! Pending conflicts, resolution preferences and the audit trail.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{json, tag, timestamp};
use crate::domain::{
    AccountId, ConflictId, ConflictPreference, ConflictResolution, ConflictType, EmailId,
    PendingConflict, ResolutionStrategy,
};
use crate::storage::database::{Database, Result};

const PENDING_COLUMNS: &str = r#"
    id, email_id, account_id, conflict_type, local_version, server_version,
    conflicting_fields, detected_at
"#;

const RESOLUTION_COLUMNS: &str = r#"
    conflict_id, email_id, account_id, conflict_type, conflicting_fields, strategy,
    resolved_data, resolved_at
"#;

/// Stores a pending conflict. Returns false if the id was already present.
pub async fn insert_pending(db: &Database, conflict: &PendingConflict) -> Result<bool> {
    let conflict = conflict.clone();

    db.with_conn(move |conn| {
        let n = conn.execute(
            r#"
            INSERT OR IGNORE INTO pending_conflicts (
                id, email_id, account_id, conflict_type, local_version, server_version,
                conflicting_fields, detected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                conflict.id.as_str(),
                conflict.email_id.as_str(),
                conflict.account_id.as_str(),
                conflict.conflict_type.as_str(),
                serde_json::to_string(&conflict.local_version)?,
                serde_json::to_string(&conflict.server_version)?,
                serde_json::to_string(&conflict.conflicting_fields)?,
                conflict.detected_at.to_rfc3339(),
            ],
        )?;
        Ok(n > 0)
    })
    .await
}

/// Stores a pending conflict, overwriting the versions, fields and type of
/// an existing row with the same id. `detected_at` keeps its first value.
pub async fn replace_pending(db: &Database, conflict: &PendingConflict) -> Result<()> {
    let conflict = conflict.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO pending_conflicts (
                id, email_id, account_id, conflict_type, local_version, server_version,
                conflicting_fields, detected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                conflict_type = excluded.conflict_type,
                local_version = excluded.local_version,
                server_version = excluded.server_version,
                conflicting_fields = excluded.conflicting_fields
            "#,
            params![
                conflict.id.as_str(),
                conflict.email_id.as_str(),
                conflict.account_id.as_str(),
                conflict.conflict_type.as_str(),
                serde_json::to_string(&conflict.local_version)?,
                serde_json::to_string(&conflict.server_version)?,
                serde_json::to_string(&conflict.conflicting_fields)?,
                conflict.detected_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists pending conflicts, oldest first.
pub async fn list_pending(db: &Database) -> Result<Vec<PendingConflict>> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_conflicts ORDER BY detected_at, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_pending)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Removes an account's pending conflicts.
pub async fn delete_pending_for_account(db: &Database, account_id: &AccountId) -> Result<usize> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        Ok(conn.execute(
            "DELETE FROM pending_conflicts WHERE account_id = ?1",
            [account_id.as_str()],
        )?)
    })
    .await
}

/// Appends the audit record and drops the pending conflict atomically.
pub async fn record_resolution(db: &Database, resolution: &ConflictResolution) -> Result<()> {
    let resolution = resolution.clone();

    db.transaction(move |tx| {
        tx.execute(
            r#"
            INSERT INTO conflict_resolutions (
                conflict_id, email_id, account_id, conflict_type, conflicting_fields,
                strategy, resolved_data, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                resolution.conflict_id.as_str(),
                resolution.email_id.as_str(),
                resolution.account_id.as_str(),
                resolution.conflict_type.as_str(),
                serde_json::to_string(&resolution.conflicting_fields)?,
                resolution.strategy.as_str(),
                serde_json::to_string(&resolution.resolved_data)?,
                resolution.resolved_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM pending_conflicts WHERE id = ?1",
            [resolution.conflict_id.as_str()],
        )?;
        Ok(())
    })
    .await
}

/// Lists the audit trail in insertion order.
pub async fn list_resolutions(db: &Database) -> Result<Vec<ConflictResolution>> {
    db.with_conn(|conn| {
        let sql = format!("SELECT {RESOLUTION_COLUMNS} FROM conflict_resolutions ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_resolution)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

/// Stores the preference for a conflict type.
pub async fn set_preference(
    db: &Database,
    conflict_type: ConflictType,
    preference: ConflictPreference,
) -> Result<()> {
    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO conflict_preferences (conflict_type, preference, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(conflict_type) DO UPDATE SET
                preference = excluded.preference,
                updated_at = excluded.updated_at
            "#,
            params![
                conflict_type.as_str(),
                preference.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists stored preferences.
pub async fn list_preferences(db: &Database) -> Result<Vec<(ConflictType, ConflictPreference)>> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT conflict_type, preference FROM conflict_preferences")?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(0)?;
            let preference: String = row.get(1)?;
            Ok((
                tag(0, &kind, ConflictType::parse)?,
                tag(1, &preference, ConflictPreference::parse)?,
            ))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    })
    .await
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingConflict> {
    let kind: String = row.get(3)?;
    let local: String = row.get(4)?;
    let server: String = row.get(5)?;
    let fields: String = row.get(6)?;
    let detected_at: String = row.get(7)?;

    Ok(PendingConflict {
        id: ConflictId(row.get(0)?),
        email_id: EmailId(row.get(1)?),
        account_id: AccountId(row.get(2)?),
        conflict_type: tag(3, &kind, ConflictType::parse)?,
        local_version: json(4, &local)?,
        server_version: json(5, &server)?,
        conflicting_fields: json(6, &fields)?,
        detected_at: timestamp(7, &detected_at)?,
    })
}

fn row_to_resolution(row: &Row<'_>) -> rusqlite::Result<ConflictResolution> {
    let kind: String = row.get(3)?;
    let fields: String = row.get(4)?;
    let strategy: String = row.get(5)?;
    let data: String = row.get(6)?;
    let resolved_at: String = row.get(7)?;

    Ok(ConflictResolution {
        conflict_id: ConflictId(row.get(0)?),
        email_id: EmailId(row.get(1)?),
        account_id: AccountId(row.get(2)?),
        conflict_type: tag(3, &kind, ConflictType::parse)?,
        conflicting_fields: json(4, &fields)?,
        strategy: tag(5, &strategy, ResolutionStrategy::parse)?,
        resolved_data: json(6, &data)?,
        resolved_at: timestamp(7, &resolved_at)?,
    })
}
