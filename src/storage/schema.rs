//! SQL schema definitions as const strings.
//!
//! Every statement is idempotent so the full list runs on each open.

/// Per-account sync state.
pub const CREATE_SYNC_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    account_id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    cursor TEXT,
    last_sync_at TEXT,
    status TEXT NOT NULL DEFAULT 'never',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Mirrored mail item documents. Deletions are tombstones.
pub const CREATE_EMAILS: &str = r#"
CREATE TABLE IF NOT EXISTS emails (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    from_address TEXT NOT NULL,
    from_name TEXT,
    subject TEXT,
    snippet TEXT NOT NULL DEFAULT '',
    body TEXT,
    labels TEXT NOT NULL DEFAULT '[]',
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    has_local_changes INTEGER NOT NULL DEFAULT 0,
    server_updated_at TEXT NOT NULL
)
"#;

/// Email indexes.
pub const CREATE_EMAIL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_emails_account ON emails(account_id);
CREATE INDEX IF NOT EXISTS idx_emails_updated ON emails(server_updated_at DESC)
"#;

/// Sync failures. `item_key` is empty for account-level failures.
pub const CREATE_SYNC_FAILURES: &str = r#"
CREATE TABLE IF NOT EXISTS sync_failures (
    account_id TEXT NOT NULL,
    item_key TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, item_key)
)
"#;

/// Unresolved conflicts.
pub const CREATE_PENDING_CONFLICTS: &str = r#"
CREATE TABLE IF NOT EXISTS pending_conflicts (
    id TEXT PRIMARY KEY,
    email_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    conflict_type TEXT NOT NULL,
    local_version TEXT NOT NULL,
    server_version TEXT NOT NULL,
    conflicting_fields TEXT NOT NULL,
    detected_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_conflicts_account ON pending_conflicts(account_id)
"#;

/// Conflict audit trail. Rows are only ever inserted.
pub const CREATE_CONFLICT_RESOLUTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS conflict_resolutions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conflict_id TEXT NOT NULL UNIQUE,
    email_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    conflict_type TEXT NOT NULL,
    conflicting_fields TEXT NOT NULL,
    strategy TEXT NOT NULL,
    resolved_data TEXT NOT NULL,
    resolved_at TEXT NOT NULL
)
"#;

/// Per-type resolution preferences.
pub const CREATE_CONFLICT_PREFERENCES: &str = r#"
CREATE TABLE IF NOT EXISTS conflict_preferences (
    conflict_type TEXT PRIMARY KEY,
    preference TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_SYNC_STATE,
        CREATE_EMAILS,
        CREATE_EMAIL_INDEXES,
        CREATE_SYNC_FAILURES,
        CREATE_PENDING_CONFLICTS,
        CREATE_CONFLICT_RESOLUTIONS,
        CREATE_CONFLICT_PREFERENCES,
    ]
}
