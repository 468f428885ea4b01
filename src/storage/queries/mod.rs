//! Database query modules.
//!
//! Each module provides async functions that operate on the database.

pub mod conflicts;
pub mod emails;
pub mod failures;
pub mod sync_state;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;

/// Parses an RFC 3339 column.
pub(crate) fn timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decodes a JSON text column.
pub(crate) fn json<T: DeserializeOwned>(idx: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Maps a stored enum tag back to its type.
pub(crate) fn tag<T>(idx: usize, value: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value {value:?}").into(),
        )
    })
}
