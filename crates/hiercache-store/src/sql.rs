//! Row decoding helpers.
//!
//! Kernel ids are stored as text and parsed back with `FromStr`; parse
//! failures surface as rusqlite conversion errors so they flow through
//! the same `?` chains as every other column error.

use rusqlite::Row;
use rusqlite::types::Type;
use std::str::FromStr;

pub(crate) fn get_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn get_opt_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        t.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Render an optional id for binding; `None` binds SQL NULL.
pub(crate) fn opt_text<T: ToString>(value: Option<&T>) -> Option<String> {
    value.map(ToString::to_string)
}

pub(crate) fn to_sql_int(value: u64) -> i64 {
    value as i64
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    value as u64
}
