//! SQL functions registered on every store connection.
//!
//! - `variables_match(stored, candidate, exact)`: the variables rule from
//!   the kernel, applied to serialized variable sets
//! - `concat_index(prefix, local)`: joins stored ordering indexes
//! - `id_concat(id)`: aggregates ids into one comma-separated string

use hiercache_kernel::{RulesetVariables, concat_stored_indexes, variables_match};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::Connection;

pub const FN_VARIABLES_MATCH: &str = "variables_match";
pub const FN_CONCAT_INDEX: &str = "concat_index";
pub const FN_ID_CONCAT: &str = "id_concat";

pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    let deterministic = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function(FN_VARIABLES_MATCH, 3, deterministic, |ctx| {
        let stored = parse_variables(ctx, 0)?;
        let candidate = parse_variables(ctx, 1)?;
        let exact: bool = ctx.get::<Option<bool>>(2)?.unwrap_or(false);
        Ok(variables_match(&stored, &candidate, exact))
    })?;

    conn.create_scalar_function(FN_CONCAT_INDEX, 2, deterministic, |ctx| {
        let prefix = ctx.get::<Option<String>>(0)?.unwrap_or_default();
        let local = ctx.get::<Option<String>>(1)?.unwrap_or_default();
        Ok(concat_stored_indexes(&prefix, &local))
    })?;

    conn.create_aggregate_function(FN_ID_CONCAT, 1, FunctionFlags::SQLITE_UTF8, IdConcat)?;
    Ok(())
}

fn parse_variables(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<RulesetVariables> {
    let text = ctx.get::<Option<String>>(idx)?.unwrap_or_default();
    RulesetVariables::from_storage_string(&text)
        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
}

struct IdConcat;

impl Aggregate<Vec<String>, Option<String>> for IdConcat {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Vec<String>) -> rusqlite::Result<()> {
        if let Some(id) = ctx.get::<Option<String>>(0)? {
            acc.push(id);
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<Vec<String>>,
    ) -> rusqlite::Result<Option<String>> {
        Ok(acc.filter(|ids| !ids.is_empty()).map(|ids| ids.join(",")))
    }
}

/// Split an `id_concat` result back into its parts.
pub fn split_id_list(list: Option<&str>) -> impl Iterator<Item = &str> {
    list.unwrap_or_default()
        .split(',')
        .filter(|part| !part.is_empty())
}
