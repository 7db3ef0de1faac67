//! Read-only catalog introspection.
//!
//! Every query here is a plain `SELECT` against `information_schema` or
//! `pg_catalog`, parameterized on schema/table/column names (never
//! interpolated), and takes no lock beyond shared catalog access. Errors
//! from the server propagate untouched — there is no silent recovery here.

use std::collections::BTreeMap;

use sqlx::PgExecutor;

use dbslice_core::Result;

/// Per-column metadata as returned by `fetch_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub nullable: bool,
    pub default_expr: Option<String>,
    pub char_max_len: Option<i32>,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
}

/// A constraint kind as stored in `pg_constraint.contype`.
pub const CONSTRAINT_KINDS: [char; 4] = ['u', 'c', 'x', 'f'];

/// A single constraint's canonical catalog definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: char,
    pub definition: String,
}

/// A trigger's definition and backing function name.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerInfo {
    pub definition: String,
    pub function: String,
}

/// Does `schema.table` exist?
pub async fn table_exists<'e, E>(exec: E, schema: &str, table: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
    )
    .bind(schema)
    .bind(table)
    .fetch_optional(exec)
    .await?;
    Ok(row.is_some())
}

/// Does `schema.table` exist and have `column`?
pub async fn column_exists<'e, E>(exec: E, schema: &str, table: &str, column: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
    )
    .bind(schema)
    .bind(table)
    .bind(column)
    .fetch_optional(exec)
    .await?;
    Ok(row.is_some())
}

/// The `character_maximum_length` of a column, if any.
pub async fn column_char_max_length<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Option<i32>>
where
    E: PgExecutor<'e>,
{
    let row: Option<(Option<i32>,)> = sqlx::query_as(
        "SELECT character_maximum_length FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
    )
    .bind(schema)
    .bind(table)
    .bind(column)
    .fetch_optional(exec)
    .await?;
    Ok(row.and_then(|r| r.0))
}

/// `(constraint_name, ordered column list)` for the table's primary key.
pub async fn primary_key<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
) -> Result<Option<(String, Vec<String>)>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT tc.constraint_name, kcu.column_name
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
         WHERE tc.table_schema = $1 AND tc.table_name = $2 AND tc.constraint_type = 'PRIMARY KEY'
         ORDER BY kcu.ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(exec)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }
    let name = rows[0].0.clone();
    let columns = rows.into_iter().map(|(_, col)| col).collect();
    Ok(Some((name, columns)))
}

/// Does the table have a primary key?
pub async fn has_primary_key<'e, E>(exec: E, schema: &str, table: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    Ok(primary_key(exec, schema, table).await?.is_some())
}

/// All base table names in `schema`, in catalog order.
pub async fn list_tables<'e, E>(exec: E, schema: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name FROM information_schema.tables
         WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// All UNLOGGED table names in `schema`.
pub async fn list_unlogged_tables<'e, E>(exec: E, schema: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT c.relname
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relkind = 'r' AND c.relpersistence = 'u'
         ORDER BY c.relname",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Is `schema.table` UNLOGGED?
pub async fn is_unlogged_table<'e, E>(exec: E, schema: &str, table: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2 AND c.relpersistence = 'u'",
    )
    .bind(schema)
    .bind(table)
    .fetch_optional(exec)
    .await?;
    Ok(row.is_some())
}

/// Does `schema` exist?
pub async fn schema_exists<'e, E>(exec: E, schema: &str) -> Result<bool>
where
    E: PgExecutor<'e>,
{
    let row: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM information_schema.schemata WHERE schema_name = $1")
            .bind(schema)
            .fetch_optional(exec)
            .await?;
    Ok(row.is_some())
}

/// All sequence names in `schema`.
pub async fn list_sequences<'e, E>(exec: E, schema: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT sequence_name FROM information_schema.sequences
         WHERE sequence_schema = $1 ORDER BY sequence_name",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Per-column metadata for `schema.table`.
pub async fn fetch_columns<'e, E>(exec: E, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(
        String,
        String,
        String,
        String,
        Option<String>,
        Option<i32>,
        Option<i32>,
        Option<i32>,
    )> = sqlx::query_as(
        "SELECT column_name, data_type, udt_name, is_nullable, column_default,
                character_maximum_length, numeric_precision, numeric_scale
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(exec)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(name, data_type, udt_name, nullable, default_expr, char_max_len, precision, scale)| {
                ColumnInfo {
                    name,
                    data_type,
                    udt_name,
                    nullable: nullable == "YES",
                    default_expr,
                    char_max_len,
                    numeric_precision: precision,
                    numeric_scale: scale,
                }
            },
        )
        .collect())
}

/// Constraints on `schema.table`, partitioned by kind.
pub async fn fetch_constraints<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
) -> Result<BTreeMap<char, Vec<ConstraintInfo>>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT con.conname, con.contype::text, pg_get_constraintdef(con.oid) AS definition
         FROM pg_constraint con
         JOIN pg_class c ON c.oid = con.conrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2
         ORDER BY con.conname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(exec)
    .await?;

    let mut out: BTreeMap<char, Vec<ConstraintInfo>> = BTreeMap::new();
    for (name, kind, definition) in rows {
        let kind_char = kind.chars().next().unwrap_or('?');
        out.entry(kind_char).or_default().push(ConstraintInfo {
            name,
            kind: kind_char,
            definition,
        });
    }
    Ok(out)
}

/// Non-PK and PK index definitions on `schema.table`, keyed by name.
pub async fn fetch_indexes<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
) -> Result<BTreeMap<String, String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT indexname, indexdef FROM pg_indexes
         WHERE schemaname = $1 AND tablename = $2
         ORDER BY indexname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Trigger definitions and their backing functions on `schema.table`.
pub async fn fetch_triggers<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
) -> Result<BTreeMap<String, TriggerInfo>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT t.tgname, pg_get_triggerdef(t.oid), p.proname
         FROM pg_trigger t
         JOIN pg_class c ON c.oid = t.tgrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         JOIN pg_proc p ON p.oid = t.tgfoid
         WHERE n.nspname = $1 AND c.relname = $2 AND NOT t.tgisinternal
         ORDER BY t.tgname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(exec)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, definition, function)| {
            (
                name,
                TriggerInfo {
                    definition,
                    function,
                },
            )
        })
        .collect())
}

/// `(next_value, increment_by, is_called)` for a sequence, where
/// `next_value = last_value` if not called else `last_value + increment_by`.
///
/// Takes a concrete connection (rather than a generic executor) because it
/// issues two sequential statements against the same session.
pub async fn fetch_sequence_core(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    seq: &str,
) -> Result<(i64, i64, bool)> {
    let qualified = format!("\"{schema}\".\"{seq}\"");
    let (last_value, is_called): (i64, bool) =
        sqlx::query_as(&format!("SELECT last_value, is_called FROM {qualified}"))
            .fetch_one(&mut *conn)
            .await?;
    let (increment_by,): (i64,) = sqlx::query_as(
        "SELECT increment FROM pg_sequences WHERE schemaname = $1 AND sequencename = $2",
    )
    .bind(schema)
    .bind(seq)
    .fetch_one(&mut *conn)
    .await?;

    let next_value = if is_called {
        last_value + increment_by
    } else {
        last_value
    };
    Ok((next_value, increment_by, is_called))
}

/// `table.column` a sequence is `OWNED BY`, if any.
pub async fn fetch_sequence_owned_by<'e, E>(
    exec: E,
    schema: &str,
    seq: &str,
) -> Result<Option<(String, String)>>
where
    E: PgExecutor<'e>,
{
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT tbl.relname, attr.attname
         FROM pg_depend dep
         JOIN pg_class seqc ON seqc.oid = dep.objid
         JOIN pg_namespace seqn ON seqn.oid = seqc.relnamespace
         JOIN pg_class tbl ON tbl.oid = dep.refobjid
         JOIN pg_attribute attr ON attr.attrelid = tbl.oid AND attr.attnum = dep.refobjsubid
         WHERE seqn.nspname = $1 AND seqc.relname = $2 AND dep.deptype = 'a'",
    )
    .bind(schema)
    .bind(seq)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

/// `(child_table, parent_table)` for every foreign key whose child table
/// lives in `schema`.
pub async fn fetch_fk_child_parent_pairs<'e, E>(
    exec: E,
    schema: &str,
) -> Result<Vec<(String, String)>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT c.relname, rc.relname
         FROM pg_constraint con
         JOIN pg_class c ON c.oid = con.conrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         JOIN pg_class rc ON rc.oid = con.confrelid
         WHERE n.nspname = $1 AND con.contype = 'f'
         ORDER BY c.relname, rc.relname",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows)
}

/// Every destination table (in `schema`) that has a column named `column`.
pub async fn tables_with_column<'e, E>(
    exec: E,
    schema: &str,
    column: &str,
) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name FROM information_schema.columns
         WHERE table_schema = $1 AND column_name = $2
         ORDER BY table_name",
    )
    .bind(schema)
    .bind(column)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Every non-null value of `column` in `schema.table`, as a reusable
/// `SELECT DISTINCT` sub-query string and its materialized result.
pub async fn distinct_column_values<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Vec<i64>>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "SELECT DISTINCT \"{column}\" FROM \"{schema}\".\"{table}\" WHERE \"{column}\" IS NOT NULL"
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(exec).await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_kinds_cover_expected_set() {
        assert_eq!(CONSTRAINT_KINDS, ['u', 'c', 'x', 'f']);
    }
}
