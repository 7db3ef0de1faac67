//! Schema/table/sequence/constraint/index mutation primitives.
//!
//! Every operation here is a single statement or a short sequence executed
//! sequentially on the caller's own connection. On statement failure, only
//! that statement is rolled back (sqlx wraps each `query` bare call in an
//! implicit single-statement transaction on the server) — it is the
//! caller's job to decide whether to retry or propagate.

use sqlx::PgExecutor;

use dbslice_core::{Error, Result};

use crate::introspect;

/// Quote a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a `schema.table` pair as `"schema"."table"`.
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Create each schema in `names` if it does not already exist.
pub async fn ensure_schemas(conn: &mut sqlx::PgConnection, names: &[String]) -> Result<()> {
    for name in names {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name));
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Drop `name` cascade, then recreate it empty.
pub async fn reset_schema(conn: &mut sqlx::PgConnection, name: &str) -> Result<()> {
    let drop_sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(name));
    sqlx::query(&drop_sql).execute(&mut *conn).await?;
    let create_sql = format!("CREATE SCHEMA {}", quote_ident(name));
    sqlx::query(&create_sql).execute(&mut *conn).await?;
    Ok(())
}

/// Rename schema `old` to `new`.
pub async fn rename_schema<'e, E>(exec: E, old: &str, new: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "ALTER SCHEMA {} RENAME TO {}",
        quote_ident(old),
        quote_ident(new)
    );
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// If `dst.table` is absent, create it as a structure-and-defaults clone of
/// `src.table` and attach the source primary key if present. Returns `true`
/// if the table was newly created.
pub async fn create_schema_only_table(
    conn: &mut sqlx::PgConnection,
    src_schema: &str,
    dst_schema: &str,
    table: &str,
) -> Result<bool> {
    if introspect::table_exists(&mut *conn, dst_schema, table).await? {
        return Ok(false);
    }
    let sql = format!(
        "CREATE TABLE {} (LIKE {} INCLUDING DEFAULTS)",
        quote_qualified(dst_schema, table),
        quote_qualified(src_schema, table)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;

    if let Some((pk_name, columns)) = introspect::primary_key(&mut *conn, src_schema, table).await? {
        add_primary_key(&mut *conn, dst_schema, table, &columns, &pk_name).await?;
    }
    Ok(true)
}

/// If `dst.table` is absent: create an UNLOGGED clone, bulk-insert all rows,
/// switch to LOGGED, and attach the source primary key. If present and
/// UNLOGGED: switch to LOGGED and attach the primary key if missing.
/// Otherwise: no-op. Returns `true` if the table was newly created.
pub async fn full_copy_table(
    conn: &mut sqlx::PgConnection,
    src_schema: &str,
    dst_schema: &str,
    table: &str,
) -> Result<bool> {
    let exists = introspect::table_exists(&mut *conn, dst_schema, table).await?;

    if !exists {
        let create_sql = format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            quote_qualified(dst_schema, table),
            quote_qualified(src_schema, table)
        );
        sqlx::query(&create_sql).execute(&mut *conn).await?;

        let insert_sql = format!(
            "INSERT INTO {} SELECT * FROM {}",
            quote_qualified(dst_schema, table),
            quote_qualified(src_schema, table)
        );
        sqlx::query(&insert_sql).execute(&mut *conn).await?;

        set_logged(&mut *conn, dst_schema, table).await?;

        if let Some((pk_name, columns)) =
            introspect::primary_key(&mut *conn, src_schema, table).await?
        {
            add_primary_key(&mut *conn, dst_schema, table, &columns, &pk_name).await?;
        }
        return Ok(true);
    }

    if introspect::is_unlogged_table(&mut *conn, dst_schema, table).await? {
        set_logged(&mut *conn, dst_schema, table).await?;
        if !introspect::has_primary_key(&mut *conn, dst_schema, table).await? {
            if let Some((pk_name, columns)) =
                introspect::primary_key(&mut *conn, src_schema, table).await?
            {
                add_primary_key(&mut *conn, dst_schema, table, &columns, &pk_name).await?;
            }
        }
    }
    Ok(false)
}

/// Add a primary key on `columns`. Fails if a constraint of that name
/// already exists; callers that want idempotence should check first.
pub async fn add_primary_key<'e, E>(
    exec: E,
    schema: &str,
    table: &str,
    columns: &[String],
    constraint_name: &str,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
        quote_qualified(schema, table),
        quote_ident(constraint_name),
        cols
    );
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// Copy every non-PK index from `src.table` to `dst.table`, rewriting
/// schema and table qualifiers and injecting `IF NOT EXISTS`.
pub async fn recreate_non_pk_indexes(
    conn: &mut sqlx::PgConnection,
    src_schema: &str,
    dst_schema: &str,
    table: &str,
) -> Result<usize> {
    let indexes = introspect::fetch_indexes(&mut *conn, src_schema, table).await?;
    let mut created = 0;
    for (name, def) in indexes {
        if name.ends_with("_pkey") {
            continue;
        }
        let rewritten = crate::canon::rewrite_index_def_for_dest(&def, src_schema, dst_schema, &name);
        sqlx::query(&rewritten).execute(&mut *conn).await?;
        created += 1;
    }
    Ok(created)
}

/// Move a qualified table into `target_schema`.
pub async fn move_to_schema<'e, E>(exec: E, schema: &str, table: &str, target_schema: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "ALTER TABLE {} SET SCHEMA {}",
        quote_qualified(schema, table),
        quote_ident(target_schema)
    );
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// `ANALYZE` a table.
pub async fn analyze_table<'e, E>(exec: E, schema: &str, table: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let sql = format!("ANALYZE {}", quote_qualified(schema, table));
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// `ALTER TABLE ... SET LOGGED`.
pub async fn set_logged<'e, E>(exec: E, schema: &str, table: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let sql = format!("ALTER TABLE {} SET LOGGED", quote_qualified(schema, table));
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// Drop a table if it exists, cascading.
pub async fn drop_table_if_exists<'e, E>(exec: E, schema: &str, table: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "DROP TABLE IF EXISTS {} CASCADE",
        quote_qualified(schema, table)
    );
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// Drop a batch of tables in one statement.
pub async fn drop_tables_if_exists<'e, E>(exec: E, schema: &str, tables: &[String]) -> Result<()>
where
    E: PgExecutor<'e>,
{
    if tables.is_empty() {
        return Ok(());
    }
    let qualified = tables
        .iter()
        .map(|t| quote_qualified(schema, t))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("DROP TABLE IF EXISTS {qualified} CASCADE");
    sqlx::query(&sql).execute(exec).await?;
    Ok(())
}

/// Relation names in `schema` matching a `LIKE` pattern (e.g. `order_sh%`).
pub async fn list_relations_like<'e, E>(exec: E, schema: &str, pattern: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT c.relname FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname LIKE $2
         ORDER BY c.relname",
    )
    .bind(schema)
    .bind(pattern)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Refresh a list of materialized views; each failure is swallowed so one
/// bad view does not abort the rest (the caller logs failures separately).
pub async fn refresh_materialized_views(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    views: &[String],
) -> Vec<(String, Option<String>)> {
    let mut results = Vec::new();
    for view in views {
        let sql = format!(
            "REFRESH MATERIALIZED VIEW {}",
            quote_qualified(schema, view)
        );
        match sqlx::query(&sql).execute(&mut *conn).await {
            Ok(_) => results.push((view.clone(), None)),
            Err(e) => results.push((view.clone(), Some(e.to_string()))),
        }
    }
    results
}

/// All materialized view names in `schema`.
pub async fn list_materialized_views<'e, E>(exec: E, schema: &str) -> Result<Vec<String>>
where
    E: PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT matviewname FROM pg_matviews WHERE schemaname = $1 ORDER BY matviewname",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Validate that a schema name given by configuration is not one of the
/// protected catalog/system namespaces a reset operation could destroy.
pub fn guard_resettable_schema(name: &str, protected: &[&str]) -> Result<()> {
    if protected.contains(&name) {
        return Err(Error::Precondition(format!(
            "refusing to reset protected schema '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn quotes_qualified_names() {
        assert_eq!(quote_qualified("stage", "orders"), "\"stage\".\"orders\"");
    }

    #[test]
    fn guard_rejects_protected_schema() {
        let protected = ["public", "pg_catalog", "information_schema"];
        assert!(guard_resettable_schema("public", &protected).is_err());
        assert!(guard_resettable_schema("shards", &protected).is_ok());
    }
}
