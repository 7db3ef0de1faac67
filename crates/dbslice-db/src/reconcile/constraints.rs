//! Constraint reconciliation: primary keys first, then unique/check/
//! exclusion/foreign-key constraints by canonical-definition diff, followed
//! by bounded-concurrency foreign-key validation.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use dbslice_core::{Error, Result};

use crate::canon::canonical_constraint_def;
use crate::ddl::{add_primary_key, quote_ident, quote_qualified};
use crate::introspect::{self, CONSTRAINT_KINDS};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ConstraintReport {
    pub primary_keys_added: Vec<String>,
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub dropped: Vec<String>,
}

/// Add primary keys to destination tables present in both schemas that
/// lack one, using the source's constraint name and column order.
pub async fn reconcile_primary_keys(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    tables: &[String],
) -> Result<Vec<String>> {
    let mut added = Vec::new();
    for table in tables {
        if !introspect::table_exists(&mut *conn, dest_schema, table).await?
            || !introspect::table_exists(&mut *conn, source_schema, table).await?
        {
            continue;
        }
        if introspect::has_primary_key(&mut *conn, dest_schema, table).await? {
            continue;
        }
        if let Some((name, columns)) = introspect::primary_key(&mut *conn, source_schema, table).await? {
            add_primary_key(&mut *conn, dest_schema, table, &columns, &name).await?;
            added.push(format!("{table}.{name}"));
        }
    }
    Ok(added)
}

/// Reconcile non-PK constraints for a single table, by kind, in the fixed
/// order `{u, c, x, f}`.
pub async fn reconcile_constraints_for_table(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
) -> Result<ConstraintReport> {
    let mut report = ConstraintReport::default();

    if !introspect::table_exists(&mut *conn, dest_schema, table).await?
        || !introspect::table_exists(&mut *conn, source_schema, table).await?
    {
        return Ok(report);
    }

    let src_constraints = introspect::fetch_constraints(&mut *conn, source_schema, table).await?;
    let dst_constraints = introspect::fetch_constraints(&mut *conn, dest_schema, table).await?;

    for kind in CONSTRAINT_KINDS {
        let src_by_kind: BTreeMap<&str, &str> = src_constraints
            .get(&kind)
            .map(|v| v.iter().map(|c| (c.name.as_str(), c.definition.as_str())).collect())
            .unwrap_or_default();
        let dst_by_kind: BTreeMap<&str, &str> = dst_constraints
            .get(&kind)
            .map(|v| v.iter().map(|c| (c.name.as_str(), c.definition.as_str())).collect())
            .unwrap_or_default();

        let is_fk = kind == 'f';

        for (name, src_def) in &src_by_kind {
            let src_canon = canonical_constraint_def(src_def, source_schema, dest_schema, is_fk);

            match dst_by_kind.get(name) {
                Some(dst_def) => {
                    let dst_canon = canonical_constraint_def(dst_def, dest_schema, dest_schema, is_fk);
                    if src_canon != dst_canon {
                        drop_constraint(conn, dest_schema, table, name).await?;
                        add_constraint(conn, dest_schema, table, name, &src_canon, is_fk).await?;
                        report.replaced.push((*name).to_string());
                    }
                }
                None => {
                    add_constraint_with_recovery(conn, dest_schema, table, name, &src_canon, is_fk).await?;
                    report.added.push((*name).to_string());
                }
            }
        }

        for name in dst_by_kind.keys() {
            if !src_by_kind.contains_key(name) {
                drop_constraint(conn, dest_schema, table, name).await?;
                report.dropped.push((*name).to_string());
            }
        }
    }

    if !report.added.is_empty() || !report.replaced.is_empty() || !report.dropped.is_empty() {
        info!(
            subsystem = "reconcile",
            component = "constraints",
            op = "table_complete",
            table = %table,
            added = report.added.len(),
            replaced = report.replaced.len(),
            dropped = report.dropped.len(),
            "constraint reconciliation complete for table"
        );
    }

    Ok(report)
}

pub async fn reconcile_constraints(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    tables: &[String],
) -> Result<ConstraintReport> {
    let mut total = ConstraintReport::default();
    for table in tables {
        let report = reconcile_constraints_for_table(conn, source_schema, dest_schema, table).await?;
        total.added.extend(report.added);
        total.replaced.extend(report.replaced);
        total.dropped.extend(report.dropped);
    }
    Ok(total)
}

async fn drop_constraint(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    table: &str,
    name: &str,
) -> Result<()> {
    let sql = format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
        quote_qualified(schema, table),
        quote_ident(name)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Add a constraint as given by its already-rewritten canonical definition.
/// Foreign keys are added `NOT VALID`; they are validated later in a
/// separate bounded-concurrency pass.
async fn add_constraint(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    table: &str,
    name: &str,
    definition: &str,
    is_fk: bool,
) -> Result<()> {
    let suffix = if is_fk && !definition.to_uppercase().contains("NOT VALID") {
        " NOT VALID"
    } else {
        ""
    };
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}{}",
        quote_qualified(schema, table),
        quote_ident(name),
        definition,
        suffix
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Add a constraint, retrying around known Postgres failure modes for
/// unique constraints that collide with an existing same-named index:
/// a deferrable unique constraint fails if a plain index of that name
/// already exists (drop it and retry); a non-deferrable one can instead
/// be attached `USING INDEX`.
async fn add_constraint_with_recovery(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    table: &str,
    name: &str,
    definition: &str,
    is_fk: bool,
) -> Result<()> {
    match add_constraint(conn, schema, table, name, definition, is_fk).await {
        Ok(()) => Ok(()),
        Err(Error::Database(e)) => {
            let is_unique = definition.to_uppercase().contains("UNIQUE");
            if !is_unique {
                return Err(Error::Database(e));
            }

            if definition.to_uppercase().contains("DEFERRABLE") {
                let drop_index_sql = format!(
                    "DROP INDEX IF EXISTS {}",
                    quote_qualified(schema, name)
                );
                sqlx::query(&drop_index_sql).execute(&mut *conn).await?;
                add_constraint(conn, schema, table, name, definition, is_fk).await
            } else {
                let using_index_sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE USING INDEX {}",
                    quote_qualified(schema, table),
                    quote_ident(name),
                    quote_ident(name)
                );
                sqlx::query(&using_index_sql).execute(&mut *conn).await?;
                Ok(())
            }
        }
        Err(e) => Err(e),
    }
}

/// Every destination foreign key constraint not yet validated, grouped by
/// table name so validations on the same table serialize.
async fn fetch_unvalidated_fks(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    tables_filter: Option<&[String]>,
) -> Result<BTreeMap<String, Vec<String>>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT c.relname, con.conname
         FROM pg_constraint con
         JOIN pg_class c ON c.oid = con.conrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND con.contype = 'f' AND NOT con.convalidated
         ORDER BY c.relname, con.conname",
    )
    .bind(dest_schema)
    .fetch_all(&mut *conn)
    .await?;

    let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (table, name) in rows {
        if let Some(filter) = tables_filter {
            if !filter.contains(&table) {
                continue;
            }
        }
        by_table.entry(table).or_default().push(name);
    }
    Ok(by_table)
}

/// Validate every not-yet-validated foreign key, one table's constraints
/// serialized per connection, tables run concurrently up to `parallelism`.
pub async fn validate_foreign_keys(
    pool: &PgPool,
    dest_schema: &str,
    tables_filter: Option<&[String]>,
    parallelism: usize,
) -> Result<usize> {
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let by_table = fetch_unvalidated_fks(&mut conn, dest_schema, tables_filter).await?;
    drop(conn);

    let total: usize = by_table.values().map(|v| v.len()).sum();
    if total == 0 {
        return Ok(0);
    }

    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks: JoinSet<Result<usize>> = JoinSet::new();

    for (table, names) in by_table {
        let pool = pool.clone();
        let sem = semaphore.clone();
        let dest_schema = dest_schema.to_string();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore not closed");
            let mut conn = pool.acquire().await.map_err(Error::Database)?;
            let mut validated = 0;
            for name in names {
                let sql = format!(
                    "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                    quote_qualified(&dest_schema, &table),
                    quote_ident(&name)
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
                validated += 1;
            }
            Ok(validated)
        });
    }

    let mut validated_total = 0;
    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| Error::Execution(e.to_string())).and_then(|r| r) {
            Ok(n) => validated_total += n,
            Err(e) => {
                if first_error.is_none() {
                    warn!(
                        subsystem = "reconcile",
                        component = "constraints",
                        op = "fk_validate_failed",
                        error_msg = %e,
                        "foreign key validation failed for a table"
                    );
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    info!(
        subsystem = "reconcile",
        component = "constraints",
        op = "fk_validate_complete",
        validated_count = validated_total,
        "foreign key validation complete"
    );

    Ok(validated_total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = ConstraintReport::default();
        assert!(report.primary_keys_added.is_empty());
        assert!(report.added.is_empty());
        assert!(report.replaced.is_empty());
        assert!(report.dropped.is_empty());
    }
}
