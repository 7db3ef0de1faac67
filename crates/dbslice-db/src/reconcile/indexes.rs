//! Index reconciliation: create missing source indexes, recreate drifted
//! ones, drop destination-only indexes (excluding primary keys), per table.

use tracing::info;

use dbslice_core::Result;

use crate::canon::{canonical_index_def, rewrite_index_def_for_dest};
use crate::introspect;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IndexReport {
    pub created: Vec<String>,
    pub recreated: Vec<String>,
    pub dropped: Vec<String>,
}

pub async fn reconcile_indexes_for_table(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
) -> Result<IndexReport> {
    let mut report = IndexReport::default();

    if !introspect::table_exists(&mut *conn, dest_schema, table).await?
        || !introspect::table_exists(&mut *conn, source_schema, table).await?
    {
        return Ok(report);
    }

    let src_indexes = introspect::fetch_indexes(&mut *conn, source_schema, table).await?;
    let dst_indexes = introspect::fetch_indexes(&mut *conn, dest_schema, table).await?;

    for (name, def) in &src_indexes {
        if name.ends_with("_pkey") {
            continue;
        }
        match dst_indexes.get(name) {
            None => {
                let rewritten = rewrite_index_def_for_dest(def, source_schema, dest_schema, name);
                sqlx::query(&rewritten).execute(&mut *conn).await?;
                report.created.push(name.clone());
            }
            Some(dst_def) => {
                let src_canon = canonical_index_def(def, source_schema, dest_schema);
                let dst_canon = canonical_index_def(dst_def, dest_schema, dest_schema);
                if src_canon != dst_canon {
                    let drop_sql = format!(
                        "DROP INDEX IF EXISTS \"{dest_schema}\".\"{name}\""
                    );
                    sqlx::query(&drop_sql).execute(&mut *conn).await?;
                    let rewritten = rewrite_index_def_for_dest(def, source_schema, dest_schema, name);
                    sqlx::query(&rewritten).execute(&mut *conn).await?;
                    report.recreated.push(name.clone());
                }
            }
        }
    }

    for name in dst_indexes.keys() {
        if name.ends_with("_pkey") {
            continue;
        }
        if !src_indexes.contains_key(name) {
            let sql = format!("DROP INDEX IF EXISTS \"{dest_schema}\".\"{name}\"");
            sqlx::query(&sql).execute(&mut *conn).await?;
            report.dropped.push(name.clone());
        }
    }

    if !report.created.is_empty() || !report.recreated.is_empty() || !report.dropped.is_empty() {
        info!(
            subsystem = "reconcile",
            component = "indexes",
            op = "table_complete",
            table = %table,
            created = report.created.len(),
            recreated = report.recreated.len(),
            dropped = report.dropped.len(),
            "index reconciliation complete for table"
        );
    }

    Ok(report)
}

pub async fn reconcile_indexes(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    tables: &[String],
) -> Result<IndexReport> {
    let mut total = IndexReport::default();
    for table in tables {
        let report = reconcile_indexes_for_table(conn, source_schema, dest_schema, table).await?;
        total.created.extend(report.created);
        total.recreated.extend(report.recreated);
        total.dropped.extend(report.dropped);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = IndexReport::default();
        assert!(report.created.is_empty());
        assert!(report.recreated.is_empty());
        assert!(report.dropped.is_empty());
    }
}
