//! Trigger reconciliation: add missing source triggers, drop destination
//! triggers absent from source, per table.

use tracing::info;

use dbslice_core::Result;

use crate::canon::rewrite_trigger_def_for_dest;
use crate::ddl::quote_qualified;
use crate::introspect;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TriggerReport {
    pub added: Vec<String>,
    pub dropped: Vec<String>,
}

pub async fn reconcile_triggers_for_table(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
) -> Result<TriggerReport> {
    let mut report = TriggerReport::default();

    if !introspect::table_exists(&mut *conn, dest_schema, table).await?
        || !introspect::table_exists(&mut *conn, source_schema, table).await?
    {
        return Ok(report);
    }

    let src_triggers = introspect::fetch_triggers(&mut *conn, source_schema, table).await?;
    let dst_triggers = introspect::fetch_triggers(&mut *conn, dest_schema, table).await?;

    for (name, info) in &src_triggers {
        if !dst_triggers.contains_key(name) {
            let rewritten = rewrite_trigger_def_for_dest(&info.definition, source_schema, dest_schema);
            sqlx::query(&rewritten).execute(&mut *conn).await?;
            report.added.push(name.clone());
        }
    }

    for name in dst_triggers.keys() {
        if !src_triggers.contains_key(name) {
            let sql = format!(
                "DROP TRIGGER IF EXISTS \"{name}\" ON {}",
                quote_qualified(dest_schema, table)
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            report.dropped.push(name.clone());
        }
    }

    if !report.added.is_empty() || !report.dropped.is_empty() {
        info!(
            subsystem = "reconcile",
            component = "triggers",
            op = "table_complete",
            table = %table,
            added = report.added.len(),
            dropped = report.dropped.len(),
            "trigger reconciliation complete for table"
        );
    }

    Ok(report)
}

pub async fn reconcile_triggers(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    tables: &[String],
) -> Result<TriggerReport> {
    let mut total = TriggerReport::default();
    for table in tables {
        let report = reconcile_triggers_for_table(conn, source_schema, dest_schema, table).await?;
        total.added.extend(report.added);
        total.dropped.extend(report.dropped);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = TriggerReport::default();
        assert!(report.added.is_empty());
        assert!(report.dropped.is_empty());
    }
}
