//! Redaction ("neuter"): overwrite sensitive destination columns per the
//! plan's `neuter.targets` rules, optionally sharded across connections.
//!
//! Sharded redaction issues statements on dedicated connections opened
//! directly from a database URL rather than a shared pool, mirroring the
//! builder's and FK validator's one-connection-per-task model — an
//! explicit DSN is required whenever `parallel > 1` is configured for a
//! sharded rule, since the redactor does not otherwise have a pool to draw
//! extra connections from.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use dbslice_core::plan::{NeuterConfig, NeuterRule, NeuterStrategy};
use dbslice_core::{Error, Result};

use crate::ddl::quote_qualified;
use crate::introspect;
use crate::pool::connect_one;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RedactReport {
    pub rules_applied: usize,
    pub rows_affected: u64,
}

/// Apply every rule in `neuter.targets` against `dest_schema`. `database_url`
/// is required only when a rule declares `shard` and `neuter.parallel > 1`.
pub async fn run_redaction(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    config: &NeuterConfig,
    database_url: Option<&str>,
) -> Result<RedactReport> {
    if !config.enabled {
        return Ok(RedactReport::default());
    }

    let mut report = RedactReport::default();

    for (table, rules) in &config.targets {
        for rule in rules {
            validate_strategy(rule)?;

            let rows = if let (Some(shard), true) = (&rule.shard, config.parallel > 1) {
                let url = database_url.ok_or_else(|| {
                    Error::Config(format!(
                        "neuter rule for {table}.{} declares a shard and parallel > 1 but no database_url was supplied",
                        rule.column
                    ))
                })?;
                run_sharded(url, dest_schema, table, rule, shard, config.parallel).await?
            } else {
                apply_rule(conn, dest_schema, table, rule).await?
            };

            report.rules_applied += 1;
            report.rows_affected += rows;
        }
    }

    info!(
        subsystem = "redact",
        component = "redact",
        op = "complete",
        rules_applied = report.rules_applied,
        rows_affected = report.rows_affected,
        "redaction complete"
    );

    Ok(report)
}

fn validate_strategy(rule: &NeuterRule) -> Result<()> {
    match rule.strategy {
        NeuterStrategy::Prefix | NeuterStrategy::Replace => Ok(()),
    }
}

async fn apply_rule(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    table: &str,
    rule: &NeuterRule,
) -> Result<u64> {
    let sql = build_rule_sql(conn, dest_schema, table, rule, None).await?;
    let result = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn build_rule_sql(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    table: &str,
    rule: &NeuterRule,
    shard_predicate: Option<&str>,
) -> Result<String> {
    let column = crate::ddl::quote_ident(&rule.column);
    let qualified_table = quote_qualified(dest_schema, table);
    let value = rule.value.replace('\'', "''");

    let set_expr = match rule.strategy {
        NeuterStrategy::Replace => format!("'{value}'"),
        NeuterStrategy::Prefix => {
            let char_len = introspect::column_char_max_length(&mut *conn, dest_schema, table, &rule.column).await?;
            let concat = format!("'{value}' || {column}");
            match char_len {
                Some(n) => format!("left({concat}, {n})"),
                None => concat,
            }
        }
    };

    let mut predicates = Vec::new();
    match rule.strategy {
        NeuterStrategy::Prefix => {
            predicates.push(format!("{column} IS NOT NULL"));
            predicates.push(format!("{column} <> ''"));
            for pattern in &rule.skip_patterns {
                let escaped = pattern.replace('\'', "''");
                predicates.push(format!("{column} NOT ILIKE '{escaped}'"));
            }
            predicates.push(format!("{column} NOT ILIKE '{value}%'"));
        }
        NeuterStrategy::Replace => {}
    }
    if let Some(shard_pred) = shard_predicate {
        predicates.push(shard_pred.to_string());
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    Ok(format!(
        "UPDATE {qualified_table} SET {column} = {set_expr}{where_clause}"
    ))
}

async fn run_sharded(
    database_url: &str,
    dest_schema: &str,
    table: &str,
    rule: &NeuterRule,
    shard: &dbslice_core::plan::NeuterShard,
    parallel: usize,
) -> Result<u64> {
    let fanout = parallel.min(shard.modulo as usize).max(1);
    let semaphore = Arc::new(Semaphore::new(fanout));
    let mut tasks: JoinSet<Result<u64>> = JoinSet::new();

    for i in 0..shard.modulo {
        let sem = semaphore.clone();
        let url = database_url.to_string();
        let dest_schema = dest_schema.to_string();
        let table = table.to_string();
        let rule = rule.clone();
        let shard_col = shard.column.clone();
        let modulo = shard.modulo;
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore not closed");
            let mut conn = connect_one(&url).await?;
            let shard_pred = format!(
                "({} % {modulo}) = {i}",
                crate::ddl::quote_ident(&shard_col)
            );
            let sql = build_rule_sql(&mut conn, &dest_schema, &table, &rule, Some(&shard_pred)).await?;
            let result = sqlx::query(&sql).execute(&mut conn).await?;
            Ok(result.rows_affected())
        });
    }

    let mut total = 0u64;
    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| Error::Execution(e.to_string())).and_then(|r| r) {
            Ok(rows) => total += rows,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = RedactReport::default();
        assert_eq!(report.rules_applied, 0);
        assert_eq!(report.rows_affected, 0);
    }
}
