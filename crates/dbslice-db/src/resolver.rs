//! The Selection Resolver: evaluates root selectors against the source
//! schema and (for `scope_or_exists`) already-resolved selections, emitting
//! a named [`Selection`] for each.

use std::collections::{BTreeMap, HashMap};

use dbslice_core::plan::{ColumnRef, SelectorMode, ShardStrategy};
use dbslice_core::{Error, Result, RootSelector, Selection};

use crate::ddl::quote_ident;
use crate::introspect;

/// Render a `serde_yaml::Value` as a SQL literal. Configuration values are
/// trusted inputs (see the design notes on sub-query strings as values), so
/// this does not attempt general escaping beyond quoting string literals.
fn yaml_value_to_sql_literal(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => "NULL".to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", serde_yaml::to_string(other).unwrap_or_default().replace('\'', "''")),
    }
}

fn ids_to_sql_literal(ids: &[i64]) -> String {
    if ids.is_empty() {
        "SELECT NULL::bigint WHERE FALSE".to_string()
    } else {
        let values = ids
            .iter()
            .map(|id| format!("({id})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT * FROM (VALUES {values}) AS v(id)")
    }
}

/// Resolve a root selector into a [`Selection`].
///
/// `resolved` must already contain every selection this selector's mode
/// references (`scope_or_exists.scope_selection`); the caller is
/// responsible for resolving selections in dependency order (see
/// `Plan::required_roots` for the transitive closure).
pub async fn resolve_selector(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    selector: &RootSelector,
    resolved: &BTreeMap<String, Selection>,
) -> Result<Selection> {
    let (mut ids, sql) = match &selector.mode {
        SelectorMode::List { ids } => (ids.clone(), ids_to_sql_literal(ids)),
        SelectorMode::Sql { query, params } => resolve_sql_mode(conn, query, params).await?,
        SelectorMode::ReferencedBy { refs } => resolve_referenced_by(conn, dest_schema, refs).await?,
        SelectorMode::ReferencedByColumn {
            schema,
            column,
            extra_refs,
        } => resolve_referenced_by_column(conn, schema, column, extra_refs).await?,
        SelectorMode::FkInStage {
            table,
            fk_col,
            stage_table,
            stage_id_col,
        } => resolve_fk_in_stage(conn, source_schema, dest_schema, table, fk_col, stage_table, stage_id_col).await?,
        SelectorMode::RefersToStage { table, targets } => {
            resolve_refers_to_stage(conn, source_schema, dest_schema, table, targets).await?
        }
        SelectorMode::ScopeOrExists {
            table,
            scope_col,
            scope_selection,
            exclude_values,
            exists_clause,
            local_predicate,
        } => {
            let scope = resolved.get(scope_selection).ok_or_else(|| {
                Error::Config(format!(
                    "scope_or_exists selector '{}' requires selection '{}' to be resolved first",
                    selector.name, scope_selection
                ))
            })?;
            resolve_scope_or_exists(
                conn,
                source_schema,
                table,
                scope_col,
                scope,
                exclude_values,
                exists_clause.as_deref(),
                local_predicate.as_deref(),
            )
            .await?
        }
    };

    for ensured in &selector.ensure {
        if !ids.contains(ensured) {
            ids.push(*ensured);
        }
    }

    let mut selection = Selection::unsharded(selector.name.clone(), ids, sql);

    if let Some(shard_cfg) = &selector.shard {
        selection.shards = build_shards(conn, &selection, shard_cfg).await?;
    }

    Ok(selection)
}

async fn resolve_sql_mode(
    conn: &mut sqlx::PgConnection,
    query: &str,
    params: &[serde_yaml::Value],
) -> Result<(Vec<i64>, String)> {
    let inlined = inline_params(query, params);
    let rows: Vec<(i64,)> = sqlx::query_as(&inlined).fetch_all(&mut *conn).await?;
    Ok((rows.into_iter().map(|(id,)| id).collect(), inlined))
}

/// Substitute `$1`, `$2`, ... placeholders with SQL literals so the query
/// becomes a self-contained, reusable sub-query string.
///
/// Placeholders are substituted highest-numbered first so that `$1` never
/// matches as a prefix of `$10`, `$11`, etc. before those are replaced.
fn inline_params(query: &str, params: &[serde_yaml::Value]) -> String {
    let mut text = query.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        text = text.replace(&placeholder, &yaml_value_to_sql_literal(param));
    }
    text
}

async fn resolve_referenced_by(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    refs: &[ColumnRef],
) -> Result<(Vec<i64>, String)> {
    if refs.is_empty() {
        return Err(Error::Config("referenced_by selector requires at least one ref".to_string()));
    }
    let parts: Vec<String> = refs
        .iter()
        .map(|r| {
            format!(
                "SELECT DISTINCT {} AS id FROM {}.{} WHERE {} IS NOT NULL",
                quote_ident(&r.column),
                quote_ident(dest_schema),
                quote_ident(&r.table),
                quote_ident(&r.column)
            )
        })
        .collect();
    let sql = parts.join(" UNION ");
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    Ok((rows.into_iter().map(|(id,)| id).collect(), sql))
}

async fn resolve_referenced_by_column(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    column: &str,
    extra_refs: &[ColumnRef],
) -> Result<(Vec<i64>, String)> {
    let tables = introspect::tables_with_column(&mut *conn, schema, column).await?;
    let mut refs: Vec<ColumnRef> = tables
        .into_iter()
        .map(|table| ColumnRef {
            table,
            column: column.to_string(),
        })
        .collect();
    refs.extend(extra_refs.iter().cloned());
    if refs.is_empty() {
        return Ok((Vec::new(), "SELECT NULL::bigint WHERE FALSE".to_string()));
    }
    resolve_referenced_by(conn, schema, &refs).await
}

#[allow(clippy::too_many_arguments)]
async fn resolve_fk_in_stage(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
    fk_col: &str,
    stage_table: &str,
    stage_id_col: &str,
) -> Result<(Vec<i64>, String)> {
    let sql = format!(
        "SELECT DISTINCT {src_t}.id AS id FROM {src_schema}.{src_t} {src_t}
         WHERE {src_t}.{fk} IS NOT NULL
           AND {src_t}.{fk} IN (SELECT {stage_id} FROM {dst_schema}.{stage_t} {stage_t})",
        src_schema = quote_ident(source_schema),
        src_t = quote_ident(table),
        fk = quote_ident(fk_col),
        dst_schema = quote_ident(dest_schema),
        stage_t = quote_ident(stage_table),
        stage_id = quote_ident(stage_id_col),
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    Ok((rows.into_iter().map(|(id,)| id).collect(), sql))
}

async fn resolve_refers_to_stage(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
    targets: &[dbslice_core::plan::ExistsTarget],
) -> Result<(Vec<i64>, String)> {
    if targets.is_empty() {
        return Err(Error::Config("refers_to_stage selector requires at least one target".to_string()));
    }
    let exists_clauses: Vec<String> = targets
        .iter()
        .map(|t| {
            format!(
                "EXISTS (SELECT 1 FROM {dst_schema}.{tgt} {tgt} WHERE {pred})",
                dst_schema = quote_ident(dest_schema),
                tgt = quote_ident(&t.table),
                pred = t.predicate
            )
        })
        .collect();
    let sql = format!(
        "SELECT DISTINCT d.id AS id FROM {src_schema}.{tbl} d WHERE {clauses}",
        src_schema = quote_ident(source_schema),
        tbl = quote_ident(table),
        clauses = exists_clauses.join(" OR ")
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    Ok((rows.into_iter().map(|(id,)| id).collect(), sql))
}

#[allow(clippy::too_many_arguments)]
async fn resolve_scope_or_exists(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    table: &str,
    scope_col: &str,
    scope: &Selection,
    exclude_values: &[serde_yaml::Value],
    exists_clause: Option<&str>,
    local_predicate: Option<&str>,
) -> Result<(Vec<i64>, String)> {
    let mut scope_pred = format!("d.{} IN ({})", quote_ident(scope_col), scope.sql);
    if !exclude_values.is_empty() {
        let excluded = exclude_values
            .iter()
            .map(yaml_value_to_sql_literal)
            .collect::<Vec<_>>()
            .join(", ");
        scope_pred.push_str(&format!(" AND d.{} NOT IN ({excluded})", quote_ident(scope_col)));
    }

    let mut branches = vec![format!("({scope_pred})")];
    if let Some(clause) = exists_clause {
        let exists_pred = match local_predicate {
            Some(local) => format!("({local}) AND {clause}"),
            None => clause.to_string(),
        };
        branches.push(format!("({exists_pred})"));
    }

    let sql = format!(
        "SELECT DISTINCT d.id AS id FROM {src_schema}.{tbl} d WHERE {branches}",
        src_schema = quote_ident(source_schema),
        tbl = quote_ident(table),
        branches = branches.join(" OR ")
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    Ok((rows.into_iter().map(|(id,)| id).collect(), sql))
}

/// Build `count` shard sub-queries for a resolved selection.
async fn build_shards(
    conn: &mut sqlx::PgConnection,
    selection: &Selection,
    shard_cfg: &dbslice_core::plan::ShardConfig,
) -> Result<Vec<String>> {
    let assignment = match shard_cfg.strategy {
        ShardStrategy::RoundRobin => dbslice_core::sharding::round_robin(&selection.ids, shard_cfg.count)?,
        ShardStrategy::Weighted => {
            let weights_sql = shard_cfg.weights_sql.as_ref().ok_or_else(|| {
                Error::Config(format!(
                    "selection '{}' uses weighted sharding but declares no weights_sql",
                    selection.name
                ))
            })?;
            let rows: Vec<(serde_json::Value, serde_json::Value)> =
                sqlx::query_as(weights_sql).fetch_all(&mut *conn).await?;
            let mut weights: HashMap<i64, i64> = HashMap::new();
            for (id_val, weight_val) in rows {
                let id = json_to_i64(&id_val).ok_or_else(|| {
                    Error::Config(format!(
                        "weights_sql for selection '{}' returned a non-integer id",
                        selection.name
                    ))
                })?;
                let weight = json_to_i64(&weight_val).ok_or_else(|| {
                    Error::Config(format!(
                        "weights_sql for selection '{}' returned a non-integer weight",
                        selection.name
                    ))
                })?;
                weights.insert(id, weight);
            }
            dbslice_core::sharding::weighted(&selection.ids, &weights, shard_cfg.count)?
        }
    };

    Ok(assignment
        .into_iter()
        .map(|ids| ids_to_sql_literal(&ids))
        .collect())
}

fn json_to_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_to_sql_literal_empty_is_falsy() {
        assert_eq!(ids_to_sql_literal(&[]), "SELECT NULL::bigint WHERE FALSE");
    }

    #[test]
    fn ids_to_sql_literal_builds_values_list() {
        let sql = ids_to_sql_literal(&[1, 2, 3]);
        assert!(sql.contains("(1)"));
        assert!(sql.contains("(2)"));
        assert!(sql.contains("(3)"));
    }

    #[test]
    fn inline_params_substitutes_placeholders() {
        let sql = inline_params("SELECT id FROM t WHERE a = $1 AND b = $2", &[
            serde_yaml::Value::Number(5.into()),
            serde_yaml::Value::String("x".to_string()),
        ]);
        assert_eq!(sql, "SELECT id FROM t WHERE a = 5 AND b = 'x'");
    }

    #[test]
    fn inline_params_handles_double_digit_placeholders() {
        let params: Vec<serde_yaml::Value> = (1..=11).map(|n| serde_yaml::Value::Number(n.into())).collect();
        let sql = inline_params(
            "SELECT id FROM t WHERE a = $1 AND k = $10 AND z = $11",
            &params,
        );
        assert_eq!(sql, "SELECT id FROM t WHERE a = 1 AND k = 10 AND z = 11");
    }

    #[test]
    fn yaml_value_to_sql_literal_escapes_quotes() {
        let v = serde_yaml::Value::String("O'Brien".to_string());
        assert_eq!(yaml_value_to_sql_literal(&v), "'O''Brien'");
    }
}
