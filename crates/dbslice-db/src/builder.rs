//! The Table-Group Builder: materializes each configured table group's root
//! and dependents by joining source rows against a resolved [`Selection`],
//! then finalizes (`ANALYZE`, `SET LOGGED`, primary key attach) once all of
//! a group's tables exist.
//!
//! Each group is built on a single driver task. Shard sub-tasks (per-shard
//! root builds, per-source dependent inserts, per-modulo dependent builds)
//! run concurrently on their own connections, bounded by `parallelism`; the
//! driver awaits all of a step's sub-tasks before moving to the next one.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use dbslice_core::plan::{Dep, ParentSource, Phase, Plan, Root, TableGroup};
use dbslice_core::{Error, Result, Selection};

use crate::ddl::{quote_ident, quote_qualified};
use crate::{ddl, introspect};

/// Destination tables newly materialized by a build pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BuildReport {
    pub created_tables: Vec<String>,
}

/// Build every table group whose root selector's phase matches `phase`
/// (groups with no selector are always treated as pre-phase).
///
/// `selections` must already contain every selection referenced by a group
/// built in this pass (see `Plan::required_roots`).
pub async fn build_table_groups(
    pool: &PgPool,
    plan: &Plan,
    selections: &BTreeMap<String, Selection>,
    parallelism: usize,
    phase: Phase,
) -> Result<BuildReport> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut report = BuildReport::default();

    for group in &plan.table_groups {
        let group_phase = group
            .root
            .selector
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(Phase::Pre);
        if group_phase != phase {
            continue;
        }

        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        if group_already_built(&mut conn, &plan.dest_schema, group).await? {
            info!(subsystem = "builder", component = "builder", op = "skip", group = %group.name, "table group already materialized");
            continue;
        }
        drop(conn);

        build_group(
            pool,
            plan,
            group,
            selections,
            semaphore.clone(),
            &mut report,
        )
        .await?;
    }

    Ok(report)
}

async fn group_already_built(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    group: &TableGroup,
) -> Result<bool> {
    if !introspect::table_exists(&mut *conn, dest_schema, &group.root.table).await? {
        return Ok(false);
    }
    for dep in &group.deps {
        if !introspect::table_exists(&mut *conn, dest_schema, &dep.table).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn build_group(
    pool: &PgPool,
    plan: &Plan,
    group: &TableGroup,
    selections: &BTreeMap<String, Selection>,
    semaphore: Arc<Semaphore>,
    report: &mut BuildReport,
) -> Result<()> {
    let start = std::time::Instant::now();

    build_root(pool, plan, &group.root, selections, semaphore.clone()).await?;
    report.created_tables.push(format!("{}.{}", plan.dest_schema, group.root.table));

    for dep in &group.deps {
        build_dep(pool, plan, &group.root, dep, selections, semaphore.clone()).await?;
        report.created_tables.push(format!("{}.{}", plan.dest_schema, dep.table));
    }

    let mut tables: Vec<&str> = vec![group.root.table.as_str()];
    tables.extend(group.deps.iter().map(|d| d.table.as_str()));
    for table in tables {
        finalize_table(pool, plan, table).await?;
    }

    info!(
        subsystem = "builder",
        component = "builder",
        op = "group_complete",
        group = %group.name,
        duration_ms = start.elapsed().as_millis() as u64,
        "table group materialized"
    );
    Ok(())
}

fn selector_for_root<'a>(plan: &'a Plan, root: &'a Root) -> Option<&'a dbslice_core::RootSelector> {
    root.selector
        .as_ref()
        .map(|inline| plan.root_selector(&inline.name).unwrap_or(inline))
}

async fn build_root(
    pool: &PgPool,
    plan: &Plan,
    root: &Root,
    selections: &BTreeMap<String, Selection>,
    semaphore: Arc<Semaphore>,
) -> Result<()> {
    let Some(selector) = selector_for_root(plan, root) else {
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        let sql = format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            quote_qualified(&plan.dest_schema, &root.table),
            quote_qualified(&plan.source_schema, &root.table)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        return Ok(());
    };

    let selection = selections.get(&selector.name).ok_or_else(|| {
        Error::Execution(format!(
            "root '{}' selection '{}' was not resolved before build",
            root.table, selector.name
        ))
    })?;

    let join = root.join_predicate();

    if selection.is_sharded() {
        // 1. Build each root shard concurrently.
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for (i, shard_sql) in selection.shards.iter().enumerate() {
            let pool = pool.clone();
            let sem = semaphore.clone();
            let source_schema = plan.source_schema.clone();
            let shards_schema = plan.shards_schema.clone();
            let table = root.table.clone();
            let join = join.clone();
            let shard_sql = shard_sql.clone();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                let mut conn = pool.acquire().await.map_err(Error::Database)?;
                let shard_table = format!("{table}_sh{i}");
                let sql = format!(
                    "CREATE UNLOGGED TABLE {} AS SELECT d.* FROM {} d JOIN ({}) p ON {}",
                    quote_qualified(&shards_schema, &shard_table),
                    quote_qualified(&source_schema, &table),
                    shard_sql,
                    join
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
                Ok(())
            });
        }
        join_all(tasks).await?;

        // 2. Empty destination clone.
        {
            let mut conn = pool.acquire().await.map_err(Error::Database)?;
            let sql = format!(
                "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
                quote_qualified(&plan.dest_schema, &root.table),
                quote_qualified(&plan.source_schema, &root.table)
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
        }

        // 3. Bulk-insert each shard concurrently.
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for i in 0..selection.shard_count() {
            let pool = pool.clone();
            let sem = semaphore.clone();
            let dest_schema = plan.dest_schema.clone();
            let shards_schema = plan.shards_schema.clone();
            let table = root.table.clone();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                let mut conn = pool.acquire().await.map_err(Error::Database)?;
                let shard_table = format!("{table}_sh{i}");
                let sql = format!(
                    "INSERT INTO {} SELECT * FROM {}",
                    quote_qualified(&dest_schema, &table),
                    quote_qualified(&shards_schema, &shard_table)
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
                Ok(())
            });
        }
        join_all(tasks).await?;
    } else {
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        let sql = format!(
            "CREATE UNLOGGED TABLE {} AS SELECT d.* FROM {} d JOIN ({}) p ON {}",
            quote_qualified(&plan.dest_schema, &root.table),
            quote_qualified(&plan.source_schema, &root.table),
            selection.sql,
            join
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }

    Ok(())
}

/// SQL fragment (a FROM-producing sub-query or a schema-qualified parent
/// table) and the schema the dependent join should read the parent from.
enum ParentProducer {
    Query(String),
    Table(String, String),
}

fn parent_producers(
    plan: &Plan,
    root: &Root,
    source: &ParentSource,
    selections: &BTreeMap<String, Selection>,
) -> Result<Vec<ParentProducer>> {
    match source {
        ParentSource::Selection { selection } => {
            let sel = selections.get(selection).ok_or_else(|| {
                Error::Execution(format!("selection '{selection}' was not resolved before build"))
            })?;
            if sel.is_sharded() {
                Ok(sel.shards.iter().map(|s| ParentProducer::Query(s.clone())).collect())
            } else {
                Ok(vec![ParentProducer::Query(sel.sql.clone())])
            }
        }
        ParentSource::ParentTable { parent_table } => {
            if parent_table == &root.table {
                if let Some(selector) = selector_for_root(plan, root) {
                    if let Some(sel) = selections.get(&selector.name) {
                        if sel.is_sharded() {
                            return Ok((0..sel.shard_count())
                                .map(|i| {
                                    ParentProducer::Table(
                                        plan.shards_schema.clone(),
                                        format!("{parent_table}_sh{i}"),
                                    )
                                })
                                .collect());
                        }
                    }
                }
            }
            Ok(vec![ParentProducer::Table(plan.dest_schema.clone(), parent_table.clone())])
        }
    }
}

async fn build_dep(
    pool: &PgPool,
    plan: &Plan,
    root: &Root,
    dep: &Dep,
    selections: &BTreeMap<String, Selection>,
    semaphore: Arc<Semaphore>,
) -> Result<()> {
    if let Some(shard) = &dep.shard_by_pk_mod {
        build_dep_pk_mod(pool, plan, root, dep, shard, selections, semaphore).await?;
    } else if dep.sources.len() > 1 {
        build_dep_multi_source(pool, plan, root, dep, selections, semaphore).await?;
    } else {
        build_dep_simple(pool, plan, root, dep, selections).await?;
    }

    if dep.distinct {
        post_process_distinct(pool, plan, dep).await?;
    }
    Ok(())
}

async fn build_dep_simple(
    pool: &PgPool,
    plan: &Plan,
    root: &Root,
    dep: &Dep,
    selections: &BTreeMap<String, Selection>,
) -> Result<()> {
    let source = dep.sources.first().ok_or_else(|| {
        Error::Config(format!("dependent '{}' declares no sources", dep.table))
    })?;
    let producers = parent_producers(plan, root, source, selections)?;
    let producer = producers.into_iter().next().ok_or_else(|| {
        Error::Execution(format!("dependent '{}' resolved no parent producer", dep.table))
    })?;

    let (from_clause, where_clause) = producer_clauses(dep, &producer);
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let sql = format!(
        "CREATE UNLOGGED TABLE {} AS SELECT d.* FROM {} d {}{}",
        quote_qualified(&plan.dest_schema, &dep.table),
        quote_qualified(&plan.source_schema, &dep.table),
        from_clause,
        where_clause
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

fn producer_clauses(dep: &Dep, producer: &ParentProducer) -> (String, String) {
    let from = match producer {
        ParentProducer::Query(sql) => format!("JOIN ({sql}) p ON {}", dep.join),
        ParentProducer::Table(schema, table) => {
            format!("JOIN {} p ON {}", quote_qualified(schema, table), dep.join)
        }
    };
    let whr = dep
        .filter
        .as_ref()
        .map(|f| format!(" WHERE {f}"))
        .unwrap_or_default();
    (from, whr)
}

async fn build_dep_multi_source(
    pool: &PgPool,
    plan: &Plan,
    root: &Root,
    dep: &Dep,
    selections: &BTreeMap<String, Selection>,
    semaphore: Arc<Semaphore>,
) -> Result<()> {
    {
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        let sql = format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS)",
            quote_qualified(&plan.dest_schema, &dep.table),
            quote_qualified(&plan.source_schema, &dep.table)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }

    let mut producers = Vec::new();
    for source in &dep.sources {
        producers.extend(parent_producers(plan, root, source, selections)?);
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for producer in producers {
        let pool = pool.clone();
        let sem = semaphore.clone();
        let source_schema = plan.source_schema.clone();
        let dest_schema = plan.dest_schema.clone();
        let table = dep.table.clone();
        let join = dep.join.clone();
        let filter = dep.filter.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore not closed");
            let mut conn = pool.acquire().await.map_err(Error::Database)?;
            let from_clause = match &producer {
                ParentProducer::Query(sql) => format!("JOIN ({sql}) p ON {join}"),
                ParentProducer::Table(schema, tbl) => {
                    format!("JOIN {} p ON {join}", quote_qualified(schema, tbl))
                }
            };
            let whr = filter.as_ref().map(|f| format!(" WHERE {f}")).unwrap_or_default();
            let sql = format!(
                "INSERT INTO {} SELECT d.* FROM {} d {}{}",
                quote_qualified(&dest_schema, &table),
                quote_qualified(&source_schema, &table),
                from_clause,
                whr
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            Ok(())
        });
    }
    join_all(tasks).await
}

fn is_integer_type(data_type: &str) -> bool {
    matches!(
        data_type.to_lowercase().as_str(),
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8"
    )
}

async fn build_dep_pk_mod(
    pool: &PgPool,
    plan: &Plan,
    root: &Root,
    dep: &Dep,
    shard: &dbslice_core::plan::PkModShard,
    selections: &BTreeMap<String, Selection>,
    semaphore: Arc<Semaphore>,
) -> Result<()> {
    if shard.shard_count < 2 {
        return Err(Error::Config(format!(
            "dependent '{}' shard_by_pk_mod.shard_count must be > 1",
            dep.table
        )));
    }
    let source = dep.sources.first().ok_or_else(|| {
        Error::Config(format!("dependent '{}' declares no sources", dep.table))
    })?;
    let producer = parent_producers(plan, root, source, selections)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Execution(format!("dependent '{}' resolved no parent producer", dep.table)))?;

    let columns = introspect::fetch_columns(pool, &plan.source_schema, &dep.table).await?;
    let is_int = columns
        .iter()
        .find(|c| c.name == shard.shard_key)
        .map(|c| is_integer_type(&c.data_type))
        .unwrap_or(false);

    let (from_clause, where_clause) = producer_clauses(dep, &producer);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for i in 0..shard.shard_count {
        let pool = pool.clone();
        let sem = semaphore.clone();
        let source_schema = plan.source_schema.clone();
        let shards_schema = plan.shards_schema.clone();
        let table = dep.table.clone();
        let shard_key = shard.shard_key.clone();
        let count = shard.shard_count;
        let from_clause = from_clause.clone();
        let mut where_clause = where_clause.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore not closed");
            let mut conn = pool.acquire().await.map_err(Error::Database)?;
            let modulo_pred = if is_int {
                format!("(d.{} % {count}) = {i}", quote_ident(&shard_key))
            } else {
                format!(
                    "abs(hashtext(d.{}::text)) % {count} = {i}",
                    quote_ident(&shard_key)
                )
            };
            if where_clause.is_empty() {
                where_clause = format!(" WHERE {modulo_pred}");
            } else {
                where_clause.push_str(&format!(" AND {modulo_pred}"));
            }
            let shard_table = format!("{table}_pmsh{i}");
            let sql = format!(
                "CREATE UNLOGGED TABLE {} AS SELECT d.* FROM {} d {}{}",
                quote_qualified(&shards_schema, &shard_table),
                quote_qualified(&source_schema, &table),
                from_clause,
                where_clause
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            Ok(())
        });
    }
    join_all(tasks).await?;

    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let union_parts: Vec<String> = (0..shard.shard_count)
        .map(|i| {
            format!(
                "SELECT * FROM {}",
                quote_qualified(&plan.shards_schema, &format!("{}_pmsh{i}", dep.table))
            )
        })
        .collect();
    let sql = format!(
        "CREATE UNLOGGED TABLE {} AS {}",
        quote_qualified(&plan.dest_schema, &dep.table),
        union_parts.join(" UNION ALL ")
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Replace the destination dependent's contents with one row per primary
/// key tuple (or, absent a primary key, per distinct row hash), via a
/// scratch table swap. `SELECT DISTINCT d.*` is never used directly because
/// some source columns (arrays of composites, etc.) lack equality operators.
async fn post_process_distinct(pool: &PgPool, plan: &Plan, dep: &Dep) -> Result<()> {
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let pk = introspect::primary_key(&mut *conn, &plan.source_schema, &dep.table).await?;
    let scratch = "_dbslice_distinct";
    let dest = quote_qualified(&plan.dest_schema, &dep.table);
    let scratch_qualified = quote_qualified(&plan.dest_schema, scratch);

    let order_expr = match &pk {
        Some((_, cols)) => cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        None => "md5(row_to_json(t)::text)".to_string(),
    };

    let select_sql = format!(
        "CREATE UNLOGGED TABLE {scratch_qualified} AS SELECT DISTINCT ON ({order_expr}) t.* FROM {dest} t ORDER BY {order_expr}"
    );
    sqlx::query(&select_sql).execute(&mut *conn).await?;
    sqlx::query(&format!("TRUNCATE {dest}")).execute(&mut *conn).await?;
    sqlx::query(&format!("INSERT INTO {dest} SELECT * FROM {scratch_qualified}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DROP TABLE {scratch_qualified}")).execute(&mut *conn).await?;
    Ok(())
}

async fn finalize_table(pool: &PgPool, plan: &Plan, table: &str) -> Result<()> {
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    ddl::analyze_table(&mut *conn, &plan.dest_schema, table).await?;
    if introspect::is_unlogged_table(&mut *conn, &plan.dest_schema, table).await? {
        ddl::set_logged(&mut *conn, &plan.dest_schema, table).await?;
    }
    if !introspect::has_primary_key(&mut *conn, &plan.dest_schema, table).await? {
        if let Some((pk_name, columns)) =
            introspect::primary_key(&mut *conn, &plan.source_schema, table).await?
        {
            ddl::add_primary_key(&mut *conn, &plan.dest_schema, table, &columns, &pk_name).await?;
        }
    }
    Ok(())
}

/// Reset the shard scratch schema once every group in a build pass has
/// completed. No-op if nothing was sharded.
pub async fn cleanup_shard_scratch(
    conn: &mut sqlx::PgConnection,
    shards_schema: &str,
    source_schema: &str,
    dest_schema: &str,
    tmp_schema: &str,
) -> Result<()> {
    let protected = [source_schema, dest_schema, tmp_schema, "public", "pg_catalog", "information_schema"];
    ddl::guard_resettable_schema(shards_schema, &protected)?;
    ddl::reset_schema(conn, shards_schema).await
}

async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| Error::Execution(e.to_string())).and_then(|r| r) {
            Ok(()) => {}
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_integer_type_recognizes_common_aliases() {
        assert!(is_integer_type("integer"));
        assert!(is_integer_type("bigint"));
        assert!(is_integer_type("SMALLINT"));
        assert!(!is_integer_type("text"));
        assert!(!is_integer_type("uuid"));
    }

    #[test]
    fn build_report_defaults_empty() {
        let report = BuildReport::default();
        assert!(report.created_tables.is_empty());
    }
}
