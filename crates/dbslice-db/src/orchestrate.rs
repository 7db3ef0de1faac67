//! The Orchestrator: sequences precopy, selection resolution, table-group
//! building, redaction, and reconciliation into the control flow behind the
//! `migrate` / `migrate-tables` / `restart` CLI commands.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::PgPool;
use tracing::info;

use dbslice_core::plan::Phase;
use dbslice_core::{Error, Plan, Result, RootSelector, Selection};

use crate::builder::{self, BuildReport};
use crate::ddl;
use crate::precopy::{self, PrecopyReport};
use crate::reconcile::{constraints, functions, indexes, sequences, triggers};
use crate::redact::{self, RedactReport};
use crate::resolver;

/// Options narrowing a pipeline or table-group run, mirroring the CLI flags
/// named in the command list.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Table group names to restrict a `migrate-tables` run to. `None` means
    /// every group in the plan.
    pub groups: Option<Vec<String>>,
    pub skip_validate_fk: bool,
    pub validate_parallel: usize,
    pub fanout_parallel: usize,
    /// Required only if a redaction rule uses sharding with `parallel > 1`.
    pub database_url: Option<String>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PipelineReport {
    pub precopy: PrecopyReport,
    pub pre_build: BuildReport,
    pub post_build: BuildReport,
    pub redact: RedactReport,
    pub sequences: sequences::SequenceReport,
    pub functions_reconciled: usize,
    pub triggers: triggers::TriggerReport,
    pub indexes: indexes::IndexReport,
    pub constraints: constraints::ConstraintReport,
    pub primary_keys_added: Vec<String>,
    pub fks_validated: usize,
}

/// Resolve a set of required root selector names in dependency order
/// (`scope_or_exists.scope_selection` chains resolve before their
/// dependents), returning them keyed by name.
pub async fn resolve_selections(
    conn: &mut sqlx::PgConnection,
    plan: &Plan,
    names: &[&str],
) -> Result<BTreeMap<String, Selection>> {
    let mut resolved: BTreeMap<String, Selection> = BTreeMap::new();
    let mut pending: BTreeSet<&str> = names.iter().copied().collect();

    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .copied()
            .filter(|name| selector_ready(plan, name, &resolved))
            .collect();

        if ready.is_empty() {
            return Err(Error::Config(
                "unable to resolve selection dependency order (unexpected cycle)".to_string(),
            ));
        }

        for name in ready {
            let selector = plan.root_selector(name).ok_or_else(|| {
                Error::Config(format!("unknown root selector '{name}'"))
            })?;
            let selection =
                resolver::resolve_selector(conn, &plan.source_schema, &plan.dest_schema, selector, &resolved)
                    .await?;
            resolved.insert(name.to_string(), selection);
            pending.remove(name);
        }
    }

    Ok(resolved)
}

fn selector_ready(plan: &Plan, name: &str, resolved: &BTreeMap<String, Selection>) -> bool {
    match plan.root_selector(name) {
        None => true,
        Some(RootSelector {
            mode: dbslice_core::plan::SelectorMode::ScopeOrExists { scope_selection, .. },
            ..
        }) => resolved.contains_key(scope_selection),
        Some(_) => true,
    }
}

fn group_names(plan: &Plan, groups: &Option<Vec<String>>) -> Vec<String> {
    match groups {
        Some(names) => names.clone(),
        None => plan.table_groups.iter().map(|g| g.name.clone()).collect(),
    }
}

/// A group's build phase, taken from its root selector (groups with no
/// selector are always pre-phase).
fn group_phase(plan: &Plan, name: &str) -> Phase {
    plan.group(name)
        .and_then(|g| g.root.selector.as_ref())
        .map(|s| s.phase)
        .unwrap_or(Phase::Pre)
}

fn all_group_tables(plan: &Plan, names: &[String]) -> Vec<String> {
    let mut tables = Vec::new();
    for name in names {
        if let Some(group) = plan.group(name) {
            tables.push(group.root.table.clone());
            tables.extend(group.deps.iter().map(|d| d.table.clone()));
        }
    }
    tables
}

/// Run selection resolution and table-group build for the given groups
/// (`migrate-tables`). No precopy; finalization still attaches primary keys.
///
/// Resolution and build run in two strict steps, pre-phase then
/// post-phase: a post-phase selector (`referenced_by`, `referenced_by_column`,
/// `fk_in_stage`, `refers_to_stage`) may read destination tables that only
/// exist once the pre-phase build has completed, so post-phase selections
/// must not be resolved until after `build_table_groups(Phase::Pre)` runs.
pub async fn build_groups(
    pool: &PgPool,
    plan: &Plan,
    options: &RunOptions,
) -> Result<(BuildReport, BuildReport)> {
    let names = group_names(plan, &options.groups);
    let pre_names: Vec<String> = names.iter().filter(|n| group_phase(plan, n) == Phase::Pre).cloned().collect();
    let post_names: Vec<String> = names.iter().filter(|n| group_phase(plan, n) == Phase::Post).cloned().collect();

    let fanout = if options.fanout_parallel > 0 {
        options.fanout_parallel
    } else {
        dbslice_core::defaults::FANOUT_PARALLEL
    };

    let pre_required = plan.required_roots(&pre_names)?;
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let pre_selections = resolve_selections(&mut conn, plan, &pre_required).await?;
    drop(conn);

    let pre_build = builder::build_table_groups(pool, plan, &pre_selections, fanout, Phase::Pre).await?;

    let post_required = plan.required_roots(&post_names)?;
    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    let post_selections = resolve_selections(&mut conn, plan, &post_required).await?;
    drop(conn);

    let post_build = builder::build_table_groups(pool, plan, &post_selections, fanout, Phase::Post).await?;

    let any_sharded = pre_selections.values().any(|s| s.is_sharded())
        || post_selections.values().any(|s| s.is_sharded());
    if !any_sharded {
        return Ok((pre_build, post_build));
    }

    let mut conn = pool.acquire().await.map_err(Error::Database)?;
    builder::cleanup_shard_scratch(
        &mut conn,
        &plan.shards_schema,
        &plan.source_schema,
        &plan.dest_schema,
        &plan.tmp_schema,
    )
    .await?;

    Ok((pre_build, post_build))
}

/// Run every reconciliation pass gated by `plan.reconcile`, for the given
/// tables (or every table in the plan's groups when unfiltered).
pub async fn reconcile_all(
    pool: &PgPool,
    plan: &Plan,
    tables: &[String],
    options: &RunOptions,
) -> Result<(
    sequences::SequenceReport,
    usize,
    triggers::TriggerReport,
    indexes::IndexReport,
    constraints::ConstraintReport,
    Vec<String>,
    usize,
)> {
    let mut conn = pool.acquire().await.map_err(Error::Database)?;

    let seq_report = if plan.reconcile.sequences {
        sequences::reconcile_sequences(&mut conn, &plan.source_schema, &plan.dest_schema).await?
    } else {
        sequences::SequenceReport::default()
    };

    // Function reconciliation has no dedicated gate in the configuration
    // surface; it always runs, matching the original pipeline.
    let fn_reconciled =
        functions::reconcile_functions(&mut conn, &plan.source_schema, &plan.dest_schema).await?;

    let pk_added = if plan.reconcile.primary_keys {
        constraints::reconcile_primary_keys(&mut conn, &plan.source_schema, &plan.dest_schema, tables).await?
    } else {
        Vec::new()
    };

    let trigger_report = if plan.reconcile.triggers {
        triggers::reconcile_triggers(&mut conn, &plan.source_schema, &plan.dest_schema, tables).await?
    } else {
        triggers::TriggerReport::default()
    };

    let index_report = if plan.reconcile.indexes {
        indexes::reconcile_indexes(&mut conn, &plan.source_schema, &plan.dest_schema, tables).await?
    } else {
        indexes::IndexReport::default()
    };

    let constraint_report = if plan.reconcile.constraints {
        constraints::reconcile_constraints(&mut conn, &plan.source_schema, &plan.dest_schema, tables).await?
    } else {
        constraints::ConstraintReport::default()
    };
    drop(conn);

    let fks_validated = if plan.reconcile.constraints && !options.skip_validate_fk {
        let parallel = if options.validate_parallel > 0 {
            options.validate_parallel
        } else {
            dbslice_core::defaults::VALIDATE_PARALLEL
        };
        constraints::validate_foreign_keys(pool, &plan.dest_schema, Some(tables), parallel).await?
    } else {
        0
    };

    Ok((
        seq_report,
        fn_reconciled,
        trigger_report,
        index_report,
        constraint_report,
        pk_added,
        fks_validated,
    ))
}

/// The full `migrate` pipeline: precopy, pre-phase build, post-phase build,
/// optional redaction, then every reconciliation pass with FK validation.
pub async fn run_migrate(pool: &PgPool, plan: &Plan, options: &RunOptions) -> Result<PipelineReport> {
    let start = std::time::Instant::now();
    let mut report = PipelineReport::default();

    {
        let fanout = if options.fanout_parallel > 0 {
            options.fanout_parallel
        } else {
            dbslice_core::defaults::FANOUT_PARALLEL
        };
        report.precopy = precopy::run_precopy(
            pool,
            &plan.source_schema,
            &plan.dest_schema,
            &plan.precopy.schema_only,
            &plan.precopy.full_copy,
            fanout,
        )
        .await?;
    }

    let (pre_build, post_build) = build_groups(pool, plan, options).await?;
    report.pre_build = pre_build;
    report.post_build = post_build;

    if plan.neuter.enabled {
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        report.redact = redact::run_redaction(
            &mut conn,
            &plan.dest_schema,
            &plan.neuter,
            options.database_url.as_deref(),
        )
        .await?;
    }

    let all_tables = all_group_tables(plan, &group_names(plan, &None));
    let mut all_tables_with_precopy = all_tables;
    all_tables_with_precopy.extend(plan.precopy.schema_only.iter().cloned());
    all_tables_with_precopy.extend(plan.precopy.full_copy.iter().cloned());

    let (seq, fns, trig, idx, con, pk, fk) =
        reconcile_all(pool, plan, &all_tables_with_precopy, options).await?;
    report.sequences = seq;
    report.functions_reconciled = fns;
    report.triggers = trig;
    report.indexes = idx;
    report.constraints = con;
    report.primary_keys_added = pk;
    report.fks_validated = fk;

    info!(
        subsystem = "orchestrate",
        component = "pipeline",
        op = "migrate_complete",
        duration_ms = start.elapsed().as_millis() as u64,
        "migration pipeline complete"
    );

    Ok(report)
}

/// Reset `dest_schema`: drop it cascade and recreate empty. Guarded against
/// resetting `public` or a catalog namespace.
pub async fn restart(conn: &mut sqlx::PgConnection, dest_schema: &str) -> Result<()> {
    crate::promote::guard_not_public(dest_schema)?;
    ddl::reset_schema(conn, dest_schema).await
}

/// Drop each named group's destination tables plus any `<table>_sh%` /
/// `<table>_pmsh%` shard scratch artifacts in `shards_schema`.
pub async fn reset_groups(conn: &mut sqlx::PgConnection, plan: &Plan, names: &[String]) -> Result<Vec<String>> {
    let tables = all_group_tables(plan, names);
    ddl::drop_tables_if_exists(&mut *conn, &plan.dest_schema, &tables).await?;
    ddl::drop_tables_if_exists(&mut *conn, &plan.tmp_schema, &tables).await?;

    for table in &tables {
        for pattern in [format!("{table}_sh%"), format!("{table}_pmsh%")] {
            let scratch = ddl::list_relations_like(&mut *conn, &plan.shards_schema, &pattern).await?;
            ddl::drop_tables_if_exists(&mut *conn, &plan.shards_schema, &scratch).await?;
        }
    }

    Ok(tables)
}

/// Run `pre_migrate.sql` (after truncating `pre_migrate.truncate` tables).
pub async fn run_pre_migrate(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    pre_migrate: &dbslice_core::plan::PreMigrate,
) -> Result<()> {
    if !pre_migrate.truncate.is_empty() {
        let qualified: Vec<String> = pre_migrate
            .truncate
            .iter()
            .map(|t| ddl::quote_qualified(dest_schema, t))
            .collect();
        let sql = format!("TRUNCATE {} CASCADE", qualified.join(", "));
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    for stmt in &pre_migrate.sql {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_report_defaults_empty() {
        let report = PipelineReport::default();
        assert!(report.precopy.schema_only_created.is_empty());
        assert!(report.pre_build.created_tables.is_empty());
        assert_eq!(report.fks_validated, 0);
    }
}
