//! dbslice: build a size-reduced, consistent replica of a PostgreSQL
//! database by slicing a subset of rows from a source schema into a
//! destination schema, then promoting it into place.

use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dbslice_core::plan::{Plan, PlanFile};
use dbslice_core::{Error, Result};
use dbslice_db::{audit, orchestrate, pool, promote, reconcile};

#[derive(Parser)]
#[command(name = "dbslice")]
#[command(author, version, about = "Slice, reconcile, and promote a reduced PostgreSQL replica")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the plan YAML. Falls back to `DBSLICE_CONFIG`.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Destination database connection URL. Falls back to `DATABASE_URL`.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the configured database is reachable.
    CheckConnection,
    /// Emit a gaps-only audit between source_schema and dest_schema.
    AuditTables { table: Option<String> },
    /// Emit a gaps-only sequence audit.
    AuditSequences,
    /// Run precopy (schema_only and full_copy tables), then exit.
    PrecopyOnly,
    /// Reconcile sequences only.
    MigrateSequences,
    /// Reconcile functions only.
    MigrateFunctions,
    /// Reconcile triggers, optionally for a single table.
    MigrateTriggers { table: Option<String> },
    /// Reconcile non-PK indexes, optionally for a single table.
    MigrateIndexes { table: Option<String> },
    /// Reconcile primary keys and constraints, then validate foreign keys.
    MigrateConstraints {
        table: Option<String>,
        #[arg(long)]
        skip_validate_fk: bool,
        #[arg(long)]
        validate_parallel: Option<usize>,
    },
    /// Resolve selections and build the named table groups (no precopy).
    MigrateTables { names: Vec<String> },
    /// Run the full pipeline: precopy, build, optional redaction, reconcile.
    Migrate {
        #[arg(long)]
        skip_validate_fk: bool,
        #[arg(long)]
        validate_parallel: Option<usize>,
        #[arg(long)]
        fanout_parallel: Option<usize>,
    },
    /// Reset the destination schema to empty.
    Restart,
    /// Drop the named groups' destination tables, tmp copies, and shard
    /// scratch artifacts.
    Reset { names: Vec<String> },
    /// Run redaction, optionally scoped to a single table.
    NeuterOnly { table: Option<String> },
    /// Promote dest_schema into `public`, quarantining the prior `public`.
    Swap,
    /// Invert a prior `swap`.
    Unswap,
    /// Truncate configured tables and run raw bootstrap SQL.
    PreMigrate,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dbslice=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };
    runtime.block_on(dispatch(cli))
}

/// The `request`/`run`/`runtime` envelope every command prints.
#[derive(Serialize)]
struct Envelope {
    request: RequestInfo,
    run: RunInfo,
    runtime: RuntimeInfo,
}

#[derive(Serialize)]
struct RequestInfo {
    command: String,
    config_path: Option<String>,
}

#[derive(Serialize)]
struct RunInfo {
    result: serde_yaml::Value,
}

#[derive(Serialize)]
struct RuntimeInfo {
    duration_ms: u128,
}

fn print_envelope(command: &str, config_path: &Option<String>, start: Instant, result: serde_yaml::Value) {
    let envelope = Envelope {
        request: RequestInfo {
            command: command.to_string(),
            config_path: config_path.clone(),
        },
        run: RunInfo { result },
        runtime: RuntimeInfo {
            duration_ms: start.elapsed().as_millis(),
        },
    };
    match serde_yaml::to_string(&envelope) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to serialize result envelope: {e}"),
    }
}

fn error_value(message: &str) -> serde_yaml::Value {
    let mut map = serde_yaml::Mapping::new();
    map.insert("error".into(), message.into());
    serde_yaml::Value::Mapping(map)
}

fn load_plan(config_path: &Option<String>) -> Result<Plan> {
    let path = config_path
        .clone()
        .or_else(|| std::env::var("DBSLICE_CONFIG").ok())
        .ok_or_else(|| Error::Config("no config path given and DBSLICE_CONFIG is unset".to_string()))?;
    let text = std::fs::read_to_string(&path)?;
    PlanFile::from_yaml(&text)?.normalize()
}

fn resolve_database_url(database_url: &Option<String>) -> Result<String> {
    database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| Error::Config("no database URL given and DATABASE_URL is unset".to_string()))
}

/// Restrict to a single table if given, otherwise every table named by the
/// plan's table groups plus its precopy lists.
fn target_tables(plan: &Plan, table: &Option<String>) -> Vec<String> {
    if let Some(t) = table {
        return vec![t.clone()];
    }
    let mut tables = Vec::new();
    for group in &plan.table_groups {
        tables.push(group.root.table.clone());
        tables.extend(group.deps.iter().map(|d| d.table.clone()));
    }
    tables.extend(plan.precopy.schema_only.iter().cloned());
    tables.extend(plan.precopy.full_copy.iter().cloned());
    tables
}

async fn dispatch(cli: Cli) -> ExitCode {
    let start = Instant::now();
    let command_name = command_name(&cli.command);

    // `check-connection` has its own exit-code contract (0/1/2) distinct
    // from every other command's (0/2/3), so it is handled before the
    // plan is loaded.
    if matches!(cli.command, Commands::CheckConnection) {
        return run_check_connection(&cli, start).await;
    }

    let plan = match load_plan(&cli.config) {
        Ok(p) => p,
        Err(e) => {
            print_envelope(&command_name, &cli.config, start, error_value(&e.to_string()));
            return ExitCode::from(2);
        }
    };

    let database_url = match resolve_database_url(&cli.database_url) {
        Ok(url) => url,
        Err(e) => {
            print_envelope(&command_name, &cli.config, start, error_value(&e.to_string()));
            return ExitCode::from(2);
        }
    };

    let pool = match pool::create_pool(&database_url).await {
        Ok(p) => p,
        Err(e) => {
            print_envelope(&command_name, &cli.config, start, error_value(&e.to_string()));
            return ExitCode::from(3);
        }
    };

    let outcome = run_command(cli.command, &plan, &pool, &database_url).await;

    match outcome {
        Ok(value) => {
            print_envelope(&command_name, &cli.config, start, value);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            print_envelope(&command_name, &cli.config, start, error_value(&e.to_string()));
            ExitCode::from(code as u8)
        }
    }
}

fn command_name(command: &Commands) -> String {
    match command {
        Commands::CheckConnection => "check-connection",
        Commands::AuditTables { .. } => "audit-tables",
        Commands::AuditSequences => "audit-sequences",
        Commands::PrecopyOnly => "precopy-only",
        Commands::MigrateSequences => "migrate-sequences",
        Commands::MigrateFunctions => "migrate-functions",
        Commands::MigrateTriggers { .. } => "migrate-triggers",
        Commands::MigrateIndexes { .. } => "migrate-indexes",
        Commands::MigrateConstraints { .. } => "migrate-constraints",
        Commands::MigrateTables { .. } => "migrate-tables",
        Commands::Migrate { .. } => "migrate",
        Commands::Restart => "restart",
        Commands::Reset { .. } => "reset",
        Commands::NeuterOnly { .. } => "neuter-only",
        Commands::Swap => "swap",
        Commands::Unswap => "unswap",
        Commands::PreMigrate => "pre-migrate",
    }
    .to_string()
}

async fn run_check_connection(cli: &Cli, start: Instant) -> ExitCode {
    let database_url = match resolve_database_url(&cli.database_url) {
        Ok(url) => url,
        Err(e) => {
            print_envelope("check-connection", &cli.config, start, error_value(&e.to_string()));
            return ExitCode::from(2);
        }
    };

    match pool::create_pool(&database_url).await {
        Ok(connected) => {
            connected.close().await;
            print_envelope("check-connection", &cli.config, start, "ok".into());
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_envelope("check-connection", &cli.config, start, error_value(&e.to_string()));
            ExitCode::from(1)
        }
    }
}

async fn run_command(
    command: Commands,
    plan: &Plan,
    db_pool: &sqlx::PgPool,
    database_url: &str,
) -> Result<serde_yaml::Value> {
    match command {
        Commands::CheckConnection => unreachable!("handled in dispatch"),

        Commands::AuditTables { table } => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            if let Some(t) = table {
                let report = audit::audit_table(&mut conn, &plan.source_schema, &plan.dest_schema, &t).await?;
                if report.is_empty() {
                    Ok("perfect match".into())
                } else {
                    Ok(serde_yaml::to_value(report)?)
                }
            } else {
                let report = audit::audit_all_tables(&mut conn, &plan.source_schema, &plan.dest_schema).await?;
                if report.is_empty() {
                    Ok("perfect match".into())
                } else {
                    Ok(serde_yaml::to_value(report)?)
                }
            }
        }

        Commands::AuditSequences => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let report = audit::audit_sequences(&mut conn, &plan.source_schema, &plan.dest_schema).await?;
            if report.is_empty() {
                Ok("perfect match".into())
            } else {
                Ok(serde_yaml::to_value(report)?)
            }
        }

        Commands::PrecopyOnly => {
            let fanout = dbslice_core::defaults::FANOUT_PARALLEL;
            let report = dbslice_db::precopy::run_precopy(
                db_pool,
                &plan.source_schema,
                &plan.dest_schema,
                &plan.precopy.schema_only,
                &plan.precopy.full_copy,
                fanout,
            )
            .await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::MigrateSequences => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let report = reconcile::sequences::reconcile_sequences(&mut conn, &plan.source_schema, &plan.dest_schema).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::MigrateFunctions => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let count = reconcile::functions::reconcile_functions(&mut conn, &plan.source_schema, &plan.dest_schema).await?;
            let mut map = serde_yaml::Mapping::new();
            map.insert("reconciled".into(), serde_yaml::to_value(count)?);
            Ok(serde_yaml::Value::Mapping(map))
        }

        Commands::MigrateTriggers { table } => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let tables = target_tables(plan, &table);
            let report = reconcile::triggers::reconcile_triggers(&mut conn, &plan.source_schema, &plan.dest_schema, &tables).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::MigrateIndexes { table } => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let tables = target_tables(plan, &table);
            let report = reconcile::indexes::reconcile_indexes(&mut conn, &plan.source_schema, &plan.dest_schema, &tables).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::MigrateConstraints { table, skip_validate_fk, validate_parallel } => {
            let tables = target_tables(plan, &table);

            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let pk_added =
                reconcile::constraints::reconcile_primary_keys(&mut conn, &plan.source_schema, &plan.dest_schema, &tables)
                    .await?;
            let report =
                reconcile::constraints::reconcile_constraints(&mut conn, &plan.source_schema, &plan.dest_schema, &tables)
                    .await?;
            drop(conn);

            let fks_validated = if skip_validate_fk {
                0
            } else {
                let parallel = validate_parallel.unwrap_or(dbslice_core::defaults::VALIDATE_PARALLEL);
                reconcile::constraints::validate_foreign_keys(db_pool, &plan.dest_schema, Some(tables.as_slice()), parallel).await?
            };

            let mut map = serde_yaml::Mapping::new();
            map.insert("constraints".into(), serde_yaml::to_value(report)?);
            map.insert("primary_keys_added".into(), serde_yaml::to_value(pk_added)?);
            map.insert("fks_validated".into(), serde_yaml::to_value(fks_validated)?);
            Ok(serde_yaml::Value::Mapping(map))
        }

        Commands::MigrateTables { names } => {
            let groups = if names.is_empty() { None } else { Some(names) };
            let options = orchestrate::RunOptions {
                groups,
                database_url: Some(database_url.to_string()),
                ..Default::default()
            };
            let (pre, post) = orchestrate::build_groups(db_pool, plan, &options).await?;
            let mut map = serde_yaml::Mapping::new();
            map.insert("pre_build".into(), serde_yaml::to_value(pre)?);
            map.insert("post_build".into(), serde_yaml::to_value(post)?);
            Ok(serde_yaml::Value::Mapping(map))
        }

        Commands::Migrate { skip_validate_fk, validate_parallel, fanout_parallel } => {
            let options = orchestrate::RunOptions {
                skip_validate_fk,
                validate_parallel: validate_parallel.unwrap_or(0),
                fanout_parallel: fanout_parallel.unwrap_or(0),
                database_url: Some(database_url.to_string()),
                ..Default::default()
            };
            let report = orchestrate::run_migrate(db_pool, plan, &options).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::Restart => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            orchestrate::restart(&mut conn, &plan.dest_schema).await?;
            Ok("reset".into())
        }

        Commands::Reset { names } => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let dropped = orchestrate::reset_groups(&mut conn, plan, &names).await?;
            Ok(serde_yaml::to_value(dropped)?)
        }

        Commands::NeuterOnly { table } => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let scoped_config = scope_neuter(&plan.neuter, &table);
            let report = dbslice_db::redact::run_redaction(&mut conn, &plan.dest_schema, &scoped_config, Some(database_url)).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::Swap => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let report = promote::swap(&mut conn, &plan.dest_schema, &plan.old_schema).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::Unswap => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            let report = promote::unswap(&mut conn, &plan.dest_schema, &plan.old_schema).await?;
            Ok(serde_yaml::to_value(report)?)
        }

        Commands::PreMigrate => {
            let mut conn = db_pool.acquire().await.map_err(Error::Database)?;
            orchestrate::run_pre_migrate(&mut conn, &plan.dest_schema, &plan.pre_migrate).await?;
            let mut map = serde_yaml::Mapping::new();
            map.insert("truncated".into(), serde_yaml::to_value(&plan.pre_migrate.truncate)?);
            map.insert("statements_run".into(), serde_yaml::to_value(plan.pre_migrate.sql.len())?);
            Ok(serde_yaml::Value::Mapping(map))
        }
    }
}

/// Restrict a neuter config to a single table's rules, for `neuter-only
/// [TABLE]`.
fn scope_neuter(config: &dbslice_core::plan::NeuterConfig, table: &Option<String>) -> dbslice_core::plan::NeuterConfig {
    let Some(t) = table else {
        return config.clone();
    };
    let mut scoped = config.clone();
    scoped.targets.retain(|name, _| name == t);
    scoped
}
