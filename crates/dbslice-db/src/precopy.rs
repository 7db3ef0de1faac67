//! Precopy Stage: bulk-copies or schema-copies a declared list of tables
//! from source to destination with bounded concurrency.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use dbslice_core::{Error, Result};

use crate::ddl;

/// Which tables in each precopy list were newly created.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PrecopyReport {
    pub schema_only_created: Vec<String>,
    pub full_copy_created: Vec<String>,
}

enum Kind {
    SchemaOnly,
    FullCopy,
}

/// Run the `schema_only` and `full_copy` lists with bounded concurrency.
///
/// Each table is handled on its own connection acquired from `pool`. A
/// task's failure is recorded but does not cancel its siblings; once every
/// task completes, the first recorded error (if any) is raised.
pub async fn run_precopy(
    pool: &PgPool,
    source_schema: &str,
    dest_schema: &str,
    schema_only: &[String],
    full_copy: &[String],
    parallelism: usize,
) -> Result<PrecopyReport> {
    let start = std::time::Instant::now();
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut tasks: JoinSet<Result<(Kind, String, bool)>> = JoinSet::new();

    for table in schema_only {
        spawn_schema_only(&mut tasks, pool.clone(), semaphore.clone(), source_schema.to_string(), dest_schema.to_string(), table.clone());
    }
    for table in full_copy {
        spawn_full_copy(&mut tasks, pool.clone(), semaphore.clone(), source_schema.to_string(), dest_schema.to_string(), table.clone());
    }

    let mut report = PrecopyReport::default();
    let mut first_error: Option<Error> = None;

    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(|e| Error::Execution(e.to_string())).and_then(|r| r) {
            Ok((Kind::SchemaOnly, table, true)) => report.schema_only_created.push(table),
            Ok((Kind::FullCopy, table, true)) => report.full_copy_created.push(table),
            Ok((_, _, false)) => {}
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

    info!(
        subsystem = "precopy",
        component = "precopy",
        op = "complete",
        schema_only_count = report.schema_only_created.len(),
        full_copy_count = report.full_copy_created.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "precopy stage complete"
    );

    Ok(report)
}

fn spawn_schema_only(
    tasks: &mut JoinSet<Result<(Kind, String, bool)>>,
    pool: PgPool,
    semaphore: Arc<Semaphore>,
    source_schema: String,
    dest_schema: String,
    table: String,
) {
    tasks.spawn(async move {
        let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        let created = ddl::create_schema_only_table(&mut conn, &source_schema, &dest_schema, &table).await?;
        info!(
            subsystem = "precopy",
            component = "precopy",
            op = "schema_only",
            table = %table,
            created,
            "schema-only precopy"
        );
        Ok((Kind::SchemaOnly, table, created))
    });
}

fn spawn_full_copy(
    tasks: &mut JoinSet<Result<(Kind, String, bool)>>,
    pool: PgPool,
    semaphore: Arc<Semaphore>,
    source_schema: String,
    dest_schema: String,
    table: String,
) {
    tasks.spawn(async move {
        let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
        let mut conn = pool.acquire().await.map_err(Error::Database)?;
        let start = std::time::Instant::now();
        let created = ddl::full_copy_table(&mut conn, &source_schema, &dest_schema, &table).await?;
        info!(
            subsystem = "precopy",
            component = "precopy",
            op = "full_copy",
            table = %table,
            created,
            duration_ms = start.elapsed().as_millis() as u64,
            "full-copy precopy"
        );
        Ok((Kind::FullCopy, table, created))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = PrecopyReport::default();
        assert!(report.schema_only_created.is_empty());
        assert!(report.full_copy_created.is_empty());
    }
}
