//! Function reconciliation: dump each source function's definition and
//! re-execute it against the destination schema as `CREATE OR REPLACE`.

use tracing::{info, warn};

use dbslice_core::Result;

use crate::canon::rewrite_function_def_for_dest;

/// One source function's definition plus its argument signature, as
/// returned by `pg_get_functiondef`.
async fn fetch_function_defs<'e, E>(exec: E, schema: &str) -> Result<Vec<String>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT pg_get_functiondef(p.oid)
         FROM pg_proc p
         JOIN pg_namespace n ON n.oid = p.pronamespace
         WHERE n.nspname = $1 AND p.prokind = 'f'
         ORDER BY p.proname",
    )
    .bind(schema)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

/// Reconcile every function in `source_schema` into `dest_schema`.
///
/// Each definition is rewritten and executed independently; a failure on
/// one function is logged and does not prevent the others from running.
/// Returns the count of functions successfully reconciled.
pub async fn reconcile_functions(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
) -> Result<usize> {
    let defs = fetch_function_defs(&mut *conn, source_schema).await?;
    let mut reconciled = 0;

    for def in &defs {
        let rewritten = rewrite_function_def_for_dest(def, source_schema, dest_schema);
        match sqlx::query(&rewritten).execute(&mut *conn).await {
            Ok(_) => reconciled += 1,
            Err(e) => {
                warn!(
                    subsystem = "reconcile",
                    component = "functions",
                    op = "failed",
                    error_msg = %e,
                    "function reconciliation failed for one definition"
                );
            }
        }
    }

    info!(
        subsystem = "reconcile",
        component = "functions",
        op = "complete",
        reconciled_count = reconciled,
        total = defs.len(),
        "function reconciliation complete"
    );

    Ok(reconciled)
}
