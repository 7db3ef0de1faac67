//! The Promoter: atomically swaps the destination schema into `public` via
//! schema renames, and the symmetric rollback.

use tracing::{info, warn};

use dbslice_core::{Error, Result};

use crate::ddl;
use crate::introspect;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PromoteReport {
    pub views_refreshed: Vec<String>,
    pub views_failed: Vec<(String, String)>,
}

/// Rename `public` to `old_schema` and `dest_schema` to `public`, then
/// refresh every materialized view in the new `public`. Requires `dest_schema`
/// to exist and `old_schema` to be absent.
pub async fn swap(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    old_schema: &str,
) -> Result<PromoteReport> {
    if !introspect::schema_exists(&mut *conn, dest_schema).await? {
        return Err(Error::Precondition(format!(
            "cannot promote: destination schema '{dest_schema}' does not exist"
        )));
    }
    if introspect::schema_exists(&mut *conn, old_schema).await? {
        return Err(Error::Precondition(format!(
            "cannot promote: old schema '{old_schema}' already exists"
        )));
    }

    ddl::rename_schema(&mut *conn, "public", old_schema).await?;
    ddl::rename_schema(&mut *conn, dest_schema, "public").await?;

    let report = refresh_all_views(conn, "public").await?;

    info!(
        subsystem = "promote",
        component = "promote",
        op = "swap",
        views_refreshed = report.views_refreshed.len(),
        views_failed = report.views_failed.len(),
        "destination schema promoted to public"
    );

    Ok(report)
}

/// The inverse of `swap`: rename `public` back to `dest_schema` and
/// `old_schema` back to `public`.
pub async fn unswap(
    conn: &mut sqlx::PgConnection,
    dest_schema: &str,
    old_schema: &str,
) -> Result<PromoteReport> {
    if !introspect::schema_exists(&mut *conn, old_schema).await? {
        return Err(Error::Precondition(format!(
            "cannot unswap: old schema '{old_schema}' does not exist"
        )));
    }
    if introspect::schema_exists(&mut *conn, dest_schema).await? {
        return Err(Error::Precondition(format!(
            "cannot unswap: destination schema '{dest_schema}' already exists"
        )));
    }

    ddl::rename_schema(&mut *conn, "public", dest_schema).await?;
    ddl::rename_schema(&mut *conn, old_schema, "public").await?;

    let report = refresh_all_views(conn, "public").await?;

    info!(
        subsystem = "promote",
        component = "promote",
        op = "unswap",
        views_refreshed = report.views_refreshed.len(),
        views_failed = report.views_failed.len(),
        "promotion rolled back"
    );

    Ok(report)
}

async fn refresh_all_views(conn: &mut sqlx::PgConnection, schema: &str) -> Result<PromoteReport> {
    let view_names = ddl::list_materialized_views(&mut *conn, schema).await?;
    let results = ddl::refresh_materialized_views(conn, schema, &view_names).await;

    let mut report = PromoteReport::default();
    for (name, error) in results {
        match error {
            None => report.views_refreshed.push(name),
            Some(e) => {
                warn!(
                    subsystem = "promote",
                    component = "promote",
                    op = "view_refresh_failed",
                    object_name = %name,
                    error_msg = %e,
                    "materialized view refresh failed during promotion"
                );
                report.views_failed.push((name, e));
            }
        }
    }
    Ok(report)
}

/// Guard used by the `restart` command before resetting `dest_schema`: it
/// must never equal `public` or a catalog namespace.
pub fn guard_not_public(schema: &str) -> Result<()> {
    ddl::guard_resettable_schema(schema, &["public", "pg_catalog", "information_schema"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_public() {
        assert!(guard_not_public("public").is_err());
        assert!(guard_not_public("stage").is_ok());
    }
}
