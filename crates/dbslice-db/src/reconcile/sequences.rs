//! Sequence reconciliation: bring destination sequences into alignment with
//! source (next value, `OWNED BY`), dropping extraneous destination-only
//! sequences.

use tracing::{info, warn};

use dbslice_core::Result;

use crate::ddl::quote_ident;
use crate::introspect;

/// Counts of the sequence operations performed by one reconcile pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SequenceReport {
    pub created: Vec<String>,
    pub advanced: Vec<String>,
    pub dropped: Vec<String>,
}

pub async fn reconcile_sequences(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
) -> Result<SequenceReport> {
    let mut report = SequenceReport::default();

    let src_seqs = introspect::list_sequences(&mut *conn, source_schema).await?;
    let dst_seqs = introspect::list_sequences(&mut *conn, dest_schema).await?;

    for seq in &src_seqs {
        let (next_value, _increment, _called) =
            introspect::fetch_sequence_core(conn, source_schema, seq).await?;

        if !dst_seqs.contains(seq) {
            create_sequence_like(conn, source_schema, dest_schema, seq, next_value).await?;
            report.created.push(seq.clone());
            continue;
        }

        let (dst_next, _, _) = introspect::fetch_sequence_core(conn, dest_schema, seq).await?;
        if dst_next != next_value {
            let sql = format!(
                "SELECT setval('{}.{}', {}, false)",
                quote_ident(dest_schema),
                quote_ident(seq),
                next_value
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            report.advanced.push(seq.clone());
        }

        align_owned_by(conn, source_schema, dest_schema, seq).await?;
    }

    for seq in &dst_seqs {
        if !src_seqs.contains(seq) {
            let sql = format!(
                "DROP SEQUENCE IF EXISTS {}.{} CASCADE",
                quote_ident(dest_schema),
                quote_ident(seq)
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            report.dropped.push(seq.clone());
        }
    }

    info!(
        subsystem = "reconcile",
        component = "sequences",
        op = "complete",
        created = report.created.len(),
        advanced = report.advanced.len(),
        dropped = report.dropped.len(),
        "sequence reconciliation complete"
    );

    Ok(report)
}

async fn create_sequence_like(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    seq: &str,
    next_value: i64,
) -> Result<()> {
    let create_sql = format!(
        "CREATE SEQUENCE {}.{}",
        quote_ident(dest_schema),
        quote_ident(seq)
    );
    sqlx::query(&create_sql).execute(&mut *conn).await?;

    let setval_sql = format!(
        "SELECT setval('{}.{}', {}, false)",
        quote_ident(dest_schema),
        quote_ident(seq),
        next_value
    );
    sqlx::query(&setval_sql).execute(&mut *conn).await?;

    align_owned_by(conn, source_schema, dest_schema, seq).await
}

async fn align_owned_by(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    seq: &str,
) -> Result<()> {
    let Some((table, column)) =
        introspect::fetch_sequence_owned_by(&mut *conn, source_schema, seq).await?
    else {
        return Ok(());
    };

    if !introspect::column_exists(&mut *conn, dest_schema, &table, &column).await? {
        warn!(
            subsystem = "reconcile",
            component = "sequences",
            op = "owned_by_skip",
            sequence = %seq,
            table = %table,
            column = %column,
            "source-owning column absent in destination, skipping OWNED BY"
        );
        return Ok(());
    }

    let sql = format!(
        "ALTER SEQUENCE {}.{} OWNED BY {}.{}.{}",
        quote_ident(dest_schema),
        quote_ident(seq),
        quote_ident(dest_schema),
        quote_ident(&table),
        quote_ident(&column)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = SequenceReport::default();
        assert!(report.created.is_empty());
        assert!(report.advanced.is_empty());
        assert!(report.dropped.is_empty());
    }
}
