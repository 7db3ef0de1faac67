//! Gap-only audit reports comparing source and destination schemas: table
//! existence and shape, primary keys, constraints, indexes, triggers, and
//! sequence drift. Empty sections are omitted; a fully empty report is the
//! "perfect match" sentinel the CLI prints instead of an empty document.

use std::collections::{BTreeMap, BTreeSet};

use dbslice_core::Result;

use crate::introspect::{self, ColumnInfo};

/// Column-level differences between a source and destination column of the
/// same name.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ColumnDiff {
    pub data_type: Option<(String, String)>,
    pub udt_name: Option<(String, String)>,
    pub nullable: Option<(bool, bool)>,
    pub default_expr: Option<(Option<String>, Option<String>)>,
    pub char_max_len: Option<(Option<i32>, Option<i32>)>,
    pub numeric_precision: Option<(Option<i32>, Option<i32>)>,
}

impl ColumnDiff {
    fn is_empty(&self) -> bool {
        self == &ColumnDiff::default()
    }
}

fn diff_columns(src: &ColumnInfo, dst: &ColumnInfo) -> ColumnDiff {
    let mut diff = ColumnDiff::default();
    if src.data_type != dst.data_type {
        diff.data_type = Some((src.data_type.clone(), dst.data_type.clone()));
    }
    if src.udt_name != dst.udt_name {
        diff.udt_name = Some((src.udt_name.clone(), dst.udt_name.clone()));
    }
    if src.nullable != dst.nullable {
        diff.nullable = Some((src.nullable, dst.nullable));
    }
    if src.default_expr != dst.default_expr {
        diff.default_expr = Some((src.default_expr.clone(), dst.default_expr.clone()));
    }
    if src.char_max_len != dst.char_max_len {
        diff.char_max_len = Some((src.char_max_len, dst.char_max_len));
    }
    if src.numeric_precision != dst.numeric_precision {
        diff.numeric_precision = Some((src.numeric_precision, dst.numeric_precision));
    }
    diff
}

/// Gaps found between a source and destination table. All fields are empty
/// when the two are in sync.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TableAudit {
    pub missing_in_src: bool,
    pub missing_in_dst: bool,
    pub column_diffs: BTreeMap<String, ColumnDiff>,
    pub missing_columns_in_dst: Vec<String>,
    pub extra_columns_in_dst: Vec<String>,
    pub primary_key_gap: Option<String>,
    pub missing_constraints: Vec<String>,
    pub extra_constraints: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub extra_indexes: Vec<String>,
    pub missing_triggers: Vec<String>,
    pub extra_triggers: Vec<String>,
    pub sequence_default_gaps: Vec<String>,
}

impl TableAudit {
    pub fn is_empty(&self) -> bool {
        !self.missing_in_src
            && !self.missing_in_dst
            && self.column_diffs.is_empty()
            && self.missing_columns_in_dst.is_empty()
            && self.extra_columns_in_dst.is_empty()
            && self.primary_key_gap.is_none()
            && self.missing_constraints.is_empty()
            && self.extra_constraints.is_empty()
            && self.missing_indexes.is_empty()
            && self.extra_indexes.is_empty()
            && self.missing_triggers.is_empty()
            && self.extra_triggers.is_empty()
            && self.sequence_default_gaps.is_empty()
    }
}

/// Compare one table between `source_schema` and `dest_schema`.
pub async fn audit_table(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
) -> Result<TableAudit> {
    let mut audit = TableAudit::default();

    let src_exists = introspect::table_exists(&mut *conn, source_schema, table).await?;
    let dst_exists = introspect::table_exists(&mut *conn, dest_schema, table).await?;

    if !src_exists {
        audit.missing_in_src = true;
        return Ok(audit);
    }
    if !dst_exists {
        audit.missing_in_dst = true;
        return Ok(audit);
    }

    let src_columns = introspect::fetch_columns(&mut *conn, source_schema, table).await?;
    let dst_columns: BTreeMap<String, ColumnInfo> = introspect::fetch_columns(&mut *conn, dest_schema, table)
        .await?
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();
    let src_names: BTreeSet<&str> = src_columns.iter().map(|c| c.name.as_str()).collect();

    for src_col in &src_columns {
        match dst_columns.get(&src_col.name) {
            None => audit.missing_columns_in_dst.push(src_col.name.clone()),
            Some(dst_col) => {
                let diff = diff_columns(src_col, dst_col);
                if !diff.is_empty() {
                    audit.column_diffs.insert(src_col.name.clone(), diff);
                }
                if let Some(default) = &src_col.default_expr {
                    if default.contains("nextval(") {
                        check_sequence_default(conn, source_schema, dest_schema, table, &src_col.name, &mut audit).await?;
                    }
                }
            }
        }
    }
    for name in dst_columns.keys() {
        if !src_names.contains(name.as_str()) {
            audit.extra_columns_in_dst.push(name.clone());
        }
    }

    let src_pk = introspect::primary_key(&mut *conn, source_schema, table).await?;
    let dst_pk = introspect::primary_key(&mut *conn, dest_schema, table).await?;
    match (&src_pk, &dst_pk) {
        (Some((_, src_cols)), Some((_, dst_cols))) if src_cols != dst_cols => {
            audit.primary_key_gap = Some(format!(
                "column order differs: source {src_cols:?} vs destination {dst_cols:?}"
            ));
        }
        (Some(_), None) => audit.primary_key_gap = Some("missing in destination".to_string()),
        (None, Some(_)) => audit.primary_key_gap = Some("present in destination, absent in source".to_string()),
        _ => {}
    }

    let src_constraints = introspect::fetch_constraints(&mut *conn, source_schema, table).await?;
    let dst_constraints = introspect::fetch_constraints(&mut *conn, dest_schema, table).await?;
    let src_names: BTreeSet<String> = src_constraints.values().flatten().map(|c| c.name.clone()).collect();
    let dst_names: BTreeSet<String> = dst_constraints.values().flatten().map(|c| c.name.clone()).collect();
    audit.missing_constraints = src_names.difference(&dst_names).cloned().collect();
    audit.extra_constraints = dst_names.difference(&src_names).cloned().collect();

    let src_indexes = introspect::fetch_indexes(&mut *conn, source_schema, table).await?;
    let dst_indexes = introspect::fetch_indexes(&mut *conn, dest_schema, table).await?;
    let src_idx_names: BTreeSet<&String> = src_indexes.keys().filter(|n| !n.ends_with("_pkey")).collect();
    let dst_idx_names: BTreeSet<&String> = dst_indexes.keys().filter(|n| !n.ends_with("_pkey")).collect();
    audit.missing_indexes = src_idx_names.difference(&dst_idx_names).map(|s| s.to_string()).collect();
    audit.extra_indexes = dst_idx_names.difference(&src_idx_names).map(|s| s.to_string()).collect();

    let src_triggers = introspect::fetch_triggers(&mut *conn, source_schema, table).await?;
    let dst_triggers = introspect::fetch_triggers(&mut *conn, dest_schema, table).await?;
    let src_trig_names: BTreeSet<&String> = src_triggers.keys().collect();
    let dst_trig_names: BTreeSet<&String> = dst_triggers.keys().collect();
    audit.missing_triggers = src_trig_names.difference(&dst_trig_names).map(|s| s.to_string()).collect();
    audit.extra_triggers = dst_trig_names.difference(&src_trig_names).map(|s| s.to_string()).collect();

    Ok(audit)
}

async fn check_sequence_default(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
    table: &str,
    column: &str,
    audit: &mut TableAudit,
) -> Result<()> {
    // Any sequence owned by this (table, column) pair in source must have an
    // equivalently-owned sequence in destination.
    let src_rows: Vec<(String,)> = sqlx::query_as(
        "SELECT seqc.relname
         FROM pg_depend dep
         JOIN pg_class seqc ON seqc.oid = dep.objid
         JOIN pg_namespace seqn ON seqn.oid = seqc.relnamespace
         JOIN pg_class tbl ON tbl.oid = dep.refobjid
         JOIN pg_namespace tbln ON tbln.oid = tbl.relnamespace
         JOIN pg_attribute attr ON attr.attrelid = tbl.oid AND attr.attnum = dep.refobjsubid
         WHERE seqn.nspname = $1 AND tbln.nspname = $1 AND tbl.relname = $2 AND attr.attname = $3 AND dep.deptype = 'a'",
    )
    .bind(source_schema)
    .bind(table)
    .bind(column)
    .fetch_all(&mut *conn)
    .await?;

    for (seq_name,) in src_rows {
        match introspect::fetch_sequence_owned_by(&mut *conn, dest_schema, &seq_name).await? {
            Some((owned_table, owned_col)) if owned_table == table && owned_col == column => {}
            _ => audit.sequence_default_gaps.push(format!("{table}.{column} -> {seq_name}")),
        }
    }
    Ok(())
}

/// Audit every table present in either schema; tables present in only one
/// report as `missing_in_src`/`missing_in_dst` without column-level detail.
pub async fn audit_all_tables(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
) -> Result<BTreeMap<String, TableAudit>> {
    let src_tables: BTreeSet<String> = introspect::list_tables(&mut *conn, source_schema).await?.into_iter().collect();
    let dst_tables: BTreeSet<String> = introspect::list_tables(&mut *conn, dest_schema).await?.into_iter().collect();
    let all: BTreeSet<&String> = src_tables.union(&dst_tables).collect();

    let mut out = BTreeMap::new();
    for table in all {
        let audit = audit_table(conn, source_schema, dest_schema, table).await?;
        if !audit.is_empty() {
            out.insert(table.clone(), audit);
        }
    }
    Ok(out)
}

/// Gaps in sequence state between `source_schema` and `dest_schema`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SequenceAudit {
    pub missing_in_dst: Vec<String>,
    pub extra_in_dst: Vec<String>,
    pub next_value_mismatch: BTreeMap<String, (i64, i64)>,
    pub owned_by_mismatch: BTreeMap<String, (Option<(String, String)>, Option<(String, String)>)>,
}

impl SequenceAudit {
    pub fn is_empty(&self) -> bool {
        self.missing_in_dst.is_empty()
            && self.extra_in_dst.is_empty()
            && self.next_value_mismatch.is_empty()
            && self.owned_by_mismatch.is_empty()
    }
}

pub async fn audit_sequences(
    conn: &mut sqlx::PgConnection,
    source_schema: &str,
    dest_schema: &str,
) -> Result<SequenceAudit> {
    let mut audit = SequenceAudit::default();

    let src_seqs: BTreeSet<String> = introspect::list_sequences(&mut *conn, source_schema).await?.into_iter().collect();
    let dst_seqs: BTreeSet<String> = introspect::list_sequences(&mut *conn, dest_schema).await?.into_iter().collect();

    audit.missing_in_dst = src_seqs.difference(&dst_seqs).cloned().collect();
    audit.extra_in_dst = dst_seqs.difference(&src_seqs).cloned().collect();

    for seq in src_seqs.intersection(&dst_seqs) {
        let (src_next, _, _) = introspect::fetch_sequence_core(conn, source_schema, seq).await?;
        let (dst_next, _, _) = introspect::fetch_sequence_core(conn, dest_schema, seq).await?;
        if src_next != dst_next {
            audit.next_value_mismatch.insert(seq.clone(), (src_next, dst_next));
        }

        let src_owned = introspect::fetch_sequence_owned_by(&mut *conn, source_schema, seq).await?;
        let dst_owned = introspect::fetch_sequence_owned_by(&mut *conn, dest_schema, seq).await?;
        if src_owned != dst_owned {
            audit.owned_by_mismatch.insert(seq.clone(), (src_owned, dst_owned));
        }
    }

    Ok(audit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_audit_empty_is_perfect_match() {
        let audit = TableAudit::default();
        assert!(audit.is_empty());
    }

    #[test]
    fn sequence_audit_empty_is_perfect_match() {
        let audit = SequenceAudit::default();
        assert!(audit.is_empty());
    }

    #[test]
    fn column_diff_detects_type_change() {
        let src = ColumnInfo {
            name: "id".to_string(),
            data_type: "integer".to_string(),
            udt_name: "int4".to_string(),
            nullable: false,
            default_expr: None,
            char_max_len: None,
            numeric_precision: None,
            numeric_scale: None,
        };
        let mut dst = src.clone();
        dst.data_type = "bigint".to_string();
        let diff = diff_columns(&src, &dst);
        assert!(!diff.is_empty());
        assert_eq!(diff.data_type, Some(("integer".to_string(), "bigint".to_string())));
    }
}
