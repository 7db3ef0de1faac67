//! The normalized migration plan.
//!
//! A [`Plan`] is the typed replacement for the dynamic configuration
//! dictionary: every selector variant, redaction strategy, and reconcile
//! gate is an enumerated, validated Rust value rather than a string key
//! looked up at call time. [`PlanFile`] is the YAML-facing shape; call
//! [`PlanFile::normalize`] to produce a [`Plan`].

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::defaults;
use crate::error::{Error, Result};

/// A single root selector: how a table group's root row set is chosen.
///
/// Variant names mirror the seven selector modes a root may declare.
/// Parsing validates the variant (and required fields) up front so the
/// resolver never has to handle an incomplete selector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectorMode {
    /// Identifiers given literally.
    List { ids: Vec<i64> },
    /// Execute a query; the first column is the identifier.
    Sql {
        query: String,
        #[serde(default)]
        params: Vec<serde_yaml::Value>,
    },
    /// Union of `DISTINCT column FROM table` over each declared reference.
    ReferencedBy { refs: Vec<ColumnRef> },
    /// Auto-discover every destination table with a column of this name.
    ReferencedByColumn {
        schema: String,
        column: String,
        #[serde(default)]
        extra_refs: Vec<ColumnRef>,
    },
    /// `source.table.id` where `fk_col` points into an already-staged table.
    FkInStage {
        table: String,
        fk_col: String,
        stage_table: String,
        stage_id_col: String,
    },
    /// `source.table.id` filtered by EXISTS-clauses against staged tables.
    RefersToStage {
        table: String,
        targets: Vec<ExistsTarget>,
    },
    /// `d.id` filtered by scope membership, or by an EXISTS mapping clause.
    ScopeOrExists {
        table: String,
        scope_col: String,
        scope_selection: String,
        #[serde(default)]
        exclude_values: Vec<serde_yaml::Value>,
        #[serde(default)]
        exists_clause: Option<String>,
        #[serde(default)]
        local_predicate: Option<String>,
    },
}

/// A `schema.table.column` reference used by `referenced_by` selectors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// An EXISTS-clause target used by `refers_to_stage` selectors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExistsTarget {
    pub table: String,
    pub predicate: String,
}

/// Sharding strategy for a root selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    RoundRobin,
    Weighted,
}

/// Shard configuration attached to a root selector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShardConfig {
    pub count: u32,
    #[serde(default = "default_strategy")]
    pub strategy: ShardStrategy,
    #[serde(default)]
    pub weights_sql: Option<String>,
}

fn default_strategy() -> ShardStrategy {
    ShardStrategy::RoundRobin
}

/// When a selection is resolved relative to other table groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Pre,
    Post,
}

/// A fully-described root selector, named and ready for resolution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RootSelector {
    pub name: String,
    #[serde(flatten)]
    pub mode: SelectorMode,
    #[serde(default)]
    pub ensure: Vec<i64>,
    #[serde(default)]
    pub shard: Option<ShardConfig>,
    #[serde(default)]
    pub phase: Phase,
}

/// The root of a table group: the table materialized first, optionally
/// restricted to a named selection.
#[derive(Debug, Clone, Deserialize)]
pub struct Root {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Inline selector; normalization lifts this into the plan's flat
    /// `roots` list and replaces it with a name reference.
    #[serde(default)]
    pub selector: Option<RootSelector>,
    #[serde(default)]
    pub join: Option<String>,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl Root {
    /// The join predicate against the selection, defaulting to `d.id = p.id`.
    pub fn join_predicate(&self) -> String {
        self.join
            .clone()
            .unwrap_or_else(|| "d.id = p.id".to_string())
    }
}

/// Where a dependent's parent rows come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParentSource {
    Selection { selection: String },
    ParentTable { parent_table: String },
}

/// PK-modulo sharding configuration for a dependent table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PkModShard {
    pub shard_key: String,
    pub shard_count: u32,
}

/// A dependent table materialized by joining against one or more parents.
#[derive(Debug, Clone, Deserialize)]
pub struct Dep {
    pub table: String,
    pub sources: Vec<ParentSource>,
    pub join: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default)]
    pub shard_by_pk_mod: Option<PkModShard>,
}

/// One root plus its ordered dependents.
#[derive(Debug, Clone, Deserialize)]
pub struct TableGroup {
    pub name: String,
    pub root: Root,
    #[serde(default)]
    pub deps: Vec<Dep>,
}

/// Tables copied wholesale (or schema-only) before selection resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Precopy {
    #[serde(default)]
    pub schema_only: Vec<String>,
    #[serde(default)]
    pub full_copy: Vec<String>,
}

/// Redaction strategy for a single column rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeuterStrategy {
    Prefix,
    Replace,
}

/// Sharding for a parallel redaction pass.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NeuterShard {
    pub column: String,
    pub modulo: u32,
}

/// One column redaction rule.
#[derive(Debug, Clone, Deserialize)]
pub struct NeuterRule {
    pub column: String,
    pub strategy: NeuterStrategy,
    pub value: String,
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    #[serde(default)]
    pub shard: Option<NeuterShard>,
}

/// Redaction configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NeuterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_neuter_parallel")]
    pub parallel: usize,
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<NeuterRule>>,
}

fn default_neuter_parallel() -> usize {
    defaults::NEUTER_PARALLEL
}

/// Truncate-then-execute bootstrap step, consumed by `pre-migrate`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreMigrate {
    #[serde(default)]
    pub truncate: Vec<String>,
    #[serde(default)]
    pub sql: Vec<String>,
}

/// Boolean gates for each reconciliation pass; all default `true` except
/// `permissions`, which is out of scope and always off.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileFlags {
    #[serde(default = "t")]
    pub sequences: bool,
    #[serde(default = "t")]
    pub primary_keys: bool,
    #[serde(default = "t")]
    pub indexes: bool,
    #[serde(default = "t")]
    pub triggers: bool,
    #[serde(default = "t")]
    pub column_settings: bool,
    #[serde(default = "t")]
    pub constraints: bool,
    #[serde(default = "t")]
    pub views: bool,
    #[serde(default)]
    pub permissions: bool,
}

fn t() -> bool {
    true
}

impl Default for ReconcileFlags {
    fn default() -> Self {
        Self {
            sequences: true,
            primary_keys: true,
            indexes: true,
            triggers: true,
            column_settings: true,
            constraints: true,
            views: true,
            permissions: false,
        }
    }
}

/// The YAML-facing configuration shape, deserialized directly from the
/// operator's config file before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    #[serde(default, alias = "src_schema")]
    pub source_schema: Option<String>,
    #[serde(default, alias = "dst_schema")]
    pub dest_schema: Option<String>,
    #[serde(default)]
    pub tmp_schema: Option<String>,
    #[serde(default)]
    pub shards_schema: Option<String>,
    #[serde(default)]
    pub old_schema: Option<String>,
    #[serde(default)]
    pub precopy: Precopy,
    #[serde(default)]
    pub table_groups: Vec<TableGroup>,
    #[serde(default)]
    pub neuter: NeuterConfig,
    #[serde(default)]
    pub reconcile: ReconcileFlags,
    #[serde(default)]
    pub pre_migrate: PreMigrate,
    /// Declared but unused beyond documentation, mirrored from the
    /// original configuration format.
    #[serde(default)]
    pub phases: Vec<String>,
}

/// The fully normalized plan the engine operates on.
#[derive(Debug, Clone)]
pub struct Plan {
    pub source_schema: String,
    pub dest_schema: String,
    pub tmp_schema: String,
    pub shards_schema: String,
    pub old_schema: String,
    pub precopy: Precopy,
    pub table_groups: Vec<TableGroup>,
    /// Root selectors, extracted from each table group's inline `root.selector`
    /// and keyed by name for the resolver.
    pub roots: Vec<RootSelector>,
    pub neuter: NeuterConfig,
    pub reconcile: ReconcileFlags,
    pub pre_migrate: PreMigrate,
}

impl PlanFile {
    /// Parse a plan from a YAML document.
    pub fn from_yaml(text: &str) -> Result<PlanFile> {
        serde_yaml::from_str(text).map_err(Error::Yaml)
    }

    /// Normalize into a [`Plan`], applying schema-name defaults and
    /// extracting each table group's inline root selector into the flat
    /// `roots` list the resolver consumes.
    pub fn normalize(self) -> Result<Plan> {
        let source_schema = self
            .source_schema
            .unwrap_or_else(|| defaults::SOURCE_SCHEMA.to_string());
        let dest_schema = self
            .dest_schema
            .unwrap_or_else(|| defaults::DEST_SCHEMA.to_string());
        let tmp_schema = self
            .tmp_schema
            .unwrap_or_else(|| defaults::TMP_SCHEMA.to_string());
        let shards_schema = self
            .shards_schema
            .unwrap_or_else(|| defaults::SHARDS_SCHEMA.to_string());
        let old_schema = self
            .old_schema
            .unwrap_or_else(|| defaults::OLD_SCHEMA.to_string());

        let mut roots = Vec::new();
        let mut seen_names = std::collections::BTreeSet::new();
        for group in &self.table_groups {
            if let Some(selector) = &group.root.selector {
                if !seen_names.insert(selector.name.clone()) {
                    return Err(Error::Config(format!(
                        "duplicate root selector name '{}'",
                        selector.name
                    )));
                }
                roots.push(selector.clone());
            }
        }

        if self.table_groups.is_empty() && self.precopy.schema_only.is_empty() && self.precopy.full_copy.is_empty() {
            return Err(Error::Config(
                "plan declares neither precopy tables nor table groups".to_string(),
            ));
        }

        detect_scope_selection_cycles(&roots)?;

        Ok(Plan {
            source_schema,
            dest_schema,
            tmp_schema,
            shards_schema,
            old_schema,
            precopy: self.precopy,
            table_groups: self.table_groups,
            roots,
            neuter: self.neuter,
            reconcile: self.reconcile,
            pre_migrate: self.pre_migrate,
        })
    }
}

impl Plan {
    /// Look up a named table group.
    pub fn group(&self, name: &str) -> Option<&TableGroup> {
        self.table_groups.iter().find(|g| g.name == name)
    }

    /// Look up a named root selector.
    pub fn root_selector(&self, name: &str) -> Option<&RootSelector> {
        self.roots.iter().find(|r| r.name == name)
    }

    /// Compute the transitive closure of root selector names required to
    /// migrate the given subset of table groups: each requested group's own
    /// selector, plus any selector transitively required via
    /// `scope_or_exists.scope_selection` chains.
    pub fn required_roots<'a>(&'a self, group_names: &[String]) -> Result<Vec<&'a str>> {
        let mut required: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
        let mut queue: Vec<&str> = Vec::new();

        for name in group_names {
            let group = self
                .group(name)
                .ok_or_else(|| Error::Config(format!("unknown table group '{name}'")))?;
            if let Some(sel) = &group.root.selector {
                queue.push(sel.name.as_str());
            }
        }

        while let Some(name) = queue.pop() {
            if !required.insert(name) {
                continue;
            }
            if let Some(selector) = self.root_selector(name) {
                if let SelectorMode::ScopeOrExists { scope_selection, .. } = &selector.mode {
                    queue.push(scope_selection.as_str());
                }
            }
        }

        Ok(required.into_iter().collect())
    }
}

/// Fatal configuration error if `scope_or_exists.scope_selection` forms a
/// cycle among declared root selectors.
fn detect_scope_selection_cycles(roots: &[RootSelector]) -> Result<()> {
    let by_name: BTreeMap<&str, &RootSelector> =
        roots.iter().map(|r| (r.name.as_str(), r)).collect();

    for root in roots {
        let mut visited = std::collections::BTreeSet::new();
        let mut current = root.name.as_str();
        loop {
            if !visited.insert(current) {
                return Err(Error::Config(format!(
                    "cycle detected in scope_or_exists.scope_selection starting at '{}'",
                    root.name
                )));
            }
            match by_name.get(current) {
                Some(selector) => match &selector.mode {
                    SelectorMode::ScopeOrExists { scope_selection, .. } => {
                        current = scope_selection.as_str();
                    }
                    _ => break,
                },
                None => break,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
source_schema: public
dest_schema: stage
precopy:
  full_copy: [coupon]
  schema_only: [shipment]
table_groups:
  - name: store
    root:
      table: store
      selector:
        name: stores
        mode: list
        ids: [1]
    deps:
      - table: product
        sources: [{selection: stores}]
        join: "d.store_id = p.id"
"#
    }

    #[test]
    fn normalizes_defaults() {
        let file = PlanFile::from_yaml(minimal_yaml()).unwrap();
        let plan = file.normalize().unwrap();
        assert_eq!(plan.source_schema, "public");
        assert_eq!(plan.dest_schema, "stage");
        assert_eq!(plan.tmp_schema, "tmp");
        assert_eq!(plan.shards_schema, "shards");
        assert_eq!(plan.old_schema, "old");
        assert_eq!(plan.roots.len(), 1);
        assert_eq!(plan.roots[0].name, "stores");
    }

    #[test]
    fn rejects_empty_plan() {
        let file = PlanFile::from_yaml("source_schema: public\n").unwrap();
        assert!(file.normalize().is_err());
    }

    #[test]
    fn legacy_schema_aliases_accepted() {
        let yaml = r#"
src_schema: legacy_src
dst_schema: legacy_dst
precopy:
  full_copy: [t]
"#;
        let file = PlanFile::from_yaml(yaml).unwrap();
        let plan = file.normalize().unwrap();
        assert_eq!(plan.source_schema, "legacy_src");
        assert_eq!(plan.dest_schema, "legacy_dst");
    }

    #[test]
    fn required_roots_follows_scope_chain() {
        let yaml = r#"
precopy:
  full_copy: [t]
table_groups:
  - name: a
    root:
      table: a
      selector: {name: sel_a, mode: list, ids: [1]}
  - name: b
    root:
      table: b
      selector:
        name: sel_b
        mode: scope_or_exists
        table: b
        scope_col: a_id
        scope_selection: sel_a
"#;
        let file = PlanFile::from_yaml(yaml).unwrap();
        let plan = file.normalize().unwrap();
        let required = plan.required_roots(&["b".to_string()]).unwrap();
        assert!(required.contains(&"sel_a"));
        assert!(required.contains(&"sel_b"));
    }

    #[test]
    fn detects_selector_cycle() {
        let yaml = r#"
precopy:
  full_copy: [t]
table_groups:
  - name: a
    root:
      table: a
      selector:
        name: sel_a
        mode: scope_or_exists
        table: a
        scope_col: b_id
        scope_selection: sel_b
  - name: b
    root:
      table: b
      selector:
        name: sel_b
        mode: scope_or_exists
        table: b
        scope_col: a_id
        scope_selection: sel_a
"#;
        let file = PlanFile::from_yaml(yaml).unwrap();
        assert!(file.normalize().is_err());
    }

    #[test]
    fn duplicate_selector_name_rejected() {
        let yaml = r#"
precopy:
  full_copy: [t]
table_groups:
  - name: a
    root:
      table: a
      selector: {name: dup, mode: list, ids: [1]}
  - name: b
    root:
      table: b
      selector: {name: dup, mode: list, ids: [2]}
"#;
        let file = PlanFile::from_yaml(yaml).unwrap();
        assert!(file.normalize().is_err());
    }

    #[test]
    fn reconcile_flags_default_all_true_except_permissions() {
        let flags = ReconcileFlags::default();
        assert!(flags.sequences);
        assert!(flags.primary_keys);
        assert!(flags.indexes);
        assert!(flags.triggers);
        assert!(flags.column_settings);
        assert!(flags.constraints);
        assert!(flags.views);
        assert!(!flags.permissions);
    }
}
