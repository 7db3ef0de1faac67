//! Centralized default constants for dbslice.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates should reference these constants instead of repeating magic
//! numbers inline.

// =============================================================================
// SCHEMA NAMES
// =============================================================================

/// Default source schema name.
pub const SOURCE_SCHEMA: &str = "public";

/// Default destination schema name.
pub const DEST_SCHEMA: &str = "stage";

/// Default scratch schema for in-progress work.
pub const TMP_SCHEMA: &str = "tmp";

/// Default scratch namespace for per-shard tables.
pub const SHARDS_SCHEMA: &str = "shards";

/// Default quarantine schema name used by `swap`.
pub const OLD_SCHEMA: &str = "old";

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Default bounded concurrency for precopy and builder fan-out.
pub const FANOUT_PARALLEL: usize = 8;

/// Default bounded concurrency for foreign-key validation.
pub const VALIDATE_PARALLEL: usize = 16;

/// Default bounded concurrency for sharded redaction.
pub const NEUTER_PARALLEL: usize = 1;

// =============================================================================
// SCHEMA NAMES THAT MUST NEVER BE RESET
// =============================================================================

/// Namespaces the scratch-cleanup step refuses to drop, regardless of
/// configuration, to guard against a misconfigured `shards_schema`.
pub const PROTECTED_SCHEMAS: &[&str] = &["public", "pg_catalog", "information_schema"];
