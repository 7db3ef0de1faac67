//! Structured logging schema and field name constants for dbslice.
//!
//! All crates use these constants for consistent structured logging fields
//! so operators can filter a migration's logs by schema, table, or pass.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | A pass aborted; operator attention required |
//! | WARN  | A tolerated per-object failure (function/trigger reconcile) |
//! | INFO  | Pass start/completion, table materialized, schema promoted |
//! | DEBUG | Per-table/per-shard decision points |
//! | TRACE | Per-row or per-identifier iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "introspect", "ddl", "selection", "precopy", "builder",
/// "reconcile", "redact", "promote", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "sequences", "functions", "triggers", "indexes",
/// "constraints", "fk_validate"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "create", "reconcile", "materialize", "swap"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Schema name a statement targets.
pub const SCHEMA: &str = "schema";

/// Table name a statement targets.
pub const TABLE: &str = "table";

/// Table group name.
pub const GROUP: &str = "group";

/// Selection name.
pub const SELECTION: &str = "selection";

/// Shard index within a sharded operation.
pub const SHARD_INDEX: &str = "shard_index";

/// Total shard count for a sharded operation.
pub const SHARD_COUNT: &str = "shard_count";

/// Constraint, index, trigger, or sequence name.
pub const OBJECT_NAME: &str = "object_name";

/// Object kind ("u", "c", "x", "f" for constraints; "index"; "trigger";
/// "sequence"; "function").
pub const OBJECT_KIND: &str = "object_kind";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Row count affected or materialized.
pub const ROW_COUNT: &str = "row_count";

/// Number of objects reconciled in a pass.
pub const RECONCILED_COUNT: &str = "reconciled_count";

/// Number of objects dropped in a pass.
pub const DROPPED_COUNT: &str = "dropped_count";

/// Number of in-flight tasks permitted concurrently.
pub const PARALLELISM: &str = "parallelism";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails or is tolerated.
pub const ERROR_MSG: &str = "error";
