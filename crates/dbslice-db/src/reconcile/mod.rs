//! Reconciliation passes that bring destination schema objects (sequences,
//! functions, triggers, indexes, constraints) into alignment with source
//! after table-group materialization, plus bounded-concurrency foreign-key
//! validation.

pub mod constraints;
pub mod functions;
pub mod indexes;
pub mod sequences;
pub mod triggers;
