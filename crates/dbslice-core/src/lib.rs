//! # dbslice-core
//!
//! Core types for dbslice: the normalized [`plan::Plan`], the
//! [`selection::Selection`] value the resolver and builder share, pure
//! shard-assignment algorithms, the crate-wide [`error::Error`], and the
//! logging and default-constant modules the rest of the workspace builds on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod plan;
pub mod selection;
pub mod sharding;

pub use error::{Error, Result};
pub use plan::{
    ColumnRef, Dep, ExistsTarget, NeuterConfig, NeuterRule, NeuterShard, NeuterStrategy,
    ParentSource, Phase, Plan, PlanFile, PkModShard, Precopy, PreMigrate, ReconcileFlags, Root,
    RootSelector, SelectorMode, ShardConfig, ShardStrategy, TableGroup,
};
pub use selection::Selection;
