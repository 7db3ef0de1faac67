//! The resolved [`Selection`] type: a named identifier set plus its
//! reusable sub-query, shared between the Selection Resolver (which
//! produces it) and the Table-Group Builder (which joins against it).

/// A named set of integer identifiers produced by evaluating a root
/// selector, together with a SQL sub-query that reproduces the same set.
///
/// Invariant: `ids` contains no duplicates, and executing `sql` against the
/// source database returns exactly `ids` as a set. If the selector was
/// sharded, `shards` holds `count` sub-queries whose union equals `sql`.
#[derive(Debug, Clone)]
pub struct Selection {
    pub name: String,
    pub ids: Vec<i64>,
    pub sql: String,
    pub shards: Vec<String>,
}

impl Selection {
    pub fn unsharded(name: impl Into<String>, ids: Vec<i64>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids,
            sql: sql.into(),
            shards: Vec::new(),
        }
    }

    pub fn is_sharded(&self) -> bool {
        !self.shards.is_empty()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
