//! Pure shard-assignment algorithms for root selections.
//!
//! These functions only decide *which shard* each identifier belongs to;
//! turning a shard assignment into a SQL sub-query (and fetching
//! `weights_sql` rows in the first place) is the Selection Resolver's job.
//! Keeping the assignment itself free of I/O makes it directly testable and
//! keeps the `union == whole, pairwise disjoint` invariant checkable without
//! a database.

use crate::error::{Error, Result};

/// Assign each identifier to `count` shards in round-robin order: the
/// identifier at input index `i` goes to shard `i mod count`.
pub fn round_robin(ids: &[i64], count: u32) -> Result<Vec<Vec<i64>>> {
    if count == 0 {
        return Err(Error::Config("shard count must be greater than zero".to_string()));
    }
    let mut shards: Vec<Vec<i64>> = vec![Vec::new(); count as usize];
    for (i, id) in ids.iter().enumerate() {
        shards[i % count as usize].push(*id);
    }
    Ok(shards)
}

/// Greedily assign identifiers to `count` shards in descending weight
/// order, always placing the next identifier into the shard with the
/// smallest running total (ties broken by the lowest shard index).
///
/// Identifiers absent from `weights` default to weight `1`. `weights` rows
/// that could not be coerced to an identifier/weight pair by the caller
/// should already have been rejected as a fatal configuration error before
/// this function runs.
pub fn weighted(ids: &[i64], weights: &std::collections::HashMap<i64, i64>, count: u32) -> Result<Vec<Vec<i64>>> {
    if count == 0 {
        return Err(Error::Config("shard count must be greater than zero".to_string()));
    }
    let mut weighted_ids: Vec<(i64, i64)> = ids
        .iter()
        .map(|id| (*id, *weights.get(id).unwrap_or(&1)))
        .collect();
    // Stable sort descending by weight; ties keep input order, which keeps
    // the assignment deterministic across runs given the same input order.
    weighted_ids.sort_by(|a, b| b.1.cmp(&a.1));

    let mut shards: Vec<Vec<i64>> = vec![Vec::new(); count as usize];
    let mut totals: Vec<i64> = vec![0; count as usize];

    for (id, weight) in weighted_ids {
        let (target, _) = totals
            .iter()
            .enumerate()
            .min_by_key(|(idx, total)| (**total, *idx))
            .expect("count > 0 checked above");
        shards[target].push(id);
        totals[target] += weight;
    }

    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_robin_covers_every_id_exactly_once() {
        let ids: Vec<i64> = (1..=10).collect();
        let shards = round_robin(&ids, 3).unwrap();
        let mut seen: Vec<i64> = shards.iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, ids);
    }

    #[test]
    fn round_robin_assigns_by_index_modulo() {
        let ids = vec![10, 20, 30, 40, 50];
        let shards = round_robin(&ids, 2).unwrap();
        assert_eq!(shards[0], vec![10, 30, 50]);
        assert_eq!(shards[1], vec![20, 40]);
    }

    #[test]
    fn round_robin_shards_are_disjoint() {
        let ids: Vec<i64> = (1..=23).collect();
        let shards = round_robin(&ids, 4).unwrap();
        let mut all = std::collections::HashSet::new();
        for shard in &shards {
            for id in shard {
                assert!(all.insert(*id), "id {id} assigned to more than one shard");
            }
        }
    }

    #[test]
    fn weighted_covers_every_id_exactly_once() {
        let ids: Vec<i64> = (1..=20).collect();
        let mut weights = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            weights.insert(*id, (i as i64) + 1);
        }
        let shards = weighted(&ids, &weights, 4).unwrap();
        let mut seen: Vec<i64> = shards.iter().flatten().copied().collect();
        seen.sort();
        assert_eq!(seen, ids);
    }

    #[test]
    fn weighted_balances_running_totals() {
        let ids = vec![1, 2, 3, 4];
        let mut weights = HashMap::new();
        weights.insert(1, 100);
        weights.insert(2, 1);
        weights.insert(3, 1);
        weights.insert(4, 1);
        let shards = weighted(&ids, &weights, 2).unwrap();
        // The heavy id lands alone in one shard; the three light ids land
        // together in the other, since each placement picks the lighter
        // running total.
        let heavy_shard = shards.iter().find(|s| s.contains(&1)).unwrap();
        assert_eq!(heavy_shard, &vec![1]);
    }

    #[test]
    fn weighted_defaults_unknown_ids_to_weight_one() {
        let ids = vec![1, 2, 3];
        let weights = HashMap::new();
        let shards = weighted(&ids, &weights, 3).unwrap();
        assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), 3);
    }

    #[test]
    fn weighted_rejects_zero_count() {
        assert!(weighted(&[1, 2], &HashMap::new(), 0).is_err());
    }

    #[test]
    fn round_robin_rejects_zero_count() {
        assert!(round_robin(&[1, 2], 0).is_err());
    }
}
