//! Recovery volume selection.
//!
//! Given the block counts of the available recovery volumes and a block
//! deficit, pick the subset of volumes to download that covers the deficit
//! with the least surplus. Inverted, that is the classic 0/1 knapsack:
//! maximise the blocks we *leave behind* without exceeding `total − needed`,
//! then download everything else.

/// Choose which recovery volumes to download.
///
/// `block_counts[i]` is the number of recovery blocks volume `i` provides;
/// `needed` is the deficit to cover. Returns the indices of the chosen
/// volumes in their original order. When the volumes cannot cover the
/// deficit, all of them are returned and the caller decides what to do
/// with the shortfall.
pub fn select_volumes(block_counts: &[usize], needed: usize) -> Vec<usize> {
    let total: usize = block_counts.iter().sum();
    if total <= needed {
        return (0..block_counts.len()).collect();
    }
    // blocks we can afford to exclude
    let target = total - needed;
    let n = block_counts.len();

    let mut best = vec![vec![0usize; target + 1]; n + 1];
    let mut keep = vec![vec![false; target + 1]; n + 1];

    for i in 1..=n {
        let w = block_counts[i - 1];
        for j in 0..=target {
            if j >= w {
                let without = best[i - 1][j];
                let with = best[i - 1][j - w] + w;
                // strict comparison keeps the earlier-indexed volume out of
                // the exclude set on ties
                if without < with {
                    best[i][j] = with;
                    keep[i][j] = true;
                } else {
                    best[i][j] = without;
                }
            } else {
                best[i][j] = best[i - 1][j];
            }
        }
    }

    let mut excluded = vec![false; n];
    let mut j = target;
    for i in (1..=n).rev() {
        if keep[i][j] {
            j -= block_counts[i - 1];
            excluded[i - 1] = true;
        }
    }

    (0..n).filter(|&i| !excluded[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(counts: &[usize], picked: &[usize]) -> usize {
        picked.iter().map(|&i| counts[i]).sum()
    }

    #[test]
    fn powers_of_two_hit_deficit_exactly() {
        let counts = [1, 2, 4, 8, 16];
        let picked = select_volumes(&counts, 10);
        assert_eq!(picked, vec![1, 3]);
        assert_eq!(blocks(&counts, &picked), 10);
    }

    #[test]
    fn zero_deficit_selects_nothing() {
        let picked = select_volumes(&[3, 5, 7], 0);
        assert!(picked.is_empty());
    }

    #[test]
    fn deficit_equal_to_total_selects_everything() {
        let counts = [3, 5, 7];
        let picked = select_volumes(&counts, 15);
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn insufficient_volumes_returns_all() {
        let picked = select_volumes(&[1, 2], 100);
        assert_eq!(picked, vec![0, 1]);
    }

    #[test]
    fn surplus_is_minimal() {
        // deficit 5 from [4, 4, 4]: two volumes (8 blocks) is the best we
        // can do, one is not enough
        let counts = [4, 4, 4];
        let picked = select_volumes(&counts, 5);
        assert_eq!(blocks(&counts, &picked), 8);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn prefers_exact_cover_over_larger() {
        // deficit 7: {3, 4} covers exactly; {10} would waste 3 blocks
        let counts = [10, 3, 4];
        let picked = select_volumes(&counts, 7);
        assert_eq!(blocks(&counts, &picked), 7);
    }

    #[test]
    fn result_keeps_original_order() {
        let counts = [5, 1, 5, 1, 5];
        let picked = select_volumes(&counts, 11);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(picked, sorted);
        assert!(blocks(&counts, &picked) >= 11);
    }

    #[test]
    fn empty_volume_list() {
        assert!(select_volumes(&[], 0).is_empty());
        assert!(select_volumes(&[], 5).is_empty());
    }

    #[test]
    fn no_proper_subset_still_covers() {
        // minimality in the subset sense: dropping any chosen volume must
        // break coverage
        let counts = [6, 5, 4, 3, 2];
        let needed = 9;
        let picked = select_volumes(&counts, needed);
        let sum = blocks(&counts, &picked);
        assert!(sum >= needed);
        for &drop in &picked {
            assert!(sum - counts[drop] < needed, "volume {drop} is redundant");
        }
    }
}
