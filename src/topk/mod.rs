//! Exact top-k selection over a finished [`CountsArray`].
//!
//! Selection works on a histogram of counts ("how many n-grams were seen
//! exactly c times"), which is small even when the counts array is huge. From
//! it we derive the smallest count that still makes the cut and how many
//! n-grams with exactly that count may be taken, so that the result has
//! exactly `k` entries whenever at least `k` n-grams were seen more than once.
//!
//! N-grams seen only once are never promoted.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::debug;

use crate::counts::CountsArray;
use crate::error::Result;
use crate::prefix_set::PrefixSet;

/// Count value → number of n-grams with that count, largest count first.
pub type CountHistogram = BTreeMap<Reverse<u32>, usize>;

/// Histogram of every count above 1, and the number of such counters.
pub fn histogram(counts: &CountsArray<'_>) -> (CountHistogram, usize) {
    let mut hist = CountHistogram::new();
    let mut total = 0;
    counts.for_each_count(|_, c| {
        if c > 1 {
            *hist.entry(Reverse(c)).or_insert(0) += 1;
            total += 1;
        }
    });
    (hist, total)
}

/// Smallest count that belongs to the top `k`.
///
/// This is the count at which the running total (largest counts first) first
/// exceeds `k`. If it never does, every n-gram in the histogram fits and the
/// cutoff is 1.
pub fn compute_cutoff(hist: &CountHistogram, total: usize, k: usize) -> u32 {
    if total < k {
        return 1;
    }

    let mut sum = 0;
    for (&Reverse(count), &n) in hist {
        sum += n;
        if sum > k {
            return count;
        }
    }
    1
}

/// Select the `k` most frequent n-grams of `counts`.
///
/// Ties at the cutoff are taken in the order [`CountsArray::copy_prefixes`]
/// walks the space. Fewer than `k` entries come back only when fewer than
/// `k` n-grams were seen more than once.
pub fn find_top_k(counts: &CountsArray<'_>, k: usize) -> Result<PrefixSet> {
    let (hist, total) = histogram(counts);
    let min_count = compute_cutoff(&hist, total, k);

    let used_before_last_bin: usize = hist
        .iter()
        .take_while(|(c, _)| c.0 > min_count)
        .map(|(_, &n)| n)
        .sum();
    let budget = if total < k {
        0
    } else {
        k.saturating_sub(used_before_last_bin)
    };

    debug!(
        candidates = total,
        distinct_counts = hist.len(),
        min_count,
        above_cutoff = used_before_last_bin,
        tie_budget = budget,
        "computed top-k cutoff"
    );

    counts.copy_prefixes(min_count, budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::NgramSpace;

    fn hist_of(values: &[u32]) -> (CountHistogram, usize) {
        let mut hist = CountHistogram::new();
        let mut total = 0;
        for &v in values.iter().filter(|&&v| v > 1) {
            *hist.entry(Reverse(v)).or_insert(0) += 1;
            total += 1;
        }
        (hist, total)
    }

    fn fixed_counts(values: &[u32]) -> CountsArray<'static> {
        let counts = CountsArray::new(NgramSpace::Fixed).unwrap();
        for (i, &v) in values.iter().enumerate() {
            for _ in 0..v {
                counts.increment(i / 64, &[1 << (i % 64)]);
            }
        }
        counts
    }

    #[test]
    fn test_cutoff_steps_into_tied_bin() {
        let (hist, total) = hist_of(&[5, 5, 5, 3, 3, 2, 2, 2, 1, 1]);
        assert_eq!(total, 8);
        assert_eq!(compute_cutoff(&hist, total, 4), 3);
        assert_eq!(compute_cutoff(&hist, total, 3), 3);
        assert_eq!(compute_cutoff(&hist, total, 2), 5);
        assert_eq!(compute_cutoff(&hist, total, 6), 2);
        assert_eq!(compute_cutoff(&hist, total, 8), 1);
        assert_eq!(compute_cutoff(&hist, total, 20), 1);
    }

    #[test]
    fn test_exactly_k_with_ties() {
        let counts = fixed_counts(&[5, 5, 5, 3, 3, 2, 2, 2, 1, 1]);
        let top = find_top_k(&counts, 4).unwrap();

        assert_eq!(top.len(), 4);
        assert_eq!(top.counts(), &[5, 5, 5, 3]);
        assert_eq!(top.ngram_len(), 3);
    }

    #[test]
    fn test_boundary_without_ties() {
        let counts = fixed_counts(&[5, 5, 5, 3, 3, 2, 2, 2, 1, 1]);
        let top = find_top_k(&counts, 5).unwrap();
        assert_eq!(top.counts(), &[5, 5, 5, 3, 3]);

        let top = find_top_k(&counts, 8).unwrap();
        assert_eq!(top.len(), 8);
    }

    #[test]
    fn test_degenerate_k_takes_only_repeated() {
        let counts = fixed_counts(&[4, 1, 2, 1, 0, 1]);
        let top = find_top_k(&counts, 10).unwrap();

        assert_eq!(top.len(), 2);
        assert_eq!(top.counts(), &[4, 2]);
        assert!(top.counts().iter().all(|&c| c > 1));
    }
}
