//! Merging per-source code sets into quorum counts.

use std::collections::HashMap;

use crate::code::Code;

/// Number of distinct sources containing each code.
pub type QuorumCounts = HashMap<Code, usize>;

/// Count, for every code seen in at least one set, how many sets contain it.
///
/// Each set is expected to hold unique codes, so a code repeated inside one source counts
/// once. The sets are consumed to avoid copying the codes.
pub fn aggregate<I, S>(sets: I) -> QuorumCounts
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = Code>,
{
    let mut counts = QuorumCounts::new();
    for set in sets {
        let set = set.into_iter();
        counts.reserve(set.size_hint().0.saturating_sub(counts.len()));
        for code in set {
            *counts.entry(code).or_default() += 1;
        }
    }
    counts
}
