//! Placement scoring for new writes and scheduled replicas.
//!
//! Candidates are ranked on `(replica-count bucket ascending, free-space
//! bucket descending, replica bytes ascending)`. Counts and free space
//! are grouped into base-10 logarithmic buckets so marginal differences
//! do not reshuffle the ordering; total replica bytes break remaining
//! ties exactly.

use scatterfs_catalog::PlacementStats;

/// Logarithmic bucket of `n`: `floor(log10(n + 1))`.
fn log_bucket(n: u64) -> i64 {
    ((n + 1) as f64).log10().floor() as i64
}

fn score(candidate: &PlacementStats) -> (i64, i64, u64) {
    (
        log_bucket(candidate.replica_count),
        -log_bucket(candidate.avail),
        candidate.replica_bytes,
    )
}

/// Orders candidates best-first: prefer nodes holding disproportionately
/// few replicas, then nodes with exponentially more free space, then
/// nodes storing fewer replica bytes.
pub fn rank(candidates: &mut [PlacementStats]) {
    candidates.sort_by_key(score);
}
