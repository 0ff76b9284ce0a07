//! Metrics for the validator backends

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by the index backends.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "coupon_quorum")]
pub struct Metrics {
    /// Reloads that published a new generation.
    pub reloads: Counter,
    /// Reloads that failed and kept the previous generation.
    #[metrics(help = "Number of reloads that failed, leaving the previous generation in place.")]
    pub reload_errors: Counter,
    /// Distinct codes in published generations, summed over all reloads.
    pub codes_published: Counter,
    /// Queries answered by the persistent store.
    pub store_lookups: Counter,
    /// Queries that failed to read the persistent store and answered `false`.
    pub store_lookup_errors: Counter,
}
