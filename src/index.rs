//! Membership indexes answering promo code validity.
//!
//! Two interchangeable backends implement [`PromoIndex`]:
//!
//! * [`VolatileIndex`] keeps the aggregated counts of all sources resident in memory and is
//!   rebuilt wholesale from the source files, see [`crate::refresh::Refresher`].
//! * [`PersistentIndex`] answers from a pre-built embedded store with one partition per
//!   source, using point lookups.
//!
//! Both normalize the raw code first, and both agree on every answer when built from the same
//! source data.

use std::fmt;

use anyhow::Result;

use crate::aggregate::QuorumCounts;

pub mod persistent;
pub mod volatile;

pub use self::{
    persistent::PersistentIndex,
    volatile::{Generation, IndexState, VolatileIndex},
};

/// The capability shared by all index backends.
pub trait PromoIndex: fmt::Debug + Send + Sync + 'static {
    /// Whether `raw` normalizes to a code present in at least the quorum threshold of
    /// sources.
    ///
    /// Never fails: malformed input and backend trouble both answer `false`.
    fn is_valid(&self, raw: &str) -> bool;

    /// The number of sources containing each known code.
    ///
    /// Meant for tests and inspection. Depending on the backend this may copy or scan the
    /// whole index.
    fn snapshot(&self) -> Result<QuorumCounts>;

    /// Release backend resources. Safe to call more than once.
    fn close(&self) {}
}
