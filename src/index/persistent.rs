//! Index backed by a pre-built redb store with one partition per source.
//!
//! The store is produced out of band (see [`crate::import`]) and only ever read here. Each
//! partition is a table keyed by normalized code; values are empty and never consulted.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail, ensure};
use arc_swap::ArcSwapOption;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{info, warn};

use super::PromoIndex;
use crate::{
    aggregate::QuorumCounts,
    code::{Code, Normalizer},
    metrics::Metrics,
};

/// Name of the partition every store carries besides the per-source ones. Validity logic
/// never reads it.
pub const DEFAULT_PARTITION: &str = "default";

/// Table definition for the partition `name`.
pub(crate) fn partition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Index answering from an embedded store via point lookups.
///
/// Nothing besides the store handle is resident, so queries cost at most one lookup per
/// partition, and stop as soon as the quorum threshold is reached.
#[derive(Debug)]
pub struct PersistentIndex {
    db: ArcSwapOption<Database>,
    partitions: Vec<String>,
    normalizer: Normalizer,
    quorum: usize,
    metrics: Arc<Metrics>,
}

impl PersistentIndex {
    /// Open an existing store at `path`.
    ///
    /// Fails if the store does not exist, or if the default partition or any of
    /// `partitions` is missing from it.
    ///
    /// redb locks the file exclusively while it is open, so only one process can serve from a
    /// store at a time. Opening a store held by another process fails.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(
        path: impl AsRef<Path>,
        partitions: Vec<String>,
        normalizer: Normalizer,
        quorum: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        ensure!(path.exists(), "coupon store not found at {}", path.display());
        info!("opening coupon store at {}", path.display());
        let db = Database::open(path)
            .with_context(|| format!("failed to open coupon store at {}", path.display()))?;
        {
            let tx = db.begin_read()?;
            let names = partitions.iter().map(String::as_str);
            for name in std::iter::once(DEFAULT_PARTITION).chain(names) {
                let _table = tx
                    .open_table(partition(name))
                    .with_context(|| format!("missing partition: {name}"))?;
            }
        }
        info!("coupon store ready with partitions {partitions:?}");
        Ok(Self {
            db: ArcSwapOption::new(Some(db.into())),
            partitions,
            normalizer,
            quorum,
            metrics: Default::default(),
        })
    }

    /// Lookup metrics of this index.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Count the partitions containing `code`, stopping once the quorum threshold is
    /// reached.
    pub fn quorum_count(&self, code: &Code) -> Result<usize> {
        let guard = self.db.load();
        let Some(db) = guard.as_deref() else {
            bail!("coupon store is closed");
        };
        let tx = db.begin_read()?;
        let mut hits = 0;
        for name in &self.partitions {
            let table = tx.open_table(partition(name))?;
            if table.get(code.as_str())?.is_some() {
                hits += 1;
                if hits >= self.quorum {
                    break;
                }
            }
        }
        Ok(hits)
    }

    /// Whether [`PromoIndex::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.db.load().is_none()
    }
}

impl PromoIndex for PersistentIndex {
    fn is_valid(&self, raw: &str) -> bool {
        let Some(code) = self.normalizer.normalize(raw) else {
            return false;
        };
        self.metrics.store_lookups.inc();
        match self.quorum_count(&code) {
            Ok(hits) => hits >= self.quorum,
            Err(err) => {
                self.metrics.store_lookup_errors.inc();
                warn!("lookup of {code} failed: {err:#}");
                false
            }
        }
    }

    /// Scan every partition of the store.
    ///
    /// Memory use grows with the number of distinct codes in the store; do not use this on
    /// request paths.
    fn snapshot(&self) -> Result<QuorumCounts> {
        let guard = self.db.load();
        let Some(db) = guard.as_deref() else {
            bail!("coupon store is closed");
        };
        let tx = db.begin_read()?;
        let mut counts = QuorumCounts::new();
        for name in &self.partitions {
            let table = tx.open_table(partition(name))?;
            for entry in table.iter()? {
                let (key, _) = entry?;
                let key = key.value();
                // keys that are not in normal form can never match a query
                match self.normalizer.normalize(key) {
                    Some(code) if code.as_str() == key => *counts.entry(code).or_default() += 1,
                    _ => warn!("skipping malformed key {key:?} in partition {name}"),
                }
            }
        }
        Ok(counts)
    }

    fn close(&self) {
        if self.db.swap(None).is_some() {
            info!("coupon store closed");
        }
    }
}
