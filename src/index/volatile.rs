//! In-memory index over the current generation of aggregated source data.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime},
};

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::info;

use super::PromoIndex;
use crate::{
    aggregate::{QuorumCounts, aggregate},
    code::Normalizer,
    metrics::Metrics,
    source::{self, LoadError, Source},
};

/// One complete, immutable build of the aggregated counts.
#[derive(Debug)]
pub struct Generation {
    seq: u64,
    loaded_at: Option<SystemTime>,
    counts: QuorumCounts,
}

impl Generation {
    fn empty() -> Self {
        Self {
            seq: 0,
            loaded_at: None,
            counts: QuorumCounts::new(),
        }
    }

    /// Sequence number, increasing with every published generation. `0` is the empty
    /// generation an index starts out with.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// When this generation was published, `None` for the initial empty generation.
    pub fn loaded_at(&self) -> Option<SystemTime> {
        self.loaded_at
    }

    /// Number of sources containing `code`, which must already be normalized.
    pub fn count(&self, code: &str) -> usize {
        self.counts.get(code).copied().unwrap_or(0)
    }

    /// All counts of this generation.
    pub fn counts(&self) -> &QuorumCounts {
        &self.counts
    }

    /// Number of distinct codes.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the generation holds no codes at all.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Lifecycle of a [`VolatileIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IndexState {
    /// No generation has been published yet.
    Loading,
    /// Serving the current generation.
    Ready,
    /// Serving the current generation while a new one is being built.
    Reloading,
}

/// Index holding the aggregated counts of all sources in memory.
///
/// The current [`Generation`] sits behind an atomically replaceable pointer. Readers never
/// take a lock; a reload builds a complete new generation off to the side and then swaps it
/// in with a single store.
#[derive(Debug)]
pub struct VolatileIndex {
    current: ArcSwap<Generation>,
    next_seq: AtomicU64,
    reloading: AtomicBool,
    /// Serializes reloads, readers never touch it.
    reload_lock: Mutex<()>,
    normalizer: Normalizer,
    quorum: usize,
    metrics: Arc<Metrics>,
}

impl VolatileIndex {
    /// Create an empty index in the [`IndexState::Loading`] state.
    pub fn new(normalizer: Normalizer, quorum: usize) -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::empty()),
            next_seq: AtomicU64::new(1),
            reloading: AtomicBool::new(false),
            reload_lock: Mutex::new(()),
            normalizer,
            quorum,
            metrics: Default::default(),
        }
    }

    /// Reload metrics of this index.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The generation currently served.
    ///
    /// The returned generation never changes, even if a newer one is published while it is
    /// held.
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        if self.current.load().seq == 0 {
            IndexState::Loading
        } else if self.reloading.load(Ordering::Acquire) {
            IndexState::Reloading
        } else {
            IndexState::Ready
        }
    }

    /// Replace the current generation with one built from `counts`.
    ///
    /// Callers must hold `reload_lock`, so sequence numbers are published in order.
    fn publish(&self, counts: QuorumCounts) -> Arc<Generation> {
        let generation = Arc::new(Generation {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            loaded_at: Some(SystemTime::now()),
            counts,
        });
        self.current.store(generation.clone());
        generation
    }

    /// Load all `sources`, aggregate them and publish the result.
    ///
    /// If any source fails nothing is published and the current generation keeps serving.
    pub async fn reload(&self, sources: Arc<[Source]>) -> Result<Arc<Generation>, LoadError> {
        let _lock = self.reload_lock.lock().await;
        let _reloading = ReloadingFlag::raise(&self.reloading);
        let start = Instant::now();

        let counts = match self.build(sources).await {
            Ok(counts) => counts,
            Err(err) => {
                self.metrics.reload_errors.inc();
                return Err(err);
            }
        };
        let generation = self.publish(counts);
        self.metrics.reloads.inc();
        self.metrics.codes_published.inc_by(generation.len() as u64);
        info!(
            "reload complete: {} total keys in generation {} after {:?}",
            generation.len(),
            generation.seq(),
            start.elapsed()
        );
        Ok(generation)
    }

    async fn build(&self, sources: Arc<[Source]>) -> Result<QuorumCounts, LoadError> {
        let sets = source::load_all(sources, self.normalizer).await?;
        let counts = tokio::task::spawn_blocking(move || aggregate(sets)).await?;
        Ok(counts)
    }
}

impl PromoIndex for VolatileIndex {
    fn is_valid(&self, raw: &str) -> bool {
        let Some(code) = self.normalizer.normalize(raw) else {
            return false;
        };
        self.current.load().count(code.as_str()) >= self.quorum
    }

    fn snapshot(&self) -> Result<QuorumCounts> {
        Ok(self.current.load().counts.clone())
    }
}

/// Marks a reload in progress until dropped.
struct ReloadingFlag<'a>(&'a AtomicBool);

impl<'a> ReloadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReloadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{EXAMPLE_SETS, write_gz, write_sources};

    fn index() -> VolatileIndex {
        VolatileIndex::new(Normalizer::default(), 2)
    }

    #[test]
    fn starts_out_loading_and_empty() {
        let index = index();
        assert_eq!(index.state(), IndexState::Loading);
        assert_eq!(index.current().seq(), 0);
        assert!(index.current().loaded_at().is_none());
        assert!(index.snapshot().unwrap().is_empty());
        assert!(!index.is_valid("ABCD1234"));
    }

    #[tokio::test]
    #[traced_test]
    async fn reload_publishes_quorum_counts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sources = write_sources(dir.path(), &EXAMPLE_SETS)?;
        let index = index();

        let generation = index.reload(sources.into()).await?;
        assert_eq!(generation.seq(), 1);
        assert_eq!(generation.len(), 3);
        assert_eq!(index.state(), IndexState::Ready);

        assert!(index.is_valid("abcd1234"));
        assert!(index.is_valid("zzzz9999"));
        assert!(!index.is_valid("ONLYIN2X"));
        assert!(!index.is_valid("AB"));
        assert!(index.is_valid(" abcd1234 "));
        assert!(logs_contain("reload complete"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_reload_keeps_previous_generation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sources: Arc<[Source]> = write_sources(dir.path(), &EXAMPLE_SETS)?.into();
        let index = index();
        index.reload(sources.clone()).await?;
        let before = index.snapshot()?;

        std::fs::remove_file(&sources[1].path)?;
        let err = index.reload(sources.clone()).await.unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }), "{err:?}");

        assert_eq!(index.snapshot()?, before);
        assert_eq!(index.current().seq(), 1);
        assert_eq!(index.state(), IndexState::Ready);
        assert!(index.is_valid("ABCD1234"));

        // a corrupt stream is no different
        std::fs::write(&sources[1].path, b"garbage")?;
        assert!(index.reload(sources).await.is_err());
        assert_eq!(index.snapshot()?, before);

        assert_eq!(index.metrics().reloads.get(), 1);
        assert_eq!(index.metrics().reload_errors.get(), 2);
        assert_eq!(index.metrics().codes_published.get(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reloads_publish_in_sequence() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sources: Arc<[Source]> = write_sources(dir.path(), &EXAMPLE_SETS)?.into();
        let index = Arc::new(index());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let index = index.clone();
            let sources = sources.clone();
            tasks.spawn(async move { index.reload(sources).await.map(|g| g.seq()) });
        }
        let mut seqs = Vec::new();
        while let Some(seq) = tasks.join_next().await {
            seqs.push(seq??);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());
        // the last generation published is the newest one
        assert_eq!(index.current().seq(), 8);
        assert_eq!(index.metrics().reloads.get(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn held_generation_is_unaffected_by_reload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sources: Arc<[Source]> = write_sources(dir.path(), &EXAMPLE_SETS)?.into();
        let index = index();
        index.reload(sources.clone()).await?;

        let old = index.current();
        for source in sources.iter() {
            write_gz(&source.path, &["NEWCODE1"])?;
        }
        let new = index.reload(sources).await?;

        assert_eq!(old.count("ABCD1234"), 3);
        assert_eq!(old.count("NEWCODE1"), 0);
        assert_eq!(new.count("ABCD1234"), 0);
        assert_eq!(new.count("NEWCODE1"), 3);
        assert!(new.seq() > old.seq());
        assert!(!index.is_valid("ABCD1234"));
        assert!(index.is_valid("NEWCODE1"));
        Ok(())
    }

    #[test]
    fn publish_replaces_wholesale() {
        let index = index();
        let normalizer = Normalizer::default();
        let code = |s| normalizer.normalize(s).unwrap();

        index.publish(QuorumCounts::from([(code("AAAA1111"), 2), (code("BBBB2222"), 1)]));
        assert!(index.is_valid("aaaa1111"));
        assert!(!index.is_valid("bbbb2222"));

        index.publish(QuorumCounts::from([(code("BBBB2222"), 3)]));
        assert!(!index.is_valid("aaaa1111"));
        assert!(index.is_valid("bbbb2222"));
        assert_eq!(index.current().seq(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_a_partial_generation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sources: Arc<[Source]> = write_sources(dir.path(), &EXAMPLE_SETS)?.into();
        let index = Arc::new(index());
        index.reload(sources.clone()).await?;

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = index.clone();
                let done = done.clone();
                tokio::task::spawn_blocking(move || {
                    let mut checks = 0u64;
                    loop {
                        let generation = index.current();
                        assert_eq!(generation.len(), 3);
                        assert!(index.is_valid("ABCD1234"));
                        assert!(index.is_valid("ZZZZ9999"));
                        assert!(!index.is_valid("ONLYIN2X"));
                        checks += 1;
                        if done.load(Ordering::Relaxed) {
                            return checks;
                        }
                    }
                })
            })
            .collect();

        for _ in 0..5 {
            index.reload(sources.clone()).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.await? > 0);
        }
        assert_eq!(index.current().seq(), 6);
        Ok(())
    }
}
