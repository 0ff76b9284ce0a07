//! The promo code validator.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    aggregate::QuorumCounts,
    code::Normalizer,
    config::{Backend, Config},
    index::{PersistentIndex, PromoIndex, VolatileIndex},
    refresh::Refresher,
    source::Source,
};

/// Answers whether a promo code is valid, using whichever backend it was built with.
///
/// Construct it with [`Validator::from_config`], or with [`Validator::volatile`] /
/// [`Validator::persistent`] directly. Call [`Validator::shutdown`] when done to stop the
/// background refresher and release the store.
#[derive(Debug)]
pub struct Validator {
    index: Arc<dyn PromoIndex>,
    refresher: Option<Refresher>,
}

impl Validator {
    /// Build the validator described by `config`.
    ///
    /// Fails if the config is invalid, if the initial load of the volatile backend fails, or if
    /// the persistent store cannot be opened.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        match config.backend {
            Backend::Volatile => {
                Self::volatile(
                    config.sources().into(),
                    config.normalizer(),
                    config.quorum_threshold,
                    config.refresh_interval,
                )
                .await
            }
            Backend::Persistent => {
                Self::persistent(
                    config.store_path()?,
                    config.partition_names(),
                    config.normalizer(),
                    config.quorum_threshold,
                )
                .await
            }
        }
    }

    /// Load `sources` into a [`VolatileIndex`] and keep it fresh every `refresh_interval`.
    ///
    /// The initial load must succeed; later reload failures only log.
    pub async fn volatile(
        sources: Arc<[Source]>,
        normalizer: Normalizer,
        quorum: usize,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let index = Arc::new(VolatileIndex::new(normalizer, quorum));
        index
            .reload(sources.clone())
            .await
            .context("initial load of code sources failed")?;
        let refresher = Refresher::spawn(index.clone(), sources, refresh_interval);
        info!("volatile validator ready");
        Ok(Self {
            index,
            refresher: Some(refresher),
        })
    }

    /// Open the pre-built store at `path`.
    pub async fn persistent(
        path: PathBuf,
        partitions: Vec<String>,
        normalizer: Normalizer,
        quorum: usize,
    ) -> Result<Self> {
        let index = tokio::task::spawn_blocking(move || {
            PersistentIndex::open(path, partitions, normalizer, quorum)
        })
        .await??;
        info!("persistent validator ready");
        Ok(Self::new(Arc::new(index)))
    }

    /// Wrap an already built index. No refresher is attached.
    pub fn new(index: Arc<dyn PromoIndex>) -> Self {
        Self {
            index,
            refresher: None,
        }
    }

    /// The backing index.
    pub fn index(&self) -> &Arc<dyn PromoIndex> {
        &self.index
    }

    /// Whether `code` is a valid promo code.
    pub fn is_valid_promo(&self, code: &str) -> bool {
        self.index.is_valid(code)
    }

    /// Counts of every code known to the backend.
    pub fn snapshot(&self) -> Result<QuorumCounts> {
        self.index.snapshot()
    }

    /// Stop the refresher, waiting for a reload in progress, and close the index.
    pub async fn shutdown(self) {
        if let Some(refresher) = self.refresher {
            refresher.shutdown().await;
        }
        self.index.close();
    }
}
