//! Building the persistent coupon store from the configured sources.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail, ensure};
use redb::Database;
use tracing::{debug, info};

use crate::{
    config::Config,
    index::persistent::{DEFAULT_PARTITION, partition},
    source::{CodeSet, Source, load_all},
};

/// Value stored for every code; only the presence of a key matters.
pub(crate) const MARKER: &[u8] = &[];

/// Outcome of [`import_sources`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStats {
    /// Partition name and number of codes written to it, in source order.
    pub per_partition: Vec<(String, usize)>,
    /// Time spent loading and writing.
    pub elapsed: Duration,
}

/// Write a store at `path` with one partition per entry of `partitions`, plus the default
/// partition.
///
/// Everything is written in a single transaction.
pub fn write_store(path: &Path, partitions: &[(String, CodeSet)]) -> Result<()> {
    for (name, _) in partitions {
        ensure!(name != DEFAULT_PARTITION, "partition name {name:?} is reserved");
    }
    let db = Database::create(path)
        .with_context(|| format!("failed to create coupon store at {}", path.display()))?;
    let tx = db.begin_write()?;
    {
        let _default = tx.open_table(partition(DEFAULT_PARTITION))?;
        for (name, codes) in partitions {
            let mut table = tx.open_table(partition(name))?;
            for code in codes {
                table.insert(code.as_str(), MARKER)?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

/// Load every configured source and write them to a fresh store at `path`.
///
/// An existing store is only replaced when `overwrite` is set. The new store is written next
/// to `path` and moved into place once complete, so a failed import leaves any existing store
/// untouched.
pub async fn import_sources(config: &Config, path: &Path, overwrite: bool) -> Result<ImportStats> {
    config.validate()?;
    let start = Instant::now();
    if path.exists() && !overwrite {
        bail!("coupon store already exists at {}", path.display());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("failed to create store directory at {}", parent.display())
        })?;
    }

    let sources: Arc<[Source]> = config.sources().into();
    let sets = load_all(sources.clone(), config.normalizer()).await?;
    let partitions: Vec<(String, CodeSet)> = sources
        .iter()
        .map(|source| source.name.clone())
        .zip(sets)
        .collect();
    let per_partition = partitions
        .iter()
        .map(|(name, codes)| (name.clone(), codes.len()))
        .collect();

    let staging = staging_path(path);
    if staging.exists() {
        debug!("removing stale staging store at {}", staging.display());
        tokio::fs::remove_file(&staging).await?;
    }
    let target = staging.clone();
    let written = tokio::task::spawn_blocking(move || write_store(&target, &partitions)).await;
    if let Err(err) = written.map_err(anyhow::Error::from).and_then(|res| res) {
        if let Err(rm_err) = tokio::fs::remove_file(&staging).await {
            debug!("no staging store to clean up: {rm_err}");
        }
        return Err(err);
    }
    if path.exists() {
        info!("replacing existing coupon store at {}", path.display());
    }
    tokio::fs::rename(&staging, path).await.with_context(|| {
        format!("failed to move new coupon store into place at {}", path.display())
    })?;

    let stats = ImportStats {
        per_partition,
        elapsed: start.elapsed(),
    };
    info!("imported {:?} into {} in {:?}", stats.per_partition, path.display(), stats.elapsed);
    Ok(stats)
}

/// Where a store for `path` is written before it is moved into place.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
