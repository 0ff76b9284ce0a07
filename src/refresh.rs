//! Periodic reloading of a [`VolatileIndex`].

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info, trace, warn};

use crate::{index::VolatileIndex, source::Source};

/// Background task reloading a [`VolatileIndex`] from its sources at a fixed interval.
///
/// A failed reload is logged and the index keeps serving its previous generation. A reload in
/// progress when [`Self::shutdown`] is called runs to completion first.
///
/// Dropping the refresher aborts the task.
#[derive(Debug)]
pub struct Refresher {
    cancel: CancellationToken,
    handle: AbortOnDropHandle<()>,
}

impl Refresher {
    /// Spawn the refresher on the current runtime.
    ///
    /// The first reload happens one `interval` from now; the initial load is up to the caller.
    pub fn spawn(index: Arc<VolatileIndex>, sources: Arc<[Source]>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let done = cancel.clone();
        let handle = tokio::task::spawn(
            async move {
                run(index, sources, interval, done).await;
                debug!("refresher stopped");
            }
            .instrument(tracing::info_span!("refresher")),
        );
        Self {
            cancel,
            handle: AbortOnDropHandle::new(handle),
        }
    }

    /// Stop refreshing and wait for the task to finish.
    ///
    /// Any shutdown errors will be logged as warnings.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("error stopping refresher: {e:?}");
        }
    }
}

async fn run(
    index: Arc<VolatileIndex>,
    sources: Arc<[Source]>,
    interval: Duration,
    done: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("reloading {} sources every {:?}", sources.len(), interval);

    loop {
        tokio::select! {
            biased;

            _ = done.cancelled() => {
                trace!("refresher cancelled, exiting");
                break;
            }
            _ = ticks.tick() => {
                if let Err(err) = index.reload(sources.clone()).await {
                    warn!(
                        "reload failed, still serving generation {}: {err}",
                        index.current().seq()
                    );
                }
            }
        }
    }
}
