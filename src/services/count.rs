//! Background recomputation of the filtered record count
//!
//! Every fire starts a new count. Only the newest one matters, so starting a
//! count cancels the one in flight, and a result is published only when no
//! newer version has been published already.

use crate::sql::ConditionMatrix;
use color_eyre::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Executes compiled conditions against the variant store
pub trait QueryExecutor: Send + Sync {
    /// Number of records matching the matrix: each row ANDed, rows ORed.
    fn filtered_count(&self, conditions: &ConditionMatrix) -> Result<u64>;
}

/// A count tagged with the filter-set version it was computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredCount {
    pub version: u64,
    pub count: u64,
}

pub struct FilteredCountRefresher {
    runtime: Handle,
    executor: Arc<dyn QueryExecutor>,
    in_flight: Mutex<Option<CancellationToken>>,
    latest: Arc<watch::Sender<Option<FilteredCount>>>,
}

impl FilteredCountRefresher {
    pub fn new(runtime: Handle, executor: Arc<dyn QueryExecutor>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            runtime,
            executor,
            in_flight: Mutex::new(None),
            latest: Arc::new(latest),
        }
    }

    /// Start counting for `version`, superseding any count still running.
    pub fn refresh(&self, version: u64, conditions: ConditionMatrix) -> JoinHandle<()> {
        let token = CancellationToken::new();
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let executor = self.executor.clone();
        let latest = self.latest.clone();
        self.runtime.spawn(async move {
            let work = tokio::task::spawn_blocking(move || executor.filtered_count(&conditions));
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(version, "filtered count superseded");
                }
                joined = work => match joined {
                    Ok(Ok(count)) => {
                        let published = latest.send_if_modified(|current| {
                            if current.map_or(true, |c| c.version < version) {
                                *current = Some(FilteredCount { version, count });
                                true
                            } else {
                                false
                            }
                        });
                        debug!(version, count, published, "filtered count computed");
                    }
                    Ok(Err(e)) => error!(version, "failed to compute filtered count: {e:?}"),
                    Err(e) => error!(version, "filtered count task aborted: {e}"),
                },
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FilteredCount>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Option<FilteredCount> {
        *self.latest.borrow()
    }
}
