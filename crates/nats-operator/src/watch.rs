//! Watch multiplexer
//!
//! Turns the NatsCluster event stream into work-queue keys. The subscription
//! is re-established with backoff whenever it ends, and every resubscription
//! replays all existing clusters, so a dropped watch costs at most one extra
//! pass per cluster and never loses a key already in the queue. The replay is
//! also the new baseline for generation tracking: clusters deleted while the
//! watch was down are forgotten.
//!
//! `Modified` events whose generation did not change are dropped. The API
//! server only bumps the generation on spec changes, so the controller's own
//! status writes do not trigger another pass.

use crate::cluster_client::{ClusterEvent, ClusterWatcher};
use crate::config::BackoffPolicy;
use crate::crd::ClusterKey;
use crate::error::{ErrorClass, OperatorError, Result};
use crate::queue::WorkQueue;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Feeds cluster keys from a [`ClusterWatcher`] into a [`WorkQueue`]
pub struct WatchMultiplexer {
    watcher: Arc<dyn ClusterWatcher>,
    queue: WorkQueue<ClusterKey>,
    namespace: Option<String>,
    backoff: BackoffPolicy,
    max_failures: u32,
    /// Last seen generation per cluster
    generations: HashMap<ClusterKey, i64>,
}

impl WatchMultiplexer {
    pub fn new(
        watcher: Arc<dyn ClusterWatcher>,
        queue: WorkQueue<ClusterKey>,
        namespace: Option<String>,
        backoff: BackoffPolicy,
        max_failures: u32,
    ) -> Self {
        Self {
            watcher,
            queue,
            namespace,
            backoff,
            max_failures,
            generations: HashMap::new(),
        }
    }

    /// Enqueue the key of `event` unless it is a status-only change.
    ///
    /// Returns whether the key was handed to the queue.
    pub fn dispatch(&mut self, event: ClusterEvent) -> bool {
        let cluster = event.cluster();
        let key = cluster.key.clone();
        let generation = cluster.generation;

        match &event {
            ClusterEvent::Deleted(_) => {
                self.generations.remove(&key);
            }
            ClusterEvent::Modified(_) => {
                if let Some(generation) = generation {
                    if self.generations.get(&key) == Some(&generation) {
                        debug!(cluster = %key, generation, "Skipping status-only change");
                        return false;
                    }
                    self.generations.insert(key.clone(), generation);
                }
            }
            ClusterEvent::Added(_) => {
                if let Some(generation) = generation {
                    self.generations.insert(key.clone(), generation);
                }
            }
        }

        debug!(cluster = %key, event = event.kind(), "Enqueueing cluster");
        self.queue.add(key);
        true
    }

    /// Pump events until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation and `Err(WatchFailed)` when the
    /// watch fails with a fatal error, or fails more than `max_failures`
    /// consecutive times before delivering a single event.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let namespace = self.namespace.clone();
        // Consecutive subscriptions that failed before delivering anything
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self.watcher.watch(namespace.as_deref()) => res,
            };

            let failure = match subscribed {
                Err(e) => Some(e),
                Ok(mut stream) => {
                    info!(namespace = namespace.as_deref().unwrap_or("all"), "Watch established");
                    self.generations.clear();

                    let mut delivered = false;
                    let mut interrupted = None;
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(()),
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(event)) => {
                                delivered = true;
                                failures = 0;
                                self.dispatch(event);
                            }
                            Some(Err(e)) => {
                                interrupted = Some(e);
                                break;
                            }
                            None => {
                                debug!("Watch stream ended");
                                break;
                            }
                        }
                    }

                    match interrupted {
                        // Subscription errors can surface lazily, on the first poll
                        Some(e) if !delivered || e.class() == ErrorClass::Fatal => Some(e),
                        Some(e) => {
                            warn!(error = %e, "Watch stream interrupted");
                            None
                        }
                        None => None,
                    }
                }
            };

            if let Some(e) = failure {
                if e.class() == ErrorClass::Fatal {
                    error!(error = %e, "Watch rejected");
                    return Err(OperatorError::WatchFailed(e.to_string()));
                }
                failures += 1;
                if failures > self.max_failures {
                    error!(error = %e, attempts = failures, "Giving up on watch");
                    return Err(OperatorError::WatchFailed(format!(
                        "no working watch after {} attempts: {}",
                        failures, e
                    )));
                }
                warn!(error = %e, attempt = failures, "Watch failed");
            }

            let delay = self.backoff.delay(failures);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
