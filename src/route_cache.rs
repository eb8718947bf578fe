//! In-memory cache of all routes, keyed by path prefix.
//!
//! The store is the source of truth, but a database round-trip on every
//! proxied request would add latency and load for read-mostly, slowly
//! changing data. The cache holds an immutable snapshot behind an
//! [`ArcSwap`]; a refresh builds a whole new map and publishes it with a
//! single atomic swap, so readers never observe a partial snapshot.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::route_store::{Route, RouteStore, RouteStoreError};

type Snapshot = HashMap<String, Arc<Route>>;

/// Hot-swappable route snapshot with longest-prefix lookup.
pub struct RouteCache {
    store: Arc<dyn RouteStore>,
    snapshot: ArcSwap<Snapshot>,
}

impl RouteCache {
    /// Create an empty cache. Call [`RouteCache::refresh`] before serving
    /// traffic; a failed startup refresh is fatal to the caller.
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        }
    }

    /// Rebuild the snapshot from the full store and publish it.
    ///
    /// On failure the previous snapshot stays current; the caller decides
    /// whether the failure is fatal (startup) or transient (scheduled tick,
    /// admin write).
    pub async fn refresh(&self) -> Result<(), RouteStoreError> {
        let routes = self.store.find_all().await?;
        let updated: Snapshot = routes
            .into_iter()
            .map(|route| (route.path.clone(), Arc::new(route)))
            .collect();
        debug!(routes = updated.len(), "route cache refreshed");
        self.snapshot.store(Arc::new(updated));
        Ok(())
    }

    /// Best-matching route for an incoming request path.
    ///
    /// Longest-prefix match: with `/api` and `/api/users` cached, a request
    /// to `/api/users/123` matches `/api/users`. Ties are impossible since
    /// paths are unique. Returns `None` when no cached prefix matches.
    pub fn find_match(&self, request_path: &str) -> Option<Arc<Route>> {
        let snapshot = self.snapshot.load();
        snapshot
            .iter()
            .filter(|(prefix, _)| request_path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, route)| Arc::clone(route))
    }

    /// Number of routes in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Whether the current snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Spawn the periodic refresh task.
    ///
    /// Fixed-delay scheduling: the next refresh starts `interval` after the
    /// previous one completes, so runs never overlap even when the store is
    /// slow. A failed tick keeps the previous snapshot and is retried on
    /// the next one. The task exits when the token is cancelled.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.refresh().await {
                            warn!(error = %e, "scheduled route cache refresh failed, keeping previous snapshot");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("route cache refresh task shutting down");
                        break;
                    }
                }
            }
        });
    }
}
