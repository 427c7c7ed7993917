//! Runs several collections' sync cycles together.
//!
//! Each collection stays single-flight through its own gate; different
//! collections run concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::collection::SyncedCollection;
use crate::db::RecordStore;
use crate::error::Result;
use crate::models::SyncEntity;
use crate::remote::RemoteClient;
use crate::sync::SyncSummary;

/// A collection the coordinator can refresh
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Collection name, for reports and logs
    fn collection(&self) -> &'static str;

    /// Refresh if stale, or unconditionally when `force` is set
    async fn sync(&self, force: bool) -> Result<Option<SyncSummary>>;

    /// Stop the running cycle at the next record boundary
    fn cancel(&self);
}

#[async_trait]
impl<T, S, R> SyncTarget for SyncedCollection<T, S, R>
where
    T: SyncEntity,
    S: RecordStore<T> + 'static,
    R: RemoteClient<T> + 'static,
{
    fn collection(&self) -> &'static str {
        T::COLLECTION
    }

    async fn sync(&self, force: bool) -> Result<Option<SyncSummary>> {
        self.refresh_if_stale(self.stale_after(), force).await
    }

    fn cancel(&self) {
        self.cancel_sync();
    }
}

/// Outcome of one collection in a coordinated run
#[derive(Debug)]
pub struct CollectionReport {
    pub collection: &'static str,
    /// `Ok(None)` when the collection was fresh and not synced
    pub outcome: Result<Option<SyncSummary>>,
}

impl CollectionReport {
    pub fn summary(&self) -> Option<&SyncSummary> {
        self.outcome.as_ref().ok().and_then(Option::as_ref)
    }
}

/// Set of collections synced as one job
#[derive(Default, Clone)]
pub struct SyncCoordinator {
    targets: Vec<Arc<dyn SyncTarget>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("collections", &self.collections())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_target(mut self, target: Arc<dyn SyncTarget>) -> Self {
        self.register(target);
        self
    }

    pub fn register(&mut self, target: Arc<dyn SyncTarget>) {
        self.targets.push(target);
    }

    pub fn collections(&self) -> Vec<&'static str> {
        self.targets.iter().map(|target| target.collection()).collect()
    }

    /// Sync every registered collection concurrently
    pub async fn sync_all(&self, force: bool) -> Vec<CollectionReport> {
        let reports = join_all(self.targets.iter().map(|target| async move {
            CollectionReport {
                collection: target.collection(),
                outcome: target.sync(force).await,
            }
        }))
        .await;

        for report in &reports {
            match &report.outcome {
                Ok(Some(summary)) => {
                    tracing::debug!("Coordinated sync of {}: {}", report.collection, summary);
                }
                Ok(None) => tracing::debug!("{} is fresh; not synced", report.collection),
                Err(error) => {
                    tracing::warn!("Coordinated sync of {} failed: {}", report.collection, error);
                }
            }
        }
        reports
    }

    pub fn cancel_all(&self) {
        for target in &self.targets {
            target.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        name: &'static str,
        runs: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl CountingTarget {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SyncTarget for CountingTarget {
        fn collection(&self) -> &'static str {
            self.name
        }

        async fn sync(&self, force: bool) -> Result<Option<SyncSummary>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(force.then(SyncSummary::default))
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sync_all_reports_every_collection_in_order() {
        let farms = CountingTarget::new("farms");
        let posts = CountingTarget::new("posts");
        let coordinator = SyncCoordinator::new()
            .with_target(farms.clone())
            .with_target(posts.clone());

        let reports = coordinator.sync_all(true).await;
        let names: Vec<_> = reports.iter().map(|report| report.collection).collect();
        assert_eq!(names, vec!["farms", "posts"]);
        assert!(reports.iter().all(|report| report.summary().is_some()));
        assert_eq!(farms.runs.load(Ordering::SeqCst), 1);
        assert_eq!(posts.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_collections_report_none() {
        let coordinator = SyncCoordinator::new().with_target(CountingTarget::new("farms"));
        let reports = coordinator.sync_all(false).await;
        assert!(reports[0].summary().is_none());
        assert!(reports[0].outcome.is_ok());
    }

    #[test]
    fn cancel_all_reaches_every_target() {
        let farms = CountingTarget::new("farms");
        let posts = CountingTarget::new("posts");
        let coordinator = SyncCoordinator::new()
            .with_target(farms.clone())
            .with_target(posts.clone());
        coordinator.cancel_all();
        assert_eq!(farms.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(posts.cancels.load(Ordering::SeqCst), 1);
    }
}
