use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use schema::Dataset;
use store::{DatasetStore, StoreError};
use tracing::{error, info, warn};

use crate::deadline::QueryDeadline;

/// When a populated epoch list is re-read from the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Populate once and keep for the process lifetime.
    #[default]
    Never,
    Ttl(Duration),
}

impl RefreshPolicy {
    pub fn from_ttl_secs(secs: Option<u64>) -> Self {
        match secs {
            Some(secs) if secs > 0 => Self::Ttl(Duration::from_secs(secs)),
            _ => Self::Never,
        }
    }

    fn is_fresh(self, loaded_at: Instant) -> bool {
        match self {
            Self::Never => true,
            Self::Ttl(ttl) => loaded_at.elapsed() < ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochLookup {
    /// Newest first. Empty when the metadata store lists no epochs.
    Known(Vec<String>),
    UnknownDataset,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpochCacheMetrics {
    pub cache_hits: u64,
    pub refresh_attempts: u64,
    pub refresh_successes: u64,
    pub refresh_missing: u64,
    pub refresh_failures: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct EpochCacheMetricAtoms {
    cache_hits: AtomicU64,
    refresh_attempts: AtomicU64,
    refresh_successes: AtomicU64,
    refresh_missing: AtomicU64,
    refresh_failures: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone)]
struct CachedEpochs {
    epochs: Vec<String>,
    loaded_at: Instant,
}

/// Owns the per-dataset epoch cache. The lock is never held across a
/// backing query, so concurrent first lookups may both hit the store.
pub struct EpochResolver {
    store: Arc<dyn DatasetStore>,
    policy: RefreshPolicy,
    deadline: QueryDeadline,
    cache: RwLock<HashMap<Dataset, CachedEpochs>>,
    metrics: EpochCacheMetricAtoms,
}

impl EpochResolver {
    pub fn new(
        store: Arc<dyn DatasetStore>,
        policy: RefreshPolicy,
        deadline: QueryDeadline,
    ) -> Self {
        Self {
            store,
            policy,
            deadline,
            cache: RwLock::new(HashMap::new()),
            metrics: EpochCacheMetricAtoms::default(),
        }
    }

    pub async fn lookup(&self, dataset: &str) -> EpochLookup {
        let Some(dataset) = Dataset::from_name(dataset) else {
            return EpochLookup::UnknownDataset;
        };

        if let Ok(cache) = self.cache.read()
            && let Some(entry) = cache.get(&dataset)
            && self.policy.is_fresh(entry.loaded_at)
        {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return EpochLookup::Known(entry.epochs.clone());
        }

        self.metrics.refresh_attempts.fetch_add(1, Ordering::Relaxed);
        let fetched = self
            .deadline
            .run(self.store.dataset_epochs(dataset.as_str()))
            .await;
        match fetched {
            Ok(epochs) if epochs.is_empty() => {
                self.metrics.refresh_successes.fetch_add(1, Ordering::Relaxed);
                warn!(dataset = %dataset, "metadata store lists no epochs");
                EpochLookup::Known(epochs)
            }
            Ok(epochs) => {
                self.metrics.refresh_successes.fetch_add(1, Ordering::Relaxed);
                info!(
                    dataset = %dataset,
                    epochs = epochs.len(),
                    newest = %epochs[0],
                    "epoch cache populated"
                );
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(
                        dataset,
                        CachedEpochs {
                            epochs: epochs.clone(),
                            loaded_at: Instant::now(),
                        },
                    );
                }
                EpochLookup::Known(epochs)
            }
            Err(StoreError::MissingTable(table)) => {
                self.metrics.refresh_missing.fetch_add(1, Ordering::Relaxed);
                warn!(dataset = %dataset, table = %table, "epoch table missing");
                EpochLookup::Known(Vec::new())
            }
            Err(err) => {
                self.metrics.refresh_failures.fetch_add(1, Ordering::Relaxed);
                error!(dataset = %dataset, error = %err, "epoch lookup failed");
                EpochLookup::Unavailable(err.to_string())
            }
        }
    }

    /// Newest-first epochs; empty for unknown datasets and failed lookups.
    pub async fn resolve_epochs(&self, dataset: &str) -> Vec<String> {
        match self.lookup(dataset).await {
            EpochLookup::Known(epochs) => epochs,
            EpochLookup::UnknownDataset | EpochLookup::Unavailable(_) => Vec::new(),
        }
    }

    pub fn invalidate(&self, dataset: &str) {
        if let Some(dataset) = Dataset::from_name(dataset)
            && let Ok(mut cache) = self.cache.write()
            && cache.remove(&dataset).is_some()
        {
            self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.write() {
            let dropped = cache.len() as u64;
            cache.clear();
            self.metrics.invalidations.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> EpochCacheMetrics {
        EpochCacheMetrics {
            cache_hits: self.metrics.cache_hits.load(Ordering::Relaxed),
            refresh_attempts: self.metrics.refresh_attempts.load(Ordering::Relaxed),
            refresh_successes: self.metrics.refresh_successes.load(Ordering::Relaxed),
            refresh_missing: self.metrics.refresh_missing.load(Ordering::Relaxed),
            refresh_failures: self.metrics.refresh_failures.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    fn resolver(store: &Arc<InMemoryStore>, policy: RefreshPolicy) -> EpochResolver {
        EpochResolver::new(store.clone(), policy, QueryDeadline::disabled())
    }

    #[tokio::test]
    async fn unknown_dataset_never_queries() {
        let store = Arc::new(InMemoryStore::new());
        let epochs = resolver(&store, RefreshPolicy::Never);
        assert_eq!(epochs.lookup("missingdateofbirthday").await, EpochLookup::UnknownDataset);
        assert!(epochs.resolve_epochs("").await.is_empty());
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn first_lookup_populates_and_later_lookups_hit_cache() {
        let store = Arc::new(InMemoryStore::new());
        store.add_dataset("missingdateofdeath", &["1", "2"]).unwrap();
        let epochs = resolver(&store, RefreshPolicy::Never);

        assert_eq!(epochs.resolve_epochs("missingdateofdeath").await, vec!["2", "1"]);
        store.add_dataset("missingdateofdeath", &["3"]).unwrap();
        assert_eq!(epochs.resolve_epochs("missingdateofdeath").await, vec!["2", "1"]);
        assert_eq!(store.query_count(), 1);
        assert_eq!(epochs.metrics().cache_hits, 1);

        epochs.invalidate("missingdateofdeath");
        assert_eq!(epochs.resolve_epochs("missingdateofdeath").await, vec!["3", "2", "1"]);
        assert_eq!(store.query_count(), 2);
        assert_eq!(epochs.metrics().invalidations, 1);
    }

    #[tokio::test]
    async fn empty_epoch_list_is_not_cached() {
        let store = Arc::new(InMemoryStore::new());
        store.add_dataset("missingplaceofbirth", &[]).unwrap();
        let epochs = resolver(&store, RefreshPolicy::Never);

        assert_eq!(epochs.lookup("missingplaceofbirth").await, EpochLookup::Known(vec![]));
        store.add_dataset("missingplaceofbirth", &["4"]).unwrap();
        assert_eq!(epochs.resolve_epochs("missingplaceofbirth").await, vec!["4"]);
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn backend_failure_is_distinct_from_absence() {
        let store = Arc::new(InMemoryStore::new());
        store.add_dataset("missingdateofbirth", &["1"]).unwrap();
        store.set_unavailable(true);
        let epochs = resolver(&store, RefreshPolicy::Never);

        assert!(matches!(
            epochs.lookup("missingdateofbirth").await,
            EpochLookup::Unavailable(_)
        ));
        assert!(epochs.resolve_epochs("missingdateofbirth").await.is_empty());
        assert_eq!(epochs.metrics().refresh_failures, 2);

        store.set_unavailable(false);
        assert_eq!(epochs.resolve_epochs("missingdateofbirth").await, vec!["1"]);
    }

    #[tokio::test]
    async fn missing_epoch_table_is_counted_apart_from_successes() {
        let store = Arc::new(InMemoryStore::new());
        let epochs = resolver(&store, RefreshPolicy::Never);

        assert_eq!(epochs.lookup("missingdateofdeath").await, EpochLookup::Known(vec![]));
        let metrics = epochs.metrics();
        assert_eq!(metrics.refresh_attempts, 1);
        assert_eq!(metrics.refresh_missing, 1);
        assert_eq!(metrics.refresh_successes, 0);
        assert_eq!(metrics.refresh_failures, 0);

        store.add_dataset("missingdateofdeath", &["2"]).unwrap();
        assert_eq!(epochs.resolve_epochs("missingdateofdeath").await, vec!["2"]);
        assert_eq!(epochs.metrics().refresh_successes, 1);
        assert_eq!(epochs.metrics().refresh_missing, 1);
    }

    #[tokio::test]
    async fn ttl_policy_requeries_after_expiry() {
        let store = Arc::new(InMemoryStore::new());
        store.add_dataset("catfacts_missingproperty", &["5"]).unwrap();
        let epochs = resolver(&store, RefreshPolicy::Ttl(Duration::from_millis(20)));

        epochs.resolve_epochs("catfacts_missingproperty").await;
        epochs.resolve_epochs("catfacts_missingproperty").await;
        assert_eq!(store.query_count(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        store.add_dataset("catfacts_missingproperty", &["6"]).unwrap();
        assert_eq!(epochs.resolve_epochs("catfacts_missingproperty").await, vec!["6", "5"]);
        assert_eq!(store.query_count(), 2);
    }

    #[test]
    fn ttl_of_zero_means_never() {
        assert_eq!(RefreshPolicy::from_ttl_secs(Some(0)), RefreshPolicy::Never);
        assert_eq!(RefreshPolicy::from_ttl_secs(None), RefreshPolicy::Never);
        assert_eq!(
            RefreshPolicy::from_ttl_secs(Some(30)),
            RefreshPolicy::Ttl(Duration::from_secs(30))
        );
    }
}
