//! Per-operation timing for repositories.
//!
//! [`InstrumentedRepository`] wraps any [`EntityRepository`] and reports one
//! [`OperationSample`] per call to an [`OperationRecorder`]. The sample carries
//! the entity name, method name, classified [`OperationKind`], elapsed time and
//! outcome. Recording never alters results or errors.
//!
//! Two recorders ship with the crate: [`TracingRecorder`] logs each sample,
//! [`RepositoryMetrics`] aggregates counters and latency windows in memory.
//! [`FanoutRecorder`] feeds several at once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::criteria::{Filter, FindOptions, Patch};
use crate::entity::Entity;
use crate::errors::StoreResult;
use crate::repository::{BackendKind, EntityRepository};
use crate::types::EntityId;

/// Coarse category of a repository method, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `find*` / `get*`
    Find,
    /// `save*` / `create*`
    Save,
    /// `update*` / `modify*`
    Update,
    /// `delete*` / `remove*`
    Delete,
    /// Anything else (`count`, `soft_delete`, ...)
    Other,
}

impl OperationKind {
    /// Classifies a method by case-insensitive name prefix.
    pub fn classify(method: &str) -> Self {
        let lower = method.to_ascii_lowercase();
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| lower.starts_with(p));

        if starts(&["find", "get"]) {
            Self::Find
        } else if starts(&["save", "create"]) {
            Self::Save
        } else if starts(&["update", "modify"]) {
            Self::Update
        } else if starts(&["delete", "remove"]) {
            Self::Delete
        } else {
            Self::Other
        }
    }

    /// Lower-case label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Save => "save",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed repository call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSample {
    /// Entity name
    pub entity: &'static str,
    /// Method name
    pub method: &'static str,
    /// Classified kind
    pub kind: OperationKind,
    /// Backend family
    pub backend: BackendKind,
    /// Wall time of the call
    pub elapsed: Duration,
    /// Whether the call returned `Ok`
    pub succeeded: bool,
}

/// Sink for [`OperationSample`]s.
pub trait OperationRecorder: Send + Sync {
    /// Records one sample. Must not block.
    fn record(&self, sample: &OperationSample);
}

/// Logs each sample at `debug`, failed calls at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl OperationRecorder for TracingRecorder {
    fn record(&self, sample: &OperationSample) {
        let elapsed_ms = sample.elapsed.as_millis();
        if sample.succeeded {
            debug!(
                backend = %sample.backend,
                "[metrics] {}.{} [{}] - {}ms",
                sample.entity, sample.method, sample.kind, elapsed_ms
            );
        } else {
            warn!(
                backend = %sample.backend,
                "[metrics] {}.{} [{}] - {}ms (failed)",
                sample.entity, sample.method, sample.kind, elapsed_ms
            );
        }
    }
}

/// Forwards each sample to several recorders.
#[derive(Clone, Default)]
pub struct FanoutRecorder {
    recorders: Vec<Arc<dyn OperationRecorder>>,
}

impl FanoutRecorder {
    /// An empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream recorder.
    #[must_use]
    pub fn with(mut self, recorder: Arc<dyn OperationRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }
}

impl fmt::Debug for FanoutRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutRecorder")
            .field("recorders", &self.recorders.len())
            .finish()
    }
}

impl OperationRecorder for FanoutRecorder {
    fn record(&self, sample: &OperationSample) {
        for recorder in &self.recorders {
            recorder.record(sample);
        }
    }
}

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// A zeroed counter.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sliding window of recent latencies.
#[derive(Debug)]
pub struct Timer {
    samples: RwLock<Vec<Duration>>,
    capacity: usize,
}

impl Timer {
    /// Samples kept per timer.
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// A timer keeping the last `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Adds a sample, evicting the oldest beyond capacity.
    pub fn record(&self, duration: Duration) {
        let mut samples = self.samples.write();
        samples.push(duration);
        if samples.len() > self.capacity {
            let excess = samples.len() - self.capacity;
            samples.drain(..excess);
        }
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    /// Returns true before the first sample.
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// Mean of the held samples.
    pub fn mean(&self) -> Option<Duration> {
        let samples = self.samples.read();
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / u32::try_from(samples.len()).unwrap_or(u32::MAX))
    }

    /// Nearest-rank percentile, `p` in `0.0..=100.0`.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let mut samples = self.samples.read().clone();
        if samples.is_empty() {
            return None;
        }
        samples.sort();
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((samples.len() as f64 - 1.0) * p.clamp(0.0, 100.0) / 100.0).round() as usize;
        samples.get(index).copied()
    }

    /// 95th percentile.
    pub fn p95(&self) -> Option<Duration> {
        self.percentile(95.0)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

#[derive(Debug, Default)]
struct MethodStats {
    calls: Counter,
    failures: Counter,
    latency: Timer,
}

/// Aggregated view of one entity method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSnapshot {
    /// Entity name
    pub entity: &'static str,
    /// Method name
    pub method: &'static str,
    /// Classified kind
    pub kind: OperationKind,
    /// Total calls
    pub calls: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Mean latency over the recent window
    pub mean: Option<Duration>,
    /// 95th percentile latency over the recent window
    pub p95: Option<Duration>,
}

/// In-memory aggregation of repository samples, keyed by entity and method.
#[derive(Debug, Default)]
pub struct RepositoryMetrics {
    methods: RwLock<HashMap<(&'static str, &'static str), Arc<MethodStats>>>,
}

impl RepositoryMetrics {
    /// Empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self, entity: &'static str, method: &'static str) -> Arc<MethodStats> {
        if let Some(stats) = self.methods.read().get(&(entity, method)) {
            return Arc::clone(stats);
        }
        Arc::clone(self.methods.write().entry((entity, method)).or_default())
    }

    /// Snapshot of one method, if it has been called.
    pub fn method(&self, entity: &str, method: &str) -> Option<MethodSnapshot> {
        self.snapshot()
            .into_iter()
            .find(|snapshot| snapshot.entity == entity && snapshot.method == method)
    }

    /// Snapshot of every method seen so far, sorted by entity then method.
    pub fn snapshot(&self) -> Vec<MethodSnapshot> {
        let mut snapshots: Vec<_> = self
            .methods
            .read()
            .iter()
            .map(|(&(entity, method), stats)| MethodSnapshot {
                entity,
                method,
                kind: OperationKind::classify(method),
                calls: stats.calls.get(),
                failures: stats.failures.get(),
                mean: stats.latency.mean(),
                p95: stats.latency.p95(),
            })
            .collect();
        snapshots.sort_by(|a, b| (a.entity, a.method).cmp(&(b.entity, b.method)));
        snapshots
    }
}

impl OperationRecorder for RepositoryMetrics {
    fn record(&self, sample: &OperationSample) {
        let stats = self.stats(sample.entity, sample.method);
        stats.calls.increment();
        if !sample.succeeded {
            stats.failures.increment();
        }
        stats.latency.record(sample.elapsed);
    }
}

/// Repository decorator timing every call.
pub struct InstrumentedRepository<R> {
    inner: R,
    recorder: Arc<dyn OperationRecorder>,
}

impl<R> InstrumentedRepository<R> {
    /// Wraps `inner`, reporting to `recorder`.
    pub fn new(inner: R, recorder: Arc<dyn OperationRecorder>) -> Self {
        Self { inner, recorder }
    }

    /// Wraps `inner`, logging samples through `tracing`.
    pub fn with_tracing(inner: R) -> Self {
        Self::new(inner, Arc::new(TracingRecorder))
    }

    /// The wrapped repository.
    pub const fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: Clone> Clone for InstrumentedRepository<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            recorder: Arc::clone(&self.recorder),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for InstrumentedRepository<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedRepository")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<R> InstrumentedRepository<R> {
    async fn track<E, T, F>(&self, method: &'static str, call: F) -> StoreResult<T>
    where
        E: Entity,
        R: EntityRepository<E>,
        F: Future<Output = StoreResult<T>> + Send,
    {
        let started = Instant::now();
        let result = call.await;
        self.recorder.record(&OperationSample {
            entity: E::NAME,
            method,
            kind: OperationKind::classify(method),
            backend: self.inner.backend_kind(),
            elapsed: started.elapsed(),
            succeeded: result.is_ok(),
        });
        result
    }
}

#[async_trait]
impl<E, R> EntityRepository<E> for InstrumentedRepository<R>
where
    E: Entity,
    R: EntityRepository<E>,
{
    fn backend_kind(&self) -> BackendKind {
        self.inner.backend_kind()
    }

    async fn save(&self, entity: E) -> StoreResult<E> {
        self.track::<E, _, _>("save", self.inner.save(entity)).await
    }

    async fn save_many(&self, entities: Vec<E>) -> StoreResult<Vec<E>> {
        self.track::<E, _, _>("save_many", self.inner.save_many(entities))
            .await
    }

    async fn find_by_id(&self, id: &EntityId) -> StoreResult<Option<E>> {
        self.track::<E, _, _>("find_by_id", self.inner.find_by_id(id))
            .await
    }

    async fn find_one(&self, options: FindOptions) -> StoreResult<Option<E>> {
        self.track::<E, _, _>("find_one", self.inner.find_one(options))
            .await
    }

    async fn find_all(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.track::<E, _, _>("find_all", self.inner.find_all(options))
            .await
    }

    async fn find_and_count(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)> {
        self.track::<E, _, _>("find_and_count", self.inner.find_and_count(options))
            .await
    }

    async fn count(&self, filter: Filter) -> StoreResult<u64> {
        self.track::<E, _, _>("count", self.inner.count(filter)).await
    }

    async fn find_by_id_with_deleted(&self, id: &EntityId) -> StoreResult<Option<E>> {
        self.track::<E, _, _>(
            "find_by_id_with_deleted",
            self.inner.find_by_id_with_deleted(id),
        )
        .await
    }

    async fn find_one_with_deleted(&self, options: FindOptions) -> StoreResult<Option<E>> {
        self.track::<E, _, _>(
            "find_one_with_deleted",
            self.inner.find_one_with_deleted(options),
        )
        .await
    }

    async fn find_all_with_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.track::<E, _, _>(
            "find_all_with_deleted",
            self.inner.find_all_with_deleted(options),
        )
        .await
    }

    async fn find_and_count_with_deleted(
        &self,
        options: FindOptions,
    ) -> StoreResult<(Vec<E>, u64)> {
        self.track::<E, _, _>(
            "find_and_count_with_deleted",
            self.inner.find_and_count_with_deleted(options),
        )
        .await
    }

    async fn count_with_deleted(&self, filter: Filter) -> StoreResult<u64> {
        self.track::<E, _, _>("count_with_deleted", self.inner.count_with_deleted(filter))
            .await
    }

    async fn find_all_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.track::<E, _, _>("find_all_deleted", self.inner.find_all_deleted(options))
            .await
    }

    async fn find_and_count_deleted(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)> {
        self.track::<E, _, _>(
            "find_and_count_deleted",
            self.inner.find_and_count_deleted(options),
        )
        .await
    }

    async fn update(&self, filter: Filter, patch: Patch) -> StoreResult<u64> {
        self.track::<E, _, _>("update", self.inner.update(filter, patch))
            .await
    }

    async fn hard_delete(&self, filter: Filter) -> StoreResult<u64> {
        self.track::<E, _, _>("hard_delete", self.inner.hard_delete(filter))
            .await
    }

    async fn soft_delete(&self, filter: Filter) -> StoreResult<u64> {
        self.track::<E, _, _>("soft_delete", self.inner.soft_delete(filter))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;
    use crate::errors::{Operation, StoreError};
    use serde::{Deserialize, Serialize};
    use tracing_test::traced_test;

    #[test]
    fn classification_follows_name_prefixes() {
        assert_eq!(OperationKind::classify("findAll"), OperationKind::Find);
        assert_eq!(OperationKind::classify("find_by_id"), OperationKind::Find);
        assert_eq!(OperationKind::classify("getUser"), OperationKind::Find);
        assert_eq!(OperationKind::classify("SAVE_many"), OperationKind::Save);
        assert_eq!(OperationKind::classify("createLabel"), OperationKind::Save);
        assert_eq!(OperationKind::classify("update"), OperationKind::Update);
        assert_eq!(OperationKind::classify("modifyRole"), OperationKind::Update);
        assert_eq!(OperationKind::classify("removeAll"), OperationKind::Delete);
        assert_eq!(OperationKind::classify("count"), OperationKind::Other);
        assert_eq!(OperationKind::classify("soft_delete"), OperationKind::Other);
        assert_eq!(OperationKind::classify("hard_delete"), OperationKind::Other);
    }

    #[test]
    fn timer_window_is_bounded() {
        let timer = Timer::with_capacity(3);
        for ms in 1..=5 {
            timer.record(Duration::from_millis(ms));
        }
        assert_eq!(timer.len(), 3);
        assert_eq!(timer.mean(), Some(Duration::from_millis(4)));
        assert_eq!(timer.percentile(0.0), Some(Duration::from_millis(3)));
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        #[serde(flatten)]
        meta: EntityMeta,
    }

    impl Entity for Widget {
        const NAME: &'static str = "Widget";
        const COLLECTION: &'static str = "widget";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    /// Answers counts with 3 and fails every other call.
    struct CountOnly;

    fn unsupported() -> StoreError {
        StoreError::backend(
            Operation::Find,
            std::io::Error::new(std::io::ErrorKind::Unsupported, "not used by this test"),
        )
    }

    #[async_trait]
    impl EntityRepository<Widget> for CountOnly {
        fn backend_kind(&self) -> BackendKind {
            BackendKind::InMemory
        }
        async fn save(&self, _: Widget) -> StoreResult<Widget> {
            Err(unsupported())
        }
        async fn save_many(&self, _: Vec<Widget>) -> StoreResult<Vec<Widget>> {
            Err(unsupported())
        }
        async fn find_by_id(&self, _: &EntityId) -> StoreResult<Option<Widget>> {
            Err(unsupported())
        }
        async fn find_one(&self, _: FindOptions) -> StoreResult<Option<Widget>> {
            Err(unsupported())
        }
        async fn find_all(&self, _: FindOptions) -> StoreResult<Vec<Widget>> {
            Err(unsupported())
        }
        async fn find_and_count(&self, _: FindOptions) -> StoreResult<(Vec<Widget>, u64)> {
            Err(unsupported())
        }
        async fn count(&self, _: Filter) -> StoreResult<u64> {
            Ok(3)
        }
        async fn find_by_id_with_deleted(&self, _: &EntityId) -> StoreResult<Option<Widget>> {
            Err(unsupported())
        }
        async fn find_one_with_deleted(&self, _: FindOptions) -> StoreResult<Option<Widget>> {
            Err(unsupported())
        }
        async fn find_all_with_deleted(&self, _: FindOptions) -> StoreResult<Vec<Widget>> {
            Err(unsupported())
        }
        async fn find_and_count_with_deleted(
            &self,
            _: FindOptions,
        ) -> StoreResult<(Vec<Widget>, u64)> {
            Err(unsupported())
        }
        async fn count_with_deleted(&self, _: Filter) -> StoreResult<u64> {
            Err(unsupported())
        }
        async fn find_all_deleted(&self, _: FindOptions) -> StoreResult<Vec<Widget>> {
            Err(unsupported())
        }
        async fn find_and_count_deleted(&self, _: FindOptions) -> StoreResult<(Vec<Widget>, u64)> {
            Err(unsupported())
        }
        async fn update(&self, _: Filter, _: Patch) -> StoreResult<u64> {
            Err(unsupported())
        }
        async fn hard_delete(&self, _: Filter) -> StoreResult<u64> {
            Err(unsupported())
        }
        async fn soft_delete(&self, _: Filter) -> StoreResult<u64> {
            Err(unsupported())
        }
    }

    #[tokio::test]
    async fn results_and_errors_pass_through_unchanged() {
        // Given: an instrumented repository feeding in-memory metrics
        let metrics = Arc::new(RepositoryMetrics::new());
        let repo = InstrumentedRepository::new(CountOnly, metrics.clone());

        // When: one call succeeds and one fails
        let counted = EntityRepository::<Widget>::count(&repo, Filter::All).await;
        let missing = EntityRepository::<Widget>::find_all(&repo, FindOptions::default()).await;

        // Then: callers see exactly what the inner repository returned
        assert_eq!(counted.unwrap(), 3);
        assert!(matches!(
            missing,
            Err(StoreError::Backend {
                operation: Operation::Find,
                ..
            })
        ));

        // And: both calls were recorded under their method names
        let count = metrics.method("Widget", "count").unwrap();
        assert_eq!((count.calls, count.failures), (1, 0));
        assert_eq!(count.kind, OperationKind::Other);

        let find_all = metrics.method("Widget", "find_all").unwrap();
        assert_eq!((find_all.calls, find_all.failures), (1, 1));
        assert_eq!(find_all.kind, OperationKind::Find);
    }

    #[tokio::test]
    #[traced_test]
    async fn tracing_recorder_logs_entity_method_and_kind() {
        let repo = InstrumentedRepository::with_tracing(CountOnly);

        EntityRepository::<Widget>::count(&repo, Filter::All)
            .await
            .unwrap();

        assert!(logs_contain("[metrics] Widget.count [other]"));
    }

    #[test]
    fn fanout_reaches_every_recorder() {
        let first = Arc::new(RepositoryMetrics::new());
        let second = Arc::new(RepositoryMetrics::new());
        let fanout = FanoutRecorder::new()
            .with(first.clone())
            .with(second.clone());

        fanout.record(&OperationSample {
            entity: "Label",
            method: "save",
            kind: OperationKind::Save,
            backend: BackendKind::Relational,
            elapsed: Duration::from_millis(2),
            succeeded: true,
        });

        assert_eq!(first.method("Label", "save").unwrap().calls, 1);
        assert_eq!(second.method("Label", "save").unwrap().calls, 1);
    }
}
