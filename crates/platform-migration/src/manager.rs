//! Migration manager
//!
//! The orchestrator. It owns the task registry, exposes the public
//! operations and drives:
//! - The synchronous single-resource pipeline (pre-check, fetch, track,
//!   optimize, convert + hooks + write with conflict retry, rollback on
//!   failure, post-validation)
//! - Background batch migrations, observable only through the registry
//! - Cancellation of running batches with compensating rollback

use crate::batch::{BatchConversionProcessor, BatchMetrics, BatchResultStatus};
use crate::config::MigrationConfig;
use crate::conversion::ConversionRegistry;
use crate::error::{LifecycleError, MigrationError, StoreError};
use crate::lifecycle::LifecycleIntegrationManager;
use crate::optimizer::{ConversionOptimizer, DocumentOptimizer};
use crate::registry::TaskRegistry;
use crate::reporter::MigrationStatusReporter;
use crate::state_machine::validate_transition;
use crate::store::ResourceStore;
use crate::tracker::SchemaEvolutionTracker;
use crate::types::{
    Document, MigrationStatus, MigrationTask, ResourceRef, TaskId, TaskKind,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Poll period of [`MigrationManager::wait_for_completion`]
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ManagerInner {
    config: MigrationConfig,
    store: Arc<dyn ResourceStore>,
    conversions: Arc<ConversionRegistry>,
    registry: TaskRegistry,
    tracker: Arc<SchemaEvolutionTracker>,
    optimizer: Option<Arc<dyn DocumentOptimizer>>,
    lifecycle: Arc<LifecycleIntegrationManager>,
    batch: Arc<BatchConversionProcessor>,
    reporter: Arc<MigrationStatusReporter>,
    cancellations: DashMap<TaskId, CancellationToken>,
}

/// Versioned resource migration manager
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MigrationManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("config", &self.inner.config)
            .field("tasks", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`MigrationManager`]
pub struct MigrationManagerBuilder {
    store: Arc<dyn ResourceStore>,
    conversions: ConversionRegistry,
    config: MigrationConfig,
    optimizer: Option<Arc<dyn DocumentOptimizer>>,
    lifecycle: Option<Arc<LifecycleIntegrationManager>>,
    reporter: Option<Arc<MigrationStatusReporter>>,
    tracker: Option<Arc<SchemaEvolutionTracker>>,
}

impl MigrationManagerBuilder {
    /// With configuration
    #[must_use]
    pub fn config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// With a custom optimizer (replaces the built-in one)
    #[must_use]
    pub fn optimizer(mut self, optimizer: Arc<dyn DocumentOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// With a shared lifecycle manager
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: Arc<LifecycleIntegrationManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// With a shared reporter
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<MigrationStatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// With a shared tracker
    #[must_use]
    pub fn tracker(mut self, tracker: Arc<SchemaEvolutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Validate the configuration and assemble the manager
    ///
    /// # Errors
    /// `MigrationError::Config` when the configuration is invalid.
    pub fn build(self) -> Result<MigrationManager, MigrationError> {
        self.config.validate()?;
        let config = self.config;

        let conversions = Arc::new(self.conversions);
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(LifecycleIntegrationManager::new(Arc::clone(&self.store))));
        let optimizer = self.optimizer.or_else(|| {
            config.enable_optimizations.then(|| {
                Arc::new(ConversionOptimizer::from_config(&config)) as Arc<dyn DocumentOptimizer>
            })
        });
        let batch = Arc::new(
            BatchConversionProcessor::new(Arc::clone(&self.store), Arc::clone(&conversions), &config)
                .with_lifecycle(Arc::clone(&lifecycle)),
        );
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(MigrationStatusReporter::new(&config)));

        tracing::debug!(?config, "Migration manager configured");
        let manager = MigrationManager {
            inner: Arc::new(ManagerInner {
                config,
                store: self.store,
                conversions,
                registry: TaskRegistry::new(),
                tracker: self.tracker.unwrap_or_default(),
                optimizer,
                lifecycle,
                batch,
                reporter,
                cancellations: DashMap::new(),
            }),
        };
        manager.spawn_cleanup();
        Ok(manager)
    }
}

impl ManagerInner {
    fn cleanup(&self) -> usize {
        let reports = self.reporter.evict_expired();
        if reports > 0 {
            tracing::debug!(reports, "Evicted expired migration reports");
        }
        reports
    }
}

impl MigrationManager {
    /// Create manager with default components
    ///
    /// # Errors
    /// `MigrationError::Config` when the configuration is invalid.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        conversions: ConversionRegistry,
        config: MigrationConfig,
    ) -> Result<Self, MigrationError> {
        Self::builder(store, conversions).config(config).build()
    }

    /// Start building a manager
    #[must_use]
    pub fn builder(
        store: Arc<dyn ResourceStore>,
        conversions: ConversionRegistry,
    ) -> MigrationManagerBuilder {
        MigrationManagerBuilder {
            store,
            conversions,
            config: MigrationConfig::default(),
            optimizer: None,
            lifecycle: None,
            reporter: None,
            tracker: None,
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.inner.config
    }

    /// Schema evolution tracker
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &Arc<SchemaEvolutionTracker> {
        &self.inner.tracker
    }

    /// Status reporter
    #[inline]
    #[must_use]
    pub fn reporter(&self) -> &Arc<MigrationStatusReporter> {
        &self.inner.reporter
    }

    /// Lifecycle integration manager
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleIntegrationManager> {
        &self.inner.lifecycle
    }

    /// Batch processor (for runtime tuning)
    #[inline]
    #[must_use]
    pub fn batch_processor(&self) -> &Arc<BatchConversionProcessor> {
        &self.inner.batch
    }

    /// Batch processor counters
    #[must_use]
    pub fn batch_metrics(&self) -> BatchMetrics {
        self.inner.batch.metrics()
    }

    /// Registered conversions
    #[inline]
    #[must_use]
    pub fn conversions(&self) -> &ConversionRegistry {
        &self.inner.conversions
    }

    /// Migrate one resource to `target_version`
    ///
    /// Runs the whole pipeline on the caller's task and returns once the task
    /// is terminal.
    ///
    /// # Errors
    /// The first fatal pipeline error; see [`MigrationError::stage`].
    pub async fn migrate_resource(
        &self,
        resource: &ResourceRef,
        target_version: &str,
    ) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let task = inner
            .registry
            .insert(MigrationTask::single(resource.clone(), target_version));
        let task_id = task.id.clone();
        tracing::info!(task_id = %task_id, %resource, target_version, "Starting migration");
        inner.reporter.report_migration_start(&task).await;

        inner
            .registry
            .transition(&task_id, MigrationStatus::InProgress, None)?;
        let start = Instant::now();
        let outcome = self.run_pipeline(&task_id, resource, target_version).await;

        let (migrated, failed) = if outcome.is_ok() { (1, 0) } else { (0, 1) };
        inner.registry.record_progress(&task_id, migrated, failed, 0);

        let finished = match &outcome {
            Ok(()) => {
                inner.tracker.record_success(start.elapsed());
                tracing::info!(task_id = %task_id, %resource, "Migration completed");
                inner
                    .registry
                    .transition(&task_id, MigrationStatus::Completed, None)
            }
            Err(error) => {
                let from = inner
                    .registry
                    .get(&task_id)
                    .and_then(|t| t.source_version)
                    .unwrap_or_else(|| "unknown".to_string());
                inner.tracker.record_failure(&from, target_version, error);
                tracing::warn!(task_id = %task_id, %resource, %error, "Migration failed");
                inner
                    .registry
                    .transition(&task_id, MigrationStatus::Failed, Some(error.to_string()))
            }
        };

        match finished {
            Ok(task) => inner.reporter.report_migration_complete(&task).await,
            Err(error) => {
                tracing::warn!(task_id = %task_id, %error, "Could not finalize migration task");
            }
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        task_id: &TaskId,
        resource: &ResourceRef,
        target_version: &str,
    ) -> Result<(), MigrationError> {
        let inner = &self.inner;

        let _lease = inner
            .lifecycle
            .pre_migration_check(resource, target_version)
            .await
            .map_err(|e| pre_check_error(resource, e))?;

        let document = inner
            .store
            .get(resource)
            .await
            .map_err(MigrationError::from_store)?;

        let source_version = document.version().to_string();
        inner.registry.update(task_id, |task| {
            task.source_version = Some(source_version.clone());
            task.progress.current_resource = Some(resource.clone());
        });
        inner
            .tracker
            .record_migration(&source_version, target_version, resource);

        if let Err(error) = self.convert_with_retry(document, target_version).await {
            self.rollback_after_failure(resource).await;
            return Err(error);
        }

        if inner.config.dry_run {
            tracing::debug!(%resource, "Dry run, skipping post-migration validation");
            inner.lifecycle.discard_snapshot(resource);
            return Ok(());
        }

        inner
            .lifecycle
            .post_migration_validation(resource, target_version)
            .await
            .map_err(|source| MigrationError::ValidationFailed {
                resource: resource.clone(),
                source,
            })
    }

    /// Convert, run hooks and write, re-fetching on conflicts
    async fn convert_with_retry(
        &self,
        mut document: Document,
        target_version: &str,
    ) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let resource = document.reference.clone();
        let attempts = inner.config.retry_attempts.saturating_add(1);
        let mut attempt = 1;

        loop {
            inner.lifecycle.record_snapshot(&document);
            let candidate = self.optimize(document, target_version).await;
            match self.convert_and_write(&candidate, target_version).await {
                Ok(()) => return Ok(()),
                Err(MigrationError::Store(StoreError::Conflict { .. })) if attempt < attempts => {
                    tracing::debug!(%resource, attempt, attempts, "Write conflict, retrying");
                    attempt += 1;
                    tokio::time::sleep(inner.config.retry_interval()).await;
                    document = inner
                        .store
                        .get(&resource)
                        .await
                        .map_err(MigrationError::from_store)?;
                }
                Err(MigrationError::Store(StoreError::Conflict { .. })) => {
                    return Err(MigrationError::ConflictRetriesExhausted { resource, attempts });
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Substitute the optimizer's output under the fetched identity and
    /// resource version
    async fn optimize(&self, document: Document, target_version: &str) -> Document {
        let optimizer = match &self.inner.optimizer {
            Some(optimizer) if self.inner.config.enable_optimizations => optimizer,
            _ => return document,
        };
        match optimizer.optimize(&document, target_version).await {
            Some(mut optimized) => {
                optimized.reference = document.reference;
                optimized.resource_version = document.resource_version;
                optimized
            }
            None => document,
        }
    }

    async fn convert_and_write(
        &self,
        document: &Document,
        target_version: &str,
    ) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let resource = &document.reference;

        let mut converted = inner
            .conversions
            .convert(document, target_version)
            .map_err(|e| MigrationError::from_conversion(resource, e))?;
        inner
            .lifecycle
            .apply_migration_hooks(&mut converted)
            .await
            .map_err(|source| MigrationError::HookFailed {
                resource: resource.clone(),
                source,
            })?;

        if inner.config.dry_run {
            tracing::debug!(%resource, target_version, "Dry run, skipping write");
            return Ok(());
        }

        let written = inner
            .store
            .update(converted)
            .await
            .map_err(MigrationError::from_store)?;
        inner.lifecycle.record_write(&written);
        Ok(())
    }

    async fn rollback_after_failure(&self, resource: &ResourceRef) {
        let lifecycle = &self.inner.lifecycle;
        match lifecycle.rollback_migration(resource).await {
            Ok(_) => lifecycle.discard_snapshot(resource),
            Err(error) => {
                tracing::error!(%resource, %error, "Rollback after failed migration failed");
            }
        }
    }

    /// Start a background batch migration
    ///
    /// Returns a copy of the registered task immediately; follow it with
    /// [`get_migration_status`](Self::get_migration_status) or
    /// [`wait_for_completion`](Self::wait_for_completion).
    ///
    /// # Errors
    /// `InvalidRequest` for an empty resource list.
    pub async fn migrate_batch(
        &self,
        resources: Vec<ResourceRef>,
        target_version: &str,
    ) -> Result<MigrationTask, MigrationError> {
        if resources.is_empty() {
            return Err(MigrationError::InvalidRequest(
                "batch migration requires at least one resource".into(),
            ));
        }

        let task = self
            .inner
            .registry
            .insert(MigrationTask::batch(resources, target_version));
        let cancel = CancellationToken::new();
        self.inner
            .cancellations
            .insert(task.id.clone(), cancel.clone());

        tracing::info!(
            task_id = %task.id,
            resources = task.resources.len(),
            target_version,
            "Starting batch migration"
        );

        let manager = self.clone();
        let spawned = task.clone();
        tokio::spawn(async move { manager.run_batch(spawned, cancel).await });

        Ok(task)
    }

    async fn run_batch(&self, task: MigrationTask, cancel: CancellationToken) {
        let inner = &self.inner;
        let task_id = task.id.clone();
        inner.reporter.report_migration_start(&task).await;

        let work = inner
            .batch
            .process_batch(&task.resources, &task.target_version, &cancel);
        let results = match inner.config.progress_report_interval() {
            None => work.await,
            Some(period) => {
                tokio::pin!(work);
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        results = &mut work => break results,
                        _ = ticker.tick() => {
                            if let Some(snapshot) = inner.registry.get(&task_id) {
                                inner.reporter.report_progress(&task_id, &snapshot.progress).await;
                            }
                        }
                    }
                }
            }
        };

        let count = |status: BatchResultStatus| results.iter().filter(|r| r.status == status).count();
        let migrated = count(BatchResultStatus::Success);
        let failed = count(BatchResultStatus::Failed);
        let skipped = count(BatchResultStatus::Skipped);
        inner
            .registry
            .record_progress(&task_id, migrated, failed, skipped);
        if let Some(source) = results.iter().find_map(|r| r.source_version.clone()) {
            inner.registry.update(&task_id, |t| {
                if !t.status.is_terminal() {
                    t.source_version.get_or_insert(source);
                }
            });
        }

        inner
            .reporter
            .report_batch_results(&task_id, &task.target_version, &results)
            .await;

        let (status, error) = if failed > 0 {
            let error = MigrationError::BatchFailed {
                failed,
                total: task.resources.len(),
            };
            (MigrationStatus::Failed, Some(error.to_string()))
        } else {
            (MigrationStatus::Completed, None)
        };

        match inner.registry.transition(&task_id, status, error) {
            Ok(finished) => {
                for resource in &task.resources {
                    inner.lifecycle.discard_snapshot(resource);
                }
                tracing::info!(
                    task_id = %task_id,
                    migrated,
                    failed,
                    skipped,
                    status = %finished.status,
                    "Batch migration finished"
                );
                inner.reporter.report_migration_complete(&finished).await;
            }
            Err(error) => {
                tracing::warn!(
                    task_id = %task_id,
                    %error,
                    migrated,
                    failed,
                    "Batch finished after cancellation, keeping terminal status"
                );
            }
        }
        inner.cancellations.remove(&task_id);
    }

    /// Copy of a task
    ///
    /// # Errors
    /// `TaskNotFound` for unknown ids.
    pub fn get_migration_status(&self, task_id: &TaskId) -> Result<MigrationTask, MigrationError> {
        self.inner
            .registry
            .get(task_id)
            .ok_or_else(|| MigrationError::TaskNotFound(task_id.clone()))
    }

    /// Copies of every registered task, oldest first
    #[must_use]
    pub fn list_active_migrations(&self) -> Vec<MigrationTask> {
        self.inner.registry.list()
    }

    /// Cancel a running batch and roll back its migrated resources
    ///
    /// Rolls back the first `migrated_resources` entries of the resource
    /// list; individual rollback failures are logged, not returned. The
    /// cancelled task's counters are frozen: outcomes of resources still in
    /// flight are logged but never recorded on it.
    ///
    /// # Errors
    /// `TaskNotFound` for unknown ids, `InvalidState` unless the task is an
    /// in-progress batch.
    pub async fn cancel_migration(&self, task_id: &TaskId) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let task = inner
            .registry
            .update(task_id, |task| {
                let cancellable = task.kind == TaskKind::Batch
                    && validate_transition(task.status, MigrationStatus::RolledBack).is_ok();
                if !cancellable {
                    return Err(MigrationError::InvalidState {
                        task_id: task_id.clone(),
                        status: task.status,
                        operation: "cancel",
                    });
                }
                task.status = MigrationStatus::RolledBack;
                task.end_time = Some(chrono::Utc::now());
                Ok(task.clone())
            })
            .ok_or_else(|| MigrationError::TaskNotFound(task_id.clone()))??;

        if let Some((_, token)) = inner.cancellations.remove(task_id) {
            token.cancel();
        }
        tracing::info!(task_id = %task_id, "Cancelling batch migration");

        let mut rolled_back = 0;
        let mut failures = 0;
        for resource in task.resources.iter().take(task.progress.migrated_resources) {
            match inner.lifecycle.rollback_migration(resource).await {
                Ok(_) => {
                    inner.lifecycle.discard_snapshot(resource);
                    rolled_back += 1;
                }
                Err(error) => {
                    failures += 1;
                    tracing::error!(task_id = %task_id, %resource, %error, "Rollback failed");
                }
            }
        }

        inner
            .reporter
            .report_rollback(task_id, rolled_back, failures)
            .await;
        inner.reporter.report_migration_complete(&task).await;
        Ok(())
    }

    /// Poll the registry until the task is terminal
    ///
    /// For batches this also waits until the background work has reported
    /// completion; a cancelled batch returns as soon as it is rolled back.
    ///
    /// # Errors
    /// `TaskNotFound` for unknown ids, `InvalidState` carrying the last
    /// observed status when `timeout` elapses first.
    pub async fn wait_for_completion(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<MigrationTask, MigrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.get_migration_status(task_id)?;
            if task.status.is_terminal() && !self.inner.cancellations.contains_key(task_id) {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::InvalidState {
                    task_id: task_id.clone(),
                    status: task.status,
                    operation: "wait for",
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Evict finished reports past the retention period
    ///
    /// Returns the number of evicted reports. Also runs every
    /// `cleanup_interval` in the background; tasks stay registered until
    /// [`evict_finished`](Self::evict_finished).
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Periodic [`cleanup`](Self::cleanup) on the current runtime
    ///
    /// The loop holds only a weak reference and ends once every manager
    /// handle is dropped.
    fn spawn_cleanup(&self) {
        let Some(period) = self.inner.config.cleanup_interval() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime, background cleanup disabled");
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.cleanup();
            }
        });
    }

    /// Remove terminal tasks that ended more than `older_than` ago
    pub fn evict_finished(&self, older_than: Duration) -> usize {
        let evicted = self.inner.registry.evict_finished(older_than);
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted finished migration tasks");
        }
        evicted
    }
}

fn pre_check_error(resource: &ResourceRef, error: LifecycleError) -> MigrationError {
    match error {
        LifecycleError::Store(store) => MigrationError::from_store(store),
        other => MigrationError::Ineligible {
            resource: resource.clone(),
            source: other,
        },
    }
}
