//! Batch conversion processing
//!
//! Converts a set of resources in chunks of `batch_size`; each chunk is
//! fanned out over at most `max_workers` concurrent conversions. Every input
//! resource yields exactly one [`BatchConversionResult`], and one resource's
//! failure never stops the others.
//!
//! Per resource: fetch, skip when missing or already at the target, snapshot,
//! convert, run hooks, then write with compare-and-swap (conflicts re-fetch
//! and retry within the attempt budget). Once the cancellation token fires no
//! further resources are started; the rest come back as skipped.

use crate::config::MigrationConfig;
use crate::conversion::ConversionRegistry;
use crate::lifecycle::LifecycleIntegrationManager;
use crate::store::ResourceStore;
use crate::types::{Document, ResourceRef};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of one resource in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchResultStatus {
    /// Converted (and written unless dry-run)
    Success,
    /// Conversion, hooks or write failed
    Failed,
    /// Missing, already at the target version, or cancelled before start
    Skipped,
}

impl BatchResultStatus {
    /// Stable string form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for BatchResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result for one resource of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConversionResult {
    /// The resource
    pub resource: ResourceRef,
    /// Outcome
    pub status: BatchResultStatus,
    /// Version the resource was read at
    pub source_version: Option<String>,
    /// Failure or skip reason
    pub error: Option<String>,
    /// Time spent on the resource
    pub duration: Duration,
    /// Conflicting writes retried
    pub retry_count: u32,
}

impl BatchConversionResult {
    fn new(resource: ResourceRef, status: BatchResultStatus) -> Self {
        Self {
            resource,
            status,
            source_version: None,
            error: None,
            duration: Duration::ZERO,
            retry_count: 0,
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Check if the resource was migrated
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BatchResultStatus::Success
    }
}

/// Batch processor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    /// `process_batch` calls
    pub total_batches: u64,
    /// Resources handed to the processor
    pub total_resources: u64,
    /// Successful resources
    pub successful_resources: u64,
    /// Failed resources
    pub failed_resources: u64,
    /// Skipped resources
    pub skipped_resources: u64,
    /// Largest batch seen
    pub largest_batch: usize,
    /// Mean wall time per batch
    pub average_batch_time: Duration,
    /// Mean time per resource
    pub average_resource_time: Duration,
}

impl BatchMetrics {
    fn record_result(&mut self, result: &BatchConversionResult) {
        match result.status {
            BatchResultStatus::Success => self.successful_resources += 1,
            BatchResultStatus::Failed => self.failed_resources += 1,
            BatchResultStatus::Skipped => self.skipped_resources += 1,
        }
        let n = self.successful_resources + self.failed_resources + self.skipped_resources;
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        self.average_resource_time = (self.average_resource_time * (n - 1) + result.duration) / n;
    }

    fn record_batch(&mut self, elapsed: Duration) {
        let n = u32::try_from(self.total_batches.max(1)).unwrap_or(u32::MAX);
        self.average_batch_time = (self.average_batch_time * (n - 1) + elapsed) / n;
    }
}

/// Batch conversion processor
pub struct BatchConversionProcessor {
    store: Arc<dyn ResourceStore>,
    conversions: Arc<ConversionRegistry>,
    lifecycle: Option<Arc<LifecycleIntegrationManager>>,
    batch_size: AtomicUsize,
    max_workers: AtomicUsize,
    retry_attempts: u32,
    retry_interval: Duration,
    dry_run: bool,
    metrics: Mutex<BatchMetrics>,
}

impl fmt::Debug for BatchConversionProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConversionProcessor")
            .field("batch_size", &self.batch_size())
            .field("max_workers", &self.max_workers())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl BatchConversionProcessor {
    /// Create processor with sizing and retry policy from the config
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        conversions: Arc<ConversionRegistry>,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            store,
            conversions,
            lifecycle: None,
            batch_size: AtomicUsize::new(config.batch_size.max(1)),
            max_workers: AtomicUsize::new(config.max_concurrent_migrations.max(1)),
            retry_attempts: config.retry_attempts,
            retry_interval: config.retry_interval(),
            dry_run: config.dry_run,
            metrics: Mutex::new(BatchMetrics::default()),
        }
    }

    /// Snapshot and run hooks through a lifecycle manager
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleIntegrationManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Resources per chunk
    #[inline]
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Change the chunk size (minimum 1)
    pub fn set_batch_size(&self, size: usize) {
        self.batch_size.store(size.max(1), Ordering::Relaxed);
    }

    /// Concurrent conversions per chunk
    #[inline]
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::Relaxed)
    }

    /// Change the worker count (minimum 1)
    pub fn set_max_workers(&self, workers: usize) {
        self.max_workers.store(workers.max(1), Ordering::Relaxed);
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn metrics(&self) -> BatchMetrics {
        self.metrics.lock().clone()
    }

    /// Convert every resource to `target_version`
    ///
    /// Results come back in input order, one per resource.
    pub async fn process_batch(
        &self,
        resources: &[ResourceRef],
        target_version: &str,
        cancel: &CancellationToken,
    ) -> Vec<BatchConversionResult> {
        let start = Instant::now();
        let batch_size = self.batch_size();
        let workers = self.max_workers();
        tracing::info!(
            resources = resources.len(),
            target_version,
            batch_size,
            workers,
            "Starting batch conversion"
        );

        {
            let mut metrics = self.metrics.lock();
            metrics.total_batches += 1;
            metrics.total_resources += resources.len() as u64;
            metrics.largest_batch = metrics.largest_batch.max(resources.len());
        }

        let mut results = Vec::with_capacity(resources.len());
        for (chunk_index, chunk) in resources.chunks(batch_size).enumerate() {
            let offset = chunk_index * batch_size;
            let pending: Vec<_> = chunk
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, resource)| self.dispatch(offset + i, resource, target_version, cancel))
                .collect();
            let mut chunk_results: Vec<(usize, BatchConversionResult)> = stream::iter(pending)
                .buffer_unordered(workers)
                .collect()
                .await;
            chunk_results.sort_by_key(|(index, _)| *index);
            results.extend(chunk_results.into_iter().map(|(_, result)| result));
        }

        let elapsed = start.elapsed();
        {
            let mut metrics = self.metrics.lock();
            for result in &results {
                metrics.record_result(result);
            }
            metrics.record_batch(elapsed);
        }
        for result in &results {
            metrics::counter!("migration_batch_resources_total", "status" => result.status.as_str())
                .increment(1);
        }
        metrics::histogram!("migration_batch_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            resources = results.len(),
            succeeded = results.iter().filter(|r| r.is_success()).count(),
            elapsed_ms = elapsed.as_millis(),
            "Batch conversion finished"
        );
        results
    }

    async fn dispatch(
        &self,
        index: usize,
        resource: ResourceRef,
        target_version: &str,
        cancel: &CancellationToken,
    ) -> (usize, BatchConversionResult) {
        if cancel.is_cancelled() {
            let skipped = BatchConversionResult::new(resource, BatchResultStatus::Skipped)
                .with_error("batch cancelled");
            return (index, skipped);
        }
        (index, self.process_resource(&resource, target_version).await)
    }

    async fn process_resource(
        &self,
        resource: &ResourceRef,
        target_version: &str,
    ) -> BatchConversionResult {
        let start = Instant::now();
        let mut result = self.convert_resource(resource, target_version).await;
        result.duration = start.elapsed();
        if let Some(error) = &result.error {
            tracing::debug!(%resource, status = %result.status, %error, "Batch resource not migrated");
        }
        result
    }

    async fn convert_resource(
        &self,
        resource: &ResourceRef,
        target_version: &str,
    ) -> BatchConversionResult {
        use BatchResultStatus::{Failed, Skipped, Success};

        let _lease = match &self.lifecycle {
            Some(lifecycle) => match lifecycle.try_acquire(resource) {
                Some(lease) => Some(lease),
                None => {
                    return BatchConversionResult::new(resource.clone(), Failed)
                        .with_error("migration already in progress");
                }
            },
            None => None,
        };

        let mut retry_count = 0;
        loop {
            let document = match self.store.get(resource).await {
                Ok(document) => document,
                Err(e) if e.is_not_found() => {
                    return BatchConversionResult::new(resource.clone(), Skipped)
                        .with_error(e.to_string());
                }
                Err(e) => {
                    return BatchConversionResult::new(resource.clone(), Failed)
                        .with_error(e.to_string());
                }
            };

            let mut outcome = BatchConversionResult::new(resource.clone(), Failed);
            outcome.source_version = Some(document.version().to_string());
            outcome.retry_count = retry_count;

            if document.version() == target_version {
                outcome.status = Skipped;
                return outcome.with_error(format!("already at version {target_version}"));
            }

            let converted = match self.prepare(&document, target_version).await {
                Ok(converted) => converted,
                Err(error) => return outcome.with_error(error),
            };

            if self.dry_run {
                if let Some(lifecycle) = &self.lifecycle {
                    lifecycle.discard_snapshot(resource);
                }
                outcome.status = Success;
                return outcome;
            }

            match self.store.update(converted).await {
                Ok(written) => {
                    if let Some(lifecycle) = &self.lifecycle {
                        lifecycle.record_write(&written);
                    }
                    outcome.status = Success;
                    return outcome;
                }
                Err(e) if e.is_conflict() && retry_count < self.retry_attempts => {
                    retry_count += 1;
                    tracing::debug!(%resource, retry_count, "Write conflict, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) if e.is_conflict() => {
                    return outcome.with_error(format!(
                        "conflict persisted after {} attempts",
                        retry_count + 1
                    ));
                }
                Err(e) => return outcome.with_error(e.to_string()),
            }
        }
    }

    /// Snapshot, convert and run hooks
    async fn prepare(&self, document: &Document, target_version: &str) -> Result<Document, String> {
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.record_snapshot(document);
        }
        let mut converted = self
            .conversions
            .convert(document, target_version)
            .map_err(|e| e.to_string())?;
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle
                .apply_migration_hooks(&mut converted)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(converted)
    }
}
