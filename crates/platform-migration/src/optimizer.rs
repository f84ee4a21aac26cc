//! Conversion optimizer
//!
//! Best-effort pre-processing run before canonical conversion. An optimizer
//! may offer a cheaper, equivalent document; it never fails the pipeline and
//! never mutates its input.
//!
//! [`ConversionOptimizer`] applies an ordered list of [`OptimizationStrategy`]
//! values and caches results by content hash (moka, bounded capacity + TTL).

use crate::config::MigrationConfig;
use crate::error::ConversionError;
use crate::types::Document;
use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Optional pre-conversion optimization
#[async_trait]
pub trait DocumentOptimizer: Send + Sync {
    /// Cheaper equivalent of `document`, or `None` to keep the original
    async fn optimize(&self, document: &Document, target_version: &str) -> Option<Document>;
}

/// One optimization pass
pub trait OptimizationStrategy: Send + Sync {
    /// Strategy name, used in logs and metrics
    fn name(&self) -> &'static str;

    /// Check if the strategy applies
    fn can_optimize(&self, document: &Document, target_version: &str) -> bool;

    /// Rewrite the document
    ///
    /// # Errors
    /// Any error; the optimizer logs it and skips the strategy.
    fn optimize(&self, document: &Document, target_version: &str)
        -> Result<Document, ConversionError>;
}

/// Server-managed metadata never carried across versions
const SKIPPED_METADATA: [&str; 4] = ["managedFields", "selfLink", "initializers", "clusterName"];

/// Drops server-managed metadata fields
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldSkipping;

impl OptimizationStrategy for FieldSkipping {
    fn name(&self) -> &'static str {
        "field-skipping"
    }

    fn can_optimize(&self, document: &Document, _target_version: &str) -> bool {
        document
            .content
            .get("metadata")
            .and_then(Value::as_object)
            .is_some_and(|meta| SKIPPED_METADATA.iter().any(|f| meta.contains_key(*f)))
    }

    fn optimize(
        &self,
        document: &Document,
        _target_version: &str,
    ) -> Result<Document, ConversionError> {
        let mut optimized = document.clone();
        let metadata = optimized
            .content
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ConversionError::MissingField("metadata".into()))?;
        for field in SKIPPED_METADATA {
            metadata.remove(field);
        }
        Ok(optimized)
    }
}

/// Drops an empty `status` object
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyStatusPruning;

impl OptimizationStrategy for EmptyStatusPruning {
    fn name(&self) -> &'static str {
        "empty-status"
    }

    fn can_optimize(&self, document: &Document, _target_version: &str) -> bool {
        document
            .content
            .get("status")
            .and_then(Value::as_object)
            .is_some_and(serde_json::Map::is_empty)
    }

    fn optimize(
        &self,
        document: &Document,
        _target_version: &str,
    ) -> Result<Document, ConversionError> {
        let mut optimized = document.clone();
        if let Some(content) = optimized.content.as_object_mut() {
            content.remove("status");
        }
        Ok(optimized)
    }
}

/// Optimizer performance counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizerMetrics {
    /// Documents offered to the optimizer
    pub total_conversions: u64,
    /// Answered from cache
    pub cached_conversions: u64,
    /// Changed by at least one strategy
    pub optimized_conversions: u64,
    /// Strategy application counts
    pub optimizations_by_strategy: BTreeMap<String, u64>,
    /// Fastest optimization
    pub fastest: Option<Duration>,
    /// Slowest optimization
    pub slowest: Option<Duration>,
    /// Mean optimization time
    pub average: Duration,
}

impl OptimizerMetrics {
    fn record_time(&mut self, elapsed: Duration) {
        self.fastest = Some(self.fastest.map_or(elapsed, |f| f.min(elapsed)));
        self.slowest = Some(self.slowest.map_or(elapsed, |s| s.max(elapsed)));
        let n = u32::try_from(self.total_conversions.max(1)).unwrap_or(u32::MAX);
        self.average = (self.average * (n - 1) + elapsed) / n;
    }
}

/// Strategy-driven optimizer with a content-addressed result cache
pub struct ConversionOptimizer {
    strategies: Vec<Box<dyn OptimizationStrategy>>,
    cache: Option<Cache<String, Option<Arc<Value>>>>,
    metrics: Mutex<OptimizerMetrics>,
}

impl std::fmt::Debug for ConversionOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("ConversionOptimizer")
            .field("strategies", &names)
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ConversionOptimizer {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

impl ConversionOptimizer {
    /// Optimizer without strategies or cache
    #[must_use]
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
            cache: None,
            metrics: Mutex::new(OptimizerMetrics::default()),
        }
    }

    /// Built-in strategies, cache sized from the config
    #[must_use]
    pub fn from_config(config: &MigrationConfig) -> Self {
        let cache = (config.optimizer_cache_size > 0).then(|| {
            Cache::builder()
                .max_capacity(config.optimizer_cache_size)
                .time_to_live(config.optimizer_cache_ttl())
                .build()
        });
        Self {
            strategies: vec![Box::new(FieldSkipping), Box::new(EmptyStatusPruning)],
            cache,
            metrics: Mutex::new(OptimizerMetrics::default()),
        }
    }

    /// Append a strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl OptimizationStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Snapshot of the performance counters
    #[must_use]
    pub fn metrics(&self) -> OptimizerMetrics {
        self.metrics.lock().clone()
    }

    /// Approximate cached entry count
    #[must_use]
    pub fn cache_entries(&self) -> u64 {
        self.cache.as_ref().map_or(0, Cache::entry_count)
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    fn cache_key(document: &Document, target_version: &str) -> Option<String> {
        let body = serde_json::to_vec(&document.content).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(document.api_version.as_bytes());
        hasher.update([0]);
        hasher.update(target_version.as_bytes());
        hasher.update([0]);
        hasher.update(&body);
        Some(hex::encode(hasher.finalize()))
    }

    fn run_strategies(&self, document: &Document, target_version: &str) -> Option<Value> {
        let mut current = document.clone();
        let mut applied = Vec::new();

        for strategy in &self.strategies {
            if !strategy.can_optimize(&current, target_version) {
                continue;
            }
            match strategy.optimize(&current, target_version) {
                Ok(next) => {
                    current = next;
                    applied.push(strategy.name());
                }
                Err(error) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        resource = %document.reference,
                        %error,
                        "Optimization strategy failed"
                    );
                }
            }
        }

        if applied.is_empty() || current.content == document.content {
            return None;
        }

        let mut metrics = self.metrics.lock();
        metrics.optimized_conversions += 1;
        for name in applied {
            *metrics
                .optimizations_by_strategy
                .entry(name.to_string())
                .or_default() += 1;
            metrics::counter!("migration_optimizations_total", "strategy" => name).increment(1);
        }
        Some(current.content)
    }
}

#[async_trait]
impl DocumentOptimizer for ConversionOptimizer {
    async fn optimize(&self, document: &Document, target_version: &str) -> Option<Document> {
        let start = Instant::now();
        self.metrics.lock().total_conversions += 1;

        let key = self
            .cache
            .as_ref()
            .and_then(|_| Self::cache_key(document, target_version));

        let cached = match (&self.cache, &key) {
            (Some(cache), Some(key)) => cache.get(key).await,
            _ => None,
        };

        let content = if let Some(hit) = cached {
            self.metrics.lock().cached_conversions += 1;
            metrics::counter!("migration_optimizer_cache_hits_total").increment(1);
            hit
        } else {
            let computed = self
                .run_strategies(document, target_version)
                .map(Arc::new);
            if let (Some(cache), Some(key)) = (&self.cache, key) {
                cache.insert(key, computed.clone()).await;
            }
            computed
        };

        let elapsed = start.elapsed();
        self.metrics.lock().record_time(elapsed);
        metrics::histogram!("migration_optimizer_duration_seconds").record(elapsed.as_secs_f64());

        content.map(|body| Document {
            reference: document.reference.clone(),
            api_version: document.api_version.clone(),
            resource_version: document.resource_version,
            content: (*body).clone(),
        })
    }
}
