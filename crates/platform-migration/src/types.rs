//! Core types for the migration engine
//!
//! Defines:
//! - Resource coordinates and the opaque versioned document
//! - Migration tasks, their status and progress counters

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Namespace + name coordinates of a platform resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceRef {
    /// Create new resource reference
    #[inline]
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Migration task identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Identifier for a single-resource migration
    ///
    /// The ULID suffix embeds a millisecond timestamp plus randomness, keeping
    /// ids unique for the lifetime of the process.
    #[must_use]
    pub fn for_resource(resource: &ResourceRef) -> Self {
        Self(format!(
            "migrate-{}-{}-{}",
            resource.namespace,
            resource.name,
            Ulid::new()
        ))
    }

    /// Identifier for a batch migration
    #[must_use]
    pub fn for_batch(resource_count: usize) -> Self {
        Self(format!("batch-migrate-{resource_count}-{}", Ulid::new()))
    }

    /// Borrow as string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Versioned platform document
///
/// The engine treats `content` as opaque JSON; only `metadata`, `spec` and
/// `status` are inspected by the built-in checks and optimizer strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Resource coordinates
    pub reference: ResourceRef,
    /// Schema version (e.g. `v1alpha1`)
    pub api_version: String,
    /// Store-assigned version used for optimistic concurrency
    #[serde(default)]
    pub resource_version: u64,
    /// Document body
    #[serde(default)]
    pub content: Value,
}

impl Document {
    /// Create new document at resource version 0
    #[inline]
    #[must_use]
    pub fn new(reference: ResourceRef, api_version: impl Into<String>, content: Value) -> Self {
        Self {
            reference,
            api_version: api_version.into(),
            resource_version: 0,
            content,
        }
    }

    /// Schema version of this document
    #[inline]
    #[must_use]
    pub fn version(&self) -> &str {
        &self.api_version
    }

    /// The `spec` object, if present
    #[inline]
    #[must_use]
    pub fn spec(&self) -> Option<&Value> {
        self.content.get("spec")
    }

    /// `status.phase`, if present
    #[must_use]
    pub fn status_phase(&self) -> Option<&str> {
        self.content.pointer("/status/phase").and_then(Value::as_str)
    }

    /// Look up a value by JSON pointer
    #[inline]
    #[must_use]
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.content.pointer(pointer)
    }

    /// Same document body at a different schema version
    #[must_use]
    pub fn with_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Whether `other` carries the same version and body (ignores resource version)
    #[must_use]
    pub fn same_content(&self, other: &Document) -> bool {
        self.api_version == other.api_version && self.content == other.content
    }
}

/// Status of a migration task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Registered, not yet running
    Pending,
    /// Running
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with a fatal error
    Failed,
    /// Cancelled and compensated
    RolledBack,
}

impl MigrationStatus {
    /// Check if no further transitions are allowed
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Stable string form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::RolledBack => "RolledBack",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-resource or batch task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Synchronous single-resource migration
    Single,
    /// Background batch migration
    Batch,
}

/// Progress counters of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    /// Resources in the task
    pub total_resources: usize,
    /// Successfully migrated
    pub migrated_resources: usize,
    /// Failed
    pub failed_resources: usize,
    /// Skipped (missing, already at target, or cancelled)
    pub skipped_resources: usize,
    /// Resource currently being processed
    pub current_resource: Option<ResourceRef>,
    /// `elapsed / processed`
    pub average_process_time: Duration,
    /// `average_process_time * remaining`
    pub estimated_time_left: Duration,
}

impl MigrationProgress {
    /// Fresh counters for `total` resources
    #[inline]
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total_resources: total,
            ..Self::default()
        }
    }

    /// Resources with an outcome
    #[inline]
    #[must_use]
    pub fn processed(&self) -> usize {
        self.migrated_resources + self.failed_resources + self.skipped_resources
    }

    /// Resources without an outcome yet
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total_resources.saturating_sub(self.processed())
    }

    /// Add outcomes and recompute the time estimates
    ///
    /// Counts that would push `processed` past `total` are clamped; the
    /// returned value is `true` when clamping happened.
    pub fn record(&mut self, migrated: usize, failed: usize, skipped: usize, elapsed: Duration) -> bool {
        let mut budget = self.remaining();
        let mut take = |n: usize| {
            let granted = n.min(budget);
            budget -= granted;
            granted
        };
        let (m, f, s) = (take(migrated), take(failed), take(skipped));
        let clamped = (m, f, s) != (migrated, failed, skipped);

        self.migrated_resources += m;
        self.failed_resources += f;
        self.skipped_resources += s;

        let processed = self.processed();
        if processed > 0 {
            let divisor = u32::try_from(processed).unwrap_or(u32::MAX);
            self.average_process_time = elapsed / divisor;
            let remaining = u32::try_from(self.remaining()).unwrap_or(u32::MAX);
            self.estimated_time_left = self.average_process_time * remaining;
        }
        clamped
    }

    /// Completed fraction in `[0, 1]`
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total_resources == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.processed() as f64 / self.total_resources as f64;
        ratio
    }
}

/// A migration task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    /// Unique identifier
    pub id: TaskId,
    /// Single or batch
    pub kind: TaskKind,
    /// Observed source version (set once a document was read)
    pub source_version: Option<String>,
    /// Target version
    pub target_version: String,
    /// Resources in registration order
    pub resources: Vec<ResourceRef>,
    /// Current status
    pub status: MigrationStatus,
    /// Registration time
    pub start_time: chrono::DateTime<chrono::Utc>,
    /// Terminal transition time
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Last fatal error
    pub error: Option<String>,
    /// Progress counters
    pub progress: MigrationProgress,
}

impl MigrationTask {
    /// New pending single-resource task
    #[must_use]
    pub fn single(resource: ResourceRef, target_version: impl Into<String>) -> Self {
        Self {
            id: TaskId::for_resource(&resource),
            kind: TaskKind::Single,
            source_version: None,
            target_version: target_version.into(),
            resources: vec![resource],
            status: MigrationStatus::Pending,
            start_time: chrono::Utc::now(),
            end_time: None,
            error: None,
            progress: MigrationProgress::new(1),
        }
    }

    /// New in-progress batch task
    #[must_use]
    pub fn batch(resources: Vec<ResourceRef>, target_version: impl Into<String>) -> Self {
        let total = resources.len();
        Self {
            id: TaskId::for_batch(total),
            kind: TaskKind::Batch,
            source_version: None,
            target_version: target_version.into(),
            resources,
            status: MigrationStatus::InProgress,
            start_time: chrono::Utc::now(),
            end_time: None,
            error: None,
            progress: MigrationProgress::new(total),
        }
    }

    /// Time since registration
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(chrono::Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }
}
