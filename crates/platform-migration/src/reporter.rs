//! Migration status reporting
//!
//! The reporter is a sink for task lifecycle and batch events. It:
//! - Keeps one [`MigrationReport`] per task and a bounded ring of recent events
//! - Forwards every event to registered [`StatusSink`]s
//! - Records counters, histograms and gauges through the `metrics` facade
//!
//! Reporting never fails the pipeline: sink errors are logged and dropped.

use crate::batch::{BatchConversionResult, BatchResultStatus};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::types::{MigrationProgress, MigrationStatus, MigrationTask, ResourceRef, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Kind of migration event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Task registered
    Started,
    /// Task completed
    Completed,
    /// Task failed
    Failed,
    /// Progress snapshot or batch results
    Progress,
    /// Resources rolled back
    Rollback,
}

impl EventType {
    /// Stable string form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "migration_started",
            Self::Completed => "migration_completed",
            Self::Failed => "migration_failed",
            Self::Progress => "migration_progress",
            Self::Rollback => "migration_rollback",
        }
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Normal lifecycle
    Info,
    /// Degraded but handled
    Warning,
    /// Failure
    Error,
}

impl EventLevel {
    /// Stable string form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One reported event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEvent {
    /// Unique event id
    pub id: String,
    /// Owning task
    pub task_id: TaskId,
    /// Event kind
    pub event_type: EventType,
    /// Severity
    pub level: EventLevel,
    /// Human-readable summary
    pub message: String,
    /// Structured details
    pub details: Value,
    /// Emission time
    pub timestamp: DateTime<Utc>,
}

/// Per-resource line of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMigrationDetail {
    /// The resource
    pub resource: ResourceRef,
    /// Version it was read at
    pub from_version: Option<String>,
    /// Target version
    pub to_version: String,
    /// Outcome
    pub status: BatchResultStatus,
    /// Time spent
    pub duration: Duration,
    /// Failure or skip reason
    pub error: Option<String>,
    /// Conflicting writes retried
    pub retry_count: u32,
}

/// Timing summary over reported resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Mean resource time
    pub average_duration: Duration,
    /// Fastest resource
    pub fastest: Option<Duration>,
    /// Slowest resource
    pub slowest: Option<Duration>,
}

/// Complete report of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Task identifier
    pub task_id: TaskId,
    /// Target version
    pub target_version: String,
    /// Task registration time
    pub start_time: DateTime<Utc>,
    /// Terminal time
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time`
    pub duration: Duration,
    /// Last reported status
    pub status: MigrationStatus,
    /// Resources in the task
    pub total_resources: usize,
    /// Migrated resources
    pub success_count: usize,
    /// Failed resources
    pub failure_count: usize,
    /// Skipped resources
    pub skipped_count: usize,
    /// Resources restored from snapshots
    pub rollback_count: usize,
    /// Events of this task, oldest first
    pub events: Vec<MigrationEvent>,
    /// Per-resource outcomes
    pub resource_details: Vec<ResourceMigrationDetail>,
    /// Timing summary over `resource_details`
    pub performance: PerformanceStats,
}

impl MigrationReport {
    fn for_task(task: &MigrationTask) -> Self {
        Self {
            task_id: task.id.clone(),
            target_version: task.target_version.clone(),
            start_time: task.start_time,
            end_time: task.end_time,
            duration: task.elapsed(),
            status: task.status,
            total_resources: task.resources.len(),
            success_count: task.progress.migrated_resources,
            failure_count: task.progress.failed_resources,
            skipped_count: task.progress.skipped_resources,
            rollback_count: 0,
            events: Vec::new(),
            resource_details: Vec::new(),
            performance: PerformanceStats::default(),
        }
    }

    fn refresh_performance(&mut self) {
        let durations: Vec<Duration> = self.resource_details.iter().map(|d| d.duration).collect();
        if durations.is_empty() {
            return;
        }
        let count = u32::try_from(durations.len()).unwrap_or(u32::MAX);
        self.performance = PerformanceStats {
            average_duration: durations.iter().sum::<Duration>() / count,
            fastest: durations.iter().min().copied(),
            slowest: durations.iter().max().copied(),
        };
    }
}

impl MigrationReport {
    /// Standalone HTML page: header, summary table, per-resource outcomes and events
    #[must_use]
    pub fn to_html(&self) -> String {
        let task_id = html_escape(self.task_id.as_str());
        let status_class = match self.status {
            MigrationStatus::Completed => "ok",
            MigrationStatus::Pending | MigrationStatus::InProgress => "running",
            MigrationStatus::Failed | MigrationStatus::RolledBack => "bad",
        };

        let mut html = String::from("<!DOCTYPE html>\n<html>\n<head>\n");
        html.push_str(&format!("<title>Migration Report - {task_id}</title>\n"));
        html.push_str(REPORT_STYLE);
        html.push_str("</head>\n<body>\n<div class=\"header\">\n<h1>Migration Report</h1>\n");
        html.push_str(&format!("<p>Task ID: {task_id}</p>\n"));
        html.push_str(&format!(
            "<p>Target version: {}</p>\n",
            html_escape(&self.target_version)
        ));
        html.push_str(&format!(
            "<p>Status: <span class=\"status-{status_class}\">{}</span></p>\n",
            self.status
        ));
        html.push_str(&format!("<p>Duration: {:?}</p>\n</div>\n", self.duration));

        html.push_str("<h2>Summary</h2>\n<table>\n");
        html.push_str("<tr><th>Total Resources</th><th>Success</th><th>Failed</th><th>Skipped</th><th>Rolled Back</th></tr>\n");
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n</table>\n",
            self.total_resources,
            self.success_count,
            self.failure_count,
            self.skipped_count,
            self.rollback_count
        ));

        if !self.resource_details.is_empty() {
            html.push_str("<h2>Resources</h2>\n<table>\n");
            html.push_str("<tr><th>Resource</th><th>From</th><th>To</th><th>Status</th><th>Duration</th><th>Retries</th><th>Error</th></tr>\n");
            for detail in &self.resource_details {
                html.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"result-{}\">{}</td><td>{:?}</td><td>{}</td><td>{}</td></tr>\n",
                    html_escape(&detail.resource.to_string()),
                    html_escape(detail.from_version.as_deref().unwrap_or("-")),
                    html_escape(&detail.to_version),
                    detail.status,
                    detail.status,
                    detail.duration,
                    detail.retry_count,
                    html_escape(detail.error.as_deref().unwrap_or("")),
                ));
            }
            html.push_str("</table>\n");
        }

        html.push_str("<h2>Events</h2>\n<table>\n");
        html.push_str("<tr><th>Time</th><th>Type</th><th>Level</th><th>Message</th></tr>\n");
        for event in &self.events {
            html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td class=\"event-{level}\">{level}</td><td>{}</td></tr>\n",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type.as_str(),
                html_escape(&event.message),
                level = event.level.as_str(),
            ));
        }
        html.push_str("</table>\n</body>\n</html>\n");
        html
    }
}

const REPORT_STYLE: &str = "<style>
body { font-family: Arial, sans-serif; margin: 20px; }
.header { background-color: #f0f0f0; padding: 10px; }
.status-ok, .result-success { color: green; }
.status-bad, .result-failed, .event-error { color: red; }
.status-running, .event-warning { color: orange; }
table { border-collapse: collapse; width: 100%; margin: 20px 0; }
th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }
th { background-color: #f2f2f2; }
</style>
";

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Error returned by a [`StatusSink`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("status sink error: {0}")]
pub struct SinkError(pub String);

/// Outward notification channel (status subresource, audit log, cluster events)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver one event
    async fn publish(&self, event: &MigrationEvent) -> Result<(), SinkError>;
}

/// Migration status reporter
pub struct MigrationStatusReporter {
    sinks: RwLock<Vec<Arc<dyn StatusSink>>>,
    reports: RwLock<HashMap<TaskId, MigrationReport>>,
    events: Mutex<VecDeque<MigrationEvent>>,
    max_events: usize,
    retention: Duration,
}

impl std::fmt::Debug for MigrationStatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStatusReporter")
            .field("sinks", &self.sinks.read().len())
            .field("reports", &self.reports.read().len())
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}

impl Default for MigrationStatusReporter {
    fn default() -> Self {
        Self::new(&MigrationConfig::default())
    }
}

impl MigrationStatusReporter {
    /// Create reporter with event capacity and retention from the config
    #[must_use]
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            reports: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::with_capacity(config.max_events.min(1024))),
            max_events: config.max_events.max(1),
            retention: config.report_retention(),
        }
    }

    /// Register an outward sink
    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.sinks.write().push(sink);
    }

    /// Report a newly registered task
    pub async fn report_migration_start(&self, task: &MigrationTask) {
        self.reports
            .write()
            .insert(task.id.clone(), MigrationReport::for_task(task));

        let message = format!(
            "Migration started for {} resources to version {}",
            task.resources.len(),
            task.target_version
        );
        let details = json!({
            "targetVersion": task.target_version,
            "resourceCount": task.resources.len(),
            "kind": task.kind,
        });
        self.emit(&task.id, EventType::Started, EventLevel::Info, message, details)
            .await;
    }

    /// Report a task that reached a terminal status
    pub async fn report_migration_complete(&self, task: &MigrationTask) {
        let (event_type, level) = match task.status {
            MigrationStatus::Failed => (EventType::Failed, EventLevel::Error),
            MigrationStatus::RolledBack => (EventType::Completed, EventLevel::Warning),
            _ => (EventType::Completed, EventLevel::Info),
        };
        let duration = task.elapsed();

        {
            let mut reports = self.reports.write();
            let report = reports
                .entry(task.id.clone())
                .or_insert_with(|| MigrationReport::for_task(task));
            report.end_time = task.end_time;
            report.duration = duration;
            report.status = task.status;
            report.success_count = task.progress.migrated_resources;
            report.failure_count = task.progress.failed_resources;
            report.skipped_count = task.progress.skipped_resources;
        }

        metrics::counter!(
            "migration_tasks_total",
            "status" => task.status.as_str(),
            "target_version" => task.target_version.clone()
        )
        .increment(1);
        metrics::histogram!("migration_task_duration_seconds", "target_version" => task.target_version.clone())
            .record(duration.as_secs_f64());

        let message = format!("Migration {} after {duration:?}", task.status);
        let details = json!({
            "status": task.status,
            "durationMs": millis(duration),
            "migratedCount": task.progress.migrated_resources,
            "failedCount": task.progress.failed_resources,
            "skippedCount": task.progress.skipped_resources,
            "error": task.error,
        });
        self.emit(&task.id, event_type, level, message, details).await;
    }

    /// Report a progress snapshot
    pub async fn report_progress(&self, task_id: &TaskId, progress: &MigrationProgress) {
        let target_version = self
            .reports
            .read()
            .get(task_id)
            .map_or_else(|| "unknown".to_string(), |r| r.target_version.clone());
        metrics::gauge!("migration_progress_ratio", "target_version" => target_version)
            .set(progress.ratio());

        let message = format!(
            "Processed {}/{} resources",
            progress.processed(),
            progress.total_resources
        );
        let details = json!({
            "migrated": progress.migrated_resources,
            "failed": progress.failed_resources,
            "skipped": progress.skipped_resources,
            "current": progress.current_resource.as_ref().map(ToString::to_string),
            "estimatedTimeLeftMs": millis(progress.estimated_time_left),
        });
        self.emit(task_id, EventType::Progress, EventLevel::Info, message, details)
            .await;
    }

    /// Report per-resource batch outcomes
    pub async fn report_batch_results(
        &self,
        task_id: &TaskId,
        target_version: &str,
        results: &[BatchConversionResult],
    ) {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let (success, failed, skipped) = (
            count(BatchResultStatus::Success),
            count(BatchResultStatus::Failed),
            count(BatchResultStatus::Skipped),
        );

        let details: Vec<ResourceMigrationDetail> = results
            .iter()
            .map(|r| ResourceMigrationDetail {
                resource: r.resource.clone(),
                from_version: r.source_version.clone(),
                to_version: target_version.to_string(),
                status: r.status,
                duration: r.duration,
                error: r.error.clone(),
                retry_count: r.retry_count,
            })
            .collect();

        if let Some(report) = self.reports.write().get_mut(task_id) {
            report.resource_details.extend(details);
            report.refresh_performance();
        }

        let level = if failed > 0 {
            EventLevel::Warning
        } else {
            EventLevel::Info
        };
        let message =
            format!("Batch completed: {success} success, {failed} failed, {skipped} skipped");
        let payload = json!({
            "successCount": success,
            "failureCount": failed,
            "skippedCount": skipped,
        });
        self.emit(task_id, EventType::Progress, level, message, payload)
            .await;
    }

    /// Report compensation after a cancel
    pub async fn report_rollback(&self, task_id: &TaskId, rolled_back: usize, failed: usize) {
        if let Some(report) = self.reports.write().get_mut(task_id) {
            report.rollback_count += rolled_back;
        }
        let level = if failed > 0 {
            EventLevel::Error
        } else {
            EventLevel::Warning
        };
        let message = format!("Rolled back {rolled_back} resources ({failed} rollback failures)");
        let details = json!({ "rolledBack": rolled_back, "rollbackFailures": failed });
        self.emit(task_id, EventType::Rollback, level, message, details)
            .await;
    }

    /// Copy of a task's report
    #[must_use]
    pub fn get_report(&self, task_id: &TaskId) -> Option<MigrationReport> {
        self.reports.read().get(task_id).cloned()
    }

    /// Copies of all reports, oldest first
    #[must_use]
    pub fn all_reports(&self) -> Vec<MigrationReport> {
        let mut reports: Vec<_> = self.reports.read().values().cloned().collect();
        reports.sort_by_key(|r| r.start_time);
        reports
    }

    /// The last `limit` events, oldest first
    #[must_use]
    pub fn recent_events(&self, limit: usize) -> Vec<MigrationEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Report as pretty-printed JSON
    ///
    /// # Errors
    /// `TaskNotFound` for unknown tasks, `Export` when serialization fails.
    pub fn export_report_json(&self, task_id: &TaskId) -> Result<String, MigrationError> {
        let report = self
            .get_report(task_id)
            .ok_or_else(|| MigrationError::TaskNotFound(task_id.clone()))?;
        Ok(serde_json::to_string_pretty(&report)?)
    }

    /// Report as a standalone HTML page
    ///
    /// # Errors
    /// `TaskNotFound` for unknown tasks.
    pub fn export_report_html(&self, task_id: &TaskId) -> Result<String, MigrationError> {
        self.get_report(task_id)
            .map(|report| report.to_html())
            .ok_or_else(|| MigrationError::TaskNotFound(task_id.clone()))
    }

    /// Drop finished reports older than the retention period
    pub fn evict_expired(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut reports = self.reports.write();
        let before = reports.len();
        reports.retain(|_, r| r.end_time.map_or(true, |end| end >= cutoff));
        let evicted = before - reports.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired migration reports");
        }
        evicted
    }

    async fn emit(
        &self,
        task_id: &TaskId,
        event_type: EventType,
        level: EventLevel,
        message: String,
        details: Value,
    ) {
        let event = MigrationEvent {
            id: format!("event-{}", Ulid::new()),
            task_id: task_id.clone(),
            event_type,
            level,
            message,
            details,
            timestamp: Utc::now(),
        };

        match level {
            EventLevel::Info => {
                tracing::info!(task_id = %task_id, event = event_type.as_str(), "{}", event.message);
            }
            EventLevel::Warning => {
                tracing::warn!(task_id = %task_id, event = event_type.as_str(), "{}", event.message);
            }
            EventLevel::Error => {
                tracing::error!(task_id = %task_id, event = event_type.as_str(), "{}", event.message);
            }
        }
        metrics::counter!("migration_events_total", "type" => event_type.as_str()).increment(1);

        {
            let mut events = self.events.lock();
            if events.len() == self.max_events {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        if let Some(report) = self.reports.write().get_mut(task_id) {
            report.events.push(event.clone());
        }

        let sinks = self.sinks.read().clone();
        for sink in sinks {
            if let Err(error) = sink.publish(&event).await {
                tracing::warn!(task_id = %task_id, %error, "Status sink failed");
            }
        }
    }
}
