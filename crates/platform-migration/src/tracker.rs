//! Schema evolution tracking
//!
//! Pure in-memory bookkeeping:
//! - Append-only per-resource log of observed version transitions
//! - Migration analytics (totals, per-path counts, error patterns)
//! - Catalog of known schema versions and registered migration paths
//!
//! Nothing here calls out of the process; every operation takes one short
//! lock and returns.

use crate::error::MigrationError;
use crate::types::ResourceRef;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

/// One observed version transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Version the resource was read at
    pub from: String,
    /// Version it was migrated towards
    pub to: String,
    /// When the transition was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Kind of field change between versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Field introduced
    Added,
    /// Field dropped
    Removed,
    /// Field type or semantics changed
    Modified,
    /// Field moved to another path
    Moved,
    /// Field renamed in place
    Renamed,
    /// Field still accepted but scheduled for removal
    Deprecated,
}

/// Field-level change introduced by a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Kind of change
    pub change: ChangeType,
    /// Path in the previous version
    pub old_path: Option<String>,
    /// Path in this version
    pub new_path: Option<String>,
    /// Free-form description
    pub description: String,
}

/// Known schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Version string
    pub version: String,
    /// Release date
    pub release_date: DateTime<Utc>,
    /// Deprecation date, if deprecated
    pub deprecated_date: Option<DateTime<Utc>>,
    /// Removal date; the version is unsupported from then on
    pub removal_date: Option<DateTime<Utc>>,
    /// Deprecated field paths
    pub deprecated_fields: Vec<String>,
    /// Field changes relative to the previous version
    pub field_changes: Vec<FieldChange>,
}

impl VersionInfo {
    /// New version released now, never deprecated
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            release_date: Utc::now(),
            deprecated_date: None,
            removal_date: None,
            deprecated_fields: Vec::new(),
            field_changes: Vec::new(),
        }
    }

    /// With removal date
    #[inline]
    #[must_use]
    pub fn removed_at(mut self, date: DateTime<Utc>) -> Self {
        self.removal_date = Some(date);
        self
    }

    /// With deprecation date and deprecated fields
    #[must_use]
    pub fn deprecated_at(mut self, date: DateTime<Utc>, fields: Vec<String>) -> Self {
        self.deprecated_date = Some(date);
        self.deprecated_fields = fields;
        self
    }

    /// Check if the version is still served at `now`
    #[inline]
    #[must_use]
    pub fn is_supported_at(&self, now: DateTime<Utc>) -> bool {
        self.removal_date.map_or(true, |removal| now < removal)
    }
}

/// Estimated effort of a migration path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Mechanical
    Simple,
    /// Some restructuring
    Moderate,
    /// Lossy or manual steps
    Complex,
}

/// Registered direct migration path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPath {
    /// Source version
    pub from: String,
    /// Target version
    pub to: String,
    /// Estimated effort
    pub complexity: Complexity,
    /// Whether fields are dropped on the way
    pub data_loss_risk: bool,
    /// Whether an operator must intervene
    pub requires_manual: bool,
}

impl MigrationPath {
    /// Simple lossless path
    #[must_use]
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            complexity: Complexity::Simple,
            data_loss_risk: false,
            requires_manual: false,
        }
    }
}

/// Aggregated migration statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationAnalytics {
    /// Transitions recorded
    pub total_migrations: u64,
    /// Migrations that finished successfully
    pub successful_migrations: u64,
    /// Migrations that failed
    pub failed_migrations: u64,
    /// Transition counts keyed `from->to`
    pub common_paths: BTreeMap<String, u64>,
    /// Failure counts keyed `from->to: stage`
    pub error_patterns: BTreeMap<String, u64>,
    /// Running average over finished migrations
    pub average_duration: Duration,
}

#[derive(Debug, Default)]
struct TrackerState {
    history: HashMap<ResourceRef, Vec<TransitionRecord>>,
    analytics: MigrationAnalytics,
    versions: BTreeMap<String, VersionInfo>,
    paths: BTreeMap<(String, String), MigrationPath>,
}

/// Schema evolution tracker
#[derive(Debug, Default)]
pub struct SchemaEvolutionTracker {
    state: RwLock<TrackerState>,
}

fn path_key(from: &str, to: &str) -> String {
    format!("{from}->{to}")
}

impl SchemaEvolutionTracker {
    /// Create empty tracker
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed transition for `resource`
    pub fn record_migration(&self, from: &str, to: &str, resource: &ResourceRef) {
        let mut state = self.state.write();
        state
            .history
            .entry(resource.clone())
            .or_default()
            .push(TransitionRecord {
                from: from.to_string(),
                to: to.to_string(),
                recorded_at: Utc::now(),
            });
        state.analytics.total_migrations += 1;
        *state
            .analytics
            .common_paths
            .entry(path_key(from, to))
            .or_default() += 1;
        drop(state);

        tracing::debug!(%resource, from, to, "Recorded migration");
    }

    /// Transitions recorded for `resource`, oldest first
    #[must_use]
    pub fn history(&self, resource: &ResourceRef) -> Vec<TransitionRecord> {
        self.state
            .read()
            .history
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of resources with at least one recorded transition
    #[must_use]
    pub fn tracked_resources(&self) -> usize {
        self.state.read().history.len()
    }

    /// Record a successful migration
    pub fn record_success(&self, duration: Duration) {
        let mut state = self.state.write();
        let analytics = &mut state.analytics;
        analytics.successful_migrations += 1;
        analytics.average_duration = running_average(analytics, duration);
    }

    /// Record a failed migration, bucketed by pipeline stage
    pub fn record_failure(&self, from: &str, to: &str, error: &MigrationError) {
        let pattern = format!("{}: {:?}", path_key(from, to), error.stage());
        let mut state = self.state.write();
        state.analytics.failed_migrations += 1;
        *state.analytics.error_patterns.entry(pattern).or_default() += 1;
    }

    /// Copy of the current analytics
    #[must_use]
    pub fn analytics(&self) -> MigrationAnalytics {
        self.state.read().analytics.clone()
    }

    /// Analytics as pretty-printed JSON
    ///
    /// # Errors
    /// Serialization failure.
    pub fn export_analytics(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.analytics())
    }

    /// Add or replace a version in the catalog
    pub fn register_version(&self, info: VersionInfo) {
        self.state.write().versions.insert(info.version.clone(), info);
    }

    /// Catalog entry for a version
    #[must_use]
    pub fn version_info(&self, version: &str) -> Option<VersionInfo> {
        self.state.read().versions.get(version).cloned()
    }

    /// Check if a version is known and not yet removed
    #[must_use]
    pub fn is_version_supported(&self, version: &str) -> bool {
        self.state
            .read()
            .versions
            .get(version)
            .is_some_and(|info| info.is_supported_at(Utc::now()))
    }

    /// Known versions that are still served
    #[must_use]
    pub fn supported_versions(&self) -> Vec<String> {
        let now = Utc::now();
        self.state
            .read()
            .versions
            .values()
            .filter(|info| info.is_supported_at(now))
            .map(|info| info.version.clone())
            .collect()
    }

    /// Deprecated field paths of a version
    #[must_use]
    pub fn deprecated_fields(&self, version: &str) -> Vec<String> {
        self.state
            .read()
            .versions
            .get(version)
            .map(|info| info.deprecated_fields.clone())
            .unwrap_or_default()
    }

    /// Register a direct migration path
    pub fn register_path(&self, path: MigrationPath) {
        self.state
            .write()
            .paths
            .insert((path.from.clone(), path.to.clone()), path);
    }

    /// Registered direct path, if any
    #[must_use]
    pub fn direct_path(&self, from: &str, to: &str) -> Option<MigrationPath> {
        self.state
            .read()
            .paths
            .get(&(from.to_string(), to.to_string()))
            .cloned()
    }

    /// Shortest chain of versions from `from` to `to` over registered paths
    ///
    /// The result starts with `from` and ends with `to`; `None` when
    /// unreachable.
    #[must_use]
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to {
            return Some(vec![from.to_string()]);
        }

        let state = self.state.read();
        let mut parents: HashMap<&str, &str> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            for (src, dst) in state.paths.keys() {
                if src != current || !visited.insert(dst.as_str()) {
                    continue;
                }
                parents.insert(dst.as_str(), current);
                if dst == to {
                    let mut chain = vec![to.to_string()];
                    let mut cursor = to;
                    while let Some(parent) = parents.get(cursor) {
                        chain.push((*parent).to_string());
                        cursor = *parent;
                    }
                    chain.reverse();
                    return Some(chain);
                }
                queue.push_back(dst.as_str());
            }
        }
        None
    }
}

fn running_average(analytics: &MigrationAnalytics, sample: Duration) -> Duration {
    let finished = analytics.successful_migrations + analytics.failed_migrations;
    if analytics.average_duration.is_zero() || finished <= 1 {
        return sample;
    }
    let finished = u32::try_from(finished).unwrap_or(u32::MAX);
    (analytics.average_duration * (finished - 1) + sample) / finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn resource() -> ResourceRef {
        ResourceRef::new("monitoring", "platform")
    }

    #[test]
    fn history_is_append_only_and_per_resource() {
        let tracker = SchemaEvolutionTracker::new();
        tracker.record_migration("v1alpha1", "v1beta1", &resource());
        tracker.record_migration("v1beta1", "v1", &resource());
        tracker.record_migration("v1alpha1", "v1beta1", &ResourceRef::new("other", "x"));

        let history = tracker.history(&resource());
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, "v1alpha1");
        assert_eq!(history[1].to, "v1");
        assert_eq!(tracker.tracked_resources(), 2);

        let analytics = tracker.analytics();
        assert_eq!(analytics.total_migrations, 3);
        assert_eq!(analytics.common_paths["v1alpha1->v1beta1"], 2);
    }

    #[test]
    fn unknown_resource_has_empty_history() {
        let tracker = SchemaEvolutionTracker::new();
        assert!(tracker.history(&resource()).is_empty());
    }

    #[test]
    fn outcomes_update_analytics() {
        let tracker = SchemaEvolutionTracker::new();
        tracker.record_success(Duration::from_millis(100));
        tracker.record_success(Duration::from_millis(300));
        tracker.record_failure(
            "v1alpha1",
            "v1beta1",
            &MigrationError::ResourceNotFound(resource()),
        );

        let analytics = tracker.analytics();
        assert_eq!(analytics.successful_migrations, 2);
        assert_eq!(analytics.failed_migrations, 1);
        assert_eq!(analytics.average_duration, Duration::from_millis(200));
        assert_eq!(analytics.error_patterns["v1alpha1->v1beta1: Store"], 1);

        let json = tracker.export_analytics().unwrap();
        assert!(json.contains("successful_migrations"));
    }

    #[test]
    fn removed_versions_are_unsupported() {
        let tracker = SchemaEvolutionTracker::new();
        tracker.register_version(VersionInfo::new("v1beta1"));
        tracker.register_version(
            VersionInfo::new("v1alpha1").removed_at(Utc::now() - TimeDelta::days(1)),
        );

        assert!(tracker.is_version_supported("v1beta1"));
        assert!(!tracker.is_version_supported("v1alpha1"));
        assert!(!tracker.is_version_supported("v9"));
        assert_eq!(tracker.supported_versions(), vec!["v1beta1".to_string()]);
    }

    #[test]
    fn find_path_walks_registered_paths() {
        let tracker = SchemaEvolutionTracker::new();
        tracker.register_path(MigrationPath::direct("v1alpha1", "v1beta1"));
        tracker.register_path(MigrationPath::direct("v1beta1", "v1"));
        tracker.register_path(MigrationPath::direct("v1alpha1", "v1alpha2"));

        assert_eq!(
            tracker.find_path("v1alpha1", "v1"),
            Some(vec!["v1alpha1".into(), "v1beta1".into(), "v1".into()])
        );
        assert_eq!(tracker.find_path("v1", "v1alpha1"), None);
        assert_eq!(tracker.find_path("v1", "v1"), Some(vec!["v1".into()]));
        assert!(tracker.direct_path("v1beta1", "v1").is_some());
    }
}
