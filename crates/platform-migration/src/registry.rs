//! Task registry
//!
//! The only structure shared between the caller and background batch work.
//! Reads return owned copies; mutations go through closures that run under
//! the exclusive lock, so the lock can never be held across an `.await`.

use crate::error::MigrationError;
use crate::state_machine::validate_transition;
use crate::types::{MigrationStatus, MigrationTask, TaskId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Registry of migration tasks keyed by id
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, MigrationTask>>,
}

impl TaskRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, returning a copy
    pub fn insert(&self, task: MigrationTask) -> MigrationTask {
        self.tasks.write().insert(task.id.clone(), task.clone());
        task
    }

    /// Copy of a task
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<MigrationTask> {
        self.tasks.read().get(id).cloned()
    }

    /// Copies of every task, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<MigrationTask> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Number of registered tasks
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Check if no task is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Mutate a task under the exclusive lock
    pub fn update<R>(&self, id: &TaskId, f: impl FnOnce(&mut MigrationTask) -> R) -> Option<R> {
        self.tasks.write().get_mut(id).map(f)
    }

    /// Move a task to `to`, stamping the end time on terminal statuses
    ///
    /// # Errors
    /// `TaskNotFound`, or `InvalidState` when the transition is illegal.
    pub fn transition(
        &self,
        id: &TaskId,
        to: MigrationStatus,
        error: Option<String>,
    ) -> Result<MigrationTask, MigrationError> {
        self.update(id, |task| {
            validate_transition(task.status, to).map_err(|_| MigrationError::InvalidState {
                task_id: id.clone(),
                status: task.status,
                operation: "transition",
            })?;
            task.status = to;
            if to.is_terminal() {
                task.end_time = Some(chrono::Utc::now());
            }
            if error.is_some() {
                task.error = error;
            }
            Ok(task.clone())
        })
        .ok_or_else(|| MigrationError::TaskNotFound(id.clone()))?
    }

    /// Add outcomes to a task's progress
    ///
    /// Outcomes past the resource total are clamped and logged. A terminal
    /// task's progress is frozen; late outcomes are logged and dropped.
    pub fn record_progress(
        &self,
        id: &TaskId,
        migrated: usize,
        failed: usize,
        skipped: usize,
    ) -> Option<MigrationTask> {
        self.update(id, |task| {
            if task.status.is_terminal() {
                tracing::debug!(
                    task_id = %id,
                    status = %task.status,
                    migrated,
                    failed,
                    skipped,
                    "Task already terminal, dropping progress update"
                );
                return task.clone();
            }
            let elapsed = task.elapsed();
            if task.progress.record(migrated, failed, skipped, elapsed) {
                tracing::warn!(
                    task_id = %id,
                    migrated,
                    failed,
                    skipped,
                    total = task.progress.total_resources,
                    "Progress update exceeded resource total, clamped"
                );
            }
            task.progress.current_resource = None;
            task.clone()
        })
    }

    /// Remove terminal tasks that ended more than `older_than` ago
    pub fn evict_finished(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - age;
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.end_time.is_some_and(|end| end < cutoff))
        });
        before - tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceRef;
    use proptest::prelude::*;

    fn single() -> MigrationTask {
        MigrationTask::single(ResourceRef::new("default", "obs"), "v1beta1")
    }

    #[test]
    fn reads_are_copies() {
        let registry = TaskRegistry::new();
        let task = registry.insert(single());

        let mut copy = registry.get(&task.id).unwrap();
        copy.status = MigrationStatus::Completed;
        copy.progress.migrated_resources = 1;

        let stored = registry.get(&task.id).unwrap();
        assert_eq!(stored.status, MigrationStatus::Pending);
        assert_eq!(stored.progress.migrated_resources, 0);
    }

    #[test]
    fn transitions_follow_state_machine() {
        let registry = TaskRegistry::new();
        let task = registry.insert(single());

        assert!(registry
            .transition(&task.id, MigrationStatus::Completed, None)
            .is_err());
        registry
            .transition(&task.id, MigrationStatus::InProgress, None)
            .unwrap();
        let done = registry
            .transition(&task.id, MigrationStatus::Completed, None)
            .unwrap();
        assert!(done.end_time.is_some());

        let err = registry
            .transition(&task.id, MigrationStatus::Failed, Some("late".into()))
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidState { .. }));
        assert!(registry.get(&task.id).unwrap().error.is_none());
    }

    #[test]
    fn unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        let err = registry
            .transition(&TaskId::from("nope"), MigrationStatus::Failed, None)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.record_progress(&TaskId::from("nope"), 1, 0, 0).is_none());
    }

    #[test]
    fn terminal_progress_is_frozen() {
        let registry = TaskRegistry::new();
        let task = registry.insert(single());
        registry
            .transition(&task.id, MigrationStatus::InProgress, None)
            .unwrap();
        registry
            .transition(&task.id, MigrationStatus::Failed, Some("stopped".into()))
            .unwrap();

        let snapshot = registry.record_progress(&task.id, 1, 0, 0).unwrap();
        assert_eq!(snapshot.progress.processed(), 0);
        assert_eq!(registry.get(&task.id).unwrap().progress.migrated_resources, 0);
    }

    #[test]
    fn evicts_only_old_terminal_tasks() {
        let registry = TaskRegistry::new();
        let running = registry.insert(single());
        let mut old = single();
        old.status = MigrationStatus::Failed;
        old.end_time = Some(chrono::Utc::now() - chrono::Duration::hours(2));
        registry.insert(old);

        assert_eq!(registry.evict_finished(Duration::from_secs(3600)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&running.id).is_some());
    }

    proptest! {
        #[test]
        fn progress_never_exceeds_total(
            total in 0usize..20,
            updates in proptest::collection::vec((0usize..5, 0usize..5, 0usize..5), 0..12),
        ) {
            let registry = TaskRegistry::new();
            let resources = (0..total.max(1))
                .map(|i| ResourceRef::new("default", format!("r{i}")))
                .collect();
            let task = registry.insert(MigrationTask::batch(resources, "v1beta1"));

            for (m, f, s) in updates {
                let snapshot = registry.record_progress(&task.id, m, f, s).unwrap();
                prop_assert!(snapshot.progress.processed() <= snapshot.progress.total_resources);
            }
        }
    }
}
