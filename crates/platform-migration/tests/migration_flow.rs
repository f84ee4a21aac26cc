//! End-to-end migration flows against a scripted store

use async_trait::async_trait;
use platform_migration::{
    BatchResultStatus, Document, DocumentOptimizer, EventType, HookPhase, LifecycleError,
    LifecycleHook, MigrationConfig, MigrationError, MigrationManager, MigrationStatus,
    MigrationValidator,
};
use platform_migration_test_utils::{
    conversions, conversions_failing_for, platform_doc, platform_doc_in_phase, resource,
    resources, setup_manager, test_config, RecordingSink, ScriptedStore, SOURCE_VERSION,
    TARGET_VERSION,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn conflicts_below_retry_limit_complete() {
    let (store, manager) = setup_manager(&["p1"], conversions(), test_config());
    store.inject_conflicts(3);

    manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();

    assert_eq!(store.update_calls(), 4);
    assert_eq!(store.successful_writes(), 1);
    assert_eq!(store.document(&resource("p1")).unwrap().version(), TARGET_VERSION);
    let task = manager.list_active_migrations().remove(0);
    assert_eq!(task.status, MigrationStatus::Completed);
}

#[tokio::test]
async fn conflicts_past_retry_limit_fail_without_write() {
    let (store, manager) = setup_manager(&["p1"], conversions(), test_config());
    store.inject_conflicts(4);

    let err = manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ConflictRetriesExhausted { attempts: 4, .. }
    ));
    assert_eq!(store.successful_writes(), 0);
    assert_eq!(store.document(&resource("p1")).unwrap().version(), SOURCE_VERSION);

    let task = manager.list_active_migrations().remove(0);
    assert_eq!(task.status, MigrationStatus::Failed);
    assert_eq!(task.progress.failed_resources, 1);
    assert!(task.error.unwrap().contains("persisted after 4 attempts"));
}

#[tokio::test]
async fn dry_run_never_writes() {
    let (store, manager) = setup_manager(&["p1"], conversions(), test_config().with_dry_run(true));

    manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();

    assert_eq!(store.update_calls(), 0);
    assert_eq!(store.document(&resource("p1")).unwrap().version(), SOURCE_VERSION);
    assert_eq!(
        manager.list_active_migrations()[0].status,
        MigrationStatus::Completed
    );
    let history = manager.tracker().history(&resource("p1"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, SOURCE_VERSION);
    assert_eq!(history[0].to, TARGET_VERSION);
    assert_eq!(manager.lifecycle().snapshot_count(), 0);
}

#[tokio::test]
async fn unhealthy_platform_is_ineligible() {
    let store = Arc::new(ScriptedStore::with_documents([platform_doc_in_phase(
        "p1",
        SOURCE_VERSION,
        "Upgrading",
    )]));
    let manager =
        platform_migration::MigrationManager::new(store.clone(), conversions(), test_config())
            .unwrap();

    let err = manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Ineligible { .. }));
    assert_eq!(store.update_calls(), 0);
    assert!(!manager.lifecycle().is_in_flight(&resource("p1")));
}

#[tokio::test]
async fn status_reads_are_copies() {
    let (_, manager) = setup_manager(&["p1"], conversions(), test_config());
    manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();
    let id = manager.list_active_migrations()[0].id.clone();

    let mut copy = manager.get_migration_status(&id).unwrap();
    copy.status = MigrationStatus::Failed;
    copy.progress.failed_resources = 7;

    let stored = manager.get_migration_status(&id).unwrap();
    assert_eq!(stored.status, MigrationStatus::Completed);
    assert_eq!(stored.progress.failed_resources, 0);
}

/// Optimizer stub that either declines or hands back a rebuilt equivalent
struct StubOptimizer {
    rebuild: bool,
    calls: AtomicUsize,
}

impl StubOptimizer {
    fn new(rebuild: bool) -> Arc<Self> {
        Arc::new(Self {
            rebuild,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentOptimizer for StubOptimizer {
    async fn optimize(&self, document: &Document, _target_version: &str) -> Option<Document> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rebuild.then(|| {
            Document::new(
                document.reference.clone(),
                document.api_version.clone(),
                document.content.clone(),
            )
        })
    }
}

async fn migrate_with_optimizer(
    optimizer: Arc<StubOptimizer>,
    config: MigrationConfig,
) -> Document {
    let store = Arc::new(ScriptedStore::with_documents([platform_doc("p1", SOURCE_VERSION)]));
    let manager = MigrationManager::builder(store.clone(), conversions())
        .config(config)
        .optimizer(optimizer)
        .build()
        .unwrap();
    manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();
    store.document(&resource("p1")).unwrap()
}

#[tokio::test]
async fn optimization_never_changes_the_stored_document() {
    let declining = StubOptimizer::new(false);
    let disabled =
        migrate_with_optimizer(declining.clone(), test_config().with_optimizations(false)).await;
    assert_eq!(declining.calls(), 0);

    let rebuilding = StubOptimizer::new(true);
    let rebuilt =
        migrate_with_optimizer(rebuilding.clone(), test_config().with_optimizations(true)).await;
    assert_eq!(rebuilding.calls(), 1);

    let declined_enabled = StubOptimizer::new(false);
    let declined =
        migrate_with_optimizer(declined_enabled.clone(), test_config().with_optimizations(true))
            .await;
    assert_eq!(declined_enabled.calls(), 1);

    assert_eq!(rebuilt, disabled);
    assert_eq!(declined, disabled);
    assert_eq!(disabled.version(), TARGET_VERSION);
    assert_eq!(disabled.pointer("/spec/migrated"), Some(&json!(true)));
}

#[tokio::test]
async fn built_in_optimizer_keeps_converted_spec() {
    let mut doc = platform_doc("p1", SOURCE_VERSION);
    doc.content["metadata"]["managedFields"] = json!([{"manager": "kubectl"}]);
    let plain_store = Arc::new(ScriptedStore::with_documents([doc.clone()]));
    let optimized_store = Arc::new(ScriptedStore::with_documents([doc]));
    let plain = MigrationManager::new(
        plain_store.clone(),
        conversions(),
        test_config().with_optimizations(false),
    )
    .unwrap();
    let optimized = MigrationManager::new(
        optimized_store.clone(),
        conversions(),
        test_config().with_optimizations(true),
    )
    .unwrap();

    plain.migrate_resource(&resource("p1"), TARGET_VERSION).await.unwrap();
    optimized
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();

    let a = plain_store.document(&resource("p1")).unwrap();
    let b = optimized_store.document(&resource("p1")).unwrap();
    assert_eq!(a.version(), b.version());
    assert_eq!(a.spec(), b.spec());
    assert_eq!(a.pointer("/status"), b.pointer("/status"));
    assert!(a.pointer("/metadata/managedFields").is_some());
    assert!(b.pointer("/metadata/managedFields").is_none());
}

#[tokio::test]
async fn status_snapshots_do_not_follow_running_batch() {
    let names = ["p0", "p1", "p2"];
    let config = test_config().with_batch_size(1).with_max_concurrent(1);
    let (_, manager) = setup_manager(&names, conversions(), config);
    manager
        .lifecycle()
        .register_hook(TARGET_VERSION, SlowHook(Duration::from_millis(30)));

    let task = manager
        .migrate_batch(resources(&names), TARGET_VERSION)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = manager.get_migration_status(&task.id).unwrap();
    let listed = manager.list_active_migrations();
    assert_eq!(listed.len(), 1);

    let done = manager.wait_for_completion(&task.id, WAIT).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(done.progress.migrated_resources, 3);

    for snapshot in [&status, &listed[0]] {
        assert_eq!(snapshot.status, MigrationStatus::InProgress);
        assert_eq!(snapshot.progress.processed(), 0);
        assert!(snapshot.end_time.is_none());
    }
}

#[tokio::test]
async fn lost_race_keeps_concurrent_write() {
    let config = test_config().with_retry(0, Duration::from_millis(1));
    let (store, manager) = setup_manager(&["p1"], conversions(), config);
    store.race_next_update("owner", "other-controller");

    let err = manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ConflictRetriesExhausted { attempts: 1, .. }
    ));
    assert_eq!(store.successful_writes(), 0);
    let stored = store.document(&resource("p1")).unwrap();
    assert_eq!(stored.version(), SOURCE_VERSION);
    assert_eq!(
        stored.pointer("/metadata/labels/owner"),
        Some(&json!("other-controller"))
    );
    assert_eq!(stored.pointer("/metadata/labels/app"), Some(&json!("observability")));
}

struct RejectAfterWrite;

#[async_trait]
impl MigrationValidator for RejectAfterWrite {
    fn name(&self) -> &str {
        "reject-after-write"
    }

    async fn validate_post(&self, _: &Document, _: &str) -> Result<(), LifecycleError> {
        Err(LifecycleError::ValidationFailed {
            check: "reject-after-write".into(),
            reason: "rejected".into(),
        })
    }
}

#[tokio::test]
async fn rollback_restores_document_read_on_retry() {
    let (store, manager) = setup_manager(&["p1"], conversions(), test_config());
    manager
        .lifecycle()
        .register_validator(TARGET_VERSION, RejectAfterWrite);
    store.race_next_update("owner", "other-controller");

    let err = manager
        .migrate_resource(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::ValidationFailed { .. }));
    assert_eq!(
        store.document(&resource("p1")).unwrap().version(),
        TARGET_VERSION
    );

    assert!(manager
        .lifecycle()
        .rollback_migration(&resource("p1"))
        .await
        .unwrap());

    assert_eq!(store.successful_writes(), 2);
    let stored = store.document(&resource("p1")).unwrap();
    assert_eq!(stored.version(), SOURCE_VERSION);
    assert!(stored.pointer("/spec/migrated").is_none());
    assert_eq!(
        stored.pointer("/metadata/labels/owner"),
        Some(&json!("other-controller"))
    );
}

#[tokio::test]
async fn batch_with_one_conversion_failure() {
    let names = ["p0", "p1", "p2", "p3", "p4"];
    let (store, manager) = setup_manager(&names, conversions_failing_for(&["p2"]), test_config());
    let sink = Arc::new(RecordingSink::default());
    manager.reporter().add_sink(sink.clone());

    let task = manager
        .migrate_batch(resources(&names), TARGET_VERSION)
        .await
        .unwrap();
    let done = manager.wait_for_completion(&task.id, WAIT).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(done.progress.migrated_resources, 4);
    assert_eq!(done.progress.failed_resources, 1);
    assert_eq!(done.progress.processed(), done.progress.total_resources);
    assert!(done.error.unwrap().contains("1 failures out of 5"));
    assert_eq!(store.document(&resource("p2")).unwrap().version(), SOURCE_VERSION);

    let report = manager.reporter().get_report(&task.id).unwrap();
    let outcome = |status: BatchResultStatus| {
        report
            .resource_details
            .iter()
            .filter(|d| d.status == status)
            .count()
    };
    assert_eq!(outcome(BatchResultStatus::Success), 4);
    assert_eq!(outcome(BatchResultStatus::Failed), 1);
    assert_eq!(report.status, MigrationStatus::Failed);

    assert_eq!(sink.of_type(EventType::Started).len(), 1);
    assert_eq!(sink.of_type(EventType::Failed).len(), 1);
    assert_eq!(manager.lifecycle().snapshot_count(), 0);
}

#[tokio::test]
async fn batch_skips_missing_and_current_resources() {
    let (store, manager) = setup_manager(&["p0"], conversions(), test_config());
    store
        .inner()
        .insert(platform_doc("current", TARGET_VERSION));

    let task = manager
        .migrate_batch(resources(&["p0", "current", "ghost"]), TARGET_VERSION)
        .await
        .unwrap();
    let done = manager.wait_for_completion(&task.id, WAIT).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(done.progress.migrated_resources, 1);
    assert_eq!(done.progress.skipped_resources, 2);
}

#[tokio::test]
async fn cancelling_completed_batch_is_rejected() {
    let names = ["p0", "p1"];
    let (store, manager) = setup_manager(&names, conversions(), test_config());
    let task = manager
        .migrate_batch(resources(&names), TARGET_VERSION)
        .await
        .unwrap();
    manager.wait_for_completion(&task.id, WAIT).await.unwrap();

    let err = manager.cancel_migration(&task.id).await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::InvalidState {
            status: MigrationStatus::Completed,
            ..
        }
    ));
    for name in names {
        assert_eq!(store.document(&resource(name)).unwrap().version(), TARGET_VERSION);
    }
    assert_eq!(manager.reporter().get_report(&task.id).unwrap().rollback_count, 0);
}

struct SlowHook(Duration);

#[async_trait]
impl LifecycleHook for SlowHook {
    fn name(&self) -> &str {
        "slow"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    async fn execute(&self, _document: &mut Document) -> Result<(), LifecycleError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

#[tokio::test]
async fn cancelled_batch_stays_rolled_back() {
    let names = ["p0", "p1", "p2", "p3"];
    let config = test_config().with_batch_size(1).with_max_concurrent(1);
    let (store, manager) = setup_manager(&names, conversions(), config);
    manager
        .lifecycle()
        .register_hook(TARGET_VERSION, SlowHook(Duration::from_millis(50)));

    let task = manager
        .migrate_batch(resources(&names), TARGET_VERSION)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.cancel_migration(&task.id).await.unwrap();

    let cancelled = manager.get_migration_status(&task.id).unwrap();
    assert_eq!(cancelled.status, MigrationStatus::RolledBack);
    assert!(cancelled.end_time.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = manager.get_migration_status(&task.id).unwrap();
    assert_eq!(after.status, MigrationStatus::RolledBack);
    assert_eq!(after.progress.processed(), 0);
    assert_eq!(after.end_time, cancelled.end_time);
    let migrated = names
        .iter()
        .filter(|n| store.document(&resource(n)).unwrap().version() == TARGET_VERSION)
        .count();
    assert!(migrated <= 1);

    let rollbacks = manager
        .reporter()
        .recent_events(100)
        .into_iter()
        .filter(|e| e.task_id == task.id && e.event_type == EventType::Rollback)
        .count();
    assert_eq!(rollbacks, 1);
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let store = Arc::new(ScriptedStore::with_documents([platform_doc("p1", SOURCE_VERSION)]));
    let lifecycle = platform_migration::LifecycleIntegrationManager::new(store.clone());

    let lease = lifecycle
        .pre_migration_check(&resource("p1"), TARGET_VERSION)
        .await
        .unwrap();
    drop(lease);
    let written = store
        .inner()
        .insert(platform_doc("p1", SOURCE_VERSION).with_version(TARGET_VERSION));
    lifecycle.record_write(&written);

    assert!(lifecycle.rollback_migration(&resource("p1")).await.unwrap());
    let restored = store.document(&resource("p1")).unwrap();
    assert_eq!(restored.version(), SOURCE_VERSION);

    assert!(!lifecycle.rollback_migration(&resource("p1")).await.unwrap());
    assert_eq!(store.document(&resource("p1")).unwrap(), restored);
}

#[tokio::test]
async fn store_outage_fails_batch_resource() {
    let names = ["p0", "p1"];
    let (store, manager) = setup_manager(&names, conversions(), test_config());
    store.fail_gets_for(resource("p1"));

    let task = manager
        .migrate_batch(resources(&names), TARGET_VERSION)
        .await
        .unwrap();
    let done = manager.wait_for_completion(&task.id, WAIT).await.unwrap();

    assert_eq!(done.status, MigrationStatus::Failed);
    assert_eq!(done.progress.migrated_resources, 1);
    assert_eq!(done.progress.failed_resources, 1);
}
