//! Testing utilities for the platform migration workspace
//!
//! Shared fixtures, scripted stores and recording sinks.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use platform_migration::{
    ConversionError, ConversionRegistry, Document, EventType, InMemoryResourceStore,
    MigrationConfig, MigrationEvent, MigrationManager, ResourceRef, ResourceStore, SinkError,
    StatusSink, StoreError,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub const NAMESPACE: &str = "monitoring";
pub const SOURCE_VERSION: &str = "v1alpha1";
pub const TARGET_VERSION: &str = "v1beta1";

pub fn resource(name: &str) -> ResourceRef {
    ResourceRef::new(NAMESPACE, name)
}

pub fn resources(names: &[&str]) -> Vec<ResourceRef> {
    names.iter().map(|n| resource(n)).collect()
}

/// Healthy platform document at `version`
pub fn platform_doc(name: &str, version: &str) -> Document {
    Document::new(
        resource(name),
        version,
        json!({
            "metadata": {"labels": {"app": "observability"}},
            "spec": {
                "monitoring": {"prometheus": {"retention": "15d"}},
                "alerting": {"enabled": true}
            },
            "status": {
                "phase": "Ready",
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        }),
    )
}

/// Platform document in the given `status.phase`
pub fn platform_doc_in_phase(name: &str, version: &str, phase: &str) -> Document {
    let mut doc = platform_doc(name, version);
    doc.content["status"]["phase"] = Value::String(phase.to_string());
    doc
}

/// Converter that renames the version and fails for the listed names
#[derive(Debug, Default, Clone)]
pub struct FailingConverter {
    fail_for: HashSet<String>,
}

impl FailingConverter {
    pub fn new(names: &[&str]) -> Self {
        Self {
            fail_for: names.iter().map(|n| (*n).to_string()).collect(),
        }
    }
}

impl platform_migration::Converter for FailingConverter {
    fn convert(&self, document: &Document, target_version: &str) -> Result<Document, ConversionError> {
        if self.fail_for.contains(&document.reference.name) {
            return Err(ConversionError::Failed(format!(
                "cannot convert {}",
                document.reference
            )));
        }
        let mut converted = document.clone().with_version(target_version);
        converted.content["spec"]["migrated"] = Value::Bool(true);
        Ok(converted)
    }
}

/// Registry with a single source -> target converter
pub fn conversions_failing_for(names: &[&str]) -> ConversionRegistry {
    ConversionRegistry::new().with(SOURCE_VERSION, TARGET_VERSION, FailingConverter::new(names))
}

pub fn conversions() -> ConversionRegistry {
    conversions_failing_for(&[])
}

/// Store wrapper with scripted failures and call counters
#[derive(Debug, Default)]
pub struct ScriptedStore {
    inner: InMemoryResourceStore,
    conflicts: AtomicU32,
    racing_label: Mutex<Option<(String, String)>>,
    unavailable: Mutex<HashSet<ResourceRef>>,
    gets: AtomicUsize,
    updates: AtomicUsize,
    writes: AtomicUsize,
}

impl ScriptedStore {
    pub fn with_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        Self {
            inner: InMemoryResourceStore::with_documents(documents),
            ..Self::default()
        }
    }

    /// Fail the next `n` updates with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Before the next update, let another writer set a label on the stored
    /// document so the pending write loses the compare-and-swap
    pub fn race_next_update(&self, key: &str, value: &str) {
        *self.racing_label.lock() = Some((key.to_string(), value.to_string()));
    }

    /// Make reads of `resource` fail as unavailable
    pub fn fail_gets_for(&self, resource: ResourceRef) {
        self.unavailable.lock().insert(resource);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Update attempts, including conflicted ones
    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Updates that reached the underlying store
    pub fn successful_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn document(&self, resource: &ResourceRef) -> Option<Document> {
        self.inner.snapshot(resource)
    }

    pub fn inner(&self) -> &InMemoryResourceStore {
        &self.inner
    }
}

#[async_trait]
impl ResourceStore for ScriptedStore {
    async fn get(&self, resource: &ResourceRef) -> Result<Document, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.lock().contains(resource) {
            return Err(StoreError::Unavailable(format!("{resource} unreachable")));
        }
        self.inner.get(resource).await
    }

    async fn update(&self, document: Document) -> Result<Document, StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let race = self.racing_label.lock().take();
        if let Some((key, value)) = race {
            if let Some(mut current) = self.inner.snapshot(&document.reference) {
                current.content["metadata"]["labels"][key.as_str()] = Value::String(value);
                self.inner.insert(current);
            }
        }
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(StoreError::Conflict {
                resource: document.reference.clone(),
                expected: document.resource_version,
                actual: document.resource_version + 1,
            });
        }
        let stored = self.inner.update(document).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

/// Sink that keeps every published event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MigrationEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<MigrationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn publish(&self, event: &MigrationEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fast-retry configuration for tests
pub fn test_config() -> MigrationConfig {
    MigrationConfig::default().with_retry(3, std::time::Duration::from_millis(1))
}

/// Manager over a scripted store seeded with healthy source documents
pub fn setup_manager(
    names: &[&str],
    conversions: ConversionRegistry,
    config: MigrationConfig,
) -> (Arc<ScriptedStore>, MigrationManager) {
    let store = Arc::new(ScriptedStore::with_documents(
        names.iter().map(|n| platform_doc(n, SOURCE_VERSION)),
    ));
    let manager = MigrationManager::new(store.clone(), conversions, config)
        .expect("test config is valid");
    (store, manager)
}
