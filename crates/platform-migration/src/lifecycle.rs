//! Lifecycle integration
//!
//! Surrounds each conversion with:
//! - Pre-migration checks (in-flight guard, supported version, validators, health)
//! - Snapshots taken before any mutation, keyed by resource
//! - Per-version hooks run on the converted document before it is written
//! - Post-migration validation (validators plus integrity check)
//! - Idempotent rollback from the snapshot, limited to the migration's own write

use crate::error::LifecycleError;
use crate::store::ResourceStore;
use crate::types::{Document, ResourceRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Platform phases that block a migration
const BLOCKING_PHASES: [&str; 3] = ["Failed", "Unknown", "Upgrading"];

/// When a hook runs relative to the write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    /// First pass over the converted document
    Pre,
    /// Second pass, after every pre hook succeeded
    Post,
}

/// Hook run on a converted document before it is written
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Hook name
    fn name(&self) -> &str;

    /// Phase the hook belongs to
    fn phase(&self) -> HookPhase;

    /// Inspect or adjust the converted document
    async fn execute(&self, document: &mut Document) -> Result<(), LifecycleError>;
}

/// Migration readiness and result validator
#[async_trait]
pub trait MigrationValidator: Send + Sync {
    /// Validator name
    fn name(&self) -> &str;

    /// Validate the document before migrating it to `target_version`
    async fn validate_pre(
        &self,
        _document: &Document,
        _target_version: &str,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Validate the stored document after the migration
    async fn validate_post(
        &self,
        _document: &Document,
        _target_version: &str,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }
}

/// Copy of a resource taken before it was migrated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Document as read before the migration
    pub document: Document,
    /// Capture time
    pub taken_at: DateTime<Utc>,
    /// SHA-256 of version and content
    pub checksum: String,
    /// Resource version produced by the migration's own write
    #[serde(default)]
    pub written_version: Option<u64>,
}

impl ResourceSnapshot {
    fn capture(document: &Document) -> Self {
        Self {
            document: document.clone(),
            taken_at: Utc::now(),
            checksum: checksum(document),
            written_version: None,
        }
    }
}

/// Hex SHA-256 over a document's version and content
#[must_use]
pub fn checksum(document: &Document) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.api_version.as_bytes());
    hasher.update([0]);
    hasher.update(document.content.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Exclusive claim on a resource for the duration of one migration
///
/// Dropping the lease releases the resource.
#[derive(Debug)]
pub struct MigrationLease {
    resource: ResourceRef,
    in_flight: Arc<DashSet<ResourceRef>>,
}

impl MigrationLease {
    /// Leased resource
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }
}

impl Drop for MigrationLease {
    fn drop(&mut self) {
        self.in_flight.remove(&self.resource);
    }
}

/// Lifecycle integration manager
pub struct LifecycleIntegrationManager {
    store: Arc<dyn ResourceStore>,
    snapshots: DashMap<ResourceRef, ResourceSnapshot>,
    in_flight: Arc<DashSet<ResourceRef>>,
    hooks: RwLock<HashMap<String, Vec<Arc<dyn LifecycleHook>>>>,
    validators: RwLock<HashMap<String, Vec<Arc<dyn MigrationValidator>>>>,
    supported_versions: RwLock<Option<BTreeSet<String>>>,
}

impl std::fmt::Debug for LifecycleIntegrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleIntegrationManager")
            .field("snapshots", &self.snapshots.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleIntegrationManager {
    /// Create manager over a store; every version is supported until restricted
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            snapshots: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
            hooks: RwLock::new(HashMap::new()),
            validators: RwLock::new(HashMap::new()),
            supported_versions: RwLock::new(None),
        }
    }

    /// Restrict migrations to the given target versions
    pub fn set_supported_versions<I, S>(&self, versions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.supported_versions.write() = Some(versions.into_iter().map(Into::into).collect());
    }

    /// Check if `version` may be targeted
    #[must_use]
    pub fn is_supported(&self, version: &str) -> bool {
        self.supported_versions
            .read()
            .as_ref()
            .map_or(true, |versions| versions.contains(version))
    }

    /// Register a hook for documents at `version`
    pub fn register_hook(&self, version: impl Into<String>, hook: impl LifecycleHook + 'static) {
        let version = version.into();
        tracing::info!(version = %version, hook = hook.name(), phase = ?hook.phase(), "Registered lifecycle hook");
        self.hooks
            .write()
            .entry(version)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Register a validator for migrations targeting `version`
    pub fn register_validator(
        &self,
        version: impl Into<String>,
        validator: impl MigrationValidator + 'static,
    ) {
        let version = version.into();
        tracing::info!(version = %version, validator = validator.name(), "Registered migration validator");
        self.validators
            .write()
            .entry(version)
            .or_default()
            .push(Arc::new(validator));
    }

    /// Claim a resource without running any checks
    ///
    /// Returns `None` while another migration holds it.
    #[must_use]
    pub fn try_acquire(&self, resource: &ResourceRef) -> Option<MigrationLease> {
        self.in_flight.insert(resource.clone()).then(|| MigrationLease {
            resource: resource.clone(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Check if a migration currently holds `resource`
    #[inline]
    #[must_use]
    pub fn is_in_flight(&self, resource: &ResourceRef) -> bool {
        self.in_flight.contains(resource)
    }

    /// Run every pre-migration check and snapshot the resource
    ///
    /// The returned lease keeps concurrent migrations of the same resource
    /// out until it is dropped.
    ///
    /// # Errors
    /// `Ineligible` when the resource is busy or unhealthy,
    /// `UnsupportedVersion` for unknown targets, a validator's error, or the
    /// store error when the resource cannot be read.
    pub async fn pre_migration_check(
        &self,
        resource: &ResourceRef,
        target_version: &str,
    ) -> Result<MigrationLease, LifecycleError> {
        tracing::debug!(%resource, target_version, "Performing pre-migration checks");

        let lease = self.try_acquire(resource).ok_or_else(|| {
            LifecycleError::Ineligible(format!("migration of {resource} already in progress"))
        })?;

        if !self.is_supported(target_version) {
            return Err(LifecycleError::UnsupportedVersion(target_version.to_string()));
        }

        let document = self.store.get(resource).await?;
        self.record_snapshot(&document);

        let checks = async {
            for validator in self.validators_for(target_version) {
                validator
                    .validate_pre(&document, target_version)
                    .await
                    .map_err(|e| named_validation_error(validator.name(), e))?;
            }
            check_health(&document)
        };
        if let Err(error) = checks.await {
            self.discard_snapshot(resource);
            return Err(error);
        }

        Ok(lease)
    }

    /// Store a snapshot of an already fetched document
    pub fn record_snapshot(&self, document: &Document) {
        self.snapshots
            .insert(document.reference.clone(), ResourceSnapshot::capture(document));
    }

    /// Remember the resource version the migration wrote
    ///
    /// Rollback only ever undoes this write; without it the stored document
    /// is left alone.
    pub fn record_write(&self, written: &Document) {
        if let Some(mut snapshot) = self.snapshots.get_mut(&written.reference) {
            snapshot.written_version = Some(written.resource_version);
        }
    }

    fn clear_write(&self, resource: &ResourceRef) {
        if let Some(mut snapshot) = self.snapshots.get_mut(resource) {
            snapshot.written_version = None;
        }
    }

    /// Copy of the snapshot held for `resource`
    #[must_use]
    pub fn snapshot(&self, resource: &ResourceRef) -> Option<ResourceSnapshot> {
        self.snapshots.get(resource).map(|s| s.clone())
    }

    /// Forget the snapshot of `resource`
    pub fn discard_snapshot(&self, resource: &ResourceRef) {
        self.snapshots.remove(resource);
    }

    /// Number of snapshots held
    #[inline]
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Run pre then post hooks registered for the document's version
    ///
    /// # Errors
    /// `HookFailed` naming the first failing hook.
    pub async fn apply_migration_hooks(&self, document: &mut Document) -> Result<(), LifecycleError> {
        let hooks = self
            .hooks
            .read()
            .get(document.version())
            .cloned()
            .unwrap_or_default();

        for phase in [HookPhase::Pre, HookPhase::Post] {
            for hook in hooks.iter().filter(|h| h.phase() == phase) {
                tracing::debug!(resource = %document.reference, hook = hook.name(), ?phase, "Applying migration hook");
                hook.execute(document)
                    .await
                    .map_err(|e| match e {
                        LifecycleError::HookFailed { .. } => e,
                        other => LifecycleError::HookFailed {
                            hook: hook.name().to_string(),
                            reason: other.to_string(),
                        },
                    })?;
            }
        }
        Ok(())
    }

    /// Validate the stored resource and release its snapshot
    ///
    /// # Errors
    /// `ValidationFailed` from a validator or the integrity check; the
    /// snapshot is kept so the migration can still be rolled back.
    pub async fn post_migration_validation(
        &self,
        resource: &ResourceRef,
        target_version: &str,
    ) -> Result<(), LifecycleError> {
        tracing::debug!(%resource, target_version, "Performing post-migration validation");
        let document = self.store.get(resource).await?;

        for validator in self.validators_for(target_version) {
            validator
                .validate_post(&document, target_version)
                .await
                .map_err(|e| named_validation_error(validator.name(), e))?;
        }
        verify_integrity(&document, target_version)?;

        self.discard_snapshot(resource);
        Ok(())
    }

    /// Restore `resource` from its snapshot
    ///
    /// Returns `true` when a write happened. Nothing is written without a
    /// snapshot, when the migration never wrote the resource, when someone
    /// else changed it after that write, or when it already matches the
    /// snapshot.
    ///
    /// # Errors
    /// `RollbackFailed` when the restore write fails or does not verify.
    pub async fn rollback_migration(&self, resource: &ResourceRef) -> Result<bool, LifecycleError> {
        let Some(snapshot) = self.snapshot(resource) else {
            tracing::debug!(%resource, "No snapshot, nothing to roll back");
            return Ok(false);
        };
        let Some(written_version) = snapshot.written_version else {
            tracing::debug!(%resource, "Migration never wrote the resource, nothing to roll back");
            return Ok(false);
        };

        let current = self
            .store
            .get(resource)
            .await
            .map_err(|e| LifecycleError::RollbackFailed(e.to_string()))?;
        if current.resource_version != written_version {
            tracing::warn!(
                %resource,
                written_version,
                current_version = current.resource_version,
                "Resource changed after the migration wrote it, leaving it in place"
            );
            self.clear_write(resource);
            return Ok(false);
        }
        if current.same_content(&snapshot.document) {
            self.clear_write(resource);
            return Ok(false);
        }

        let mut restored = snapshot.document.clone();
        restored.resource_version = current.resource_version;
        let written = self
            .store
            .update(restored)
            .await
            .map_err(|e| LifecycleError::RollbackFailed(e.to_string()))?;
        self.clear_write(resource);

        if checksum(&written) != snapshot.checksum {
            return Err(LifecycleError::RollbackFailed(format!(
                "restored {resource} does not match its snapshot"
            )));
        }

        tracing::info!(%resource, version = snapshot.document.version(), "Rolled back migration");
        Ok(true)
    }

    fn validators_for(&self, version: &str) -> Vec<Arc<dyn MigrationValidator>> {
        self.validators
            .read()
            .get(version)
            .cloned()
            .unwrap_or_default()
    }
}

fn named_validation_error(name: &str, error: LifecycleError) -> LifecycleError {
    match error {
        LifecycleError::ValidationFailed { .. } | LifecycleError::Ineligible(_) => error,
        other => LifecycleError::ValidationFailed {
            check: name.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Reject platforms that are failed, unknown, upgrading or not ready
fn check_health(document: &Document) -> Result<(), LifecycleError> {
    if let Some(phase) = document.status_phase() {
        if BLOCKING_PHASES.contains(&phase) {
            return Err(LifecycleError::Ineligible(format!(
                "platform {} is in phase {phase}",
                document.reference
            )));
        }
    }

    let not_ready = document
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|c| {
            c.get("type").and_then(Value::as_str) == Some("Ready")
                && c.get("status").and_then(Value::as_str) != Some("True")
        });
    if let Some(condition) = not_ready {
        let message = condition
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Ready condition is not True");
        return Err(LifecycleError::Ineligible(format!(
            "platform {} is not ready: {message}",
            document.reference
        )));
    }
    Ok(())
}

fn verify_integrity(document: &Document, target_version: &str) -> Result<(), LifecycleError> {
    if document.version() != target_version {
        return Err(LifecycleError::ValidationFailed {
            check: "integrity".into(),
            reason: format!(
                "stored version {} does not match target {target_version}",
                document.version()
            ),
        });
    }
    if document.spec().is_none() {
        return Err(LifecycleError::ValidationFailed {
            check: "integrity".into(),
            reason: "spec is missing after migration".into(),
        });
    }
    Ok(())
}
