//! Error types for the migration engine
//!
//! Provides error handling for:
//! - Resource store access (including optimistic-concurrency conflicts)
//! - Version conversion
//! - Lifecycle checks, hooks, validation and rollback
//! - Task orchestration

use crate::types::{MigrationStatus, ResourceRef, TaskId};

/// Main migration error type
///
/// Every fatal condition of the single-resource pipeline maps onto exactly one
/// variant, so callers can tell which stage failed without inspecting engine
/// state (see [`MigrationError::stage`]).
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Pre-migration check rejected the resource
    #[error("pre-migration check failed for {resource}: {source}")]
    Ineligible {
        /// The rejected resource
        resource: ResourceRef,
        /// Why the resource is ineligible
        #[source]
        source: LifecycleError,
    },

    /// Migration task does not exist
    #[error("migration task not found: {0}")]
    TaskNotFound(TaskId),

    /// Resource does not exist in the store
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceRef),

    /// Every write attempt hit an optimistic-concurrency conflict
    #[error("conflict on {resource} persisted after {attempts} attempts")]
    ConflictRetriesExhausted {
        /// The contended resource
        resource: ResourceRef,
        /// Total write attempts made
        attempts: u32,
    },

    /// Converter rejected the document
    #[error("conversion failed for {resource}: {source}")]
    ConversionFailed {
        /// The resource being converted
        resource: ResourceRef,
        /// Underlying conversion error
        #[source]
        source: ConversionError,
    },

    /// No converter registered for the version pair
    #[error("unsupported migration path {from} -> {to}")]
    UnsupportedVersion {
        /// Source schema version
        from: String,
        /// Target schema version
        to: String,
    },

    /// Lifecycle hook failed before the write
    #[error("lifecycle hooks failed for {resource}: {source}")]
    HookFailed {
        /// The resource being migrated
        resource: ResourceRef,
        /// Underlying hook error
        #[source]
        source: LifecycleError,
    },

    /// Post-migration validation failed; the write already happened
    #[error("post-migration validation failed for {resource}: {source}")]
    ValidationFailed {
        /// The migrated resource (requires manual inspection)
        resource: ResourceRef,
        /// Underlying validation error
        #[source]
        source: LifecycleError,
    },

    /// Resource store error other than not-found / conflict
    #[error("resource store error: {0}")]
    Store(#[source] StoreError),

    /// Task is in a status that does not allow the operation
    #[error("cannot {operation} migration {task_id} in status {status}")]
    InvalidState {
        /// Task identifier
        task_id: TaskId,
        /// Current status
        status: MigrationStatus,
        /// Attempted operation
        operation: &'static str,
    },

    /// Batch finished with failed resources
    #[error("batch migration completed with {failed} failures out of {total} resources")]
    BatchFailed {
        /// Failed resource count
        failed: usize,
        /// Resources in the batch
        total: usize,
    },

    /// Request rejected before a task was created
    #[error("invalid migration request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Report or analytics could not be serialized
    #[error("export failed: {0}")]
    Export(#[from] serde_json::Error),
}

/// Pipeline stage a [`MigrationError`] originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Request validation / task lookup
    Request,
    /// Pre-migration check
    PreCheck,
    /// Fetching or writing the document
    Store,
    /// Version conversion
    Conversion,
    /// Lifecycle hooks
    Hooks,
    /// Post-migration validation
    Validation,
    /// Batch aggregation
    Batch,
    /// Engine configuration
    Config,
}

impl MigrationError {
    /// Stage of the pipeline this error belongs to
    #[must_use]
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Ineligible { .. } => PipelineStage::PreCheck,
            Self::TaskNotFound(_)
            | Self::InvalidState { .. }
            | Self::InvalidRequest(_)
            | Self::Export(_) => PipelineStage::Request,
            Self::ResourceNotFound(_) | Self::ConflictRetriesExhausted { .. } | Self::Store(_) => {
                PipelineStage::Store
            }
            Self::ConversionFailed { .. } | Self::UnsupportedVersion { .. } => {
                PipelineStage::Conversion
            }
            Self::HookFailed { .. } => PipelineStage::Hooks,
            Self::ValidationFailed { .. } => PipelineStage::Validation,
            Self::BatchFailed { .. } => PipelineStage::Batch,
            Self::Config(_) => PipelineStage::Config,
        }
    }

    /// Check if error is a not-found condition (task or resource)
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::ResourceNotFound(_))
    }

    /// Check if the caller may retry the whole migration later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Ineligible { .. }
                | Self::ConflictRetriesExhausted { .. }
                | Self::Store(StoreError::Unavailable(_))
        )
    }

    /// Wrap a store error, lifting not-found into its own variant
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(resource) => Self::ResourceNotFound(resource),
            other => Self::Store(other),
        }
    }

    /// Wrap a conversion error, lifting unsupported paths into their own variant
    pub(crate) fn from_conversion(resource: &ResourceRef, err: ConversionError) -> Self {
        match err {
            ConversionError::UnsupportedVersion { from, to } => {
                Self::UnsupportedVersion { from, to }
            }
            other => Self::ConversionFailed {
                resource: resource.clone(),
                source: other,
            },
        }
    }
}

/// Resource store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Resource absent
    #[error("resource not found: {0}")]
    NotFound(ResourceRef),

    /// Document changed since it was read
    #[error("conflict on {resource}: expected resource version {expected}, found {actual}")]
    Conflict {
        /// Contended resource
        resource: ResourceRef,
        /// Resource version the writer read
        expected: u64,
        /// Resource version currently stored
        actual: u64,
    },

    /// Store unreachable or failing
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Check if this is an optimistic-concurrency conflict
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if the resource is absent
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Conversion errors raised by [`crate::conversion::Converter`] implementations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// No conversion registered for the pair
    #[error("unsupported conversion {from} -> {to}")]
    UnsupportedVersion {
        /// Source schema version
        from: String,
        /// Target schema version
        to: String,
    },

    /// Required field absent from the source document
    #[error("missing field: {0}")]
    MissingField(String),

    /// Conversion rule failed
    #[error("{0}")]
    Failed(String),
}

/// Lifecycle integration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Resource may not be migrated right now
    #[error("resource ineligible: {0}")]
    Ineligible(String),

    /// Target version not served by this engine
    #[error("unsupported target version: {0}")]
    UnsupportedVersion(String),

    /// A registered hook failed
    #[error("hook {hook} failed: {reason}")]
    HookFailed {
        /// Hook name
        hook: String,
        /// Failure reason
        reason: String,
    },

    /// A validator or integrity check failed
    #[error("validation {check} failed: {reason}")]
    ValidationFailed {
        /// Validator or check name
        check: String,
        /// Failure reason
        reason: String,
    },

    /// Restoring a snapshot failed
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Store access failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ResourceRef {
        ResourceRef::new("monitoring", "platform-a")
    }

    #[test]
    fn migration_error_display() {
        let err = MigrationError::TaskNotFound(TaskId::from("batch-1"));
        assert!(err.to_string().contains("migration task not found"));
    }

    #[test]
    fn store_not_found_lifts_to_resource_not_found() {
        let err = MigrationError::from_store(StoreError::NotFound(resource()));
        assert!(matches!(err, MigrationError::ResourceNotFound(_)));
        assert!(err.is_not_found());

        let err = MigrationError::from_store(StoreError::Unavailable("down".into()));
        assert!(matches!(err, MigrationError::Store(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn unsupported_conversion_lifts_to_unsupported_version() {
        let err = MigrationError::from_conversion(
            &resource(),
            ConversionError::UnsupportedVersion {
                from: "v1alpha1".into(),
                to: "v2".into(),
            },
        );
        assert!(matches!(err, MigrationError::UnsupportedVersion { .. }));
        assert_eq!(err.stage(), PipelineStage::Conversion);
    }

    #[test]
    fn stages_are_distinct_for_pipeline_failures() {
        let ineligible = MigrationError::Ineligible {
            resource: resource(),
            source: LifecycleError::Ineligible("upgrading".into()),
        };
        let hook = MigrationError::HookFailed {
            resource: resource(),
            source: LifecycleError::HookFailed {
                hook: "notify".into(),
                reason: "timeout".into(),
            },
        };
        let validation = MigrationError::ValidationFailed {
            resource: resource(),
            source: LifecycleError::ValidationFailed {
                check: "integrity".into(),
                reason: "spec missing".into(),
            },
        };

        assert_eq!(ineligible.stage(), PipelineStage::PreCheck);
        assert_eq!(hook.stage(), PipelineStage::Hooks);
        assert_eq!(validation.stage(), PipelineStage::Validation);
    }

    #[test]
    fn store_error_classification() {
        let conflict = StoreError::Conflict {
            resource: resource(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
        assert!(StoreError::NotFound(resource()).is_not_found());
    }
}
