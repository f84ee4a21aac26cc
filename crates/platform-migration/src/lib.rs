//! Platform Migration - versioned resource migration engine
//!
//! Migrates observability platform resources between schema versions:
//! - Single-resource migrations run synchronously with conflict retry
//!   and snapshot rollback
//! - Batch migrations run in the background with bounded concurrency
//!   and can be cancelled with compensating rollback
//! - Schema evolution tracking, migration analytics and path finding
//! - Lifecycle hooks, validators and health checks around each write
//! - Structured migration events, reports and pluggable status sinks
//!
//! # Example
//!
//! ```rust,ignore
//! use platform_migration::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), MigrationError> {
//! let store = Arc::new(InMemoryResourceStore::new());
//! let conversions = ConversionRegistry::new().with("v1alpha1", "v1beta1", |doc: &Document, to: &str| {
//!     Ok(doc.clone().with_version(to))
//! });
//! let manager = MigrationManager::new(store, conversions, MigrationConfig::default())?;
//!
//! manager
//!     .migrate_resource(&ResourceRef::new("monitoring", "platform-a"), "v1beta1")
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod batch;
pub mod config;
pub mod conversion;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod optimizer;
pub mod registry;
pub mod reporter;
pub mod state_machine;
pub mod store;
pub mod tracker;
pub mod types;

// Re-exports for convenience
pub use batch::{BatchConversionProcessor, BatchConversionResult, BatchMetrics, BatchResultStatus};
pub use config::MigrationConfig;
pub use conversion::{ConversionRegistry, ConversionRule, Converter, FieldMappingConverter};
pub use error::{ConversionError, LifecycleError, MigrationError, PipelineStage, StoreError};
pub use lifecycle::{
    checksum, HookPhase, LifecycleHook, LifecycleIntegrationManager, MigrationLease,
    MigrationValidator, ResourceSnapshot,
};
pub use manager::{MigrationManager, MigrationManagerBuilder};
pub use optimizer::{
    ConversionOptimizer, DocumentOptimizer, EmptyStatusPruning, FieldSkipping,
    OptimizationStrategy, OptimizerMetrics,
};
pub use registry::TaskRegistry;
pub use reporter::{
    EventLevel, EventType, MigrationEvent, MigrationReport, MigrationStatusReporter,
    PerformanceStats, ResourceMigrationDetail, SinkError, StatusSink,
};
pub use state_machine::{allowed_transitions, validate_transition, IllegalTransition};
pub use store::{InMemoryResourceStore, ResourceStore};
pub use tracker::{
    ChangeType, Complexity, FieldChange, MigrationAnalytics, MigrationPath,
    SchemaEvolutionTracker, TransitionRecord, VersionInfo,
};
pub use types::{
    Document, MigrationProgress, MigrationStatus, MigrationTask, ResourceRef, TaskId, TaskKind,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the migration engine
    pub use crate::{
        ConversionRegistry, Document, InMemoryResourceStore, LifecycleHook,
        LifecycleIntegrationManager, MigrationConfig, MigrationError, MigrationManager,
        MigrationStatus, MigrationTask, MigrationValidator, ResourceRef, ResourceStore,
        StatusSink, TaskId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
