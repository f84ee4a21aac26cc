//! Migration engine configuration
//!
//! Loaded from TOML (every field has a default) or built in code with the
//! `with_*` methods. Durations are stored in milliseconds.

use crate::error::MigrationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Process-wide migration configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Concurrent resource conversions inside a batch
    pub max_concurrent_migrations: usize,
    /// Resources dispatched per batch chunk
    pub batch_size: usize,
    /// Additional write attempts after a conflict
    pub retry_attempts: u32,
    /// Pause between conflicting write attempts
    pub retry_interval_ms: u64,
    /// Run the conversion optimizer before converting
    pub enable_optimizations: bool,
    /// Convert and run hooks but never write
    pub dry_run: bool,
    /// Progress report period for batches (0 disables)
    pub progress_report_interval_ms: u64,
    /// Optimizer cache capacity (0 disables caching)
    pub optimizer_cache_size: u64,
    /// Optimizer cache entry time-to-live
    pub optimizer_cache_ttl_ms: u64,
    /// Recent events kept by the status reporter
    pub max_events: usize,
    /// How long finished reports are kept
    pub report_retention_ms: u64,
    /// Period of the background eviction of expired reports (0 disables)
    pub cleanup_interval_ms: u64,
}

impl MigrationConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    ///
    /// # Errors
    /// `MigrationError::Config` when the document is malformed or invalid.
    pub fn from_toml_str(source: &str) -> Result<Self, MigrationError> {
        let config: Self =
            toml::from_str(source).map_err(|e| MigrationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `MigrationError::Config` when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `MigrationError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.max_concurrent_migrations == 0 {
            return Err(MigrationError::Config(
                "max_concurrent_migrations must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MigrationError::Config(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.max_events == 0 {
            return Err(MigrationError::Config(
                "max_events must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// With max concurrent migrations
    #[inline]
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_migrations = max;
        self
    }

    /// With batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// With retry budget
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_interval_ms = duration_to_ms(interval);
        self
    }

    /// With optimizations toggled
    #[inline]
    #[must_use]
    pub fn with_optimizations(mut self, enabled: bool) -> Self {
        self.enable_optimizations = enabled;
        self
    }

    /// With dry-run toggled
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With progress report interval
    #[inline]
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_report_interval_ms = duration_to_ms(interval);
        self
    }

    /// With finished report retention
    #[inline]
    #[must_use]
    pub fn with_report_retention(mut self, retention: Duration) -> Self {
        self.report_retention_ms = duration_to_ms(retention);
        self
    }

    /// With background cleanup period (zero disables)
    #[inline]
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = duration_to_ms(interval);
        self
    }

    /// Pause between conflicting write attempts
    #[inline]
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Progress report period, `None` when disabled
    #[must_use]
    pub fn progress_report_interval(&self) -> Option<Duration> {
        (self.progress_report_interval_ms > 0)
            .then(|| Duration::from_millis(self.progress_report_interval_ms))
    }

    /// Optimizer cache entry time-to-live
    #[inline]
    #[must_use]
    pub fn optimizer_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.optimizer_cache_ttl_ms)
    }

    /// Finished report retention
    #[inline]
    #[must_use]
    pub fn report_retention(&self) -> Duration {
        Duration::from_millis(self.report_retention_ms)
    }

    /// Background cleanup period, `None` when disabled
    #[must_use]
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_migrations: 5,
            batch_size: 10,
            retry_attempts: 5,
            retry_interval_ms: 10,
            enable_optimizations: true,
            dry_run: false,
            progress_report_interval_ms: 5_000,
            optimizer_cache_size: 1_000,
            optimizer_cache_ttl_ms: 5 * 60 * 1_000,
            max_events: 1_000,
            report_retention_ms: 7 * 24 * 60 * 60 * 1_000,
            cleanup_interval_ms: 60 * 60 * 1_000,
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MigrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_migrations, 5);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = MigrationConfig::from_toml_str(
            r#"
            batch_size = 3
            retry_attempts = 2
            retry_interval_ms = 250
            dry_run = true
            progress_report_interval_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.batch_size, 3);
        assert_eq!(config.retry_interval(), Duration::from_millis(250));
        assert!(config.dry_run);
        assert!(config.progress_report_interval().is_none());
        assert_eq!(config.max_concurrent_migrations, 5);
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(3600)));

        let disabled = MigrationConfig::from_toml_str("cleanup_interval_ms = 0").unwrap();
        assert!(disabled.cleanup_interval().is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = MigrationConfig::from_toml_str("batch_size = 0").unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let err = MigrationConfig::new().with_max_concurrent(0).validate();
        assert!(err.is_err());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = MigrationConfig::from_toml_str("batch_size = \"many\"").unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.toml");
        std::fs::write(&path, "max_concurrent_migrations = 2\n").unwrap();

        let config = MigrationConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_migrations, 2);
    }
}
