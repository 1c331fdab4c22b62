//! Session and factory configuration.

use orm_core::{CacheMode, Error, Result};
use serde::{Deserialize, Serialize};

/// When the session synchronizes pending changes with the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlushMode {
    /// Flush on commit and before operations whose results could be stale.
    #[default]
    Auto,
    /// Flush on commit only.
    Commit,
    /// Flush before every auto-flush check, whether needed or not.
    Always,
    /// Flush only when asked.
    Manual,
}

impl FlushMode {
    /// Does commit flush in this mode?
    pub const fn flushes_on_commit(self) -> bool {
        !matches!(self, FlushMode::Manual)
    }
}

/// Settings shared by every session a factory opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFactoryOptions {
    /// Group inserts by entity so batches stay homogeneous.
    pub order_inserts: bool,
    /// Sort updates by entity name and identifier.
    pub order_updates: bool,
    /// Defer identity inserts to flush, using placeholder identifiers until then.
    pub delay_identity_inserts: bool,
    /// Consult and populate second-level cache regions.
    pub use_second_level_cache: bool,
    /// Skip cache puts for items that are already cached.
    pub minimal_puts: bool,
    /// Record statistics.
    pub statistics_enabled: bool,
    /// Flush mode of new sessions.
    pub default_flush_mode: FlushMode,
    /// Cache mode of new sessions.
    pub default_cache_mode: CacheMode,
    /// Whether new sessions load instances read-only.
    pub default_read_only: bool,
    /// Bump the owner's version when one of its collections changes.
    pub version_increment_on_collection_change: bool,
}

impl Default for SessionFactoryOptions {
    fn default() -> Self {
        Self {
            order_inserts: false,
            order_updates: false,
            delay_identity_inserts: true,
            use_second_level_cache: true,
            minimal_puts: false,
            statistics_enabled: false,
            default_flush_mode: FlushMode::Auto,
            default_cache_mode: CacheMode::Normal,
            default_read_only: false,
            version_increment_on_collection_change: true,
        }
    }
}

impl SessionFactoryOptions {
    /// Parse options from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Mapping(format!("invalid session factory options: {e}")))
    }

    /// Enable or disable insert ordering.
    #[must_use]
    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    /// Enable or disable update ordering.
    #[must_use]
    pub fn order_updates(mut self, enabled: bool) -> Self {
        self.order_updates = enabled;
        self
    }

    /// Enable or disable delayed identity inserts.
    #[must_use]
    pub fn delay_identity_inserts(mut self, enabled: bool) -> Self {
        self.delay_identity_inserts = enabled;
        self
    }

    /// Enable or disable the second-level cache.
    #[must_use]
    pub fn use_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    /// Enable or disable statistics.
    #[must_use]
    pub fn statistics_enabled(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// When pending changes are flushed.
    pub flush_mode: FlushMode,
    /// How the second-level cache is used.
    pub cache_mode: CacheMode,
    /// Whether loaded instances start out read-only.
    pub default_read_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            cache_mode: CacheMode::Normal,
            default_read_only: false,
        }
    }
}

impl SessionConfig {
    /// Session settings derived from factory defaults.
    pub fn from_options(options: &SessionFactoryOptions) -> Self {
        Self {
            flush_mode: options.default_flush_mode,
            cache_mode: options.default_cache_mode,
            default_read_only: options.default_read_only,
        }
    }

    /// Set the flush mode.
    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Set the cache mode.
    #[must_use]
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Load instances read-only by default.
    #[must_use]
    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = SessionFactoryOptions::default();
        assert!(options.delay_identity_inserts);
        assert!(options.use_second_level_cache);
        assert!(!options.order_inserts);
        assert_eq!(options.default_flush_mode, FlushMode::Auto);
    }

    #[test]
    fn test_options_from_json_keeps_defaults() {
        let options = SessionFactoryOptions::from_json(
            r#"{"order_inserts": true, "default_flush_mode": "Commit", "default_cache_mode": "Ignore"}"#,
        )
        .unwrap();
        assert!(options.order_inserts);
        assert!(options.delay_identity_inserts);
        assert_eq!(options.default_flush_mode, FlushMode::Commit);
        assert_eq!(options.default_cache_mode, CacheMode::Ignore);

        let err = SessionFactoryOptions::from_json("{\"order_inserts\": 3}").unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_session_config_from_options() {
        let options = SessionFactoryOptions {
            default_read_only: true,
            default_flush_mode: FlushMode::Manual,
            ..SessionFactoryOptions::default()
        };
        let config = SessionConfig::from_options(&options);
        assert!(config.default_read_only);
        assert!(!config.flush_mode.flushes_on_commit());

        let config = SessionConfig::default().cache_mode(CacheMode::Get);
        assert_eq!(config.cache_mode, CacheMode::Get);
    }
}
