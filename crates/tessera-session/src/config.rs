//! Session configuration.

use serde::{Deserialize, Serialize};
use tessera_core::Error;
use tessera_core::error::ConfigError;

/// How the session is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionProfile {
    /// Long-lived transactions; pending changes are flushed before reads.
    #[default]
    Server,
    /// Changes accumulate locally and reach storage through `save_changes`.
    Client,
}

/// Configuration for a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Begin a transaction on the first flush when none is active.
    pub auto_begin: bool,
    /// Flush pending changes before queries and loads (server profile only).
    pub auto_flush: bool,
    pub profile: SessionProfile,
    /// Most rows per multi-row insert.
    pub batch_size: usize,
    /// Compiled queries kept by the session's cache; zero disables caching.
    pub query_cache_capacity: usize,
    /// Fetch unavailable fields on access instead of failing.
    pub lazy_load: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: true,
            profile: SessionProfile::Server,
            batch_size: 100,
            query_cache_capacity: 128,
            lazy_load: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client-profile defaults: no auto-flush.
    pub fn client() -> Self {
        Self {
            auto_flush: false,
            profile: SessionProfile::Client,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; absent fields keep their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        if config.batch_size == 0 {
            return Err(Error::Config(ConfigError {
                message: "batch_size must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(config)
    }

    pub fn auto_begin(mut self, enabled: bool) -> Self {
        self.auto_begin = enabled;
        self
    }

    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    pub fn profile(mut self, profile: SessionProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the multi-row insert limit (at least one row).
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows.max(1);
        self
    }

    pub fn query_cache_capacity(mut self, entries: usize) -> Self {
        self.query_cache_capacity = entries;
        self
    }

    pub fn lazy_load(mut self, enabled: bool) -> Self {
        self.lazy_load = enabled;
        self
    }

    /// Whether reads should flush pending changes first.
    pub(crate) fn flushes_before_reads(&self) -> bool {
        self.auto_flush && self.profile == SessionProfile::Server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_profile_flushes_before_reads() {
        assert!(SessionConfig::default().flushes_before_reads());
        assert!(!SessionConfig::client().flushes_before_reads());
        let client_with_flag = SessionConfig::default().profile(SessionProfile::Client);
        assert!(!client_with_flag.flushes_before_reads());
    }

    #[test]
    fn json_keeps_defaults_for_missing_fields() {
        let config = SessionConfig::from_json(r#"{"profile": "Client", "batch_size": 3}"#).unwrap();
        assert_eq!(config.profile, SessionProfile::Client);
        assert_eq!(config.batch_size, 3);
        assert!(config.lazy_load);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = SessionConfig::from_json(r#"{"batch_size": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(SessionConfig::new().batch_size(0).batch_size, 1);
    }
}
