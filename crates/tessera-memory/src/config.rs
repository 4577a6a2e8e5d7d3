//! Driver configuration.

use serde::{Deserialize, Serialize};
use tessera_core::error::ConfigError;
use tessera_core::{Dialect, DriverCapabilities, Error};

/// In-memory driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Accept several statements or queries per round trip
    pub batching: bool,
    /// Support savepoints inside a transaction
    pub savepoints: bool,
    /// Largest parameter list a query may bind inline
    pub max_query_params: usize,
    /// Support connection-local temporary tables
    pub temp_tables: bool,
    /// Dialect used when rendering plans for logs
    pub dialect: Dialect,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            batching: true,
            savepoints: true,
            max_query_params: 2100,
            temp_tables: true,
            dialect: Dialect::Postgres,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; absent fields keep their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid memory driver configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Enable/disable batching.
    pub fn batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    /// Enable/disable savepoints.
    pub fn savepoints(mut self, enabled: bool) -> Self {
        self.savepoints = enabled;
        self
    }

    /// Set the inline parameter limit.
    pub fn max_query_params(mut self, n: usize) -> Self {
        self.max_query_params = n;
        self
    }

    /// Enable/disable temp tables.
    pub fn temp_tables(mut self, enabled: bool) -> Self {
        self.temp_tables = enabled;
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Capabilities advertised by connections with this configuration.
    pub fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            batching: self.batching,
            savepoints: self.savepoints,
            max_query_params: self.max_query_params,
            temp_tables: self.temp_tables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = MemoryConfig::from_json(r#"{"batching": false, "dialect": "Sqlite"}"#).unwrap();
        assert!(!config.batching);
        assert_eq!(config.dialect, Dialect::Sqlite);
        assert_eq!(config.max_query_params, 2100);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = MemoryConfig::from_json("{batching").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_feeds_capabilities() {
        let caps = MemoryConfig::new().max_query_params(10).temp_tables(false).capabilities();
        assert_eq!(caps.max_query_params, 10);
        assert!(!caps.temp_tables);
        assert!(caps.savepoints);
    }
}
