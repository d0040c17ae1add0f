//! Context Configuration

use serde::Deserialize;

use crate::error::{GraphError, GraphResult};

/// Settings applied to a [`GraphContext`](crate::GraphContext).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Prefix that marks an id as a placeholder for a not yet persisted
    /// instance. Placeholder ids are `prefix` followed by a counter.
    pub placeholder_prefix: String,

    /// Raise a `PropertyGet` event the first time each property of an
    /// instance is read.
    pub track_reads: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            placeholder_prefix: "?".to_string(),
            track_reads: true,
        }
    }
}

impl ContextConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> GraphResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| GraphError::Config(err.to_string()))?;
        if config.placeholder_prefix.is_empty() {
            return Err(GraphError::Config(
                "placeholder_prefix must not be empty".to_string(),
            ));
        }
        Ok(config)
    }

    /// Whether `id` was issued as a placeholder.
    pub fn is_placeholder(&self, id: &str) -> bool {
        id.starts_with(&self.placeholder_prefix)
    }
}
