//! Feature toggles for a `Database`.

use serde::{Deserialize, Serialize};

/// Default cap on entries per operation kind in the history log.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Full-text indexing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    pub enabled: bool,
    /// Dot paths whose string values are indexed. `None` indexes every
    /// top-level string field except `id`.
    pub fields: Option<Vec<String>>,
}

impl FtsConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            fields: None,
        }
    }

    pub fn with_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Operation history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Entries kept per operation kind; older ones are dropped first.
    pub max_history: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl HistoryConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Settings supplied when creating a `Database`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub fts: FtsConfig,
    pub history: HistoryConfig,
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fts(mut self, fts: FtsConfig) -> Self {
        self.fts = fts;
        self
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::new();
        assert!(!config.fts.enabled);
        assert!(config.fts.fields.is_none());
        assert!(!config.history.enabled);
        assert_eq!(config.history.max_history, 1000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"fts": {"enabled": true, "fields": ["title"]}}"#).unwrap();
        assert!(config.fts.enabled);
        assert_eq!(config.fts.fields, Some(vec!["title".to_string()]));
        assert_eq!(config.history, HistoryConfig::default());
    }

    #[test]
    fn test_builders() {
        let config = DatabaseConfig::new()
            .with_fts(FtsConfig::enabled().with_fields(["body"]))
            .with_history(HistoryConfig::enabled());
        assert!(config.fts.enabled);
        assert!(config.history.enabled);
        assert_eq!(config.fts.fields.as_deref(), Some(&["body".to_string()][..]));
    }
}
