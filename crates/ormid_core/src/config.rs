//! Data model configuration.

use ormid_store::IsolationLevel;
use std::time::Duration;

/// Configuration for a [`DataModel`](crate::DataModel).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Default timeout attached to every statement (None = no limit).
    pub command_timeout: Option<Duration>,

    /// Isolation level requested when a physical transaction begins.
    pub isolation_level: IsolationLevel,

    /// Overrides the driver's multiple-active-result-set capability.
    ///
    /// `None` asks the driver.
    pub multiple_active_result_sets: Option<bool>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command_timeout: Some(Duration::from_secs(30)),
            isolation_level: IsolationLevel::Unspecified,
            multiple_active_result_sets: None,
        }
    }
}

impl ModelConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default statement timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the isolation level for new transactions.
    #[must_use]
    pub const fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Forces multiple-active-result-set emulation on or off.
    #[must_use]
    pub const fn multiple_active_result_sets(mut self, value: Option<bool>) -> Self {
        self.multiple_active_result_sets = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.command_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.isolation_level, IsolationLevel::Unspecified);
        assert!(config.multiple_active_result_sets.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = ModelConfig::new()
            .command_timeout(None)
            .isolation_level(IsolationLevel::Serializable)
            .multiple_active_result_sets(Some(false));

        assert!(config.command_timeout.is_none());
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.multiple_active_result_sets, Some(false));
    }
}
