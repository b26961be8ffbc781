//! Configuration
//!
//! Plain option structs. Both deserialize with defaults for every field so a
//! host can load a partial JSON document.

use std::time::Duration;

use serde::Deserialize;

/// Options for a [`Domain`](crate::Domain).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Name attached to log records emitted by the domain.
    pub name: Option<String>,

    /// Upper bound on re-evaluations performed by a single tick.
    pub max_tick_evaluations: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_tick_evaluations: 10_000,
        }
    }
}

impl DomainConfig {
    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Options for a stale-while-revalidate resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SwrOptions {
    /// Explicit key prefix. Generated when absent.
    pub key: Option<String>,

    /// Age after which cached data is considered stale but still servable.
    pub fresh_age: Duration,

    /// Age after which cached data is no longer served and a read refetches.
    pub stale_age: Duration,

    /// Revalidate when the host reports that focus was regained.
    pub revalidate_on_focus: bool,

    /// Revalidate when the host reports that connectivity was restored.
    pub revalidate_on_reconnect: bool,
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self {
            key: None,
            fresh_age: Duration::from_secs(2),
            stale_age: Duration::from_secs(30),
            revalidate_on_focus: false,
            revalidate_on_reconnect: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_config_defaults_missing_fields() {
        let config = DomainConfig::from_json(r#"{"name":"app"}"#).unwrap();
        assert_eq!(config.name.as_deref(), Some("app"));
        assert_eq!(config.max_tick_evaluations, 10_000);
    }

    #[test]
    fn swr_options_from_json() {
        let options: SwrOptions = serde_json::from_str(
            r#"{"fresh_age":{"secs":1,"nanos":0},"revalidate_on_focus":true}"#,
        )
        .unwrap();
        assert_eq!(options.fresh_age, Duration::from_secs(1));
        assert_eq!(options.stale_age, Duration::from_secs(30));
        assert!(options.revalidate_on_focus);
        assert!(!options.revalidate_on_reconnect);
    }
}
