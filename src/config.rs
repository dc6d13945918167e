//! Moderation pipeline configuration
//!
//! Loaded from HCL, or JSON when the content starts with `{`. Every field
//! has a default, so an empty document yields the baseline deployment:
//! four checks over `check-requests` / `check-results`.

use crate::aggregator::AggregatorConfig;
use crate::error::{ModerationError, Result};
use crate::model::{CheckKind, CheckSet};
use crate::provider::nats::NatsConfig;
use crate::retry::RetryConfig;
use crate::types::SubscribeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration shared by dispatcher, workers and aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Check kinds every request must cover, by name
    pub checks: Vec<String>,

    /// Topic scatter events are published to
    pub scatter_topic: String,

    /// Topic partial results are published to
    pub result_topic: String,

    /// Consumer group the aggregator joins on the result topic
    pub aggregator_group: String,

    pub aggregator: AggregatorConfig,

    /// Transport retry for publish and subscribe
    pub retry: RetryConfig,

    /// Consumer-group options for workers and the aggregator
    pub subscribe: SubscribeOptions,

    pub nats: NatsConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            checks: CheckKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
            scatter_topic: "check-requests".to_string(),
            result_topic: "check-results".to_string(),
            aggregator_group: "aggregator".to_string(),
            aggregator: AggregatorConfig::default(),
            retry: RetryConfig::default(),
            subscribe: SubscribeOptions::default(),
            nats: NatsConfig::default(),
        }
    }
}

impl ModerationConfig {
    /// Parse configuration from an HCL (or JSON) string
    pub fn from_hcl(content: &str) -> Result<Self> {
        let config: Self = if content.trim_start().starts_with('{') {
            serde_json::from_str(content)
                .map_err(|e| ModerationError::Config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            hcl::from_str(content)
                .map_err(|e| ModerationError::Config(format!("Failed to parse HCL config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModerationError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_hcl(&content)
    }

    /// Resolve `checks` into a validated check set
    pub fn check_set(&self) -> Result<CheckSet> {
        CheckSet::from_names(&self.checks)
    }

    /// Fail fast on unusable settings
    pub fn validate(&self) -> Result<()> {
        self.check_set()?;
        if self.scatter_topic.is_empty() || self.result_topic.is_empty() {
            return Err(ModerationError::Config("Topics must not be empty".to_string()));
        }
        if self.scatter_topic == self.result_topic {
            return Err(ModerationError::Config(format!(
                "Scatter and result topics must differ (both '{}')",
                self.scatter_topic
            )));
        }
        if self.aggregator_group.is_empty() {
            return Err(ModerationError::Config(
                "Aggregator group must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{ExpiryAction, ExpiryPolicy};
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = ModerationConfig::default();
        assert_eq!(config.check_set().unwrap(), CheckSet::default());
        assert_eq!(config.scatter_topic, "check-requests");
        assert_eq!(config.result_topic, "check-results");
        assert_eq!(config.aggregator_group, "aggregator");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_hcl_is_default() {
        let config = ModerationConfig::from_hcl("").unwrap();
        assert_eq!(config.checks.len(), 4);
        assert_eq!(config.aggregator.expiry_policy(), ExpiryPolicy::Never);
    }

    #[test]
    fn test_parse_hcl() {
        let config = ModerationConfig::from_hcl(
            r#"
            checks = ["pii", "ad"]
            scatter_topic = "requests"
            result_topic = "results"

            aggregator {
              completed_capacity = 500
              expiry_secs = 30
              expiry_action = "discard"
              rewrite_fallback = "Withheld."
            }

            retry {
              maxRetries = 5
            }

            subscribe {
              maxDeliver = 4
              parallelism = 8
            }

            nats {
              url = "nats://broker:4222"
              streamName = "MOD"
            }
            "#,
        )
        .unwrap();

        assert_eq!(
            config.check_set().unwrap().kinds(),
            &[CheckKind::Pii, CheckKind::Ad]
        );
        assert_eq!(config.scatter_topic, "requests");
        assert_eq!(config.aggregator.completed_capacity, 500);
        assert_eq!(
            config.aggregator.expiry_policy(),
            ExpiryPolicy::After {
                ttl: Duration::from_secs(30),
                action: ExpiryAction::Discard
            }
        );
        assert_eq!(config.aggregator.rewrite_fallback, "Withheld.");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.subscribe.max_deliver_count(), 4);
        assert_eq!(config.subscribe.parallelism(), 8);
        assert_eq!(config.nats.url, "nats://broker:4222");
        assert_eq!(config.nats.stream_name, "MOD");
    }

    #[test]
    fn test_parse_json() {
        let config =
            ModerationConfig::from_hcl(r#"{"checks": ["safety"], "aggregator_group": "agg"}"#)
                .unwrap();
        assert_eq!(config.check_set().unwrap().kinds(), &[CheckKind::Safety]);
        assert_eq!(config.aggregator_group, "agg");
        assert_eq!(config.result_topic, "check-results");
    }

    #[test]
    fn test_unknown_check_fails_fast() {
        let err = ModerationConfig::from_hcl(r#"checks = ["pii", "sentiment"]"#).unwrap_err();
        assert!(matches!(err, ModerationError::Config(_)));
        assert!(err.to_string().contains("sentiment"));
    }

    #[test]
    fn test_invalid_topics_rejected() {
        let err = ModerationConfig::from_hcl(
            r#"
            scatter_topic = "same"
            result_topic = "same"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));

        assert!(ModerationConfig::from_hcl(r#"checks = []"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("a3s-moderation-{}.hcl", uuid::Uuid::new_v4()));
        std::fs::write(&path, "checks = [\"off_topic\"]\n").unwrap();

        let config = ModerationConfig::from_file(&path).unwrap();
        assert_eq!(config.check_set().unwrap().kinds(), &[CheckKind::OffTopic]);

        let _ = std::fs::remove_file(&path);
        assert!(ModerationConfig::from_file(&path).is_err());
    }
}
