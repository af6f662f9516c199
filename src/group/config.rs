//! Consumer group configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_CLIENT_ID;
use crate::error::{ClientError, Result};
use crate::offset::OffsetStore;
use crate::retry::RetryPolicy;

/// Configuration for one consumer group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerGroupConfig {
    pub group_id: String,

    pub client_id: String,

    pub topics: Vec<String>,

    /// Starting position for partitions the group never committed
    pub from_offset: FromOffset,

    /// Where to move a cursor that fell outside the retained log
    pub out_of_range_offset: OutOfRangeReset,

    pub auto_commit: bool,

    pub auto_commit_interval_ms: u64,

    /// Commit the starting offsets of a fresh assignment right after joining
    pub commit_offsets_on_first_join: bool,

    pub session_timeout_ms: u64,

    pub heartbeat_interval_ms: u64,

    pub fetch_max_records: usize,

    /// Broker-side long-poll window of an idle fetch
    pub fetch_max_wait_ms: u64,

    pub request_timeout_ms: u64,

    /// Assignment strategy proposed to the group leader
    pub protocol: AssignmentStrategy,

    pub offset_store: OffsetStore,

    pub retry: RetryPolicy,

    pub message_buffer: usize,
}

/// Initial cursor policy when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FromOffset {
    Earliest,
    #[default]
    Latest,
    /// Report an error instead of guessing
    None,
}

/// Reset target after an out-of-range fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangeReset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    #[default]
    Range,
    RoundRobin,
}

impl AssignmentStrategy {
    pub fn name(self) -> &'static str {
        match self {
            AssignmentStrategy::Range => "range",
            AssignmentStrategy::RoundRobin => "roundrobin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "range" => Some(AssignmentStrategy::Range),
            "roundrobin" => Some(AssignmentStrategy::RoundRobin),
            _ => None,
        }
    }
}

impl Default for ConsumerGroupConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topics: Vec::new(),
            from_offset: FromOffset::default(),
            out_of_range_offset: OutOfRangeReset::default(),
            auto_commit: true,
            auto_commit_interval_ms: 5_000,
            commit_offsets_on_first_join: true,
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            fetch_max_records: 500,
            fetch_max_wait_ms: 100,
            request_timeout_ms: 30_000,
            protocol: AssignmentStrategy::default(),
            offset_store: OffsetStore::default(),
            retry: RetryPolicy::default(),
            message_buffer: 1_024,
        }
    }
}

impl ConsumerGroupConfig {
    pub fn new<S: Into<String>>(group_id: impl Into<String>, topics: impl IntoIterator<Item = S>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(ClientError::InvalidGroupId(self.group_id.clone()));
        }
        // an empty subscription is allowed, topics can be added after start
        if self.topics.iter().any(|t| t.is_empty()) {
            return Err(ClientError::Configuration("topic names must not be empty".to_string()));
        }
        for (name, value) in [
            ("autoCommitIntervalMs", self.auto_commit_interval_ms),
            ("sessionTimeoutMs", self.session_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ClientError::Configuration(format!("{name} must be positive")));
            }
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(ClientError::Configuration(
                "heartbeatIntervalMs must be lower than sessionTimeoutMs".to_string(),
            ));
        }
        if self.fetch_max_records == 0 || self.message_buffer == 0 {
            return Err(ClientError::Configuration(
                "fetchMaxRecords and messageBuffer must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_keys_are_camel_case() {
        let config = ConsumerGroupConfig::from_json(
            r#"{
                "groupId": "orders",
                "topics": ["t"],
                "fromOffset": "earliest",
                "autoCommit": true,
                "autoCommitIntervalMs": 1,
                "commitOffsetsOnFirstJoin": false,
                "protocol": "roundrobin",
                "offsetStore": "v0",
                "retry": { "maxAttempts": 3, "initialBackoffMs": 10 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.group_id, "orders");
        assert_eq!(config.from_offset, FromOffset::Earliest);
        assert_eq!(config.auto_commit_interval(), Duration::from_millis(1));
        assert!(!config.commit_offsets_on_first_join);
        assert_eq!(config.protocol, AssignmentStrategy::RoundRobin);
        assert_eq!(config.offset_store, OffsetStore::V0);
        assert_eq!(config.retry.max_attempts, Some(3));
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.session_timeout_ms, 30_000);
    }

    #[test]
    fn blank_group_is_invalid() {
        let config = ConsumerGroupConfig::new(" ", ["t"]);
        assert_eq!(config.validate(), Err(ClientError::InvalidGroupId(" ".into())));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ConsumerGroupConfig {
            auto_commit_interval_ms: 0,
            ..ConsumerGroupConfig::new("g", ["t"])
        };
        assert!(matches!(config.validate(), Err(ClientError::Configuration(_))));
    }

    #[test]
    fn empty_subscription_is_allowed_but_blank_topics_are_not() {
        let config = ConsumerGroupConfig::new("g", Vec::<String>::new());
        assert_eq!(config.validate(), Ok(()));
        let config = ConsumerGroupConfig::new("g", ["t", ""]);
        assert!(matches!(config.validate(), Err(ClientError::Configuration(_))));
    }

    #[test]
    fn retry_multiplier_is_validated() {
        let result = ConsumerGroupConfig::from_json(
            r#"{"groupId": "g", "topics": [], "retry": {"multiplier": 0.5}}"#,
        );
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        assert!(matches!(
            ConsumerGroupConfig::from_json("{\"groupId\": 5}"),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn strategy_names_round_trip() {
        for strategy in [AssignmentStrategy::Range, AssignmentStrategy::RoundRobin] {
            assert_eq!(AssignmentStrategy::from_name(strategy.name()), Some(strategy));
        }
        assert_eq!(AssignmentStrategy::from_name("sticky"), None);
    }
}
