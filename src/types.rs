use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_NUM_OFFSETS, LATEST_TIME, NO_GENERATION};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Addresses one partition, or every known partition of a topic when
/// `partition` is `None`.
///
/// `time` is either [`LATEST_TIME`], [`crate::constants::EARLIEST_TIME`] or a
/// timestamp in milliseconds. `offset` is only meaningful to commit-shaped
/// calls and must not be combined with `time`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicPartitionSelector {
    pub topic: String,
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub max_num: Option<i32>,
}

impl TopicPartitionSelector {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn max_num(mut self, max_num: i32) -> Self {
        self.max_num = Some(max_num);
        self
    }

    pub fn time_or_latest(&self) -> i64 {
        self.time.unwrap_or(LATEST_TIME)
    }

    pub fn max_num_or_default(&self) -> i32 {
        self.max_num.unwrap_or(DEFAULT_MAX_NUM_OFFSETS)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(ClientError::InvalidSelector {
                topic: self.topic.clone(),
                reason: "topic name is empty",
            });
        }
        if self.time.is_some() && self.offset.is_some() {
            return Err(ClientError::InvalidSelector {
                topic: self.topic.clone(),
                reason: "time and offset are mutually exclusive",
            });
        }
        if matches!(self.partition, Some(p) if p < 0) {
            return Err(ClientError::InvalidSelector {
                topic: self.topic.clone(),
                reason: "partition must not be negative",
            });
        }
        if matches!(self.max_num, Some(n) if n < 1) {
            return Err(ClientError::InvalidSelector {
                topic: self.topic.clone(),
                reason: "max_num must be at least 1",
            });
        }
        Ok(())
    }
}

/// Offset to record for one partition on behalf of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl CommitRequest {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < -1 || self.partition < 0 || self.topic.is_empty() {
            return Err(ClientError::InvalidOffset {
                topic: self.topic.clone(),
                partition: self.partition,
                offset: self.offset,
            });
        }
        Ok(())
    }
}

/// Group generation a V1 commit is issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub generation_id: i32,
    pub member_id: String,
}

impl Generation {
    pub fn new(generation_id: i32, member_id: impl Into<String>) -> Self {
        Self {
            generation_id,
            member_id: member_id.into(),
        }
    }

    /// Standalone commit outside of any group membership.
    pub fn none() -> Self {
        Self {
            generation_id: NO_GENERATION,
            member_id: String::new(),
        }
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::none()
    }
}

/// topic -> partition -> candidate offsets, most relevant first.
pub type FetchedOffsets = HashMap<String, HashMap<i32, Vec<i64>>>;
/// topic -> partition -> offset.
pub type PartitionOffsets = HashMap<String, HashMap<i32, i64>>;
/// topic -> partitions whose commit was acknowledged.
pub type CommitAck = HashMap<String, Vec<i32>>;
