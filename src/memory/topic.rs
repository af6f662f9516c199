use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use crate::memory::partition::Partition;

#[derive(Debug)]
pub struct Topic {
    name: String,
    partitions: BTreeMap<i32, Partition>,
    config: TopicConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub num_partitions: i32,
    pub max_message_bytes: usize, // maximum size of a message
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            max_message_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic {0} not found")]
    TopicNotFound(String),

    #[error("Topic {0} already exists")]
    TopicExists(String),

    #[error("Partition {topic}-{partition} not found")]
    PartitionNotFound { topic: String, partition: i32 },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Broker {0} is not part of the cluster")]
    UnknownBroker(i32),
}

impl Topic {
    /// Creates the topic with leaders chosen by `leader_for(partition)`.
    pub fn new(
        name: impl Into<String>,
        config: TopicConfig,
        leader_for: impl Fn(i32) -> Option<i32>,
    ) -> Self {
        let partitions = (0..config.num_partitions)
            .map(|id| (id, Partition::new(id, leader_for(id))))
            .collect();
        Topic {
            name: name.into(),
            partitions,
            config,
        }
    }

    pub fn append(
        &mut self,
        partition_id: i32,
        key: Option<Bytes>,
        value: Bytes,
        timestamp: i64,
    ) -> Result<i64, TopicError> {
        if value.len() > self.config.max_message_bytes {
            return Err(TopicError::MessageTooLarge {
                size: value.len(),
                max: self.config.max_message_bytes,
            });
        }

        Ok(self.partition_mut(partition_id)?.append(key, value, timestamp))
    }

    pub fn partition(&self, partition_id: i32) -> Option<&Partition> {
        self.partitions.get(&partition_id)
    }

    pub fn partition_mut(&mut self, partition_id: i32) -> Result<&mut Partition, TopicError> {
        let topic = &self.name;
        self.partitions
            .get_mut(&partition_id)
            .ok_or_else(|| TopicError::PartitionNotFound {
                topic: topic.clone(),
                partition: partition_id,
            })
    }

    pub fn partitions_mut(&mut self) -> impl Iterator<Item = &mut Partition> {
        self.partitions.values_mut()
    }

    pub fn partition_ids(&self) -> Vec<i32> {
        self.partitions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_get_leaders_from_placement() {
        let config = TopicConfig {
            num_partitions: 3,
            ..TopicConfig::default()
        };
        let topic = Topic::new("orders", config, |p| Some(p % 2 + 1));
        assert_eq!(topic.partition_ids(), vec![0, 1, 2]);
        assert_eq!(topic.partition(1).and_then(Partition::leader), Some(2));
        assert_eq!(topic.partition(2).and_then(Partition::leader), Some(1));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let config = TopicConfig {
            num_partitions: 1,
            max_message_bytes: 4,
        };
        let mut topic = Topic::new("t", config, |_| Some(1));
        assert_eq!(
            topic.append(0, None, Bytes::from_static(b"12345"), 0),
            Err(TopicError::MessageTooLarge { size: 5, max: 4 })
        );
        assert_eq!(topic.append(0, None, Bytes::from_static(b"1234"), 0), Ok(0));
        assert_eq!(
            topic.append(7, None, Bytes::from_static(b"1"), 0),
            Err(TopicError::PartitionNotFound {
                topic: "t".to_string(),
                partition: 7,
            })
        );
    }
}
