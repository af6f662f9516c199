use bytes::Bytes;

use crate::error::ClientError;
use crate::protocol::Record;
use crate::types::{CommitAck, TopicPartition};

/// One consumed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// End of the log when the record was fetched; the member is caught up
    /// once `offset == high_water_offset - 1`.
    pub high_water_offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

impl ConsumerMessage {
    pub(crate) fn from_record(tp: &TopicPartition, high_water_offset: i64, record: Record) -> Self {
        Self {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset: record.offset,
            high_water_offset,
            key: record.key,
            value: record.value,
            timestamp: record.timestamp,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn is_caught_up(&self) -> bool {
        self.offset == self.high_water_offset - 1
    }
}

/// Lifecycle notifications delivered on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// First join completed.
    Connect {
        generation_id: i32,
        member_id: String,
        assignment: Vec<TopicPartition>,
    },
    /// The group re-formed and this member has a new assignment.
    Rebalanced {
        generation_id: i32,
        assignment: Vec<TopicPartition>,
    },
    /// Non-fatal protocol or connectivity problem; `fatal` marks errors that
    /// fenced the member out of its generation.
    Error { error: ClientError, fatal: bool },
    /// A cursor fell outside the retained log and was reset.
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
        reset_to: i64,
    },
    Committed(CommitAck),
}
