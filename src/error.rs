use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{CommitAck, TopicPartition};

/// Error codes carried in broker responses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KafkaErrorCode {
    Unknown = -1,
    None = 0,
    OffsetOutOfRange = 1,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    GroupLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    UnknownMemberId = 25,
    RebalanceInProgress = 27,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    UnsupportedVersion = 35,
}

impl From<KafkaErrorCode> for i16 {
    fn from(error: KafkaErrorCode) -> i16 {
        error as i16
    }
}

impl KafkaErrorCode {
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => KafkaErrorCode::None,
            1 => KafkaErrorCode::OffsetOutOfRange,
            3 => KafkaErrorCode::UnknownTopicOrPartition,
            5 => KafkaErrorCode::LeaderNotAvailable,
            6 => KafkaErrorCode::NotLeaderForPartition,
            7 => KafkaErrorCode::RequestTimedOut,
            14 => KafkaErrorCode::GroupLoadInProgress,
            15 => KafkaErrorCode::CoordinatorNotAvailable,
            16 => KafkaErrorCode::NotCoordinator,
            22 => KafkaErrorCode::IllegalGeneration,
            23 => KafkaErrorCode::InconsistentGroupProtocol,
            24 => KafkaErrorCode::InvalidGroupId,
            25 => KafkaErrorCode::UnknownMemberId,
            27 => KafkaErrorCode::RebalanceInProgress,
            29 => KafkaErrorCode::TopicAuthorizationFailed,
            30 => KafkaErrorCode::GroupAuthorizationFailed,
            35 => KafkaErrorCode::UnsupportedVersion,
            _ => KafkaErrorCode::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == KafkaErrorCode::None
    }
}

/// Where a broker error code was observed, used to build a precise [`ClientError`].
#[derive(Debug, Clone, Copy)]
pub enum ErrorContext<'a> {
    Partition { topic: &'a str, partition: i32, offset: i64 },
    Group { group_id: &'a str },
    GroupPartition { group_id: &'a str, topic: &'a str, partition: i32, offset: i64 },
    None,
}

impl<'a> ErrorContext<'a> {
    fn partition(&self) -> Option<(&'a str, i32, i64)> {
        match *self {
            ErrorContext::Partition { topic, partition, offset }
            | ErrorContext::GroupPartition { topic, partition, offset, .. } => {
                Some((topic, partition, offset))
            }
            _ => None,
        }
    }

    fn group(&self) -> Option<&'a str> {
        match *self {
            ErrorContext::Group { group_id } | ErrorContext::GroupPartition { group_id, .. } => {
                Some(group_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("Broker not ready")]
    BrokerNotReady,

    #[error("Leader not available for {topic}-{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    #[error("Coordinator not available for group {group_id}")]
    CoordinatorNotAvailable { group_id: String },

    #[error("Group coordinator is still loading group state")]
    GroupLoadInProgress,

    #[error("Request timed out")]
    Timeout,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Topic(s) does not exist")]
    TopicDoesNotExist,

    #[error("Invalid group id: {0:?}")]
    InvalidGroupId(String),

    #[error("Offset {offset} out of range for {topic}-{partition}")]
    OffsetOutOfRange { topic: String, partition: i32, offset: i64 },

    #[error("Illegal generation, the member was fenced by a completed rebalance")]
    IllegalGeneration,

    #[error("Unknown member id")]
    UnknownMemberId,

    #[error("Group is rebalancing")]
    RebalanceInProgress,

    #[error("Not authorized: {0:?}")]
    AuthorizationFailed(KafkaErrorCode),

    #[error("Invalid selector for topic {topic}: {reason}")]
    InvalidSelector { topic: String, reason: &'static str },

    #[error("Invalid offset {offset} for {topic}-{partition}")]
    InvalidOffset { topic: String, partition: i32, offset: i64 },

    #[error("No committed offset for {topic}-{partition} and fromOffset is none")]
    NoCommittedOffset { topic: String, partition: i32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(
        "Commit acknowledged for {} partition(s) but failed for {}",
        partition_count(.acked),
        .failures.len()
    )]
    PartialCommit {
        acked: CommitAck,
        failures: BTreeMap<TopicPartition, ClientError>,
    },

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last: Box<ClientError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Consumer group is closed")]
    Closed,

    #[error("Broker error: {0:?}")]
    Broker(KafkaErrorCode),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

pub type Result<T> = std::result::Result<T, ClientError>;

fn partition_count(ack: &CommitAck) -> usize {
    ack.values().map(Vec::len).sum()
}

impl ClientError {
    /// Broker-not-ready conditions the retry driver absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::BrokerNotReady
                | ClientError::LeaderNotAvailable { .. }
                | ClientError::CoordinatorNotAvailable { .. }
                | ClientError::GroupLoadInProgress
                | ClientError::Timeout
                | ClientError::ConnectionLost(_)
        )
    }

    /// Errors after which a group member has to rejoin or be restarted.
    pub fn is_fatal_to_member(&self) -> bool {
        matches!(
            self,
            ClientError::IllegalGeneration
                | ClientError::UnknownMemberId
                | ClientError::AuthorizationFailed(_)
        )
    }

    /// Errors that mean the cached leader or coordinator identity is stale.
    pub fn invalidates_routing(&self) -> bool {
        matches!(
            self,
            ClientError::LeaderNotAvailable { .. }
                | ClientError::CoordinatorNotAvailable { .. }
                | ClientError::ConnectionLost(_)
                | ClientError::Timeout
        )
    }

    /// Translates a broker error code into a typed error, `None` for success.
    pub fn from_code(code: KafkaErrorCode, context: ErrorContext<'_>) -> Option<Self> {
        let err = match code {
            KafkaErrorCode::None => return None,
            KafkaErrorCode::OffsetOutOfRange => match context.partition() {
                Some((topic, partition, offset)) => ClientError::OffsetOutOfRange {
                    topic: topic.to_string(),
                    partition,
                    offset,
                },
                None => ClientError::Broker(code),
            },
            KafkaErrorCode::UnknownTopicOrPartition => ClientError::TopicDoesNotExist,
            KafkaErrorCode::LeaderNotAvailable | KafkaErrorCode::NotLeaderForPartition => {
                match context.partition() {
                    Some((topic, partition, _)) => ClientError::LeaderNotAvailable {
                        topic: topic.to_string(),
                        partition,
                    },
                    None => ClientError::BrokerNotReady,
                }
            }
            KafkaErrorCode::RequestTimedOut => ClientError::Timeout,
            KafkaErrorCode::GroupLoadInProgress => ClientError::GroupLoadInProgress,
            KafkaErrorCode::CoordinatorNotAvailable | KafkaErrorCode::NotCoordinator => {
                match context.group() {
                    Some(group_id) => ClientError::CoordinatorNotAvailable {
                        group_id: group_id.to_string(),
                    },
                    None => ClientError::BrokerNotReady,
                }
            }
            KafkaErrorCode::IllegalGeneration => ClientError::IllegalGeneration,
            KafkaErrorCode::InvalidGroupId => {
                ClientError::InvalidGroupId(context.group().unwrap_or_default().to_string())
            }
            KafkaErrorCode::UnknownMemberId => ClientError::UnknownMemberId,
            KafkaErrorCode::RebalanceInProgress => ClientError::RebalanceInProgress,
            KafkaErrorCode::TopicAuthorizationFailed | KafkaErrorCode::GroupAuthorizationFailed => {
                ClientError::AuthorizationFailed(code)
            }
            KafkaErrorCode::InconsistentGroupProtocol
            | KafkaErrorCode::UnsupportedVersion
            | KafkaErrorCode::Unknown => ClientError::Broker(code),
        };
        Some(err)
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout
    }
}
