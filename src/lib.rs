//! Offset management and consumer group coordination for a partitioned log
//! broker.
//!
//! * [`OffsetManager`] discovers offset ranges and stores committed offsets
//!   under either storage generation ([`OffsetStore::V0`] next to the log,
//!   [`OffsetStore::V1`] in the group coordinator).
//! * [`ConsumerGroup`] is a long-lived group member that consumes its
//!   assignment and commits progress.
//! * `memory::Cluster` is an in-process broker implementing
//!   [`BrokerClient`], behind the default `memory` feature.

pub mod broker;
pub mod constants;
pub mod error;
pub mod group;
#[cfg(feature = "memory")]
pub mod memory;
pub mod offset;
pub mod protocol;
pub mod retry;
pub mod types;

pub use broker::{BrokerClient, BrokerDirectory, BrokerRef};
pub use error::{ClientError, KafkaErrorCode, Result};
pub use group::{
    ConsumerGroup, ConsumerGroupConfig, ConsumerMessage, FromOffset, GroupEvent, GroupState,
    GroupStreams,
};
pub use offset::{OffsetManager, OffsetStore};
pub use retry::RetryPolicy;
pub use types::{CommitRequest, Generation, TopicPartition, TopicPartitionSelector};
