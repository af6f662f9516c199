//! Consumer group member: joins a group, consumes its assignment and
//! commits progress.

pub mod assignor;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod state;

pub use config::{AssignmentStrategy, ConsumerGroupConfig, FromOffset, OutOfRangeReset};
pub use coordinator::{ConsumerGroup, GroupStreams};
pub use event::{ConsumerMessage, GroupEvent};
pub use state::{ConsumptionCursor, GroupState, Membership};
