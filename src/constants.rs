use std::time::Duration;

pub const API_KEY_FETCH: i16 = 1;
pub const API_KEY_LIST_OFFSETS: i16 = 2;
pub const API_KEY_METADATA: i16 = 3;
pub const API_KEY_OFFSET_COMMIT: i16 = 8;
pub const API_KEY_OFFSET_FETCH: i16 = 9;
pub const API_KEY_FIND_COORDINATOR: i16 = 10;
pub const API_KEY_JOIN_GROUP: i16 = 11;
pub const API_KEY_HEARTBEAT: i16 = 12;
pub const API_KEY_LEAVE_GROUP: i16 = 13;
pub const API_KEY_SYNC_GROUP: i16 = 14;

/// Offset commit/fetch generation stored next to the partition log.
pub const OFFSET_API_VERSION_V0: i16 = 0;
/// Offset commit/fetch generation stored by the group coordinator.
pub const OFFSET_API_VERSION_V1: i16 = 1;

/// `time` sentinel selecting the high watermark.
pub const LATEST_TIME: i64 = -1;
/// `time` sentinel selecting the log start offset.
pub const EARLIEST_TIME: i64 = -2;
/// Committed offset reported for a partition the group never committed.
pub const NO_COMMITTED_OFFSET: i64 = -1;
/// Generation id used by standalone (non-member) V1 commits.
pub const NO_GENERATION: i32 = -1;

pub const DEFAULT_CLIENT_ID: &str = "rafka-offsets";
/// Protocol type announced by consumer group members.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";
pub const DEFAULT_MAX_NUM_OFFSETS: i32 = 1;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
