//! Typed requests and responses exchanged with a broker.
//!
//! Byte-level encoding lives with the connection client behind
//! [`crate::broker::BrokerClient`]; this module only fixes the shape of each
//! exchange and which API key/version it travels under.

use std::ops::RangeInclusive;
use std::time::Duration;

use bytes::Bytes;

use crate::constants::{
    API_KEY_FETCH, API_KEY_HEARTBEAT, API_KEY_JOIN_GROUP, API_KEY_LEAVE_GROUP,
    API_KEY_LIST_OFFSETS, API_KEY_OFFSET_COMMIT, API_KEY_OFFSET_FETCH, API_KEY_SYNC_GROUP,
    OFFSET_API_VERSION_V0, OFFSET_API_VERSION_V1,
};
use crate::error::{ClientError, KafkaErrorCode, Result};
use crate::types::TopicPartition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

/// Version range a broker accepts per API key.
pub fn supported_versions(api_key: i16) -> RangeInclusive<i16> {
    match api_key {
        API_KEY_OFFSET_COMMIT | API_KEY_OFFSET_FETCH => OFFSET_API_VERSION_V0..=OFFSET_API_VERSION_V1,
        _ => 0..=0,
    }
}

pub fn is_version_supported(api_key: i16, api_version: i16) -> bool {
    supported_versions(api_key).contains(&api_version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartition {
    pub topic: String,
    pub partition: i32,
    pub time: i64,
    pub max_num: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsRequest {
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartitionResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaErrorCode,
    pub offsets: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsResponse {
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub version: i16,
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub partitions: Vec<CommitPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionError {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    pub partitions: Vec<PartitionError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub version: i16,
    pub group_id: String,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<String>,
    pub error: KafkaErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    pub partitions: Vec<OffsetFetchPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub max_wait: Duration,
    pub partitions: Vec<FetchPartition>,
}

/// A record as stored in a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaErrorCode,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProtocol {
    pub name: String,
    pub subscription: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub member_id: String,
    pub client_id: String,
    pub protocol_type: String,
    pub protocols: Vec<GroupProtocol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub subscription: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGroupResponse {
    pub error: KafkaErrorCode,
    pub generation_id: i32,
    pub protocol: String,
    pub leader_id: String,
    pub member_id: String,
    /// Populated for the elected leader only.
    pub members: Vec<JoinGroupMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAssignment {
    pub member_id: String,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub assignments: Vec<MemberAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroupResponse {
    pub error: KafkaErrorCode,
    pub assignment: Vec<TopicPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ListOffsets(ListOffsetsRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
    Fetch(FetchRequest),
    JoinGroup(JoinGroupRequest),
    SyncGroup(SyncGroupRequest),
    Heartbeat(HeartbeatRequest),
    LeaveGroup(LeaveGroupRequest),
}

impl Request {
    pub fn api_key(&self) -> i16 {
        match self {
            Request::ListOffsets(_) => API_KEY_LIST_OFFSETS,
            Request::OffsetCommit(_) => API_KEY_OFFSET_COMMIT,
            Request::OffsetFetch(_) => API_KEY_OFFSET_FETCH,
            Request::Fetch(_) => API_KEY_FETCH,
            Request::JoinGroup(_) => API_KEY_JOIN_GROUP,
            Request::SyncGroup(_) => API_KEY_SYNC_GROUP,
            Request::Heartbeat(_) => API_KEY_HEARTBEAT,
            Request::LeaveGroup(_) => API_KEY_LEAVE_GROUP,
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            Request::OffsetCommit(req) => req.version,
            Request::OffsetFetch(req) => req.version,
            _ => 0,
        }
    }

    pub fn header(&self, correlation_id: i32, client_id: &str) -> RequestHeader {
        RequestHeader {
            api_key: self.api_key(),
            api_version: self.api_version(),
            correlation_id,
            client_id: client_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ListOffsets(ListOffsetsResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
    Fetch(FetchResponse),
    JoinGroup(JoinGroupResponse),
    SyncGroup(SyncGroupResponse),
    Heartbeat(KafkaErrorCode),
    LeaveGroup(KafkaErrorCode),
}

// Generates `Response::into_*` accessors that reject a mismatched variant.
macro_rules! response_accessor {
    ($($method:ident => $variant:ident($type:ty)),* $(,)?) => {
        impl Response {
            $(
                pub fn $method(self) -> Result<$type> {
                    match self {
                        Response::$variant(inner) => Ok(inner),
                        _ => Err(ClientError::UnexpectedResponse(stringify!($variant))),
                    }
                }
            )*
        }
    };
}

response_accessor! {
    into_list_offsets => ListOffsets(ListOffsetsResponse),
    into_offset_commit => OffsetCommit(OffsetCommitResponse),
    into_offset_fetch => OffsetFetch(OffsetFetchResponse),
    into_fetch => Fetch(FetchResponse),
    into_join_group => JoinGroup(JoinGroupResponse),
    into_sync_group => SyncGroup(SyncGroupResponse),
    into_heartbeat => Heartbeat(KafkaErrorCode),
    into_leave_group => LeaveGroup(KafkaErrorCode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_apis_accept_both_generations() {
        assert!(is_version_supported(API_KEY_OFFSET_COMMIT, 0));
        assert!(is_version_supported(API_KEY_OFFSET_FETCH, 1));
        assert!(!is_version_supported(API_KEY_OFFSET_FETCH, 2));
        assert!(!is_version_supported(API_KEY_FETCH, 1));
    }

    #[test]
    fn header_carries_offset_generation() {
        let request = Request::OffsetFetch(OffsetFetchRequest {
            version: OFFSET_API_VERSION_V1,
            group_id: "g".into(),
            partitions: vec![TopicPartition::new("t", 0)],
        });
        let header = request.header(7, "client");
        assert_eq!(header.api_key, API_KEY_OFFSET_FETCH);
        assert_eq!(header.api_version, 1);
        assert_eq!(header.correlation_id, 7);
    }

    #[test]
    fn accessor_rejects_other_variant() {
        let response = Response::Heartbeat(KafkaErrorCode::None);
        assert_eq!(
            response.into_fetch(),
            Err(ClientError::UnexpectedResponse("Fetch"))
        );
    }
}
