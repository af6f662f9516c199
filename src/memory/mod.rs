//! In-process broker cluster.
//!
//! Implements [`BrokerClient`] over shared in-memory state so the offset
//! manager and consumer groups can run without a network. Brokers enforce the
//! same routing rules a real cluster does: partition requests must reach the
//! partition leader, group requests the group coordinator. Faults can be
//! injected per API key to simulate elections and coordinator moves.

pub mod group;
pub mod partition;
pub mod topic;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::broker::{BrokerClient, BrokerRef};
use crate::constants::{
    API_KEY_FIND_COORDINATOR, API_KEY_METADATA, NO_COMMITTED_OFFSET, OFFSET_API_VERSION_V0,
};
use crate::error::{ClientError, ErrorContext, KafkaErrorCode, Result};
use crate::protocol::{
    is_version_supported, FetchPartitionResponse, FetchRequest, FetchResponse, JoinGroupResponse,
    ListOffsetsPartitionResponse, ListOffsetsRequest, ListOffsetsResponse, OffsetCommitRequest,
    OffsetCommitResponse, OffsetFetchPartition, OffsetFetchRequest, OffsetFetchResponse,
    PartitionError, Request, RequestHeader, Response, SyncGroupResponse,
};
use crate::types::TopicPartition;

pub use group::{CommittedOffset, ConsumerGroup, GroupState};
pub use partition::Partition;
pub use topic::{Topic, TopicConfig, TopicError};

/// What an injected fault does to a matching request.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    /// Answer with this error code on every partition/member of the request.
    Code(KafkaErrorCode),
    /// Fail the exchange as if the connection dropped.
    ConnectionLost,
    /// Hold the request before handling it.
    Delay(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub api_key: i16,
    /// Restrict to one broker; `None` matches any.
    pub broker: Option<i32>,
    pub kind: FaultKind,
    pub remaining: u32,
}

impl Fault {
    pub fn new(api_key: i16, kind: FaultKind, times: u32) -> Self {
        Self {
            api_key,
            broker: None,
            kind,
            remaining: times,
        }
    }

    pub fn on_broker(mut self, broker: i32) -> Self {
        self.broker = Some(broker);
        self
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    topics: HashMap<String, Topic>,
    groups: HashMap<String, ConsumerGroup>,
    // explicit placement; `None` means the coordinator is unavailable
    coordinators: HashMap<String, Option<i32>>,
}

impl ClusterState {
    fn partition(&self, topic: &str, partition: i32) -> std::result::Result<&Partition, KafkaErrorCode> {
        self.topics
            .get(topic)
            .and_then(|t| t.partition(partition))
            .ok_or(KafkaErrorCode::UnknownTopicOrPartition)
    }

    // error code for a partition request reaching broker_id
    fn leader_check(&self, broker_id: i32, topic: &str, partition: i32) -> KafkaErrorCode {
        match self.partition(topic, partition) {
            Err(code) => code,
            Ok(p) => match p.leader() {
                None => KafkaErrorCode::LeaderNotAvailable,
                Some(leader) if leader != broker_id => KafkaErrorCode::NotLeaderForPartition,
                Some(_) => KafkaErrorCode::None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub broker: i32,
    pub header: RequestHeader,
}

#[derive(Debug)]
pub struct Cluster {
    brokers: Vec<BrokerRef>,
    state: RwLock<ClusterState>,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<LoggedRequest>>,
    appended: watch::Sender<u64>,
}

impl Cluster {
    pub fn new(num_brokers: usize) -> Arc<Self> {
        let brokers = (1..=num_brokers.max(1) as i32)
            .map(|id| BrokerRef::new(id, "127.0.0.1", 9091 + id as u16))
            .collect();
        let (appended, _) = watch::channel(0);
        Arc::new(Self {
            brokers,
            state: RwLock::new(ClusterState::default()),
            faults: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            appended,
        })
    }

    pub fn brokers(&self) -> &[BrokerRef] {
        &self.brokers
    }

    fn broker(&self, id: i32) -> Option<&BrokerRef> {
        self.brokers.iter().find(|b| b.id == id)
    }

    pub async fn create_topic(&self, name: &str, num_partitions: i32) -> std::result::Result<(), TopicError> {
        let brokers = self.brokers.len() as i32;
        self.insert_topic(name, num_partitions, move |p| Some(p % brokers + 1))
            .await
    }

    /// Creates a topic that has no elected leaders yet.
    pub async fn create_topic_without_leaders(
        &self,
        name: &str,
        num_partitions: i32,
    ) -> std::result::Result<(), TopicError> {
        self.insert_topic(name, num_partitions, |_| None).await
    }

    async fn insert_topic(
        &self,
        name: &str,
        num_partitions: i32,
        leader_for: impl Fn(i32) -> Option<i32>,
    ) -> std::result::Result<(), TopicError> {
        let mut state = self.state.write().await;
        if state.topics.contains_key(name) {
            return Err(TopicError::TopicExists(name.to_string()));
        }
        let config = TopicConfig {
            num_partitions: num_partitions.max(1),
            ..TopicConfig::default()
        };
        state
            .topics
            .insert(name.to_string(), Topic::new(name, config, leader_for));
        debug!("created topic {} with {} partition(s)", name, num_partitions);
        Ok(())
    }

    /// Elects round-robin leaders for every leaderless partition of `topic`.
    pub async fn elect_leaders(&self, topic: &str) -> std::result::Result<(), TopicError> {
        let brokers = self.brokers.len() as i32;
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TopicError::TopicNotFound(topic.to_string()))?;
        for partition in topic.partitions_mut() {
            if partition.leader().is_none() {
                let leader = partition.id() % brokers + 1;
                partition.set_leader(Some(leader));
            }
        }
        Ok(())
    }

    pub async fn set_leader(
        &self,
        topic: &str,
        partition: i32,
        leader: Option<i32>,
    ) -> std::result::Result<(), TopicError> {
        if let Some(id) = leader {
            if self.broker(id).is_none() {
                return Err(TopicError::UnknownBroker(id));
            }
        }
        let mut state = self.state.write().await;
        state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TopicError::TopicNotFound(topic.to_string()))?
            .partition_mut(partition)?
            .set_leader(leader);
        Ok(())
    }

    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        value: impl Into<Bytes>,
    ) -> std::result::Result<i64, TopicError> {
        self.produce_record(topic, partition, None, value.into(), Utc::now().timestamp_millis())
            .await
    }

    pub async fn produce_record(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Bytes,
        timestamp: i64,
    ) -> std::result::Result<i64, TopicError> {
        let offset = {
            let mut state = self.state.write().await;
            state
                .topics
                .get_mut(topic)
                .ok_or_else(|| TopicError::TopicNotFound(topic.to_string()))?
                .append(partition, key, value, timestamp)?
        };
        self.appended.send_modify(|seq| *seq += 1);
        trace!("appended {}-{} at offset {}", topic, partition, offset);
        Ok(offset)
    }

    /// Drops records below `offset`, as retention would.
    pub async fn truncate(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> std::result::Result<(), TopicError> {
        let mut state = self.state.write().await;
        state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TopicError::TopicNotFound(topic.to_string()))?
            .partition_mut(partition)?
            .truncate_before(offset);
        Ok(())
    }

    /// Pins a group's coordinator; `None` makes it unavailable.
    pub async fn set_coordinator(&self, group_id: &str, broker: Option<i32>) {
        self.state
            .write()
            .await
            .coordinators
            .insert(group_id.to_string(), broker);
    }

    pub async fn inject_fault(&self, fault: Fault) {
        self.faults.lock().await.push(fault);
    }

    pub async fn requests(&self) -> Vec<LoggedRequest> {
        self.log.lock().await.clone()
    }

    pub async fn requests_to(&self, broker: i32, api_key: i16) -> usize {
        self.log
            .lock()
            .await
            .iter()
            .filter(|r| r.broker == broker && r.header.api_key == api_key)
            .count()
    }

    pub async fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.read().await;
        state.partition(topic, partition).ok().map(Partition::high_watermark)
    }

    pub async fn leader_of(&self, topic: &str, partition: i32) -> Option<i32> {
        let state = self.state.read().await;
        state.partition(topic, partition).ok().and_then(Partition::leader)
    }

    pub async fn group_generation(&self, group_id: &str) -> Option<i32> {
        self.state.read().await.groups.get(group_id).map(ConsumerGroup::generation_id)
    }

    pub async fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.state.read().await.groups.get(group_id).map(ConsumerGroup::state)
    }

    pub async fn group_members(&self, group_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .groups
            .get(group_id)
            .map(ConsumerGroup::member_ids)
            .unwrap_or_default()
    }

    fn coordinator_id(&self, state: &ClusterState, group_id: &str) -> Option<i32> {
        if let Some(pinned) = state.coordinators.get(group_id) {
            return *pinned;
        }
        let mut hasher = DefaultHasher::new();
        group_id.hash(&mut hasher);
        let index = (hasher.finish() % self.brokers.len() as u64) as usize;
        self.brokers.get(index).map(|b| b.id)
    }

    async fn take_fault(&self, api_key: i16, broker: Option<i32>) -> Option<FaultKind> {
        let mut faults = self.faults.lock().await;
        let position = faults.iter().position(|f| {
            f.api_key == api_key
                && f.remaining > 0
                && (f.broker.is_none() || broker.is_none() || f.broker == broker)
        })?;
        let fault = &mut faults[position];
        fault.remaining -= 1;
        let kind = fault.kind.clone();
        if fault.remaining == 0 {
            faults.remove(position);
        }
        Some(kind)
    }

    // faults on lookups have no response body to carry the code
    async fn lookup_fault(&self, api_key: i16, context: ErrorContext<'_>) -> Result<()> {
        match self.take_fault(api_key, None).await {
            None => Ok(()),
            Some(FaultKind::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(FaultKind::ConnectionLost) => {
                Err(ClientError::ConnectionLost("injected".to_string()))
            }
            Some(FaultKind::Code(code)) => match ClientError::from_code(code, context) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    async fn handle(&self, broker: &BrokerRef, request: Request) -> Response {
        match request {
            Request::ListOffsets(req) => Response::ListOffsets(self.list_offsets(broker.id, req).await),
            Request::OffsetCommit(req) => Response::OffsetCommit(self.offset_commit(broker.id, req).await),
            Request::OffsetFetch(req) => Response::OffsetFetch(self.offset_fetch(broker.id, req).await),
            Request::Fetch(req) => Response::Fetch(self.fetch(broker.id, req).await),
            Request::JoinGroup(req) => {
                let mut state = self.state.write().await;
                if req.group_id.is_empty() {
                    return Response::JoinGroup(join_error(KafkaErrorCode::InvalidGroupId, &req.member_id));
                }
                if self.coordinator_id(&state, &req.group_id) != Some(broker.id) {
                    return Response::JoinGroup(join_error(KafkaErrorCode::NotCoordinator, &req.member_id));
                }
                let group = state
                    .groups
                    .entry(req.group_id.clone())
                    .or_insert_with(|| ConsumerGroup::new(req.group_id.clone()));
                Response::JoinGroup(group.join(&req, Instant::now()))
            }
            Request::SyncGroup(req) => {
                let mut state = self.state.write().await;
                if self.coordinator_id(&state, &req.group_id) != Some(broker.id) {
                    return Response::SyncGroup(SyncGroupResponse {
                        error: KafkaErrorCode::NotCoordinator,
                        assignment: Vec::new(),
                    });
                }
                match state.groups.get_mut(&req.group_id) {
                    Some(group) => Response::SyncGroup(group.sync(&req, Instant::now())),
                    None => Response::SyncGroup(SyncGroupResponse {
                        error: KafkaErrorCode::UnknownMemberId,
                        assignment: Vec::new(),
                    }),
                }
            }
            Request::Heartbeat(req) => {
                let mut state = self.state.write().await;
                if self.coordinator_id(&state, &req.group_id) != Some(broker.id) {
                    return Response::Heartbeat(KafkaErrorCode::NotCoordinator);
                }
                Response::Heartbeat(match state.groups.get_mut(&req.group_id) {
                    Some(group) => group.heartbeat(&req, Instant::now()),
                    None => KafkaErrorCode::UnknownMemberId,
                })
            }
            Request::LeaveGroup(req) => {
                let mut state = self.state.write().await;
                if self.coordinator_id(&state, &req.group_id) != Some(broker.id) {
                    return Response::LeaveGroup(KafkaErrorCode::NotCoordinator);
                }
                Response::LeaveGroup(match state.groups.get_mut(&req.group_id) {
                    Some(group) => group.leave(&req, Instant::now()),
                    None => KafkaErrorCode::UnknownMemberId,
                })
            }
        }
    }

    async fn list_offsets(&self, broker_id: i32, req: ListOffsetsRequest) -> ListOffsetsResponse {
        let state = self.state.read().await;
        let partitions = req
            .partitions
            .into_iter()
            .map(|p| {
                let error = state.leader_check(broker_id, &p.topic, p.partition);
                let offsets = match state.partition(&p.topic, p.partition) {
                    Ok(partition) if error.is_ok() => partition.list_offsets(p.time, p.max_num),
                    _ => Vec::new(),
                };
                ListOffsetsPartitionResponse {
                    topic: p.topic,
                    partition: p.partition,
                    error,
                    offsets,
                }
            })
            .collect();
        ListOffsetsResponse { partitions }
    }

    async fn offset_commit(&self, broker_id: i32, req: OffsetCommitRequest) -> OffsetCommitResponse {
        let mut state = self.state.write().await;
        let timestamp = Utc::now().timestamp_millis();
        let now = Instant::now();
        let coordinator = self.coordinator_id(&state, &req.group_id);

        let mut partitions = Vec::with_capacity(req.partitions.len());
        for p in &req.partitions {
            let error = if req.group_id.is_empty() {
                KafkaErrorCode::InvalidGroupId
            } else if req.version == OFFSET_API_VERSION_V0 {
                let error = state.leader_check(broker_id, &p.topic, p.partition);
                if error.is_ok() {
                    if let Some(partition) = state
                        .topics
                        .get_mut(&p.topic)
                        .and_then(|t| t.partition_mut(p.partition).ok())
                    {
                        partition.commit(
                            &req.group_id,
                            CommittedOffset {
                                offset: p.offset,
                                metadata: p.metadata.clone(),
                                commit_timestamp_ms: timestamp,
                            },
                        );
                    }
                }
                error
            } else if coordinator != Some(broker_id) {
                KafkaErrorCode::NotCoordinator
            } else if let Err(code) = state.partition(&p.topic, p.partition) {
                code
            } else {
                state
                    .groups
                    .entry(req.group_id.clone())
                    .or_insert_with(|| ConsumerGroup::new(req.group_id.clone()))
                    .commit(req.generation_id, &req.member_id, p, timestamp, now)
            };
            partitions.push(PartitionError {
                topic: p.topic.clone(),
                partition: p.partition,
                error,
            });
        }
        OffsetCommitResponse { partitions }
    }

    async fn offset_fetch(&self, broker_id: i32, req: OffsetFetchRequest) -> OffsetFetchResponse {
        let state = self.state.read().await;
        let coordinator = self.coordinator_id(&state, &req.group_id);

        let partitions = req
            .partitions
            .into_iter()
            .map(|tp| {
                let (error, offset, metadata) = if req.version == OFFSET_API_VERSION_V0 {
                    let error = state.leader_check(broker_id, &tp.topic, tp.partition);
                    let committed = state
                        .partition(&tp.topic, tp.partition)
                        .ok()
                        .filter(|_| error.is_ok())
                        .and_then(|p| p.committed(&req.group_id));
                    match committed {
                        Some(c) => (error, c.offset, c.metadata.clone()),
                        None => (error, NO_COMMITTED_OFFSET, None),
                    }
                } else if coordinator != Some(broker_id) {
                    (KafkaErrorCode::NotCoordinator, NO_COMMITTED_OFFSET, None)
                } else if let Err(code) = state.partition(&tp.topic, tp.partition) {
                    (code, NO_COMMITTED_OFFSET, None)
                } else {
                    let (offset, metadata) = state
                        .groups
                        .get(&req.group_id)
                        .map(|g| g.committed(&tp))
                        .unwrap_or((NO_COMMITTED_OFFSET, None));
                    (KafkaErrorCode::None, offset, metadata)
                };
                OffsetFetchPartition {
                    topic: tp.topic,
                    partition: tp.partition,
                    offset,
                    metadata,
                    error,
                }
            })
            .collect();
        OffsetFetchResponse { partitions }
    }

    // long-polls up to max_wait when no partition has new data
    async fn fetch(&self, broker_id: i32, req: FetchRequest) -> FetchResponse {
        let mut appended = self.appended.subscribe();
        appended.borrow_and_update();

        let response = self.read_partitions(broker_id, &req).await;
        let idle = response
            .partitions
            .iter()
            .all(|p| p.error.is_ok() && p.records.is_empty());
        if !idle || req.max_wait.is_zero() {
            return response;
        }

        match tokio::time::timeout(req.max_wait, appended.changed()).await {
            Ok(Ok(())) => self.read_partitions(broker_id, &req).await,
            _ => response,
        }
    }

    async fn read_partitions(&self, broker_id: i32, req: &FetchRequest) -> FetchResponse {
        let state = self.state.read().await;
        let partitions = req
            .partitions
            .iter()
            .map(|p| {
                let mut response = FetchPartitionResponse {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    error: state.leader_check(broker_id, &p.topic, p.partition),
                    high_watermark: -1,
                    log_start_offset: -1,
                    records: Vec::new(),
                };
                if let (true, Ok(partition)) =
                    (response.error.is_ok(), state.partition(&p.topic, p.partition))
                {
                    response.high_watermark = partition.high_watermark();
                    response.log_start_offset = partition.log_start_offset();
                    if partition.in_range(p.offset) {
                        response.records = partition.read_from(p.offset, p.max_records);
                    } else {
                        response.error = KafkaErrorCode::OffsetOutOfRange;
                    }
                }
                response
            })
            .collect();
        FetchResponse { partitions }
    }
}

fn join_error(error: KafkaErrorCode, member_id: &str) -> JoinGroupResponse {
    JoinGroupResponse {
        error,
        generation_id: -1,
        protocol: String::new(),
        leader_id: String::new(),
        member_id: member_id.to_string(),
        members: Vec::new(),
    }
}

/// Response carrying `code` for everything the request addressed.
fn error_response(request: &Request, code: KafkaErrorCode) -> Response {
    match request {
        Request::ListOffsets(req) => Response::ListOffsets(ListOffsetsResponse {
            partitions: req
                .partitions
                .iter()
                .map(|p| ListOffsetsPartitionResponse {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    error: code,
                    offsets: Vec::new(),
                })
                .collect(),
        }),
        Request::OffsetCommit(req) => Response::OffsetCommit(OffsetCommitResponse {
            partitions: req
                .partitions
                .iter()
                .map(|p| PartitionError {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    error: code,
                })
                .collect(),
        }),
        Request::OffsetFetch(req) => Response::OffsetFetch(OffsetFetchResponse {
            partitions: req
                .partitions
                .iter()
                .map(|tp| OffsetFetchPartition {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: NO_COMMITTED_OFFSET,
                    metadata: None,
                    error: code,
                })
                .collect(),
        }),
        Request::Fetch(req) => Response::Fetch(FetchResponse {
            partitions: req
                .partitions
                .iter()
                .map(|p| FetchPartitionResponse {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    error: code,
                    high_watermark: -1,
                    log_start_offset: -1,
                    records: Vec::new(),
                })
                .collect(),
        }),
        Request::JoinGroup(req) => Response::JoinGroup(join_error(code, &req.member_id)),
        Request::SyncGroup(_) => Response::SyncGroup(SyncGroupResponse {
            error: code,
            assignment: Vec::new(),
        }),
        Request::Heartbeat(_) => Response::Heartbeat(code),
        Request::LeaveGroup(_) => Response::LeaveGroup(code),
    }
}

#[async_trait]
impl BrokerClient for Cluster {
    async fn leader_for(&self, topic: &str, partition: i32) -> Result<BrokerRef> {
        self.lookup_fault(
            API_KEY_METADATA,
            ErrorContext::Partition { topic, partition, offset: -1 },
        )
        .await?;
        let state = self.state.read().await;
        let leader = state
            .partition(topic, partition)
            .map_err(|_| ClientError::TopicDoesNotExist)?
            .leader()
            .and_then(|id| self.broker(id))
            .cloned();
        leader.ok_or_else(|| ClientError::LeaderNotAvailable {
            topic: topic.to_string(),
            partition,
        })
    }

    async fn coordinator_for(&self, group_id: &str) -> Result<BrokerRef> {
        self.lookup_fault(API_KEY_FIND_COORDINATOR, ErrorContext::Group { group_id })
            .await?;
        let state = self.state.read().await;
        self.coordinator_id(&state, group_id)
            .and_then(|id| self.broker(id))
            .cloned()
            .ok_or_else(|| ClientError::CoordinatorNotAvailable {
                group_id: group_id.to_string(),
            })
    }

    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        self.lookup_fault(API_KEY_METADATA, ErrorContext::None).await?;
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(Topic::partition_ids)
            .ok_or(ClientError::TopicDoesNotExist)
    }

    async fn send(&self, broker: &BrokerRef, header: RequestHeader, request: Request) -> Result<Response> {
        if self.broker(broker.id).is_none() {
            return Err(ClientError::ConnectionLost(format!("no such broker {}", broker)));
        }
        self.log.lock().await.push(LoggedRequest {
            broker: broker.id,
            header: header.clone(),
        });

        if !is_version_supported(header.api_key, header.api_version) {
            warn!(
                "unsupported version {} for api key {}",
                header.api_version, header.api_key
            );
            return Ok(error_response(&request, KafkaErrorCode::UnsupportedVersion));
        }

        match self.take_fault(header.api_key, Some(broker.id)).await {
            Some(FaultKind::Code(code)) => {
                debug!("injecting {:?} into api key {} on {}", code, header.api_key, broker);
                return Ok(error_response(&request, code));
            }
            Some(FaultKind::ConnectionLost) => {
                return Err(ClientError::ConnectionLost(format!("{} dropped the request", broker)));
            }
            Some(FaultKind::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        Ok(self.handle(broker, request).await)
    }
}

impl Cluster {
    pub async fn coordinator_of(&self, group_id: &str) -> Option<i32> {
        let state = self.state.read().await;
        self.coordinator_id(&state, group_id)
    }

    pub async fn committed_v0(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.read().await;
        state
            .partition(topic, partition)
            .ok()
            .and_then(|p| p.committed(group_id))
            .map(|c| c.offset)
    }

    pub async fn committed_v1(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state.read().await;
        let (offset, _) = state
            .groups
            .get(group_id)?
            .committed(&TopicPartition::new(topic, partition));
        (offset != NO_COMMITTED_OFFSET).then_some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{API_KEY_LIST_OFFSETS, LATEST_TIME};
    use crate::protocol::ListOffsetsPartition;

    fn list_request(topic: &str, partition: i32) -> Request {
        Request::ListOffsets(ListOffsetsRequest {
            partitions: vec![ListOffsetsPartition {
                topic: topic.into(),
                partition,
                time: LATEST_TIME,
                max_num: 1,
            }],
        })
    }

    fn header(request: &Request) -> RequestHeader {
        request.header(0, "test")
    }

    #[tokio::test]
    async fn non_leader_rejects_partition_requests() {
        let cluster = Cluster::new(2);
        cluster.create_topic("t", 2).await.unwrap();
        let leader = cluster.leader_of("t", 0).await.unwrap();
        let other = cluster.brokers().iter().find(|b| b.id != leader).unwrap().clone();

        let request = list_request("t", 0);
        let response = cluster
            .send(&other, header(&request), request.clone())
            .await
            .unwrap()
            .into_list_offsets()
            .unwrap();
        assert_eq!(response.partitions[0].error, KafkaErrorCode::NotLeaderForPartition);

        let leader_ref = cluster.leader_for("t", 0).await.unwrap();
        let response = cluster
            .send(&leader_ref, header(&request), request)
            .await
            .unwrap()
            .into_list_offsets()
            .unwrap();
        assert_eq!(response.partitions[0].error, KafkaErrorCode::None);
        assert_eq!(response.partitions[0].offsets, vec![0]);
    }

    #[tokio::test]
    async fn leaderless_partition_is_not_ready() {
        let cluster = Cluster::new(1);
        cluster.create_topic_without_leaders("fresh", 1).await.unwrap();
        assert_eq!(
            cluster.leader_for("fresh", 0).await,
            Err(ClientError::LeaderNotAvailable { topic: "fresh".into(), partition: 0 })
        );
        cluster.elect_leaders("fresh").await.unwrap();
        assert_eq!(cluster.leader_for("fresh", 0).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn injected_fault_fires_requested_number_of_times() {
        let cluster = Cluster::new(1);
        cluster.create_topic("t", 1).await.unwrap();
        cluster
            .inject_fault(Fault::new(
                API_KEY_LIST_OFFSETS,
                FaultKind::Code(KafkaErrorCode::LeaderNotAvailable),
                1,
            ))
            .await;
        let broker = cluster.leader_for("t", 0).await.unwrap();
        let request = list_request("t", 0);

        let first = cluster.send(&broker, header(&request), request.clone()).await.unwrap();
        let second = cluster.send(&broker, header(&request), request).await.unwrap();
        assert_eq!(
            first.into_list_offsets().unwrap().partitions[0].error,
            KafkaErrorCode::LeaderNotAvailable
        );
        assert_eq!(
            second.into_list_offsets().unwrap().partitions[0].error,
            KafkaErrorCode::None
        );
        assert_eq!(cluster.requests_to(1, API_KEY_LIST_OFFSETS).await, 2);
    }

    #[tokio::test]
    async fn unavailable_coordinator_is_transient() {
        let cluster = Cluster::new(3);
        cluster.set_coordinator("g", None).await;
        let err = cluster.coordinator_for("g").await.unwrap_err();
        assert!(err.is_transient());
        cluster.set_coordinator("g", Some(2)).await;
        assert_eq!(cluster.coordinator_for("g").await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn fetch_reports_out_of_range() {
        let cluster = Cluster::new(1);
        cluster.create_topic("t", 1).await.unwrap();
        for i in 0..3 {
            cluster.produce("t", 0, format!("m{i}")).await.unwrap();
        }
        cluster.truncate("t", 0, 2).await.unwrap();
        let broker = cluster.leader_for("t", 0).await.unwrap();
        let request = Request::Fetch(FetchRequest {
            max_wait: Duration::ZERO,
            partitions: vec![crate::protocol::FetchPartition {
                topic: "t".into(),
                partition: 0,
                offset: 0,
                max_records: 10,
            }],
        });
        let response = cluster
            .send(&broker, header(&request), request)
            .await
            .unwrap()
            .into_fetch()
            .unwrap();
        assert_eq!(response.partitions[0].error, KafkaErrorCode::OffsetOutOfRange);
        assert_eq!(response.partitions[0].log_start_offset, 2);
        assert_eq!(response.partitions[0].high_watermark, 3);
    }
}
