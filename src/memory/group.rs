//! Broker-side state of a consumer group: membership, generations,
//! leader-computed assignments and V1 committed offsets.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::{NO_COMMITTED_OFFSET, NO_GENERATION};
use crate::error::KafkaErrorCode;
use crate::protocol::{
    CommitPartition, HeartbeatRequest, JoinGroupMember, JoinGroupRequest, JoinGroupResponse,
    LeaveGroupRequest, SyncGroupRequest, SyncGroupResponse,
};
use crate::types::TopicPartition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    pub offset: i64,
    pub metadata: Option<String>,
    pub commit_timestamp_ms: i64,
}

#[derive(Debug)]
pub struct ConsumerGroup {
    group_id: String,
    members: HashMap<String, GroupMember>,
    assignments: HashMap<String, Vec<TopicPartition>>,
    generation_id: i32,
    protocol_type: Option<String>,
    protocol: String,
    leader: Option<String>,
    state: GroupState,
    offsets: HashMap<TopicPartition, CommittedOffset>,
}

#[derive(Debug)]
pub struct GroupMember {
    member_id: String,
    session_timeout: Duration,
    subscription: Vec<String>, // list of subscribed topics
    protocols: Vec<String>,
    last_heartbeat: Instant,
    // joined the rebalance currently in progress
    rejoined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
}

impl ConsumerGroup {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            members: HashMap::new(),
            assignments: HashMap::new(),
            generation_id: 0,
            protocol_type: None,
            protocol: String::new(),
            leader: None,
            state: GroupState::Empty,
            offsets: HashMap::new(),
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn join(&mut self, request: &JoinGroupRequest, now: Instant) -> JoinGroupResponse {
        self.evict_expired(now);

        if matches!(&self.protocol_type, Some(t) if !self.members.is_empty() && *t != request.protocol_type)
        {
            return self.join_error(KafkaErrorCode::InconsistentGroupProtocol, &request.member_id);
        }
        if !request.member_id.is_empty() && !self.members.contains_key(&request.member_id) {
            return self.join_error(KafkaErrorCode::UnknownMemberId, &request.member_id);
        }

        let subscription = request
            .protocols
            .first()
            .map(|p| p.subscription.clone())
            .unwrap_or_default();
        let protocols: Vec<String> = request.protocols.iter().map(|p| p.name.clone()).collect();

        let member_id = if request.member_id.is_empty() {
            let member_id = format!("{}-{}", request.client_id, Uuid::new_v4());
            debug!("new member {} joining group {}", member_id, self.group_id);
            self.members.insert(
                member_id.clone(),
                GroupMember {
                    member_id: member_id.clone(),
                    session_timeout: Duration::from_millis(request.session_timeout_ms.max(0) as u64),
                    subscription,
                    protocols,
                    last_heartbeat: now,
                    rejoined: false,
                },
            );
            self.protocol_type = Some(request.protocol_type.clone());
            self.prepare_rebalance("member joined");
            member_id
        } else {
            let changed = match self.members.get_mut(&request.member_id) {
                Some(member) => {
                    let changed =
                        member.subscription != subscription || member.protocols != protocols;
                    member.subscription = subscription;
                    member.protocols = protocols;
                    changed
                }
                None => false,
            };
            if changed {
                self.prepare_rebalance("subscription changed");
            }
            request.member_id.clone()
        };

        if let Some(member) = self.members.get_mut(&member_id) {
            member.last_heartbeat = now;
            member.rejoined = true;
        }

        if self.state == GroupState::PreparingRebalance {
            if !self.members.values().all(|m| m.rejoined) {
                return self.join_error(KafkaErrorCode::RebalanceInProgress, &member_id);
            }
            self.complete_join();
        }

        self.join_response(&member_id)
    }

    pub fn sync(&mut self, request: &SyncGroupRequest, now: Instant) -> SyncGroupResponse {
        self.evict_expired(now);
        if let Err(error) = self.check_member(&request.member_id, request.generation_id, now) {
            return SyncGroupResponse {
                error,
                assignment: Vec::new(),
            };
        }

        if self.state == GroupState::CompletingRebalance
            && self.leader.as_deref() == Some(request.member_id.as_str())
        {
            self.assignments = request
                .assignments
                .iter()
                .map(|a| (a.member_id.clone(), a.partitions.clone()))
                .collect();
            self.state = GroupState::Stable;
            info!(
                "group {} stable at generation {} with {} member(s)",
                self.group_id,
                self.generation_id,
                self.members.len()
            );
        }

        if self.state != GroupState::Stable {
            return SyncGroupResponse {
                error: KafkaErrorCode::RebalanceInProgress,
                assignment: Vec::new(),
            };
        }
        SyncGroupResponse {
            error: KafkaErrorCode::None,
            assignment: self
                .assignments
                .get(&request.member_id)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn heartbeat(&mut self, request: &HeartbeatRequest, now: Instant) -> KafkaErrorCode {
        self.evict_expired(now);
        match self.check_member(&request.member_id, request.generation_id, now) {
            Ok(()) => KafkaErrorCode::None,
            Err(code) => code,
        }
    }

    pub fn leave(&mut self, request: &LeaveGroupRequest, now: Instant) -> KafkaErrorCode {
        self.evict_expired(now);
        if self.members.remove(&request.member_id).is_none() {
            return KafkaErrorCode::UnknownMemberId;
        }
        debug!("member {} left group {}", request.member_id, self.group_id);
        self.after_departure("member left");
        KafkaErrorCode::None
    }

    pub fn commit(
        &mut self,
        generation_id: i32,
        member_id: &str,
        partition: &CommitPartition,
        timestamp_ms: i64,
        now: Instant,
    ) -> KafkaErrorCode {
        let standalone = generation_id == NO_GENERATION && member_id.is_empty();
        if !standalone {
            if !self.members.contains_key(member_id) {
                return KafkaErrorCode::UnknownMemberId;
            }
            if generation_id != self.generation_id {
                return KafkaErrorCode::IllegalGeneration;
            }
            if let Some(member) = self.members.get_mut(member_id) {
                member.last_heartbeat = now;
            }
        }
        self.offsets.insert(
            TopicPartition::new(partition.topic.clone(), partition.partition),
            CommittedOffset {
                offset: partition.offset,
                metadata: partition.metadata.clone(),
                commit_timestamp_ms: timestamp_ms,
            },
        );
        KafkaErrorCode::None
    }

    pub fn committed(&self, tp: &TopicPartition) -> (i64, Option<String>) {
        match self.offsets.get(tp) {
            Some(committed) => (committed.offset, committed.metadata.clone()),
            None => (NO_COMMITTED_OFFSET, None),
        }
    }

    /// Removes members whose session expired without a heartbeat.
    pub fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .members
            .values()
            .filter(|m| now.duration_since(m.last_heartbeat) > m.session_timeout)
            .map(|m| m.member_id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for member_id in &expired {
            info!("evicting member {} from group {} (session expired)", member_id, self.group_id);
            self.members.remove(member_id);
        }
        self.after_departure("session expired");
    }

    fn check_member(&mut self, member_id: &str, generation_id: i32, now: Instant) -> Result<(), KafkaErrorCode> {
        let Some(member) = self.members.get_mut(member_id) else {
            return Err(KafkaErrorCode::UnknownMemberId);
        };
        member.last_heartbeat = now;
        if self.state == GroupState::PreparingRebalance {
            return Err(KafkaErrorCode::RebalanceInProgress);
        }
        if generation_id != self.generation_id {
            return Err(KafkaErrorCode::IllegalGeneration);
        }
        Ok(())
    }

    fn after_departure(&mut self, reason: &str) {
        if self.members.is_empty() {
            self.state = GroupState::Empty;
            self.leader = None;
            self.assignments.clear();
            return;
        }
        if self.leader.as_ref().is_some_and(|l| !self.members.contains_key(l)) {
            self.leader = None;
        }
        if self.state != GroupState::PreparingRebalance {
            self.prepare_rebalance(reason);
        } else if self.members.values().all(|m| m.rejoined) {
            self.complete_join();
        }
    }

    fn prepare_rebalance(&mut self, reason: &str) {
        debug!("group {} preparing rebalance: {}", self.group_id, reason);
        self.state = GroupState::PreparingRebalance;
        for member in self.members.values_mut() {
            member.rejoined = false;
        }
    }

    fn complete_join(&mut self) {
        self.generation_id += 1;
        self.state = GroupState::CompletingRebalance;
        self.assignments.clear();
        for member in self.members.values_mut() {
            member.rejoined = false;
        }

        let leader_alive = self.leader.as_ref().is_some_and(|l| self.members.contains_key(l));
        if !leader_alive {
            self.leader = self.member_ids().into_iter().next();
        }
        self.protocol = self.select_protocol();
        info!(
            "group {} formed generation {} (leader {:?}, protocol {})",
            self.group_id, self.generation_id, self.leader, self.protocol
        );
    }

    /// First protocol of the leader's preference list every member supports.
    fn select_protocol(&self) -> String {
        let Some(leader) = self.leader.as_ref().and_then(|l| self.members.get(l)) else {
            return String::new();
        };
        leader
            .protocols
            .iter()
            .find(|candidate| self.members.values().all(|m| m.protocols.contains(candidate)))
            .or_else(|| leader.protocols.first())
            .cloned()
            .unwrap_or_default()
    }

    fn join_response(&self, member_id: &str) -> JoinGroupResponse {
        let is_leader = self.leader.as_deref() == Some(member_id);
        let mut members: Vec<JoinGroupMember> = if is_leader {
            self.members
                .values()
                .map(|m| JoinGroupMember {
                    member_id: m.member_id.clone(),
                    subscription: m.subscription.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        members.sort_by(|a, b| a.member_id.cmp(&b.member_id));

        JoinGroupResponse {
            error: KafkaErrorCode::None,
            generation_id: self.generation_id,
            protocol: self.protocol.clone(),
            leader_id: self.leader.clone().unwrap_or_default(),
            member_id: member_id.to_string(),
            members,
        }
    }

    fn join_error(&self, error: KafkaErrorCode, member_id: &str) -> JoinGroupResponse {
        JoinGroupResponse {
            error,
            generation_id: NO_GENERATION,
            protocol: String::new(),
            leader_id: String::new(),
            member_id: member_id.to_string(),
            members: Vec::new(),
        }
    }
}
