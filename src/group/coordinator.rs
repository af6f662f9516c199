//! Consumer group member.
//!
//! [`ConsumerGroup::start`] spawns a driver task that owns the membership
//! protocol: it finds the coordinator, joins, runs the assignor when elected
//! leader, syncs, and then heartbeats until the group rebalances. Every
//! assigned partition gets its own fetch task which is the only writer of that
//! partition's cursor. Records flow to the application over a bounded
//! channel, lifecycle notifications over a separate event channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

use crate::broker::{BrokerClient, BrokerDirectory};
use crate::constants::{CONSUMER_PROTOCOL_TYPE, EARLIEST_TIME, LATEST_TIME, NO_COMMITTED_OFFSET};
use crate::error::{ClientError, ErrorContext, KafkaErrorCode, Result};
use crate::group::assignor;
use crate::group::config::{AssignmentStrategy, ConsumerGroupConfig, FromOffset, OutOfRangeReset};
use crate::group::event::{ConsumerMessage, GroupEvent};
use crate::group::state::{ConsumptionCursor, Cursor, GroupState, Membership};
use crate::offset::OffsetManager;
use crate::protocol::{
    FetchPartition, FetchPartitionResponse, FetchRequest, GroupProtocol, HeartbeatRequest,
    JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest, MemberAssignment, Request,
    SyncGroupRequest,
};
use crate::retry::RetryState;
use crate::types::{CommitAck, CommitRequest, PartitionOffsets, TopicPartition, TopicPartitionSelector};

/// Receiving ends handed to the application by [`ConsumerGroup::start`].
#[derive(Debug)]
pub struct GroupStreams {
    /// Consumed records, in log order per partition. Ends after `close`.
    pub messages: mpsc::Receiver<ConsumerMessage>,
    pub events: mpsc::UnboundedReceiver<GroupEvent>,
}

enum Command {
    AddTopics {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Vec<TopicPartition>>>,
    },
}

type Reply = oneshot::Sender<Result<Vec<TopicPartition>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejoin {
    Keep,
    /// The coordinator forgot us; join again as a new member.
    ResetMember,
}

struct Shared {
    config: ConsumerGroupConfig,
    offsets: OffsetManager,
    state: watch::Sender<GroupState>,
    membership: watch::Sender<Option<Membership>>,
    paused: watch::Sender<bool>,
    cursors: Mutex<BTreeMap<TopicPartition, Arc<Cursor>>>,
    commit_lock: Arc<Mutex<()>>,
    events: mpsc::UnboundedSender<GroupEvent>,
    cancel: CancellationToken,
}

impl Shared {
    fn group_id(&self) -> &str {
        &self.config.group_id
    }

    fn directory(&self) -> &BrokerDirectory {
        self.offsets.directory()
    }

    fn set_state(&self, state: GroupState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("group {} member {:?} -> {:?}", self.group_id(), previous, state);
        }
    }

    fn emit(&self, event: GroupEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: ClientError) {
        let fatal = error.is_fatal_to_member();
        warn!("group {}: {}", self.group_id(), error);
        self.emit(GroupEvent::Error { error, fatal });
    }

    fn retry_state(&self, operation: &'static str, token: &CancellationToken) -> RetryState {
        self.config.retry.start(operation).cancel_on(token.clone())
    }

    /// Commits cursor positions under the current generation. Callers hold
    /// `commit_lock`.
    async fn commit_cursors(&self, force: bool) -> Result<CommitAck> {
        // cursors and membership are swapped together under this lock
        let (membership, pending) = {
            let cursors = self.cursors.lock().await;
            let membership = self.membership.borrow().clone();
            let Some(membership) = membership else {
                return Ok(CommitAck::new());
            };
            let pending: Vec<(Arc<Cursor>, CommitRequest)> = cursors
                .iter()
                .filter(|(tp, _)| membership.assignment.binary_search(tp).is_ok())
                .filter_map(|(tp, cursor)| {
                    cursor.pending_commit(force).map(|offset| {
                        (
                            Arc::clone(cursor),
                            CommitRequest::new(tp.topic.clone(), tp.partition, offset),
                        )
                    })
                })
                .collect();
            (membership, pending)
        };
        if pending.is_empty() {
            return Ok(CommitAck::new());
        }

        let requests: Vec<CommitRequest> = pending.iter().map(|(_, r)| r.clone()).collect();
        let result = self
            .offsets
            .commit_with(
                self.config.offset_store,
                self.group_id(),
                &membership.generation(),
                &requests,
            )
            .await;
        let (ack, failures) = match result {
            Ok(ack) => (ack, None),
            Err(ClientError::PartialCommit { acked, failures }) => (acked, Some(failures)),
            Err(err) => return Err(err),
        };
        for (cursor, request) in &pending {
            let acked = ack
                .get(&request.topic)
                .is_some_and(|partitions| partitions.contains(&request.partition));
            if acked {
                cursor.mark_committed(request.offset);
            }
        }
        debug!(
            "group {} generation {} committed {} of {} partition(s)",
            self.group_id(),
            membership.generation_id,
            ack.values().map(Vec::len).sum::<usize>(),
            requests.len()
        );
        self.emit(GroupEvent::Committed(ack.clone()));
        match failures {
            Some(failures) => Err(ClientError::PartialCommit {
                acked: ack,
                failures,
            }),
            None => Ok(ack),
        }
    }

    /// Auto-commit tick; skipped while another commit is in flight.
    fn spawn_auto_commit(self: &Arc<Self>) {
        let Ok(guard) = Arc::clone(&self.commit_lock).try_lock_owned() else {
            trace!("group {} commit in flight, skipping tick", self.group_id());
            return;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                result = shared.commit_cursors(false) => result,
            };
            match result {
                Ok(_) => {}
                // the rebalance path commits again under the new generation
                Err(err @ (ClientError::RebalanceInProgress | ClientError::IllegalGeneration)) => {
                    debug!("group {} auto-commit deferred: {}", shared.group_id(), err);
                }
                Err(err) => shared.emit_error(err),
            }
            drop(guard);
        });
    }

    async fn leave_group(&self) {
        let membership = self.membership.borrow().clone();
        let Some(membership) = membership else {
            return;
        };
        match self.send_leave(&membership.member_id).await {
            Ok(()) => info!("member {} left group {}", membership.member_id, self.group_id()),
            Err(err) => warn!(
                "member {} could not leave group {}: {}",
                membership.member_id,
                self.group_id(),
                err
            ),
        }
    }

    async fn send_leave(&self, member_id: &str) -> Result<()> {
        let coordinator = self.directory().coordinator_for(self.group_id()).await?;
        let request = Request::LeaveGroup(LeaveGroupRequest {
            group_id: self.group_id().to_string(),
            member_id: member_id.to_string(),
        });
        let code = self
            .directory()
            .send(&coordinator, request)
            .await?
            .into_leave_group()?;
        group_result(code, self.group_id())
    }
}

fn group_result(code: KafkaErrorCode, group_id: &str) -> Result<()> {
    match ClientError::from_code(code, ErrorContext::Group { group_id }) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A running consumer group member.
pub struct ConsumerGroup {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
    _shutdown: DropGuard,
}

impl fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("group_id", &self.shared.config.group_id)
            .field("state", &self.state())
            .field("membership", &self.membership())
            .finish()
    }
}

impl ConsumerGroup {
    /// Validates `config` and starts joining in the background. The first
    /// successful join is announced with [`GroupEvent::Connect`].
    pub fn start(
        config: ConsumerGroupConfig,
        client: Arc<dyn BrokerClient>,
    ) -> Result<(Self, GroupStreams)> {
        config.validate()?;

        let directory = BrokerDirectory::with_options(
            client,
            config.client_id.clone(),
            config.request_timeout(),
        );
        let offsets = OffsetManager::new(directory, config.retry.clone());
        let (messages_tx, messages) = mpsc::channel(config.message_buffer);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut topics: Vec<String> = Vec::new();
        for topic in &config.topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }

        info!(
            "starting member of group {} subscribed to {:?}",
            config.group_id, topics
        );
        let shared = Arc::new(Shared {
            config,
            offsets,
            state: watch::channel(GroupState::Created).0,
            membership: watch::channel(None).0,
            paused: watch::channel(false).0,
            cursors: Mutex::new(BTreeMap::new()),
            commit_lock: Arc::new(Mutex::new(())),
            events: events_tx,
            cancel: cancel.clone(),
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            commands: commands_rx,
            messages: messages_tx,
            member_id: String::new(),
            topics,
            fetchers: JoinSet::new(),
            generation: cancel.child_token(),
            connected: false,
            heartbeat_retry: None,
        };
        let driver = tokio::spawn(driver.run());

        Ok((
            Self {
                shared,
                commands: commands_tx,
                driver,
                _shutdown: cancel.drop_guard(),
            },
            GroupStreams { messages, events },
        ))
    }

    pub fn group_id(&self) -> &str {
        self.shared.group_id()
    }

    pub fn state(&self) -> GroupState {
        *self.shared.state.borrow()
    }

    pub fn membership(&self) -> Option<Membership> {
        self.shared.membership.borrow().clone()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.shared
            .membership
            .borrow()
            .as_ref()
            .map(|m| m.assignment.clone())
            .unwrap_or_default()
    }

    pub async fn cursors(&self) -> BTreeMap<TopicPartition, ConsumptionCursor> {
        self.shared
            .cursors
            .lock()
            .await
            .iter()
            .map(|(tp, cursor)| (tp.clone(), cursor.snapshot()))
            .collect()
    }

    /// Stops issuing fetches and delivering messages. Membership and
    /// heartbeats are unaffected.
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("paused group {}", self.group_id());
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            info!("resumed group {}", self.group_id());
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Extends the subscription and waits for the resulting rebalance.
    /// Returns this member's new assignment.
    pub async fn add_topics<S: Into<String>>(
        &self,
        topics: impl IntoIterator<Item = S>,
    ) -> Result<Vec<TopicPartition>> {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() || topics.iter().any(String::is_empty) {
            return Err(ClientError::Configuration(
                "add_topics needs at least one non-empty topic".to_string(),
            ));
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::AddTopics { topics, reply })
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)?
    }

    /// Commits the next offset to read of every assigned partition. Waits
    /// for an in-flight auto-commit to finish first.
    pub async fn commit(&self) -> Result<CommitAck> {
        if self.state().is_closed() {
            return Err(ClientError::Closed);
        }
        let _guard = self.shared.commit_lock.lock().await;
        self.shared.commit_cursors(true).await
    }

    /// Stops fetching, commits progress unless `force` is set, and leaves
    /// the group. Returns once teardown is complete; the message stream ends
    /// afterwards.
    pub async fn close(self, force: bool) -> Result<()> {
        let ConsumerGroup {
            shared,
            commands,
            driver,
            _shutdown,
        } = self;
        shared.set_state(GroupState::Closing);
        shared.cancel.cancel();
        drop(commands);
        if let Err(err) = driver.await {
            error!("driver of group {} failed: {}", shared.group_id(), err);
        }

        let mut result = Ok(());
        if !force {
            let commit = async {
                let _guard = shared.commit_lock.lock().await;
                shared.commit_cursors(true).await
            };
            result = match time::timeout(shared.config.request_timeout(), commit).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ClientError::Timeout),
            };
            if let Err(err) = &result {
                warn!("final commit of group {} failed: {}", shared.group_id(), err);
            }
        }

        shared.leave_group().await;
        shared.membership.send_replace(None);
        shared.set_state(GroupState::Closed);
        info!("closed member of group {}", shared.group_id());
        result
    }
}

/// Owns the membership protocol and the fetch tasks of the current generation.
struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::Sender<ConsumerMessage>,
    member_id: String,
    topics: Vec<String>,
    fetchers: JoinSet<()>,
    generation: CancellationToken,
    connected: bool,
    heartbeat_retry: Option<RetryState>,
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        let mut reply: Option<Reply> = None;
        self.shared.set_state(GroupState::Connecting);

        'session: loop {
            let established = tokio::select! {
                _ = cancel.cancelled() => break 'session,
                result = self.establish() => result,
            };
            let membership = match established {
                Ok(membership) => membership,
                Err(ClientError::Cancelled) => break 'session,
                Err(err) => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(err.clone()));
                    }
                    self.stop_fetching().await;
                    self.shared.emit_error(err);
                    tokio::select! {
                        _ = cancel.cancelled() => break 'session,
                        _ = time::sleep(self.shared.config.retry.max_backoff) => continue 'session,
                    }
                }
            };
            if let Some(reply) = reply.take() {
                let _ = reply.send(Ok(membership.assignment.clone()));
            }

            let Some(rejoin) = self.stable(&membership, &cancel, &mut reply).await else {
                break 'session;
            };

            self.shared.set_state(GroupState::Rebalancing);
            self.stop_fetching().await;
            if rejoin == Rejoin::ResetMember {
                self.member_id.clear();
            } else if self.shared.config.auto_commit {
                let shared = Arc::clone(&self.shared);
                let commit = async {
                    let _guard = shared.commit_lock.lock().await;
                    shared.commit_cursors(false).await
                };
                tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    result = commit => if let Err(err) = result {
                        debug!("group {} commit before rejoin failed: {}", shared.group_id(), err);
                    },
                }
            }
        }

        self.stop_fetching().await;
        if let Some(reply) = reply.take() {
            let _ = reply.send(Err(ClientError::Closed));
        }
        debug!("driver of group {} stopped", self.shared.group_id());
    }

    /// Joins, installs cursors for the new assignment and starts fetching.
    async fn establish(&mut self) -> Result<Membership> {
        // positions of the previous generation must not be committed under the next one
        self.shared.cursors.lock().await.clear();
        self.heartbeat_retry = None;
        let membership = self.join().await?;
        self.start_fetching(&membership).await?;

        let event = if self.connected {
            GroupEvent::Rebalanced {
                generation_id: membership.generation_id,
                assignment: membership.assignment.clone(),
            }
        } else {
            GroupEvent::Connect {
                generation_id: membership.generation_id,
                member_id: membership.member_id.clone(),
                assignment: membership.assignment.clone(),
            }
        };
        self.connected = true;
        self.shared.set_state(GroupState::Stable);
        info!(
            "member {} of group {} owns {} partition(s) at generation {}",
            membership.member_id,
            membership.group_id,
            membership.assignment.len(),
            membership.generation_id
        );
        self.shared.emit(event);
        Ok(membership)
    }

    // None on shutdown
    async fn stable(
        &mut self,
        membership: &Membership,
        cancel: &CancellationToken,
        reply: &mut Option<Reply>,
    ) -> Option<Rejoin> {
        let shared = Arc::clone(&self.shared);
        let period = shared.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut auto_commit = time::interval(shared.config.auto_commit_interval());
        auto_commit.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                command = self.commands.recv() => match command {
                    None => return None,
                    Some(Command::AddTopics { topics, reply: tx }) => match self.subscribe(topics).await {
                        Ok(true) => {
                            *reply = Some(tx);
                            return Some(Rejoin::Keep);
                        }
                        Ok(false) => {
                            let _ = tx.send(Ok(membership.assignment.clone()));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err));
                        }
                    },
                },
                _ = heartbeat.tick() => {
                    if let Some(rejoin) = self.heartbeat(membership).await {
                        return Some(rejoin);
                    }
                }
                _ = auto_commit.tick(), if shared.config.auto_commit => shared.spawn_auto_commit(),
            }
        }
    }

    async fn join(&mut self) -> Result<Membership> {
        let mut retry = self.shared.retry_state("join group", &self.shared.cancel);
        loop {
            let err = match self.join_once().await {
                Ok(membership) => return Ok(membership),
                Err(err) => err,
            };
            if matches!(err, ClientError::UnknownMemberId) {
                self.member_id.clear();
            }
            if err.invalidates_routing() {
                self.shared
                    .directory()
                    .invalidate_coordinator(self.shared.group_id())
                    .await;
            }
            let retryable = err.is_transient()
                || matches!(
                    err,
                    ClientError::RebalanceInProgress
                        | ClientError::UnknownMemberId
                        | ClientError::IllegalGeneration
                );
            debug!("join of group {} not complete: {}", self.shared.group_id(), err);
            retry.backoff_if(err, retryable).await?;
        }
    }

    // one JoinGroup + SyncGroup exchange
    async fn join_once(&mut self) -> Result<Membership> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let directory = shared.directory();

        let coordinator = directory.coordinator_for(&config.group_id).await?;
        shared.set_state(GroupState::Joining);

        let request = Request::JoinGroup(JoinGroupRequest {
            group_id: config.group_id.clone(),
            session_timeout_ms: i32::try_from(config.session_timeout_ms).unwrap_or(i32::MAX),
            member_id: self.member_id.clone(),
            client_id: config.client_id.clone(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            protocols: vec![GroupProtocol {
                name: config.protocol.name().to_string(),
                subscription: self.topics.clone(),
            }],
        });
        let joined = directory.send(&coordinator, request).await?.into_join_group()?;
        if !joined.member_id.is_empty() {
            self.member_id = joined.member_id.clone();
        }
        group_result(joined.error, &config.group_id)?;

        let assignments = if joined.leader_id == joined.member_id {
            self.assign(&joined).await?
        } else {
            Vec::new()
        };

        let request = Request::SyncGroup(SyncGroupRequest {
            group_id: config.group_id.clone(),
            generation_id: joined.generation_id,
            member_id: joined.member_id.clone(),
            assignments,
        });
        let synced = directory.send(&coordinator, request).await?.into_sync_group()?;
        group_result(synced.error, &config.group_id)?;

        let mut assignment = synced.assignment;
        assignment.sort();
        Ok(Membership {
            group_id: config.group_id.clone(),
            generation_id: joined.generation_id,
            member_id: joined.member_id,
            assignment,
        })
    }

    // leader only
    async fn assign(&self, joined: &JoinGroupResponse) -> Result<Vec<MemberAssignment>> {
        let directory = self.shared.directory();
        let strategy =
            AssignmentStrategy::from_name(&joined.protocol).unwrap_or(self.shared.config.protocol);
        let topics: BTreeSet<&str> = joined
            .members
            .iter()
            .flat_map(|m| m.subscription.iter().map(String::as_str))
            .collect();

        let mut partitions = HashMap::new();
        for topic in topics {
            directory.invalidate_topic(topic).await;
            match directory.partitions_for(topic).await {
                Ok(ids) => {
                    partitions.insert(topic.to_string(), ids);
                }
                Err(ClientError::TopicDoesNotExist) => {
                    warn!("subscribed topic {} does not exist", topic);
                    self.shared.emit_error(ClientError::TopicDoesNotExist);
                }
                Err(err) => return Err(err),
            }
        }

        let assignments = assignor::assign(strategy, &joined.members, &partitions);
        debug!(
            "leader {} assigned {} member(s) with {} strategy at generation {}",
            joined.member_id,
            assignments.len(),
            strategy.name(),
            joined.generation_id
        );
        Ok(assignments)
    }

    /// Resolves each partition's starting offset and spawns its fetch task.
    async fn start_fetching(&mut self, membership: &Membership) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;

        let selectors: Vec<TopicPartitionSelector> = membership
            .assignment
            .iter()
            .map(|tp| TopicPartitionSelector::topic(tp.topic.clone()).partition(tp.partition))
            .collect();
        let committed = if selectors.is_empty() {
            PartitionOffsets::new()
        } else {
            shared
                .offsets
                .fetch_commits_with(config.offset_store, &config.group_id, &selectors)
                .await?
        };

        // tp -> (start, last committed)
        let mut starts: BTreeMap<TopicPartition, (i64, i64)> = BTreeMap::new();
        let mut uncommitted = Vec::new();
        for tp in &membership.assignment {
            let offset = committed
                .get(&tp.topic)
                .and_then(|partitions| partitions.get(&tp.partition))
                .copied()
                .unwrap_or(NO_COMMITTED_OFFSET);
            if offset >= 0 {
                starts.insert(tp.clone(), (offset, offset));
            } else {
                uncommitted.push(tp.clone());
            }
        }

        if !uncommitted.is_empty() {
            let time = match config.from_offset {
                FromOffset::Earliest => Some(EARLIEST_TIME),
                FromOffset::Latest => Some(LATEST_TIME),
                FromOffset::None => None,
            };
            match time {
                None => {
                    for tp in &uncommitted {
                        shared.emit_error(ClientError::NoCommittedOffset {
                            topic: tp.topic.clone(),
                            partition: tp.partition,
                        });
                    }
                }
                Some(time) => {
                    let selectors: Vec<TopicPartitionSelector> = uncommitted
                        .iter()
                        .map(|tp| {
                            TopicPartitionSelector::topic(tp.topic.clone())
                                .partition(tp.partition)
                                .time(time)
                        })
                        .collect();
                    let found = shared.offsets.fetch(&selectors).await?;
                    let mut initial = Vec::new();
                    for tp in &uncommitted {
                        let offset = found
                            .get(&tp.topic)
                            .and_then(|partitions| partitions.get(&tp.partition))
                            .and_then(|offsets| offsets.first())
                            .copied();
                        if let Some(offset) = offset {
                            starts.insert(tp.clone(), (offset, NO_COMMITTED_OFFSET));
                            initial.push(CommitRequest::new(tp.topic.clone(), tp.partition, offset));
                        }
                    }
                    if config.commit_offsets_on_first_join && !initial.is_empty() {
                        self.commit_initial(membership, &initial, &mut starts).await;
                    }
                }
            }
        }

        let mut cursors = BTreeMap::new();
        for (tp, (start, last_committed)) in starts {
            let cursor = Arc::new(Cursor::new(start, last_committed));
            cursors.insert(tp.clone(), Arc::clone(&cursor));
            let fetcher = PartitionFetcher {
                shared: Arc::clone(&shared),
                tp,
                cursor,
                token: self.generation.clone(),
                paused: shared.paused.subscribe(),
                messages: self.messages.clone(),
            };
            self.fetchers.spawn(fetcher.run());
        }
        let mut installed = shared.cursors.lock().await;
        *installed = cursors;
        shared.membership.send_replace(Some(membership.clone()));
        Ok(())
    }

    async fn commit_initial(
        &self,
        membership: &Membership,
        initial: &[CommitRequest],
        starts: &mut BTreeMap<TopicPartition, (i64, i64)>,
    ) {
        let config = &self.shared.config;
        let _guard = self.shared.commit_lock.lock().await;
        let result = self
            .shared
            .offsets
            .commit_with(
                config.offset_store,
                &config.group_id,
                &membership.generation(),
                initial,
            )
            .await;
        let ack = match result {
            Ok(ack) => ack,
            Err(ClientError::PartialCommit { acked, failures }) => {
                for (tp, err) in failures {
                    debug!("initial commit of {} failed", tp);
                    self.shared.emit_error(err);
                }
                acked
            }
            Err(err) => {
                self.shared.emit_error(err);
                return;
            }
        };
        for request in initial {
            let acked = ack
                .get(&request.topic)
                .is_some_and(|partitions| partitions.contains(&request.partition));
            if !acked {
                continue;
            }
            if let Some(entry) = starts.get_mut(&request.topic_partition()) {
                entry.1 = request.offset;
            }
        }
        self.shared.emit(GroupEvent::Committed(ack));
    }

    async fn stop_fetching(&mut self) {
        self.generation.cancel();
        while let Some(result) = self.fetchers.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!("fetch task of group {} panicked: {}", self.shared.group_id(), err);
                }
            }
        }
        self.generation = self.shared.cancel.child_token();
    }

    async fn heartbeat(&mut self, membership: &Membership) -> Option<Rejoin> {
        match self.send_heartbeat(membership).await {
            Ok(()) => {
                trace!("heartbeat of {} acknowledged", membership.member_id);
                self.heartbeat_retry = None;
                None
            }
            Err(ClientError::RebalanceInProgress) => {
                info!("group {} is rebalancing, rejoining", membership.group_id);
                Some(Rejoin::Keep)
            }
            Err(err @ ClientError::UnknownMemberId) => {
                self.shared.emit_error(err);
                Some(Rejoin::ResetMember)
            }
            Err(err @ ClientError::IllegalGeneration) => {
                self.shared.emit_error(err);
                Some(Rejoin::Keep)
            }
            Err(err) => {
                if err.invalidates_routing() {
                    self.shared
                        .directory()
                        .invalidate_coordinator(&membership.group_id)
                        .await;
                }
                // transient failures are retried on the next tick
                let retry = self
                    .heartbeat_retry
                    .get_or_insert_with(|| self.shared.config.retry.start("heartbeat"));
                match retry.record(&err) {
                    Ok(()) => debug!(
                        "heartbeat of {} failed ({}), retrying next tick",
                        membership.member_id, err
                    ),
                    Err(err) => {
                        self.heartbeat_retry = None;
                        self.shared.emit_error(err);
                    }
                }
                None
            }
        }
    }

    async fn send_heartbeat(&self, membership: &Membership) -> Result<()> {
        let directory = self.shared.directory();
        let coordinator = directory.coordinator_for(&membership.group_id).await?;
        let request = Request::Heartbeat(HeartbeatRequest {
            group_id: membership.group_id.clone(),
            generation_id: membership.generation_id,
            member_id: membership.member_id.clone(),
        });
        let code = directory.send(&coordinator, request).await?.into_heartbeat()?;
        group_result(code, &membership.group_id)
    }

    /// Adds unknown topics to the subscription. `Ok(false)` when nothing changed.
    async fn subscribe(&mut self, topics: Vec<String>) -> Result<bool> {
        let fresh: BTreeSet<String> = topics
            .into_iter()
            .filter(|topic| !self.topics.contains(topic))
            .collect();
        if fresh.is_empty() {
            return Ok(false);
        }

        let directory = self.shared.directory().clone();
        for topic in &fresh {
            directory.invalidate_topic(topic).await;
            self.shared
                .retry_state("partition lookup", &self.shared.cancel)
                .run(|| directory.partitions_for(topic))
                .await?;
        }
        info!("group {} subscribing to {:?}", self.shared.group_id(), fresh);
        self.topics.extend(fresh);
        Ok(true)
    }
}

struct PartitionFetcher {
    shared: Arc<Shared>,
    tp: TopicPartition,
    cursor: Arc<Cursor>,
    token: CancellationToken,
    paused: watch::Receiver<bool>,
    messages: mpsc::Sender<ConsumerMessage>,
}

impl PartitionFetcher {
    async fn run(mut self) {
        debug!("fetching {} from offset {}", self.tp, self.cursor.next_offset());
        let mut retry = self.shared.retry_state("fetch", &self.token);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = pause_state(&mut self.paused, false) => {}
            }

            let offset = self.cursor.next_offset();
            let fetched = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                // drop the in-flight fetch; the cursor has not moved
                _ = pause_state(&mut self.paused, true) => continue,
                fetched = fetch_once(&self.shared, &self.tp, offset) => fetched,
            };

            match fetched {
                Ok(partition) => {
                    retry = self.shared.retry_state("fetch", &self.token);
                    if !self.deliver(partition).await {
                        return;
                    }
                }
                Err(ClientError::OffsetOutOfRange { offset, .. }) => {
                    if !self.reset(offset).await {
                        return;
                    }
                }
                Err(err) => {
                    if err.invalidates_routing() {
                        self.shared
                            .directory()
                            .invalidate_leader(&self.tp.topic, self.tp.partition)
                            .await;
                    }
                    if !err.is_transient() {
                        self.shared.emit_error(err.clone());
                    }
                    match retry.backoff_if(err, true).await {
                        Ok(()) => {}
                        Err(ClientError::Cancelled) => return,
                        Err(exhausted) => {
                            self.shared.emit_error(exhausted);
                            retry = self.shared.retry_state("fetch", &self.token);
                        }
                    }
                }
            }
        }
    }

    /// Hands records to the application in order. Returns `false` when the
    /// task should stop.
    async fn deliver(&mut self, partition: FetchPartitionResponse) -> bool {
        let high_water = partition.high_watermark;
        self.cursor.set_high_water(high_water);

        for record in partition.records {
            if record.offset < self.cursor.next_offset() {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = self.token.cancelled() => return false,
                _ = pause_state(&mut self.paused, true) => return true,
                permit = self.messages.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("message receiver of {} dropped", self.tp);
                        return false;
                    }
                },
            };
            // advance before handing over so a commit issued after
            // receiving the record covers it
            self.cursor.advance(record.offset + 1);
            permit.send(ConsumerMessage::from_record(&self.tp, high_water, record));
        }
        true
    }

    /// Moves the cursor back into the retained range. Returns `false` when
    /// the task should stop.
    async fn reset(&mut self, offset: i64) -> bool {
        let time = match self.shared.config.out_of_range_offset {
            OutOfRangeReset::Earliest => EARLIEST_TIME,
            OutOfRangeReset::Latest => LATEST_TIME,
        };
        let selector = TopicPartitionSelector::topic(self.tp.topic.clone())
            .partition(self.tp.partition)
            .time(time);
        let lookup = tokio::select! {
            _ = self.token.cancelled() => return false,
            lookup = self.shared.offsets.fetch(std::slice::from_ref(&selector)) => lookup,
        };

        let reset_to = lookup.map(|found| {
            found
                .get(&self.tp.topic)
                .and_then(|partitions| partitions.get(&self.tp.partition))
                .and_then(|offsets| offsets.first())
                .copied()
        });
        match reset_to {
            Ok(Some(reset_to)) => {
                warn!(
                    "offset {} out of range for {}, resetting to {}",
                    offset, self.tp, reset_to
                );
                self.cursor.reset(reset_to);
                self.shared.emit(GroupEvent::OffsetOutOfRange {
                    topic: self.tp.topic.clone(),
                    partition: self.tp.partition,
                    offset,
                    reset_to,
                });
                true
            }
            Ok(None) => {
                self.shared
                    .emit_error(ClientError::UnexpectedResponse("list offsets"));
                self.sleep(self.shared.config.retry.initial_backoff).await
            }
            Err(err) => {
                self.shared.emit_error(err);
                self.sleep(self.shared.config.retry.initial_backoff).await
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }
}

async fn fetch_once(
    shared: &Shared,
    tp: &TopicPartition,
    offset: i64,
) -> Result<FetchPartitionResponse> {
    let directory = shared.directory();
    let leader = directory.leader_for(&tp.topic, tp.partition).await?;
    let request = Request::Fetch(FetchRequest {
        max_wait: shared.config.fetch_max_wait(),
        partitions: vec![FetchPartition {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            max_records: shared.config.fetch_max_records,
        }],
    });
    let partition = directory
        .send(&leader, request)
        .await?
        .into_fetch()?
        .partitions
        .into_iter()
        .find(|p| p.topic == tp.topic && p.partition == tp.partition)
        .ok_or(ClientError::UnexpectedResponse("fetch"))?;

    let context = ErrorContext::Partition {
        topic: &tp.topic,
        partition: tp.partition,
        offset,
    };
    match ClientError::from_code(partition.error, context) {
        Some(err) => Err(err),
        None => Ok(partition),
    }
}

/// Resolves once the pause flag equals `paused`. Never resolves after the
/// sender is gone; callers race it against their cancellation token.
async fn pause_state(rx: &mut watch::Receiver<bool>, paused: bool) {
    loop {
        let current = *rx.borrow_and_update();
        if current == paused {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
