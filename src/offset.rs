//! Offset discovery and committed-offset storage for consumer groups.
//!
//! Two storage generations are supported and modelled by [`OffsetStore`]:
//! V0 keeps a group's offsets next to each partition's log, so requests go to
//! the partition leader; V1 keeps them in the group coordinator, so every
//! request for a group goes to that single broker. Everything else (batching,
//! merging, retry) is shared.

use std::collections::{BTreeMap, HashMap};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{BrokerDirectory, BrokerRef};
use crate::constants::{
    EARLIEST_TIME, LATEST_TIME, NO_COMMITTED_OFFSET, OFFSET_API_VERSION_V0, OFFSET_API_VERSION_V1,
};
use crate::error::{ClientError, ErrorContext, KafkaErrorCode, Result};
use crate::protocol::{
    CommitPartition, ListOffsetsPartition, ListOffsetsRequest, OffsetCommitRequest,
    OffsetFetchRequest, Request, Response,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::types::{
    CommitAck, CommitRequest, FetchedOffsets, Generation, PartitionOffsets, TopicPartition,
    TopicPartitionSelector,
};

/// Where a group's committed offsets live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetStore {
    /// Stored alongside the partition log, addressed through the partition leader.
    V0,
    /// Stored by the group coordinator.
    #[default]
    V1,
}

impl OffsetStore {
    pub fn api_version(self) -> i16 {
        match self {
            OffsetStore::V0 => OFFSET_API_VERSION_V0,
            OffsetStore::V1 => OFFSET_API_VERSION_V1,
        }
    }

    fn routing(self, group_id: &str) -> Routing<'_> {
        match self {
            OffsetStore::V0 => Routing::Leader,
            OffsetStore::V1 => Routing::Coordinator(group_id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Routing<'a> {
    Leader,
    Coordinator(&'a str),
}

impl<'a> Routing<'a> {
    async fn resolve(&self, directory: &BrokerDirectory, tp: &TopicPartition) -> Result<BrokerRef> {
        match self {
            Routing::Leader => directory.leader_for(&tp.topic, tp.partition).await,
            Routing::Coordinator(group_id) => directory.coordinator_for(group_id).await,
        }
    }

    async fn invalidate(&self, directory: &BrokerDirectory, tp: &TopicPartition) {
        match self {
            Routing::Leader => directory.invalidate_leader(&tp.topic, tp.partition).await,
            Routing::Coordinator(group_id) => directory.invalidate_coordinator(group_id).await,
        }
    }

    fn context<'b>(&self, topic: &'b str, partition: i32, offset: i64) -> ErrorContext<'b>
    where
        'a: 'b,
    {
        match *self {
            Routing::Leader => ErrorContext::Partition { topic, partition, offset },
            Routing::Coordinator(group_id) => ErrorContext::GroupPartition {
                group_id,
                topic,
                partition,
                offset,
            },
        }
    }
}

/// One request family that can be split per broker and merged back per partition.
trait Batch {
    type Item: Clone;
    type Output;

    const OPERATION: &'static str;

    fn key(item: &Self::Item) -> TopicPartition;

    fn offset_hint(_item: &Self::Item) -> i64 {
        NO_COMMITTED_OFFSET
    }

    fn request(&self, items: Vec<Self::Item>) -> Request;

    fn response(&self, response: Response)
        -> Result<Vec<(TopicPartition, KafkaErrorCode, Self::Output)>>;
}

struct ListOffsets;

impl Batch for ListOffsets {
    type Item = ListOffsetsPartition;
    type Output = Vec<i64>;

    const OPERATION: &'static str = "list offsets";

    fn key(item: &Self::Item) -> TopicPartition {
        TopicPartition::new(item.topic.clone(), item.partition)
    }

    fn offset_hint(item: &Self::Item) -> i64 {
        item.time
    }

    fn request(&self, items: Vec<Self::Item>) -> Request {
        Request::ListOffsets(ListOffsetsRequest { partitions: items })
    }

    fn response(
        &self,
        response: Response,
    ) -> Result<Vec<(TopicPartition, KafkaErrorCode, Self::Output)>> {
        Ok(response
            .into_list_offsets()?
            .partitions
            .into_iter()
            .map(|p| (TopicPartition::new(p.topic, p.partition), p.error, p.offsets))
            .collect())
    }
}

struct CommitOffsets<'a> {
    store: OffsetStore,
    group_id: &'a str,
    generation: &'a Generation,
}

impl Batch for CommitOffsets<'_> {
    type Item = CommitPartition;
    type Output = ();

    const OPERATION: &'static str = "offset commit";

    fn key(item: &Self::Item) -> TopicPartition {
        TopicPartition::new(item.topic.clone(), item.partition)
    }

    fn offset_hint(item: &Self::Item) -> i64 {
        item.offset
    }

    fn request(&self, items: Vec<Self::Item>) -> Request {
        Request::OffsetCommit(OffsetCommitRequest {
            version: self.store.api_version(),
            group_id: self.group_id.to_string(),
            generation_id: self.generation.generation_id,
            member_id: self.generation.member_id.clone(),
            partitions: items,
        })
    }

    fn response(
        &self,
        response: Response,
    ) -> Result<Vec<(TopicPartition, KafkaErrorCode, Self::Output)>> {
        Ok(response
            .into_offset_commit()?
            .partitions
            .into_iter()
            .map(|p| (TopicPartition::new(p.topic, p.partition), p.error, ()))
            .collect())
    }
}

struct FetchCommits<'a> {
    store: OffsetStore,
    group_id: &'a str,
}

impl Batch for FetchCommits<'_> {
    type Item = TopicPartition;
    type Output = i64;

    const OPERATION: &'static str = "offset fetch";

    fn key(item: &Self::Item) -> TopicPartition {
        item.clone()
    }

    fn request(&self, items: Vec<Self::Item>) -> Request {
        Request::OffsetFetch(OffsetFetchRequest {
            version: self.store.api_version(),
            group_id: self.group_id.to_string(),
            partitions: items,
        })
    }

    fn response(
        &self,
        response: Response,
    ) -> Result<Vec<(TopicPartition, KafkaErrorCode, Self::Output)>> {
        Ok(response
            .into_offset_fetch()?
            .partitions
            .into_iter()
            .map(|p| (TopicPartition::new(p.topic, p.partition), p.error, p.offset))
            .collect())
    }
}

/// Per-partition outcome of one scattered call.
struct Scattered<O> {
    done: Vec<(TopicPartition, O)>,
    failed: BTreeMap<TopicPartition, ClientError>,
    /// Set when the retry budget ran out or the call was cancelled.
    aborted: Option<ClientError>,
}

impl<O> Scattered<O> {
    /// All-or-nothing view used by read-only calls.
    fn into_result(self) -> Result<Vec<(TopicPartition, O)>> {
        if let Some(err) = self.aborted {
            return Err(err);
        }
        match self.failed.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.done),
        }
    }
}

/// Stateless offset façade; clones share the same broker directory.
#[derive(Debug, Clone)]
pub struct OffsetManager {
    directory: BrokerDirectory,
    retry: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl OffsetManager {
    pub fn new(directory: BrokerDirectory, retry: RetryPolicy) -> Self {
        Self {
            directory,
            retry,
            cancel: None,
        }
    }

    /// Aborts pending retries of every call made through this manager once
    /// `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn directory(&self) -> &BrokerDirectory {
        &self.directory
    }

    /// Offsets per partition for each selector, defaulting to the latest
    /// offset. Selectors without a partition expand to every known partition.
    pub async fn fetch(&self, selectors: &[TopicPartitionSelector]) -> Result<FetchedOffsets> {
        let mut items = Vec::new();
        for (tp, selector) in self.expand(selectors).await? {
            if selector.offset.is_some() {
                return Err(ClientError::InvalidSelector {
                    topic: selector.topic.clone(),
                    reason: "offset lookups take a time, not an offset",
                });
            }
            items.push(ListOffsetsPartition {
                topic: tp.topic,
                partition: tp.partition,
                time: selector.time_or_latest(),
                max_num: selector.max_num_or_default(),
            });
        }

        let mut result = FetchedOffsets::new();
        let scattered = self.scatter(&ListOffsets, Routing::Leader, items).await;
        for (tp, offsets) in scattered.into_result()? {
            result.entry(tp.topic).or_default().insert(tp.partition, offsets);
        }
        Ok(result)
    }

    pub async fn fetch_earliest_offsets<S: AsRef<str>>(
        &self,
        topics: &[S],
    ) -> Result<PartitionOffsets> {
        self.fetch_single_offsets(topics, EARLIEST_TIME).await
    }

    pub async fn fetch_latest_offsets<S: AsRef<str>>(&self, topics: &[S]) -> Result<PartitionOffsets> {
        self.fetch_single_offsets(topics, LATEST_TIME).await
    }

    /// V0 commit, stored next to each partition's log.
    pub async fn commit(&self, group_id: &str, requests: &[CommitRequest]) -> Result<CommitAck> {
        self.commit_with(OffsetStore::V0, group_id, &Generation::none(), requests)
            .await
    }

    /// V1 commit through the group coordinator.
    pub async fn commit_v1(
        &self,
        group_id: &str,
        generation: &Generation,
        requests: &[CommitRequest],
    ) -> Result<CommitAck> {
        self.commit_with(OffsetStore::V1, group_id, generation, requests)
            .await
    }

    /// V0 committed offsets; `-1` for partitions the group never committed.
    pub async fn fetch_commits(
        &self,
        group_id: &str,
        selectors: &[TopicPartitionSelector],
    ) -> Result<PartitionOffsets> {
        self.fetch_commits_with(OffsetStore::V0, group_id, selectors)
            .await
    }

    /// V1 committed offsets, read from the group coordinator.
    pub async fn fetch_commits_v1(
        &self,
        group_id: &str,
        selectors: &[TopicPartitionSelector],
    ) -> Result<PartitionOffsets> {
        self.fetch_commits_with(OffsetStore::V1, group_id, selectors)
            .await
    }

    /// Fails with `PartialCommit` when some partitions were stored and others
    /// were not; `acked` then lists what the broker kept.
    pub async fn commit_with(
        &self,
        store: OffsetStore,
        group_id: &str,
        generation: &Generation,
        requests: &[CommitRequest],
    ) -> Result<CommitAck> {
        validate_group_id(group_id)?;
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            request.validate()?;
            items.push(CommitPartition {
                topic: request.topic.clone(),
                partition: request.partition,
                offset: request.offset,
                metadata: request.metadata.clone(),
            });
        }

        let batch = CommitOffsets {
            store,
            group_id,
            generation,
        };
        let Scattered {
            done,
            mut failed,
            aborted,
        } = self.scatter(&batch, store.routing(group_id), items).await;
        let mut ack = CommitAck::new();
        for (tp, ()) in done {
            ack.entry(tp.topic).or_default().push(tp.partition);
        }
        for partitions in ack.values_mut() {
            partitions.sort_unstable();
        }
        debug!(
            "group {} committed {} partition(s) via {:?}",
            group_id,
            ack.values().map(Vec::len).sum::<usize>(),
            store
        );

        if failed.is_empty() {
            return Ok(ack);
        }
        if ack.is_empty() {
            // nothing was stored, report the cause directly
            return Err(match aborted {
                Some(err) => err,
                None => match failed.pop_first() {
                    Some((_, err)) => err,
                    None => ClientError::BrokerNotReady,
                },
            });
        }
        Err(ClientError::PartialCommit {
            acked: ack,
            failures: failed,
        })
    }

    pub async fn fetch_commits_with(
        &self,
        store: OffsetStore,
        group_id: &str,
        selectors: &[TopicPartitionSelector],
    ) -> Result<PartitionOffsets> {
        validate_group_id(group_id)?;
        let items: Vec<TopicPartition> = self
            .expand(selectors)
            .await?
            .into_iter()
            .map(|(tp, _)| tp)
            .collect();

        let batch = FetchCommits { store, group_id };
        let mut result = PartitionOffsets::new();
        let scattered = self.scatter(&batch, store.routing(group_id), items).await;
        for (tp, offset) in scattered.into_result()? {
            result.entry(tp.topic).or_default().insert(tp.partition, offset);
        }
        Ok(result)
    }

    async fn fetch_single_offsets<S: AsRef<str>>(
        &self,
        topics: &[S],
        time: i64,
    ) -> Result<PartitionOffsets> {
        let selectors: Vec<TopicPartitionSelector> = topics
            .iter()
            .map(|topic| TopicPartitionSelector::topic(topic.as_ref()).time(time))
            .collect();

        let mut result = PartitionOffsets::new();
        for (topic, partitions) in self.fetch(&selectors).await? {
            let flattened = partitions
                .into_iter()
                .filter_map(|(partition, offsets)| offsets.first().map(|o| (partition, *o)))
                .collect();
            result.insert(topic, flattened);
        }
        Ok(result)
    }

    async fn expand<'s>(
        &self,
        selectors: &'s [TopicPartitionSelector],
    ) -> Result<Vec<(TopicPartition, &'s TopicPartitionSelector)>> {
        let mut expanded = Vec::new();
        for selector in selectors {
            selector.validate()?;
            match selector.partition {
                Some(partition) => {
                    expanded.push((TopicPartition::new(selector.topic.clone(), partition), selector))
                }
                None => {
                    let partitions = self
                        .retry_state("partition lookup")
                        .run(|| self.directory.partitions_for(&selector.topic))
                        .await?;
                    for partition in partitions {
                        expanded
                            .push((TopicPartition::new(selector.topic.clone(), partition), selector));
                    }
                }
            }
        }
        Ok(expanded)
    }

    /// Groups items by destination broker, sends the sub-batches
    /// concurrently and merges the per-partition answers. Partitions that hit
    /// a transient error are re-routed and retried; the call completes once
    /// every partition has an answer or a failure.
    async fn scatter<B: Batch>(
        &self,
        batch: &B,
        routing: Routing<'_>,
        items: Vec<B::Item>,
    ) -> Scattered<B::Output> {
        let mut pending: Vec<B::Item> = items
            .into_iter()
            .map(|item| (B::key(&item), item))
            .collect::<HashMap<_, _>>()
            .into_values()
            .collect();
        let mut done = Vec::with_capacity(pending.len());
        let mut failed: BTreeMap<TopicPartition, ClientError> = BTreeMap::new();
        let mut aborted = None;
        let mut retry = self.retry_state(B::OPERATION);

        while !pending.is_empty() {
            let mut retry_later = Vec::new();
            let mut last_transient = None;

            let mut by_broker: HashMap<BrokerRef, Vec<B::Item>> = HashMap::new();
            for item in pending.drain(..) {
                let tp = B::key(&item);
                match routing.resolve(&self.directory, &tp).await {
                    Ok(broker) => by_broker.entry(broker).or_default().push(item),
                    Err(err) if err.is_transient() => {
                        last_transient = Some(err);
                        retry_later.push(item);
                    }
                    Err(err) => {
                        failed.insert(tp, err);
                    }
                }
            }

            let sends = by_broker.into_iter().map(|(broker, items)| {
                let request = batch.request(items.clone());
                async move {
                    let result = self.directory.send(&broker, request).await;
                    (broker, items, result)
                }
            });

            for (broker, items, result) in join_all(sends).await {
                let answers = match result.and_then(|response| batch.response(response)) {
                    Ok(answers) => answers,
                    Err(err) => {
                        warn!("{} to {} failed: {}", B::OPERATION, broker, err);
                        for item in items {
                            let tp = B::key(&item);
                            if err.invalidates_routing() {
                                routing.invalidate(&self.directory, &tp).await;
                            }
                            if err.is_transient() {
                                retry_later.push(item);
                            } else {
                                failed.insert(tp, err.clone());
                            }
                        }
                        if err.is_transient() {
                            last_transient = Some(err);
                        }
                        continue;
                    }
                };

                let mut unanswered: HashMap<TopicPartition, B::Item> =
                    items.into_iter().map(|item| (B::key(&item), item)).collect();
                for (tp, code, output) in answers {
                    let Some(item) = unanswered.remove(&tp) else {
                        continue;
                    };
                    let context = routing.context(&tp.topic, tp.partition, B::offset_hint(&item));
                    match ClientError::from_code(code, context) {
                        None => done.push((tp, output)),
                        Some(err) if err.is_transient() => {
                            if err.invalidates_routing() {
                                routing.invalidate(&self.directory, &tp).await;
                            }
                            last_transient = Some(err);
                            retry_later.push(item);
                        }
                        Some(err) => {
                            failed.insert(tp, err);
                        }
                    }
                }
                for (tp, item) in unanswered {
                    warn!("{} left {} unanswered", broker, tp);
                    last_transient = Some(ClientError::BrokerNotReady);
                    retry_later.push(item);
                }
            }

            if retry_later.is_empty() {
                break;
            }
            if let Err(err) = retry
                .backoff(last_transient.unwrap_or(ClientError::BrokerNotReady))
                .await
            {
                for item in retry_later {
                    failed.insert(B::key(&item), err.clone());
                }
                aborted = Some(err);
                break;
            }
            pending = retry_later;
        }

        for (tp, err) in &failed {
            debug!("{} failed for {}: {}", B::OPERATION, tp, err);
        }
        Scattered {
            done,
            failed,
            aborted,
        }
    }

    fn retry_state(&self, operation: &'static str) -> RetryState {
        let state = self.retry.start(operation);
        match &self.cancel {
            Some(token) => state.cancel_on(token.clone()),
            None => state,
        }
    }
}

fn validate_group_id(group_id: &str) -> Result<()> {
    if group_id.trim().is_empty() {
        return Err(ClientError::InvalidGroupId(group_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_generation_selects_api_version() {
        assert_eq!(OffsetStore::V0.api_version(), 0);
        assert_eq!(OffsetStore::V1.api_version(), 1);
        assert_eq!(OffsetStore::default(), OffsetStore::V1);
    }

    #[test]
    fn store_routes_by_generation() {
        assert!(matches!(OffsetStore::V0.routing("g"), Routing::Leader));
        assert!(matches!(OffsetStore::V1.routing("g"), Routing::Coordinator("g")));
    }

    #[test]
    fn store_reads_lowercase_names() {
        let store: OffsetStore = serde_json::from_str("\"v0\"").unwrap();
        assert_eq!(store, OffsetStore::V0);
    }

    #[test]
    fn blank_group_is_rejected() {
        assert_eq!(
            validate_group_id("  "),
            Err(ClientError::InvalidGroupId("  ".into()))
        );
        assert!(validate_group_id("g").is_ok());
    }
}
