use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rafka_offsets::constants::{
    API_KEY_FIND_COORDINATOR, API_KEY_LIST_OFFSETS, API_KEY_OFFSET_COMMIT, API_KEY_OFFSET_FETCH,
    EARLIEST_TIME, LATEST_TIME,
};
use rafka_offsets::memory::{Cluster, Fault, FaultKind};
use rafka_offsets::{
    BrokerDirectory, ClientError, CommitRequest, Generation, KafkaErrorCode, OffsetManager,
    RetryPolicy, TopicPartition, TopicPartitionSelector,
};

fn manager(cluster: &Arc<Cluster>) -> OffsetManager {
    OffsetManager::new(
        BrokerDirectory::new(cluster.clone()),
        RetryPolicy::fixed(Duration::from_millis(5), Some(200)),
    )
}

fn selector(topic: &str, partition: i32) -> TopicPartitionSelector {
    TopicPartitionSelector::topic(topic).partition(partition)
}

#[tokio::test]
async fn fresh_topic_reports_a_single_offset() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("fresh", 1).await?;

    let offsets = manager(&cluster).fetch(&[selector("fresh", 0)]).await?;
    assert_eq!(offsets["fresh"][&0], vec![0]);
    Ok(())
}

#[tokio::test]
async fn earliest_is_not_after_latest() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    cluster.create_topic("t", 1).await?;
    for i in 0..5 {
        cluster.produce("t", 0, format!("m{i}")).await?;
    }
    cluster.truncate("t", 0, 2).await?;
    let manager = manager(&cluster);

    let earliest = manager
        .fetch(&[selector("t", 0).time(EARLIEST_TIME)])
        .await?;
    let latest = manager.fetch(&[selector("t", 0).time(LATEST_TIME)]).await?;
    let earliest = &earliest["t"][&0];
    let latest = &latest["t"][&0];
    assert!(!earliest.is_empty() && !latest.is_empty());
    assert_eq!(earliest[0], 2);
    assert_eq!(latest[0], 5);
    assert!(earliest[0] <= latest[0]);
    Ok(())
}

#[tokio::test]
async fn latest_offsets_agree_with_fetch() -> anyhow::Result<()> {
    let cluster = Cluster::new(3);
    cluster.create_topic("spread", 3).await?;
    for i in 0..7 {
        cluster.produce("spread", i % 3, "x").await?;
    }
    let manager = manager(&cluster);

    let latest = manager.fetch_latest_offsets(&["spread"]).await?;
    let fetched = manager
        .fetch(&[TopicPartitionSelector::topic("spread").time(LATEST_TIME)])
        .await?;
    assert_eq!(latest["spread"].len(), 3);
    for partition in 0..3 {
        assert_eq!(latest["spread"][&partition], fetched["spread"][&partition][0]);
    }
    assert_eq!(latest["spread"][&0], 3);

    let earliest = manager.fetch_earliest_offsets(&["spread"]).await?;
    assert!(earliest["spread"].values().all(|offset| *offset == 0));
    Ok(())
}

#[tokio::test]
async fn max_num_bounds_candidate_offsets() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    for _ in 0..4 {
        cluster.produce("t", 0, "x").await?;
    }
    cluster.truncate("t", 0, 1).await?;

    let offsets = manager(&cluster)
        .fetch(&[selector("t", 0).max_num(5)])
        .await?;
    assert_eq!(offsets["t"][&0], vec![4, 1]);
    Ok(())
}

#[tokio::test]
async fn unknown_topic_is_reported() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    let manager = manager(&cluster);

    let earliest = manager.fetch_earliest_offsets(&["nope"]).await.unwrap_err();
    assert_eq!(earliest.to_string(), "Topic(s) does not exist");
    let latest = manager.fetch_latest_offsets(&["nope"]).await.unwrap_err();
    assert_eq!(latest, ClientError::TopicDoesNotExist);
    Ok(())
}

#[tokio::test]
async fn selector_with_offset_is_rejected() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    let err = manager(&cluster)
        .fetch(&[selector("t", 0).offset(3)])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidSelector { .. }));
    Ok(())
}

#[tokio::test]
async fn v0_commit_reads_back_and_is_routed_to_leaders() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    cluster.create_topic("t", 2).await?;
    let manager = manager(&cluster);

    let ack = manager
        .commit(
            "g0",
            &[CommitRequest::new("t", 0, 5), CommitRequest::new("t", 1, 7)],
        )
        .await?;
    assert_eq!(ack["t"], vec![0, 1]);

    let committed = manager
        .fetch_commits("g0", &[TopicPartitionSelector::topic("t")])
        .await?;
    assert_eq!(committed["t"][&0], 5);
    assert_eq!(committed["t"][&1], 7);

    // each partition lives on a different leader
    for partition in 0..2 {
        let leader = cluster.leader_of("t", partition).await.unwrap();
        assert_eq!(cluster.requests_to(leader, API_KEY_OFFSET_COMMIT).await, 1);
        assert_eq!(cluster.committed_v0("g0", "t", partition).await, Some(5 + 2 * partition as i64));
    }
    assert_eq!(cluster.committed_v1("g0", "t", 0).await, None);
    Ok(())
}

#[tokio::test]
async fn v1_commit_goes_to_the_coordinator() -> anyhow::Result<()> {
    let cluster = Cluster::new(3);
    cluster.create_topic("t", 3).await?;
    cluster.set_coordinator("g1", Some(2)).await;
    let manager = manager(&cluster);

    let requests: Vec<CommitRequest> = (0..3).map(|p| CommitRequest::new("t", p, 10 + p as i64)).collect();
    manager.commit_v1("g1", &Generation::none(), &requests).await?;
    let committed = manager
        .fetch_commits_v1("g1", &[TopicPartitionSelector::topic("t")])
        .await?;
    for partition in 0..3 {
        assert_eq!(committed["t"][&partition], 10 + partition as i64);
    }

    // one batched request per call, all to the coordinator
    assert_eq!(cluster.requests_to(2, API_KEY_OFFSET_COMMIT).await, 1);
    assert_eq!(cluster.requests_to(2, API_KEY_OFFSET_FETCH).await, 1);
    for other in [1, 3] {
        assert_eq!(cluster.requests_to(other, API_KEY_OFFSET_COMMIT).await, 0);
        assert_eq!(cluster.requests_to(other, API_KEY_OFFSET_FETCH).await, 0);
    }

    let v0 = manager
        .fetch_commits("g1", &[selector("t", 0)])
        .await?;
    assert_eq!(v0["t"][&0], -1);
    Ok(())
}

#[tokio::test]
async fn absent_commits_read_as_minus_one() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    let manager = manager(&cluster);

    let v0 = manager.fetch_commits("never", &[selector("t", 0)]).await?;
    let v1 = manager.fetch_commits_v1("never", &[selector("t", 0)]).await?;
    assert_eq!(v0["t"][&0], -1);
    assert_eq!(v1["t"][&0], -1);
    Ok(())
}

#[tokio::test]
async fn repeated_commit_is_idempotent() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    let manager = manager(&cluster);
    let request = [CommitRequest::new("t", 0, 4).with_metadata("first")];

    manager.commit("g", &request).await?;
    manager.commit("g", &request).await?;
    manager.commit_v1("g", &Generation::none(), &request).await?;
    manager.commit_v1("g", &Generation::none(), &request).await?;

    assert_eq!(manager.fetch_commits("g", &[selector("t", 0)]).await?["t"][&0], 4);
    assert_eq!(manager.fetch_commits_v1("g", &[selector("t", 0)]).await?["t"][&0], 4);
    Ok(())
}

#[tokio::test]
async fn commit_validates_its_input() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    let manager = manager(&cluster);

    let blank = manager.commit("", &[CommitRequest::new("t", 0, 1)]).await;
    assert!(matches!(blank, Err(ClientError::InvalidGroupId(_))));
    let negative = manager.commit("g", &[CommitRequest::new("t", 0, -5)]).await;
    assert!(matches!(negative, Err(ClientError::InvalidOffset { .. })));
    let missing = manager.commit("g", &[CommitRequest::new("other", 0, 1)]).await;
    assert_eq!(missing, Err(ClientError::TopicDoesNotExist));
    Ok(())
}

#[tokio::test]
async fn mixed_commit_keeps_what_the_broker_acknowledged() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    let manager = manager(&cluster);

    let result = manager
        .commit(
            "g",
            &[CommitRequest::new("t", 0, 5), CommitRequest::new("missing", 0, 1)],
        )
        .await;
    let Err(ClientError::PartialCommit { acked, failures }) = result else {
        panic!("expected a partial commit, got {result:?}");
    };
    assert_eq!(acked.len(), 1);
    assert_eq!(acked["t"], vec![0]);
    assert_eq!(
        failures.into_iter().collect::<Vec<_>>(),
        vec![(TopicPartition::new("missing", 0), ClientError::TopicDoesNotExist)]
    );
    assert_eq!(cluster.committed_v0("g", "t", 0).await, Some(5));

    // reads stay all-or-nothing
    let read = manager
        .fetch_commits("g", &[selector("t", 0), selector("missing", 0)])
        .await;
    assert_eq!(read, Err(ClientError::TopicDoesNotExist));
    Ok(())
}

#[tokio::test]
async fn fetch_commits_v1_waits_for_the_coordinator() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    cluster.create_topic("t", 1).await?;
    cluster.set_coordinator("late", None).await;
    let manager = manager(&cluster);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.fetch_commits_v1("late", &[selector("t", 0)]).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    cluster.set_coordinator("late", Some(1)).await;

    let committed = tokio::time::timeout(Duration::from_secs(5), pending).await???;
    assert_eq!(committed["t"][&0], -1);
    Ok(())
}

#[tokio::test]
async fn moved_coordinator_is_rediscovered() -> anyhow::Result<()> {
    let cluster = Cluster::new(3);
    cluster.create_topic("t", 1).await?;
    cluster.set_coordinator("moving", Some(1)).await;
    let manager = manager(&cluster);
    manager
        .commit_v1("moving", &Generation::none(), &[CommitRequest::new("t", 0, 3)])
        .await?;

    cluster.set_coordinator("moving", Some(3)).await;
    cluster
        .inject_fault(Fault::new(
            API_KEY_FIND_COORDINATOR,
            FaultKind::Code(KafkaErrorCode::CoordinatorNotAvailable),
            2,
        ))
        .await;
    // the cached coordinator answers NotCoordinator, rediscovery fails twice
    manager
        .commit_v1("moving", &Generation::none(), &[CommitRequest::new("t", 0, 4)])
        .await?;
    assert_eq!(cluster.requests_to(3, API_KEY_OFFSET_COMMIT).await, 1);
    assert_eq!(cluster.committed_v1("moving", "t", 0).await, Some(4));
    Ok(())
}

#[tokio::test]
async fn offsets_wait_for_leader_election() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    cluster.create_topic_without_leaders("electing", 2).await?;
    let manager = manager(&cluster);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.fetch_latest_offsets(&["electing"]).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    cluster.elect_leaders("electing").await?;

    let latest = tokio::time::timeout(Duration::from_secs(5), pending).await???;
    assert_eq!(latest["electing"].len(), 2);
    Ok(())
}

#[tokio::test]
async fn stale_leader_is_invalidated_and_retried() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    cluster.create_topic("t", 1).await?;
    let manager = manager(&cluster);
    manager.fetch_latest_offsets(&["t"]).await?;

    let old = cluster.leader_of("t", 0).await.unwrap();
    let new = if old == 1 { 2 } else { 1 };
    cluster.set_leader("t", 0, Some(new)).await?;

    // the cached leader answers NotLeaderForPartition first
    let latest = manager.fetch_latest_offsets(&["t"]).await?;
    assert_eq!(latest["t"][&0], 0);
    assert_eq!(cluster.requests_to(old, API_KEY_LIST_OFFSETS).await, 2);
    assert_eq!(cluster.requests_to(new, API_KEY_LIST_OFFSETS).await, 1);
    Ok(())
}

#[tokio::test]
async fn retry_ceiling_surfaces_last_error() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic("t", 1).await?;
    cluster
        .inject_fault(Fault::new(
            API_KEY_LIST_OFFSETS,
            FaultKind::Code(KafkaErrorCode::LeaderNotAvailable),
            10,
        ))
        .await;
    let manager = OffsetManager::new(
        BrokerDirectory::new(cluster.clone()),
        RetryPolicy::fixed(Duration::from_millis(1), Some(3)),
    );

    let err = manager.fetch_latest_offsets(&["t"]).await.unwrap_err();
    match err {
        ClientError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(last.is_transient());
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_pending_retries() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.create_topic_without_leaders("stuck", 1).await?;
    let token = CancellationToken::new();
    let manager = OffsetManager::new(
        BrokerDirectory::new(cluster.clone()),
        RetryPolicy::fixed(Duration::from_millis(5), None),
    )
    .with_cancellation(token.clone());

    let pending = tokio::spawn(async move { manager.fetch_latest_offsets(&["stuck"]).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), pending).await??;
    assert_eq!(result, Err(ClientError::Cancelled));
    Ok(())
}
