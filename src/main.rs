//! Runs a consumer group member against an embedded cluster.
//!
//! Usage: `rafka-offsets [messages] [partitions]`. Produces the messages,
//! consumes them with one group member and reports committed offsets from
//! both storage generations.

use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rafka_offsets::memory::Cluster;
use rafka_offsets::{
    BrokerDirectory, ConsumerGroup, ConsumerGroupConfig, FromOffset, GroupEvent, OffsetManager,
    RetryPolicy, TopicPartitionSelector,
};

const TOPIC: &str = "demo";
const GROUP: &str = "demo-group";

fn parse_arg(position: usize, default: usize) -> anyhow::Result<usize> {
    match std::env::args().nth(position) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("argument {position} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let messages = parse_arg(1, 10)?;
    let partitions = parse_arg(2, 3)?;
    if partitions == 0 {
        bail!("a topic needs at least one partition");
    }

    let cluster = Cluster::new(3);
    cluster.create_topic(TOPIC, partitions as i32).await?;
    for i in 0..messages {
        let partition = (i % partitions) as i32;
        cluster
            .produce(TOPIC, partition, format!("message {i}"))
            .await?;
    }
    info!("produced {} message(s) over {} partition(s)", messages, partitions);

    let config = ConsumerGroupConfig {
        from_offset: FromOffset::Earliest,
        auto_commit_interval_ms: 100,
        heartbeat_interval_ms: 500,
        retry: RetryPolicy::fixed(Duration::from_millis(50), None),
        ..ConsumerGroupConfig::new(GROUP, [TOPIC])
    };
    let (group, mut streams) = ConsumerGroup::start(config, cluster.clone())?;

    let mut consumed = 0;
    while consumed < messages {
        tokio::select! {
            message = streams.messages.recv() => {
                let message = message.context("message stream ended early")?;
                info!(
                    "{}-{} offset {} (high water {}): {}",
                    message.topic,
                    message.partition,
                    message.offset,
                    message.high_water_offset,
                    String::from_utf8_lossy(&message.value)
                );
                consumed += 1;
            }
            Some(event) = streams.events.recv() => match event {
                GroupEvent::Error { error, .. } => info!("group error: {}", error),
                other => info!("group event: {:?}", other),
            },
        }
    }

    group.close(false).await?;

    let offsets = OffsetManager::new(BrokerDirectory::new(cluster), RetryPolicy::default());
    let committed = offsets
        .fetch_commits_v1(GROUP, &[TopicPartitionSelector::topic(TOPIC)])
        .await?;
    let latest = offsets.fetch_latest_offsets(&[TOPIC]).await?;
    for partition in 0..partitions as i32 {
        info!(
            "{}-{}: committed {:?}, latest {:?}",
            TOPIC,
            partition,
            committed.get(TOPIC).and_then(|p| p.get(&partition)),
            latest.get(TOPIC).and_then(|p| p.get(&partition))
        );
    }
    Ok(())
}
