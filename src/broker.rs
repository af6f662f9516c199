//! Broker discovery and request routing.
//!
//! [`BrokerClient`] is the seam to the connection layer: it knows how to
//! resolve partition leaders and group coordinators and how to put a request
//! on the wire. [`BrokerDirectory`] wraps it with a shared identity cache that
//! every offset and group operation reads from. Only the resolution path
//! writes to the cache; callers invalidate entries when a broker answers that
//! it is not (or no longer) the right destination.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::constants::{DEFAULT_CLIENT_ID, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{ClientError, Result};
use crate::protocol::{Request, RequestHeader, Response};
use crate::types::TopicPartition;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerRef {
    pub id: i32,
    pub host: String,
    pub port: u16,
}

impl BrokerRef {
    pub fn new(id: i32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker-{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Connection-level client consumed by this crate.
///
/// Every method may fail with a transient error (`LeaderNotAvailable`,
/// `CoordinatorNotAvailable`, `ConnectionLost`, `Timeout`, ...) which callers
/// hand to the retry driver.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    async fn leader_for(&self, topic: &str, partition: i32) -> Result<BrokerRef>;

    async fn coordinator_for(&self, group_id: &str) -> Result<BrokerRef>;

    /// Partition ids of `topic`, or `TopicDoesNotExist`.
    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>>;

    async fn send(
        &self,
        broker: &BrokerRef,
        header: RequestHeader,
        request: Request,
    ) -> Result<Response>;
}

struct DirectoryInner {
    client: Arc<dyn BrokerClient>,
    client_id: String,
    request_timeout: Duration,
    correlation_id: AtomicI32,
    leaders: RwLock<HashMap<TopicPartition, BrokerRef>>,
    coordinators: RwLock<HashMap<String, BrokerRef>>,
    partitions: RwLock<HashMap<String, Vec<i32>>>,
}

/// Caching front for a [`BrokerClient`]; cheap to clone and share.
#[derive(Clone)]
pub struct BrokerDirectory {
    inner: Arc<DirectoryInner>,
}

impl fmt::Debug for BrokerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerDirectory")
            .field("client_id", &self.inner.client_id)
            .field("request_timeout", &self.inner.request_timeout)
            .finish()
    }
}

impl BrokerDirectory {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self::with_options(client, DEFAULT_CLIENT_ID, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_options(
        client: Arc<dyn BrokerClient>,
        client_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                client,
                client_id: client_id.into(),
                request_timeout,
                correlation_id: AtomicI32::new(0),
                leaders: RwLock::new(HashMap::new()),
                coordinators: RwLock::new(HashMap::new()),
                partitions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub async fn leader_for(&self, topic: &str, partition: i32) -> Result<BrokerRef> {
        let key = TopicPartition::new(topic, partition);
        if let Some(broker) = self.inner.leaders.read().await.get(&key) {
            return Ok(broker.clone());
        }

        let broker = self.bounded(self.inner.client.leader_for(topic, partition)).await?;
        trace!("resolved leader of {} to {}", key, broker);
        self.inner.leaders.write().await.insert(key, broker.clone());
        Ok(broker)
    }

    pub async fn coordinator_for(&self, group_id: &str) -> Result<BrokerRef> {
        if let Some(broker) = self.inner.coordinators.read().await.get(group_id) {
            return Ok(broker.clone());
        }

        let broker = self.bounded(self.inner.client.coordinator_for(group_id)).await?;
        trace!("resolved coordinator of group {} to {}", group_id, broker);
        self.inner
            .coordinators
            .write()
            .await
            .insert(group_id.to_string(), broker.clone());
        Ok(broker)
    }

    /// Partitions of `topic` as currently known to the client.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        if let Some(partitions) = self.inner.partitions.read().await.get(topic) {
            return Ok(partitions.clone());
        }

        let mut partitions = self.bounded(self.inner.client.partitions_for(topic)).await?;
        partitions.sort_unstable();
        if partitions.is_empty() {
            return Err(ClientError::TopicDoesNotExist);
        }
        self.inner
            .partitions
            .write()
            .await
            .insert(topic.to_string(), partitions.clone());
        Ok(partitions)
    }

    pub async fn invalidate_leader(&self, topic: &str, partition: i32) {
        let key = TopicPartition::new(topic, partition);
        if self.inner.leaders.write().await.remove(&key).is_some() {
            debug!("invalidated cached leader of {}", key);
        }
    }

    pub async fn invalidate_coordinator(&self, group_id: &str) {
        if self.inner.coordinators.write().await.remove(group_id).is_some() {
            debug!("invalidated cached coordinator of group {}", group_id);
        }
    }

    /// Forgets a topic's partition list so the next lookup sees new partitions.
    pub async fn invalidate_topic(&self, topic: &str) {
        self.inner.partitions.write().await.remove(topic);
        self.inner.leaders.write().await.retain(|tp, _| tp.topic != topic);
    }

    /// Sends one request with a bounded wait. A fetch's long-poll window is
    /// added on top of the request timeout.
    pub async fn send(&self, broker: &BrokerRef, request: Request) -> Result<Response> {
        let correlation_id = self.inner.correlation_id.fetch_add(1, Ordering::Relaxed);
        let header = request.header(correlation_id, &self.inner.client_id);
        let budget = match &request {
            Request::Fetch(fetch) => self.inner.request_timeout + fetch.max_wait,
            _ => self.inner.request_timeout,
        };
        trace!(
            "sending api_key {} v{} (correlation {}) to {}",
            header.api_key,
            header.api_version,
            correlation_id,
            broker
        );
        tokio::time::timeout(budget, self.inner.client.send(broker, header, request)).await?
    }

    async fn bounded<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.inner.request_timeout, fut).await?
    }
}
