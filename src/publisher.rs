// =============================================================================
// publisher.rs — THE BROKER MEGAPHONE
// =============================================================================
//
// Collectors hand this module a batch of JSON messages; it puts them on the
// configured topic. In production the topic is a Redis pub/sub channel and
// downstream consumers subscribe to it.
//
// Architecture:
// 1. Connect lazily on the first publish, name the connection after the
//    configured client id
// 2. Keep ONE multiplexed connection behind an async mutex. Collectors run
//    one after another today, but nothing here assumes that: concurrent
//    publishers simply queue on the lock
// 3. Send the whole batch in one atomic pipeline, so a batch either lands
//    or it doesn't
// 4. If anything fails, drop the connection. The next tick reconnects
//
// There is no retry loop. A batch that fails is reported to the collector,
// which marks its run as failed, and the next tick re-fetches the snapshot
// anyway.
// =============================================================================

use async_trait::async_trait;
use portable_atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PublishError;

/// Where collectors send their batches. Implementations own their
/// connection handling; callers never assume exclusive access.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    /// Publish every JSON message in `batch` to the topic, returning how
    /// many were sent.
    async fn publish(&self, batch: Vec<String>) -> Result<usize, PublishError>;

    /// Counters for the tick summary.
    fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot::default()
    }
}

/// Publisher statistics.
#[derive(Default)]
pub struct PublisherStats {
    pub messages_published: AtomicU64,
    pub batches_sent: AtomicU64,
    pub publish_errors: AtomicU64,
    pub reconnects: AtomicU64,
}

/// A serializable snapshot of publisher stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PublisherSnapshot {
    pub messages_published: u64,
    pub batches_sent: u64,
    pub publish_errors: u64,
    pub reconnects: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Publishes to a Redis pub/sub channel.
pub struct RedisPublisher {
    client: redis::Client,
    topic: String,
    client_id: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    stats: PublisherStats,
}

impl RedisPublisher {
    /// Validate the broker URL. No connection is made until the first
    /// publish, so a broker that is down at startup does not stop the
    /// process from starting.
    pub fn new(
        broker_url: &str,
        topic: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Result<Self, PublishError> {
        let client = redis::Client::open(broker_url)
            .map_err(|e| PublishError::Unavailable(format!("invalid broker url: {e}")))?;

        Ok(Self {
            client,
            topic: topic.into(),
            client_id: client_id.into(),
            connection: Mutex::new(None),
            stats: PublisherStats::default(),
        })
    }

    async fn connect(&self) -> Result<redis::aio::MultiplexedConnection, PublishError> {
        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&self.client_id)
            .query_async(&mut con)
            .await
            .map_err(|e| PublishError::Unavailable(format!("CLIENT SETNAME failed: {e}")))?;

        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = %self.topic,
            client_id = %self.client_id,
            "Broker connection established"
        );
        Ok(con)
    }
}

#[async_trait]
impl ReportPublisher for RedisPublisher {
    async fn publish(&self, batch: Vec<String>) -> Result<usize, PublishError> {
        if batch.is_empty() {
            return Ok(0);
        }

        // Held for the whole round-trip; the connection is only put back on success.
        let mut guard = self.connection.lock().await;
        let mut con = match guard.take() {
            Some(con) => con,
            None => self.connect().await.inspect_err(|_| {
                self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
            })?,
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        for message in &batch {
            pipe.publish(&self.topic, message).ignore();
        }

        let count = batch.len();
        let result: redis::RedisResult<()> = pipe.query_async(&mut con).await;
        *guard = result.is_ok().then_some(con);
        if let Err(e) = result {
            self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %e,
                batch_size = count,
                topic = %self.topic,
                "Broker rejected batch, connection dropped"
            );
            return Err(PublishError::Rejected {
                count,
                reason: e.to_string(),
            });
        }

        self.stats
            .messages_published
            .fetch_add(count as u64, Ordering::Relaxed);
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

        debug!(
            batch_size = count,
            topic = %self.topic,
            total_published = self.stats.messages_published.load(Ordering::Relaxed),
            "Batch published"
        );

        Ok(count)
    }

    fn snapshot(&self) -> PublisherSnapshot {
        self.stats.snapshot()
    }
}
