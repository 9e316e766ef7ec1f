//! Scoped broker sessions.
//!
//! Each facade borrows one pooled connection, wraps a single category of
//! broker operation with a deadline, and gives the connection back on close
//! (or poisons it on timeout). Consumer, producer and offset coordinator
//! share the same lease plumbing and differ only in the delegate they drive.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::client::{
    ConsumerConfig, ConsumerSession, OffsetCoordinatorConfig, OffsetCoordinatorSession,
    ProducerConfig, ProducerSession,
};
use crate::error::{AppError, Error, Result};
use crate::metrics::{self, OpTimer};
use crate::pool::Pool;
use crate::record::Message;

pub(crate) enum Deadline<T> {
    Completed(T),
    Elapsed,
}

/// Run `op` on its own task and race it against `timeout` (zero disables
/// the deadline).
///
/// The task is deliberately left running when the deadline fires: the
/// caller quarantines the session it was talking to, so the stalled call
/// drains against a connection that is about to be closed anyway.
pub(crate) async fn run_with_deadline<T, F>(timeout: Duration, op: F) -> Deadline<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = done_tx.send(op.await);
    });

    if timeout.is_zero() {
        match done_rx.await {
            Ok(value) => Deadline::Completed(value),
            Err(_) => Deadline::Elapsed,
        }
    } else {
        tokio::select! {
            result = done_rx => match result {
                Ok(value) => Deadline::Completed(value),
                Err(_) => Deadline::Elapsed,
            },
            _ = tokio::time::sleep(timeout) => Deadline::Elapsed,
        }
    }
}

/// Exclusive loan of one pooled broker id.
///
/// Exactly one of `close` or `corrupt` settles the lease; whichever comes
/// first wins and the other becomes a no-op. Dropping an unsettled lease
/// closes it.
struct Lease {
    pool: Arc<Pool>,
    id: i64,
    opened: bool,
}

impl Lease {
    fn close(&mut self) {
        if self.opened {
            self.pool.release(self.id);
            self.opened = false;
        }
    }

    fn corrupt(&mut self) {
        if self.opened {
            self.pool.quarantine(self.id);
            self.opened = false;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.close();
    }
}

/// Single-partition consumer bound to one pooled connection.
pub struct Consumer {
    lease: Lease,
    delegate: Arc<dyn ConsumerSession>,
    timeout: Duration,
}

impl Consumer {
    /// Borrow a session and open a consumer on it at `conf.start_offset`.
    pub async fn open(pool: Arc<Pool>, conf: ConsumerConfig, timeout: Duration) -> Result<Self> {
        let id = pool.borrow()?;
        match pool.session(id).consumer(conf).await {
            Ok(delegate) => Ok(Self {
                lease: Lease {
                    pool,
                    id,
                    opened: true,
                },
                delegate,
                timeout,
            }),
            Err(err) => {
                pool.release(id);
                Err(err.into())
            }
        }
    }

    /// Next message, or [`AppError::ReadTimeout`] once the deadline fires
    /// (which also poisons the borrowed connection).
    pub async fn message(&mut self) -> Result<Message> {
        if !self.lease.opened {
            return Err(AppError::ConsumerClosed.into());
        }
        let _timer = OpTimer::start(metrics::GET_MESSAGE);

        let delegate = Arc::clone(&self.delegate);
        match run_with_deadline(self.timeout, async move { delegate.consume().await }).await {
            Deadline::Completed(result) => result.map_err(Error::from),
            Deadline::Elapsed => {
                self.corrupt();
                Err(AppError::ReadTimeout.into())
            }
        }
    }

    pub fn close(&mut self) {
        self.lease.close();
    }

    pub fn corrupt(&mut self) {
        self.lease.corrupt();
    }
}

/// Producer bound to one pooled connection.
pub struct Producer {
    lease: Lease,
    delegate: Arc<dyn ProducerSession>,
    timeout: Duration,
}

impl Producer {
    pub async fn open(pool: Arc<Pool>, conf: ProducerConfig, timeout: Duration) -> Result<Self> {
        let id = pool.borrow()?;
        match pool.session(id).producer(conf).await {
            Ok(delegate) => Ok(Self {
                lease: Lease {
                    pool,
                    id,
                    opened: true,
                },
                delegate,
                timeout,
            }),
            Err(err) => {
                pool.release(id);
                Err(err.into())
            }
        }
    }

    /// Append one message to the partition; returns the assigned offset.
    pub async fn send(&mut self, topic: &str, partition: i32, payload: Bytes) -> Result<i64> {
        if !self.lease.opened {
            return Err(AppError::ProducerClosed.into());
        }
        let _timer = OpTimer::start(metrics::SEND_MESSAGE);

        let delegate = Arc::clone(&self.delegate);
        let topic = topic.to_owned();
        let outcome = run_with_deadline(self.timeout, async move {
            delegate.produce(&topic, partition, payload).await
        })
        .await;

        match outcome {
            Deadline::Completed(result) => result.map_err(Error::from),
            Deadline::Elapsed => {
                self.corrupt();
                Err(AppError::WriteTimeout.into())
            }
        }
    }

    pub fn close(&mut self) {
        self.lease.close();
    }

    pub fn corrupt(&mut self) {
        self.lease.corrupt();
    }
}

/// Offset coordinator for one consumer group, bound to one pooled connection.
pub struct OffsetCoordinator {
    lease: Lease,
    delegate: Arc<dyn OffsetCoordinatorSession>,
    commit_timeout: Duration,
    fetch_timeout: Duration,
}

impl OffsetCoordinator {
    pub async fn open(
        pool: Arc<Pool>,
        conf: OffsetCoordinatorConfig,
        commit_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        let id = pool.borrow()?;
        match pool.session(id).offset_coordinator(conf).await {
            Ok(delegate) => Ok(Self {
                lease: Lease {
                    pool,
                    id,
                    opened: true,
                },
                delegate,
                commit_timeout,
                fetch_timeout,
            }),
            Err(err) => {
                pool.release(id);
                Err(err.into())
            }
        }
    }

    pub async fn commit(&mut self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        if !self.lease.opened {
            return Err(AppError::OffsetCoordinatorClosed.into());
        }
        let _timer = OpTimer::start(metrics::COMMIT_OFFSET);

        let delegate = Arc::clone(&self.delegate);
        let topic = topic.to_owned();
        let outcome = run_with_deadline(self.commit_timeout, async move {
            delegate.commit(&topic, partition, offset).await
        })
        .await;

        match outcome {
            Deadline::Completed(result) => result.map_err(Error::from),
            Deadline::Elapsed => {
                self.corrupt();
                Err(AppError::OffsetCommitTimeout.into())
            }
        }
    }

    /// Committed offset and metadata string for the partition.
    pub async fn fetch(&mut self, topic: &str, partition: i32) -> Result<(i64, String)> {
        if !self.lease.opened {
            return Err(AppError::OffsetCoordinatorClosed.into());
        }
        let _timer = OpTimer::start(metrics::FETCH_OFFSET);

        let delegate = Arc::clone(&self.delegate);
        let topic = topic.to_owned();
        let outcome = run_with_deadline(self.fetch_timeout, async move {
            delegate.fetch(&topic, partition).await
        })
        .await;

        match outcome {
            Deadline::Completed(result) => result.map_err(Error::from),
            Deadline::Elapsed => {
                self.corrupt();
                Err(AppError::OffsetFetchTimeout.into())
            }
        }
    }

    pub fn close(&mut self) {
        self.lease.close();
    }

    pub fn corrupt(&mut self) {
        self.lease.corrupt();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::pool::PoolConfig;
    use crate::testing::MockCluster;

    fn pool_config(num_conns: usize) -> PoolConfig {
        PoolConfig {
            num_conns,
            get_metadata_timeout: Duration::from_secs(1),
            metadata_cache_period: Duration::ZERO,
            get_offsets_timeout: Duration::from_secs(1),
            reconnect_period: Duration::ZERO,
        }
    }

    fn consumer_config(topic: &str, offset: i64) -> ConsumerConfig {
        ConsumerConfig {
            topic: topic.to_owned(),
            partition: 0,
            start_offset: offset,
            request_timeout: Duration::from_millis(50),
            retry_limit: 2,
            retry_wait: Duration::from_millis(10),
            retry_err_limit: 2,
            retry_err_wait: Duration::from_millis(10),
            min_fetch_size: 1,
            max_fetch_size: 1 << 20,
        }
    }

    fn producer_config() -> ProducerConfig {
        ProducerConfig {
            request_timeout: Duration::from_millis(50),
            retry_limit: 2,
            retry_wait: Duration::from_millis(10),
        }
    }

    fn coordinator_config(group: &str) -> OffsetCoordinatorConfig {
        OffsetCoordinatorConfig {
            group: group.to_owned(),
            retry_err_limit: 2,
            retry_err_wait: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn consumer_round_trip_and_close() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"payload");

        let pool = Pool::connect(cluster.connector(), pool_config(1))
            .await
            .unwrap();
        let mut consumer = Consumer::open(
            Arc::clone(&pool),
            consumer_config("events", 0),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let msg = consumer.message().await.unwrap();
        assert_eq!(msg.offset, 0);
        assert_eq!(&msg.value[..], b"payload");

        consumer.close();
        consumer.close(); // idempotent
        assert_matches!(
            consumer.message().await,
            Err(Error::App(AppError::ConsumerClosed))
        );
        // The id is free again.
        assert!(pool.borrow().is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn consumer_deadline_quarantines_the_session() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"payload");
        cluster.set_consume_delay(Duration::from_millis(200));

        let pool = Pool::connect(cluster.connector(), pool_config(1))
            .await
            .unwrap();
        cluster.fail_dials(u32::MAX);

        let mut consumer = Consumer::open(
            Arc::clone(&pool),
            consumer_config("events", 0),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        assert_matches!(
            consumer.message().await,
            Err(Error::App(AppError::ReadTimeout))
        );
        // Corrupted: further reads fail fast and the id is not free.
        assert_matches!(
            consumer.message().await,
            Err(Error::App(AppError::ConsumerClosed))
        );
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));
        pool.close().await;
    }

    #[tokio::test]
    async fn producer_sends_and_times_out() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);

        let pool = Pool::connect(cluster.connector(), pool_config(2))
            .await
            .unwrap();

        let mut producer = Producer::open(
            Arc::clone(&pool),
            producer_config(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let offset = producer
            .send("events", 0, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(offset, 0);
        producer.close();

        cluster.set_produce_delay(Duration::from_millis(200));
        let mut slow = Producer::open(
            Arc::clone(&pool),
            producer_config(),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_matches!(
            slow.send("events", 0, Bytes::from_static(b"{}")).await,
            Err(Error::App(AppError::WriteTimeout))
        );
        assert_matches!(
            slow.send("events", 0, Bytes::from_static(b"{}")).await,
            Err(Error::App(AppError::ProducerClosed))
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn coordinator_commit_fetch_round_trip() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);

        let pool = Pool::connect(cluster.connector(), pool_config(1))
            .await
            .unwrap();
        let mut coordinator = OffsetCoordinator::open(
            Arc::clone(&pool),
            coordinator_config("readers"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        coordinator.commit("events", 0, 5).await.unwrap();
        let (offset, _metadata) = coordinator.fetch("events", 0).await.unwrap();
        assert_eq!(offset, 5);

        coordinator.close();
        assert_matches!(
            coordinator.commit("events", 0, 6).await,
            Err(Error::App(AppError::OffsetCoordinatorClosed))
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn corrupt_is_idempotent() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);

        let pool = Pool::connect(cluster.connector(), pool_config(1))
            .await
            .unwrap();
        cluster.fail_dials(u32::MAX);

        let mut producer = Producer::open(
            Arc::clone(&pool),
            producer_config(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        producer.corrupt();
        producer.corrupt();
        producer.close();
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));
        pool.close().await;
    }

    #[tokio::test]
    async fn dropping_an_open_facade_releases_the_lease() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);

        let pool = Pool::connect(cluster.connector(), pool_config(1))
            .await
            .unwrap();
        {
            let _producer = Producer::open(
                Arc::clone(&pool),
                producer_config(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
            assert_matches!(pool.borrow(), Err(AppError::NoBrokers));
        }
        assert!(pool.borrow().is_ok());
        pool.close().await;
    }
}
