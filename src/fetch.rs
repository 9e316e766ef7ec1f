//! Adaptive bounded range reads.
//!
//! A single fetch returns whole messages that fit inside a byte budget; a
//! budget smaller than the next message yields no data at all. The loop
//! below starts from the per-topic size hint, grows the budget whenever the
//! broker comes back empty-handed, and streams messages into an mpsc sink
//! until the requested count or the upper offset bound is reached.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ClientError;
use crate::config::ConsumerSection;
use crate::error::Error;
use crate::hints::MessageSizeHints;
use crate::pool::Pool;
use crate::record::Message;
use crate::session::Consumer;

/// Bounded range read over one partition.
#[derive(Debug, Clone)]
pub struct RangeRead {
    pub topic: String,
    pub partition: i32,
    /// First offset to read.
    pub offset: i64,
    /// Maximum number of messages to deliver. Values below 1 mean 1.
    pub limit: i32,
    /// Readable range `[offset_from, offset_to)` pre-fetched from the broker.
    pub offset_from: i64,
    pub offset_to: i64,
}

#[derive(Debug, Error)]
pub enum ReadError {
    /// The start offset lies outside the readable range.
    #[error("offset {offset} out of range [{offset_from}, {offset_to})")]
    OutOfRange {
        offset: i64,
        offset_from: i64,
        offset_to: i64,
    },

    #[error(transparent)]
    Gateway(#[from] Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    /// Messages handed to the sink.
    pub delivered: i32,
    /// Whether the read stopped early (error after the first message, or
    /// the sink went away).
    pub truncated: bool,
}

/// Stream up to `read.limit` messages starting at `read.offset` into `tx`.
///
/// Errors are only returned while nothing has been delivered yet; once a
/// message is out the door the response can no longer change status, so
/// later failures end the read quietly with `truncated` set. A dropped
/// receiver is treated as the client hanging up.
pub async fn read_range(
    pool: Arc<Pool>,
    conf: &ConsumerSection,
    hints: &MessageSizeHints,
    read: RangeRead,
    tx: mpsc::Sender<Message>,
) -> Result<ReadSummary, ReadError> {
    if read.offset < read.offset_from || read.offset >= read.offset_to {
        return Err(ReadError::OutOfRange {
            offset: read.offset,
            offset_from: read.offset_from,
            offset_to: read.offset_to,
        });
    }

    let mut size = hints.get(&read.topic, conf.default_fetch_size);
    let mut remaining = read.limit.max(1);
    let mut offset = read.offset;
    let mut max_seen: i32 = 0;
    let mut delivered: i32 = 0;
    let mut truncated = false;

    'grow: loop {
        let budget = size.saturating_mul(remaining).min(conf.max_fetch_size);
        let consumer_conf = conf.session_config(&read.topic, read.partition, offset, budget);

        let mut consumer =
            match Consumer::open(Arc::clone(&pool), consumer_conf, conf.get_message_timeout).await
            {
                Ok(consumer) => consumer,
                Err(err) if delivered == 0 => return Err(err.into()),
                Err(err) => {
                    debug!(%err, "ending partial read: cannot reopen consumer");
                    truncated = true;
                    break 'grow;
                }
            };

        let mut not_enough_size = false;
        loop {
            if tx.is_closed() {
                consumer.close();
                return Ok(ReadSummary {
                    delivered,
                    truncated: true,
                });
            }

            match consumer.message().await {
                Ok(msg) => {
                    offset = msg.offset + 1;
                    remaining -= 1;
                    max_seen = max_seen.max(msg.payload_len());
                    if tx.send(msg).await.is_err() {
                        consumer.close();
                        return Ok(ReadSummary {
                            delivered,
                            truncated: true,
                        });
                    }
                    delivered += 1;
                    if offset >= read.offset_to || remaining == 0 {
                        consumer.close();
                        break 'grow;
                    }
                }
                Err(Error::Client(ClientError::NoData)) => {
                    not_enough_size = true;
                    break;
                }
                Err(err) if delivered == 0 => {
                    consumer.close();
                    return Err(err.into());
                }
                Err(err) => {
                    debug!(%err, "ending partial read after delegate error");
                    consumer.close();
                    truncated = true;
                    break 'grow;
                }
            }
        }
        consumer.close();

        if not_enough_size {
            if size >= conf.max_fetch_size {
                // No growth possible; report what was read so far.
                break 'grow;
            }
            size = size.saturating_add(conf.default_fetch_size);
        }
    }

    if max_seen > 0 {
        hints.put(&read.topic, max_seen);
    }
    Ok(ReadSummary {
        delivered,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::pool::PoolConfig;
    use crate::testing::MockCluster;

    fn consumer_section(default_fetch: i32, max_fetch: i32) -> ConsumerSection {
        ConsumerSection {
            request_timeout: Duration::from_millis(50),
            retry_limit: 2,
            retry_wait: Duration::from_millis(10),
            retry_err_limit: 2,
            retry_err_wait: Duration::from_millis(10),
            get_message_timeout: Duration::from_secs(1),
            min_fetch_size: 1,
            max_fetch_size: max_fetch,
            default_fetch_size: default_fetch,
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            num_conns: 2,
            get_metadata_timeout: Duration::from_secs(1),
            metadata_cache_period: Duration::ZERO,
            get_offsets_timeout: Duration::from_secs(1),
            reconnect_period: Duration::ZERO,
        }
    }

    fn range(offset: i64, limit: i32, offset_to: i64) -> RangeRead {
        RangeRead {
            topic: "events".to_owned(),
            partition: 0,
            offset,
            limit,
            offset_from: 0,
            offset_to,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn rejects_out_of_range_without_opening_a_consumer() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"one");
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        for offset in [-1, 1, 999] {
            let (tx, _rx) = mpsc::channel(4);
            let result = read_range(
                Arc::clone(&pool),
                &conf,
                &hints,
                range(offset, 1, 1),
                tx,
            )
            .await;
            assert_matches!(result, Err(ReadError::OutOfRange { .. }));
        }
        assert_eq!(cluster.consumer_opens(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn delivers_up_to_the_limit() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        for payload in [&b"a"[..], b"b", b"c"] {
            cluster.append("events", 0, payload);
        }
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        let (tx, rx) = mpsc::channel(8);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(0, 2, 3), tx)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 2);
        assert!(!summary.truncated);

        let messages = collect(rx).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].offset, 0);
        assert_eq!(messages[1].offset, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn stops_at_the_upper_offset_bound() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        for payload in [&b"a"[..], b"b", b"c"] {
            cluster.append("events", 0, payload);
        }
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        let (tx, rx) = mpsc::channel(8);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(1, 100, 3), tx)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 2);
        assert_eq!(collect(rx).await.len(), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn grows_the_budget_until_the_message_fits() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, &[b'x'; 100]);
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(10, 1000);

        let (tx, rx) = mpsc::channel(4);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(0, 1, 1), tx)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(collect(rx).await[0].value.len(), 100);
        // The loop needed several consumers to get there.
        assert!(cluster.consumer_opens() > 1);
        // And the hint converged on the observed payload size.
        assert_eq!(hints.get("events", 0), 100);
        pool.close().await;
    }

    #[tokio::test]
    async fn gives_up_when_the_message_exceeds_the_global_maximum() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, &[b'x'; 2000]);
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(100, 1000);

        let (tx, rx) = mpsc::channel(4);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(0, 1, 1), tx)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 0);
        assert!(collect(rx).await.is_empty());
        // Growth is bounded, so the loop terminated instead of spinning.
        assert!(cluster.consumer_opens() <= 11);
        assert_eq!(hints.get("events", 7), 7);
        pool.close().await;
    }

    #[tokio::test]
    async fn surfaces_errors_before_the_first_message() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"one");
        cluster.set_consume_error_at("events", 0, ClientError::Protocol("boom".to_owned()));
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        let (tx, _rx) = mpsc::channel(4);
        let result = read_range(Arc::clone(&pool), &conf, &hints, range(0, 1, 1), tx).await;
        assert_matches!(
            result,
            Err(ReadError::Gateway(Error::Client(ClientError::Protocol(_))))
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn truncates_quietly_after_the_first_message() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"one");
        cluster.append("events", 0, b"two");
        cluster.append("events", 0, b"three");
        cluster.set_consume_error_at("events", 1, ClientError::Protocol("boom".to_owned()));
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        let (tx, rx) = mpsc::channel(8);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(0, 3, 3), tx)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 1);
        assert!(summary.truncated);
        assert_eq!(collect(rx).await.len(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn stops_when_the_receiver_goes_away() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        for _ in 0..10 {
            cluster.append("events", 0, b"payload");
        }
        let pool = Pool::connect(cluster.connector(), pool_config())
            .await
            .unwrap();
        let hints = MessageSizeHints::new();
        let conf = consumer_section(512, 4096);

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let summary = read_range(Arc::clone(&pool), &conf, &hints, range(0, 10, 10), tx)
            .await
            .unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.delivered, 0);
        pool.close().await;
    }
}
