//! In-process broker fakes for tests.
//!
//! [`MockCluster`] stands in for a whole cluster: every session dialed from
//! it shares the same topic logs and group offsets, the way pooled
//! connections share one real cluster. Tests script failures and delays to
//! drive the timeout, quarantine and reconnect paths deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::{
    BrokerSession, ClientError, Connector, ConsumerConfig, ConsumerSession,
    OffsetCoordinatorConfig, OffsetCoordinatorSession, ProducerConfig, ProducerSession,
};
use crate::metadata::{Metadata, MetadataPartition, MetadataTopic};
use crate::record::Message;

#[derive(Debug, Default, Clone)]
struct PartitionState {
    messages: Vec<Bytes>,
    leader: i32,
    isr: Vec<i32>,
    error: Option<ClientError>,
}

#[derive(Default)]
struct MockState {
    topics: Mutex<HashMap<String, Vec<PartitionState>>>,
    topic_errors: Mutex<HashMap<String, ClientError>>,
    group_offsets: Mutex<HashMap<(String, String, i32), (i64, String)>>,
    consume_errors: Mutex<HashMap<(String, i64), ClientError>>,

    dial_failures: Mutex<u32>,
    metadata_delay: Mutex<Duration>,
    consume_delay: Mutex<Duration>,
    produce_delay: Mutex<Duration>,

    dial_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
    consumer_opens: AtomicUsize,
}

/// Scriptable in-memory stand-in for a broker cluster.
#[derive(Default)]
pub struct MockCluster {
    state: Arc<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose sessions all talk to this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn create_topic(&self, name: &str, partitions: usize) {
        let partition = PartitionState {
            messages: Vec::new(),
            leader: 0,
            isr: vec![0],
            error: None,
        };
        self.state
            .topics
            .lock()
            .insert(name.to_owned(), vec![partition; partitions.max(1)]);
    }

    /// Append a payload and return its offset.
    pub fn append(&self, topic: &str, partition: i32, payload: &[u8]) -> i64 {
        let mut topics = self.state.topics.lock();
        let log = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .expect("append to a topic the test created");
        log.messages.push(Bytes::copy_from_slice(payload));
        log.messages.len() as i64 - 1
    }

    /// Make the next `n` dials fail with a transport error.
    pub fn fail_dials(&self, n: u32) {
        *self.state.dial_failures.lock() = n;
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        *self.state.metadata_delay.lock() = delay;
    }

    pub fn set_consume_delay(&self, delay: Duration) {
        *self.state.consume_delay.lock() = delay;
    }

    pub fn set_produce_delay(&self, delay: Duration) {
        *self.state.produce_delay.lock() = delay;
    }

    /// Fail every consume that reaches `offset` on `topic`.
    pub fn set_consume_error_at(&self, topic: &str, offset: i64, error: ClientError) {
        self.state
            .consume_errors
            .lock()
            .insert((topic.to_owned(), offset), error);
    }

    /// Attach an error marker to a whole topic in metadata responses.
    pub fn set_topic_error(&self, topic: &str, error: ClientError) {
        self.state
            .topic_errors
            .lock()
            .insert(topic.to_owned(), error);
    }

    /// Attach an error marker to one partition in metadata responses.
    pub fn set_partition_error(&self, topic: &str, partition: i32, error: ClientError) {
        let mut topics = self.state.topics.lock();
        if let Some(state) = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
        {
            state.error = Some(error);
        }
    }

    pub fn set_partition_details(&self, topic: &str, partition: i32, leader: i32, isr: Vec<i32>) {
        let mut topics = self.state.topics.lock();
        if let Some(state) = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
        {
            state.leader = leader;
            state.isr = isr;
        }
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<(i64, String)> {
        self.state
            .group_offsets
            .lock()
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .cloned()
    }

    pub fn dial_calls(&self) -> usize {
        self.state.dial_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.state.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn consumer_opens(&self) -> usize {
        self.state.consumer_opens.load(Ordering::SeqCst)
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

struct MockConnector {
    state: Arc<MockState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, ClientError> {
        self.state.dial_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.state.dial_failures.lock();
            if *failures > 0 {
                *failures = failures.saturating_sub(1);
                return Err(ClientError::Transport("mock dial refused".to_owned()));
            }
        }
        Ok(Arc::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

impl MockSession {
    fn partition_len(&self, topic: &str, partition: i32) -> Result<i64, ClientError> {
        let topics = self.state.topics.lock();
        topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|state| state.messages.len() as i64)
            .ok_or(ClientError::UnknownTopicOrPartition)
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn metadata(&self) -> Result<Metadata, ClientError> {
        let delay = *self.state.metadata_delay.lock();
        pause(delay).await;
        self.state.metadata_calls.fetch_add(1, Ordering::SeqCst);

        let topics = self.state.topics.lock();
        let topic_errors = self.state.topic_errors.lock();
        let mut names: Vec<_> = topics.keys().cloned().collect();
        names.sort();

        let topics = names
            .into_iter()
            .map(|name| MetadataTopic {
                partitions: topics[&name]
                    .iter()
                    .enumerate()
                    .map(|(id, state)| MetadataPartition {
                        id: id as i32,
                        leader: state.leader,
                        isr: state.isr.clone(),
                        error: state.error.clone(),
                    })
                    .collect(),
                error: topic_errors.get(&name).cloned(),
                name,
            })
            .collect();
        Ok(Metadata { topics })
    }

    async fn offset_earliest(&self, topic: &str, partition: i32) -> Result<i64, ClientError> {
        self.partition_len(topic, partition).map(|_| 0)
    }

    async fn offset_latest(&self, topic: &str, partition: i32) -> Result<i64, ClientError> {
        self.partition_len(topic, partition)
    }

    async fn consumer(&self, conf: ConsumerConfig) -> Result<Arc<dyn ConsumerSession>, ClientError> {
        self.state.consumer_opens.fetch_add(1, Ordering::SeqCst);
        self.partition_len(&conf.topic, conf.partition)?;
        Ok(Arc::new(MockConsumer {
            state: Arc::clone(&self.state),
            topic: conf.topic,
            partition: conf.partition,
            cursor: AtomicI64::new(conf.start_offset),
            budget: conf.max_fetch_size,
        }))
    }

    async fn producer(&self, _conf: ProducerConfig) -> Result<Arc<dyn ProducerSession>, ClientError> {
        Ok(Arc::new(MockProducer {
            state: Arc::clone(&self.state),
        }))
    }

    async fn offset_coordinator(
        &self,
        conf: OffsetCoordinatorConfig,
    ) -> Result<Arc<dyn OffsetCoordinatorSession>, ClientError> {
        Ok(Arc::new(MockCoordinator {
            state: Arc::clone(&self.state),
            group: conf.group,
        }))
    }

    async fn close(&self) {}
}

struct MockConsumer {
    state: Arc<MockState>,
    topic: String,
    partition: i32,
    cursor: AtomicI64,
    budget: i32,
}

#[async_trait]
impl ConsumerSession for MockConsumer {
    async fn consume(&self) -> Result<Message, ClientError> {
        let delay = *self.state.consume_delay.lock();
        pause(delay).await;

        let offset = self.cursor.load(Ordering::SeqCst);
        if let Some(err) = self
            .state
            .consume_errors
            .lock()
            .get(&(self.topic.clone(), offset))
        {
            return Err(err.clone());
        }

        let topics = self.state.topics.lock();
        let log = topics
            .get(&self.topic)
            .and_then(|partitions| partitions.get(self.partition as usize))
            .ok_or(ClientError::UnknownTopicOrPartition)?;
        let Some(payload) = log.messages.get(offset as usize) else {
            return Err(ClientError::NoData);
        };
        if payload.len() as i32 > self.budget {
            return Err(ClientError::NoData);
        }

        self.cursor.store(offset + 1, Ordering::SeqCst);
        Ok(Message {
            offset,
            key: None,
            value: payload.clone(),
        })
    }
}

struct MockProducer {
    state: Arc<MockState>,
}

#[async_trait]
impl ProducerSession for MockProducer {
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Bytes,
    ) -> Result<i64, ClientError> {
        let delay = *self.state.produce_delay.lock();
        pause(delay).await;

        let mut topics = self.state.topics.lock();
        let log = topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .ok_or(ClientError::UnknownTopicOrPartition)?;
        log.messages.push(payload);
        Ok(log.messages.len() as i64 - 1)
    }
}

struct MockCoordinator {
    state: Arc<MockState>,
    group: String,
}

#[async_trait]
impl OffsetCoordinatorSession for MockCoordinator {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ClientError> {
        self.state.group_offsets.lock().insert(
            (self.group.clone(), topic.to_owned(), partition),
            (offset, String::new()),
        );
        Ok(())
    }

    async fn fetch(&self, topic: &str, partition: i32) -> Result<(i64, String), ClientError> {
        let offsets = self.state.group_offsets.lock();
        Ok(offsets
            .get(&(self.group.clone(), topic.to_owned(), partition))
            .cloned()
            .unwrap_or((-1, String::new())))
    }
}
