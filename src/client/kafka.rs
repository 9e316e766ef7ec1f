//! Production backend over the `kafka` crate (kafka-rust).
//!
//! Each pooled session owns one synchronous [`KafkaClient`] guarded by a
//! mutex and driven through `spawn_blocking`; operations on a session are
//! therefore strictly sequential, which is exactly the contract the pool
//! relies on. The gateway core only ever sees the trait objects from
//! [`crate::client`].
//!
//! Two port features degrade on this backend: the metadata API of
//! kafka-rust does not expose ISR sets or per-topic error codes, so
//! snapshots carry empty replica lists and no markers, and committed
//! offsets come back without their metadata string.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use kafka::client::{
    FetchGroupOffset, FetchOffset, FetchPartition, GroupOffsetStorage, KafkaClient,
    ProduceMessage, RequiredAcks,
};
use kafka::error::{Error as KafkaError, KafkaCode};
use tokio::task;
use tracing::debug;

use super::{
    BrokerSession, ClientError, Connector, ConsumerConfig, ConsumerSession, DialConfig,
    OffsetCoordinatorConfig, OffsetCoordinatorSession, ProducerConfig, ProducerSession,
};
use crate::metadata::{Metadata, MetadataPartition, MetadataTopic};
use crate::record::Message;

const CLIENT_ID: &str = "kafka-http-gateway";

fn map_code(code: KafkaCode) -> ClientError {
    match code {
        KafkaCode::LeaderNotAvailable => ClientError::LeaderNotAvailable,
        KafkaCode::ReplicaNotAvailable => ClientError::ReplicaNotAvailable,
        KafkaCode::UnknownTopicOrPartition => ClientError::UnknownTopicOrPartition,
        other => ClientError::Protocol(format!("{other:?}")),
    }
}

fn map_err(err: &KafkaError) -> ClientError {
    match err {
        KafkaError::Kafka(code) => map_code(code.clone()),
        KafkaError::Io(io) => ClientError::Transport(io.to_string()),
        other => ClientError::Transport(other.to_string()),
    }
}

fn join_err(err: task::JoinError) -> ClientError {
    ClientError::Transport(err.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dials [`KafkaSession`]s for the pool.
pub struct KafkaConnector {
    conf: DialConfig,
}

impl KafkaConnector {
    pub fn new(conf: DialConfig) -> Self {
        Self { conf }
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, ClientError> {
        let conf = self.conf.clone();
        let dial = task::spawn_blocking(move || -> Result<KafkaClient, ClientError> {
            let mut client = KafkaClient::new(conf.brokers.clone());
            client.set_client_id(CLIENT_ID.to_owned());
            client.set_group_offset_storage(Some(GroupOffsetStorage::Kafka));
            // The initial metadata load is what actually opens a connection.
            client.load_metadata_all().map_err(|err| map_err(&err))?;
            Ok(client)
        });

        let client = if self.conf.dial_timeout.is_zero() {
            dial.await.map_err(join_err)??
        } else {
            tokio::time::timeout(self.conf.dial_timeout, dial)
                .await
                .map_err(|_| ClientError::Transport("dial timeout".to_owned()))?
                .map_err(join_err)??
        };

        debug!(brokers = ?self.conf.brokers, "established new broker session");
        Ok(Arc::new(KafkaSession {
            client: Arc::new(Mutex::new(client)),
            conf: self.conf.clone(),
        }))
    }
}

/// One pooled connection, multiplexing every per-request sub-session that
/// the pool opens on it.
pub struct KafkaSession {
    client: Arc<Mutex<KafkaClient>>,
    conf: DialConfig,
}

impl KafkaSession {
    async fn blocking<T, F>(&self, op: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut KafkaClient) -> Result<T, ClientError> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        task::spawn_blocking(move || {
            let mut client = lock(&client);
            op(&mut client)
        })
        .await
        .map_err(join_err)?
    }
}

#[async_trait]
impl BrokerSession for KafkaSession {
    async fn metadata(&self) -> Result<Metadata, ClientError> {
        self.blocking(|client| {
            client.load_metadata_all().map_err(|err| map_err(&err))?;

            let mut topics = Vec::new();
            for topic in client.topics().iter() {
                let mut partitions = Vec::new();
                for partition in topic.partitions().iter() {
                    partitions.push(MetadataPartition {
                        id: partition.id(),
                        leader: partition.leader().map(|broker| broker.id()).unwrap_or(-1),
                        isr: Vec::new(),
                        error: None,
                    });
                }
                topics.push(MetadataTopic {
                    name: topic.name().to_owned(),
                    error: None,
                    partitions,
                });
            }
            Ok(Metadata { topics })
        })
        .await
    }

    async fn offset_earliest(&self, topic: &str, partition: i32) -> Result<i64, ClientError> {
        let topic = topic.to_owned();
        self.blocking(move |client| partition_offset(client, &topic, partition, FetchOffset::Earliest))
            .await
    }

    async fn offset_latest(&self, topic: &str, partition: i32) -> Result<i64, ClientError> {
        let topic = topic.to_owned();
        self.blocking(move |client| partition_offset(client, &topic, partition, FetchOffset::Latest))
            .await
    }

    async fn consumer(&self, conf: ConsumerConfig) -> Result<Arc<dyn ConsumerSession>, ClientError> {
        Ok(Arc::new(KafkaConsumerSession {
            client: Arc::clone(&self.client),
            cursor: AtomicI64::new(conf.start_offset),
            buffer: Mutex::new(VecDeque::new()),
            conf,
        }))
    }

    async fn producer(&self, conf: ProducerConfig) -> Result<Arc<dyn ProducerSession>, ClientError> {
        Ok(Arc::new(KafkaProducerSession {
            client: Arc::clone(&self.client),
            conf,
            allow_topic_creation: self.conf.allow_topic_creation,
            leader_retry_wait: self.conf.leader_retry_wait,
        }))
    }

    async fn offset_coordinator(
        &self,
        conf: OffsetCoordinatorConfig,
    ) -> Result<Arc<dyn OffsetCoordinatorSession>, ClientError> {
        Ok(Arc::new(KafkaCoordinatorSession {
            client: Arc::clone(&self.client),
            conf,
        }))
    }

    async fn close(&self) {
        // kafka-rust tears connections down when the client drops; the pool
        // drops its handle right after calling this.
    }
}

fn partition_offset(
    client: &mut KafkaClient,
    topic: &str,
    partition: i32,
    bound: FetchOffset,
) -> Result<i64, ClientError> {
    let offsets = client
        .fetch_topic_offsets(topic, bound)
        .map_err(|err| map_err(&err))?;
    offsets
        .into_iter()
        .find(|po| po.partition == partition)
        .map(|po| po.offset)
        .ok_or(ClientError::UnknownTopicOrPartition)
}

struct KafkaConsumerSession {
    client: Arc<Mutex<KafkaClient>>,
    conf: ConsumerConfig,
    cursor: AtomicI64,
    buffer: Mutex<VecDeque<Message>>,
}

#[async_trait]
impl ConsumerSession for KafkaConsumerSession {
    async fn consume(&self) -> Result<Message, ClientError> {
        if let Some(msg) = lock(&self.buffer).pop_front() {
            return Ok(msg);
        }

        let client = Arc::clone(&self.client);
        let conf = self.conf.clone();
        let offset = self.cursor.load(Ordering::SeqCst);
        let batch = task::spawn_blocking(move || fetch_batch(&client, &conf, offset))
            .await
            .map_err(join_err)??;

        if batch.is_empty() {
            // Nothing fit inside the budget; the read loop will grow it.
            return Err(ClientError::NoData);
        }

        let mut buffer = lock(&self.buffer);
        self.cursor.store(
            batch.last().map(|msg| msg.offset + 1).unwrap_or(offset),
            Ordering::SeqCst,
        );
        buffer.extend(batch);
        buffer
            .pop_front()
            .ok_or_else(|| ClientError::Protocol("fetch produced an empty batch".to_owned()))
    }
}

fn fetch_batch(
    client: &Arc<Mutex<KafkaClient>>,
    conf: &ConsumerConfig,
    offset: i64,
) -> Result<Vec<Message>, ClientError> {
    let mut attempt = 0;
    loop {
        let result = {
            let mut client = lock(client);
            let _ = client.set_fetch_min_bytes(conf.min_fetch_size);
            let _ = client.set_fetch_max_wait_time(conf.request_timeout);
            let request = FetchPartition::new(&conf.topic, conf.partition, offset)
                .with_max_bytes(conf.max_fetch_size);
            client.fetch_messages_for_partition(&request)
        };

        match result {
            Ok(responses) => {
                let mut batch = Vec::new();
                for response in &responses {
                    for topic in response.topics() {
                        for partition in topic.partitions() {
                            match partition.data() {
                                Ok(data) => {
                                    for msg in data.messages() {
                                        batch.push(Message {
                                            offset: msg.offset,
                                            key: if msg.key.is_empty() {
                                                None
                                            } else {
                                                Some(Bytes::copy_from_slice(msg.key))
                                            },
                                            value: Bytes::copy_from_slice(msg.value),
                                        });
                                    }
                                }
                                Err(err) => return Err(map_err(&err)),
                            }
                        }
                    }
                }
                return Ok(batch);
            }
            Err(err) => {
                let mapped = map_err(&err);
                if mapped.is_retriable() && attempt < conf.retry_err_limit {
                    attempt += 1;
                    std::thread::sleep(conf.retry_err_wait);
                    continue;
                }
                return Err(mapped);
            }
        }
    }
}

struct KafkaProducerSession {
    client: Arc<Mutex<KafkaClient>>,
    conf: ProducerConfig,
    allow_topic_creation: bool,
    leader_retry_wait: std::time::Duration,
}

#[async_trait]
impl ProducerSession for KafkaProducerSession {
    async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Bytes,
    ) -> Result<i64, ClientError> {
        let client = Arc::clone(&self.client);
        let conf = self.conf.clone();
        let allow_topic_creation = self.allow_topic_creation;
        let leader_retry_wait = self.leader_retry_wait;
        let topic = topic.to_owned();

        task::spawn_blocking(move || {
            let mut attempt = 0;
            let mut reloaded = false;
            loop {
                let result = {
                    let mut locked = lock(&client);
                    let message =
                        ProduceMessage::new(&topic, partition, None, Some(payload.as_ref()));
                    locked.produce_messages(RequiredAcks::All, conf.request_timeout, vec![message])
                };

                match result {
                    Ok(confirms) => return confirmed_offset(confirms, &topic, partition),
                    Err(err) => {
                        let mapped = map_err(&err);
                        // A produce against a topic the cluster has not seen
                        // yet triggers auto-creation on the metadata reload.
                        if matches!(mapped, ClientError::UnknownTopicOrPartition)
                            && allow_topic_creation
                            && !reloaded
                        {
                            reloaded = true;
                            let mut locked = lock(&client);
                            let _ = locked.load_metadata(&[topic.as_str()]);
                            drop(locked);
                            std::thread::sleep(leader_retry_wait);
                            continue;
                        }
                        if mapped.is_retriable() && attempt < conf.retry_limit {
                            attempt += 1;
                            std::thread::sleep(conf.retry_wait);
                            continue;
                        }
                        return Err(mapped);
                    }
                }
            }
        })
        .await
        .map_err(join_err)?
    }
}

fn confirmed_offset(
    confirms: Vec<kafka::client::ProduceConfirm>,
    topic: &str,
    partition: i32,
) -> Result<i64, ClientError> {
    for confirm in confirms {
        if confirm.topic != topic {
            continue;
        }
        for pc in confirm.partition_confirms {
            if pc.partition != partition {
                continue;
            }
            return pc.offset.map_err(map_code);
        }
    }
    Err(ClientError::Protocol(
        "produce response carried no confirmation for the partition".to_owned(),
    ))
}

struct KafkaCoordinatorSession {
    client: Arc<Mutex<KafkaClient>>,
    conf: OffsetCoordinatorConfig,
}

#[async_trait]
impl OffsetCoordinatorSession for KafkaCoordinatorSession {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ClientError> {
        let client = Arc::clone(&self.client);
        let conf = self.conf.clone();
        let topic = topic.to_owned();
        task::spawn_blocking(move || {
            with_err_retry(&conf, || {
                lock(&client)
                    .commit_offset(&conf.group, &topic, partition, offset)
                    .map_err(|err| map_err(&err))
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn fetch(&self, topic: &str, partition: i32) -> Result<(i64, String), ClientError> {
        let client = Arc::clone(&self.client);
        let conf = self.conf.clone();
        let topic = topic.to_owned();
        task::spawn_blocking(move || {
            with_err_retry(&conf, || {
                let offsets = lock(&client)
                    .fetch_group_offsets(&conf.group, &[FetchGroupOffset::new(&topic, partition)])
                    .map_err(|err| map_err(&err))?;
                let offset = offsets
                    .get(topic.as_str())
                    .and_then(|partitions| partitions.iter().find(|po| po.partition == partition))
                    .map(|po| po.offset)
                    .unwrap_or(-1);
                // kafka-rust does not expose the committed metadata string.
                Ok((offset, String::new()))
            })
        })
        .await
        .map_err(join_err)?
    }
}

fn with_err_retry<T>(
    conf: &OffsetCoordinatorConfig,
    mut op: impl FnMut() -> Result<T, ClientError>,
) -> Result<T, ClientError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < conf.retry_err_limit => {
                attempt += 1;
                std::thread::sleep(conf.retry_err_wait);
            }
            Err(err) => return Err(err),
        }
    }
}
