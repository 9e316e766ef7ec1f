//! Fixed-size pool of broker sessions.
//!
//! The pool owns `num_conns` long-lived connections, identified by stable
//! ids. Every HTTP request borrows one id for the duration of a single
//! broker operation; corrupted sessions are quarantined and redialed on a
//! background task while their id stays out of circulation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::client::{BrokerSession, ClientError, Connector};
use crate::error::{AppError, Error, Result};
use crate::metadata::Metadata;
use crate::metrics::{self, OpTimer};
use crate::session::{run_with_deadline, Deadline};

/// Pool timing knobs. A zero period disables the matching background task;
/// a zero timeout disables the matching deadline.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_conns: usize,
    pub get_metadata_timeout: Duration,
    pub metadata_cache_period: Duration,
    pub get_offsets_timeout: Duration,
    /// Recycle one pooled connection per period to bound session lifetime.
    pub reconnect_period: Duration,
}

struct MetadataCache {
    snapshot: Option<Arc<Metadata>>,
    updated_at_nanos: i64,
}

pub struct Pool {
    conf: PoolConfig,
    connector: Arc<dyn Connector>,

    /// All sessions by id. Reconnects swap entries in place; ids never change.
    sessions: RwLock<HashMap<i64, Arc<dyn BrokerSession>>>,

    free_tx: mpsc::Sender<i64>,
    free_rx: Mutex<mpsc::Receiver<i64>>,
    dead_tx: mpsc::Sender<i64>,

    shutdown: broadcast::Sender<()>,

    cache: RwLock<MetadataCache>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Dial `num_conns` sessions and start the background maintenance tasks.
    /// Any dial failure tears the whole pool down and fails startup.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        conf: PoolConfig,
    ) -> Result<Arc<Self>, ClientError> {
        let (free_tx, free_rx) = mpsc::channel(conf.num_conns.max(1));
        let (dead_tx, dead_rx) = mpsc::channel(conf.num_conns.max(1));
        let (shutdown, _) = broadcast::channel(1);

        let pool = Arc::new(Self {
            conf,
            connector,
            sessions: RwLock::new(HashMap::new()),
            free_tx,
            free_rx: Mutex::new(free_rx),
            dead_tx,
            shutdown,
            cache: RwLock::new(MetadataCache {
                snapshot: None,
                updated_at_nanos: 0,
            }),
        });

        for id in 0..pool.conf.num_conns as i64 {
            match pool.connector.connect().await {
                Ok(session) => {
                    pool.sessions.write().insert(id, session);
                    pool.release(id);
                }
                Err(err) => {
                    error!(broker = id, %err, "dial failed, tearing the pool down");
                    pool.close().await;
                    return Err(err);
                }
            }
        }
        info!(size = pool.conf.num_conns, "broker pool ready");

        pool.spawn_reconnector(dead_rx);
        if !pool.conf.metadata_cache_period.is_zero() {
            pool.spawn_metadata_refresher();
        }
        if !pool.conf.reconnect_period.is_zero() {
            pool.spawn_rolling_reconnect();
        }

        Ok(pool)
    }

    /// Non-blocking borrow of one free session id.
    ///
    /// With nothing free the caller is shed immediately; requests must not
    /// queue up behind the pool.
    pub fn borrow(&self) -> Result<i64, AppError> {
        match self.free_rx.lock().try_recv() {
            Ok(id) => {
                metrics::free_brokers().decrement(1.0);
                Ok(id)
            }
            Err(_) => Err(AppError::NoBrokers),
        }
    }

    /// Return a borrowed id to the free set.
    pub fn release(&self, id: i64) {
        metrics::free_brokers().increment(1.0);
        if self.free_tx.try_send(id).is_err() {
            // Capacity equals the id count, so this means double release.
            error!(broker = id, "free queue rejected an id");
        }
    }

    /// Hand a broken id to the reconnect task. The caller relinquishes it.
    pub fn quarantine(&self, id: i64) {
        metrics::dead_brokers().increment(1.0);
        if self.dead_tx.try_send(id).is_err() {
            error!(broker = id, "dead queue rejected an id");
        }
    }

    pub(crate) fn session(&self, id: i64) -> Arc<dyn BrokerSession> {
        Arc::clone(
            self.sessions
                .read()
                .get(&id)
                .expect("pool ids are stable for the process lifetime"),
        )
    }

    /// Fetch a fresh metadata snapshot through a pooled session.
    pub async fn get_metadata(self: &Arc<Self>) -> Result<Arc<Metadata>> {
        let id = self.borrow()?;
        let _timer = OpTimer::start(metrics::GET_METADATA);

        let session = self.session(id);
        let outcome =
            run_with_deadline(self.conf.get_metadata_timeout, async move {
                session.metadata().await
            })
            .await;

        match outcome {
            Deadline::Completed(Ok(meta)) => {
                self.release(id);
                Ok(Arc::new(meta))
            }
            Deadline::Completed(Err(err)) => {
                self.release(id);
                Err(err.into())
            }
            Deadline::Elapsed => {
                self.quarantine(id);
                Err(AppError::MetadataReadTimeout.into())
            }
        }
    }

    /// Cached snapshot when it is younger than the refresh period, otherwise
    /// a live fetch. Only the scheduled refresher writes the cache back, so
    /// handler reads may be up to one period stale.
    pub async fn fetch_metadata(self: &Arc<Self>) -> Result<Arc<Metadata>> {
        if !self.conf.metadata_cache_period.is_zero() {
            if let Some(snapshot) = self.cached_snapshot() {
                return Ok(snapshot);
            }
        }
        self.get_metadata().await
    }

    fn cached_snapshot(&self) -> Option<Arc<Metadata>> {
        let cache = self.cache.read();
        let snapshot = cache.snapshot.as_ref()?;
        // Absolute age tolerates wall-clock skew.
        let age = (now_nanos() - cache.updated_at_nanos).unsigned_abs() as u128;
        if age < self.conf.metadata_cache_period.as_nanos() {
            Some(Arc::clone(snapshot))
        } else {
            None
        }
    }

    fn store_snapshot(&self, snapshot: Arc<Metadata>) {
        let mut cache = self.cache.write();
        cache.snapshot = Some(snapshot);
        cache.updated_at_nanos = now_nanos();
    }

    /// Earliest and latest offsets for a partition, fetched back-to-back on
    /// one borrowed session under a shared deadline.
    pub async fn get_offsets(self: &Arc<Self>, topic: &str, partition: i32) -> Result<(i64, i64)> {
        let id = self.borrow()?;
        let _timer = OpTimer::start(metrics::GET_OFFSETS);

        let session = self.session(id);
        let topic = topic.to_owned();
        let outcome = run_with_deadline(self.conf.get_offsets_timeout, async move {
            let earliest = offset_with_retry(&session, &topic, partition, Bound::Earliest).await?;
            let latest = offset_with_retry(&session, &topic, partition, Bound::Latest).await?;
            Ok::<_, ClientError>((earliest, latest))
        })
        .await;

        match outcome {
            Deadline::Completed(Ok(range)) => {
                self.release(id);
                Ok(range)
            }
            Deadline::Completed(Err(err)) => {
                self.release(id);
                Err(err.into())
            }
            Deadline::Elapsed => {
                self.quarantine(id);
                Err(AppError::ReadTimeout.into())
            }
        }
    }

    /// Stop the background tasks and tear down every connection. In-flight
    /// borrows are not tracked; they fail on their next broker call.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }

    fn spawn_reconnector(self: &Arc<Self>, mut dead_rx: mpsc::Receiver<i64>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    maybe = dead_rx.recv() => match maybe {
                        Some(id) => id,
                        None => return,
                    },
                    _ = shutdown.recv() => return,
                };
                metrics::dead_brokers().decrement(1.0);

                // Each id reconnects on its own task so a slow redial does
                // not hold up other quarantined ids.
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.reconnect(id).await });
            }
        });
    }

    /// Replace the session behind `id` with a freshly dialed connection,
    /// retrying until it succeeds. The id re-enters the free set afterwards.
    async fn reconnect(self: Arc<Self>, id: i64) {
        self.session(id).close().await;

        let mut backoff = Backoff::new(&BackoffConfig::default());
        let mut shutdown = self.shutdown.subscribe();
        loop {
            match self.connector.connect().await {
                Ok(session) => {
                    self.sessions.write().insert(id, session);
                    self.release(id);
                    info!(broker = id, "connection was reset");
                    return;
                }
                Err(err) => {
                    let wait = backoff.next();
                    warn!(broker = id, %err, wait_ms = wait.as_millis() as u64, "unable to reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.recv() => return,
                    }
                }
            }
        }
    }

    fn spawn_metadata_refresher(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.conf.metadata_cache_period) => {}
                    _ = shutdown.recv() => return,
                }
                match pool.get_metadata().await {
                    Ok(snapshot) => {
                        pool.store_snapshot(snapshot);
                        debug!("metadata refreshed on schedule");
                    }
                    Err(err) => warn!(%err, "scheduled metadata refresh failed"),
                }
            }
        });
    }

    fn spawn_rolling_reconnect(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.conf.reconnect_period) => {}
                    _ = shutdown.recv() => return,
                }
                if let Ok(id) = pool.borrow() {
                    debug!(broker = id, "recycling pooled connection");
                    pool.quarantine(id);
                }
            }
        });
    }
}

enum Bound {
    Earliest,
    Latest,
}

const OFFSET_ATTEMPTS: u32 = 2;

async fn offset_with_retry(
    session: &Arc<dyn BrokerSession>,
    topic: &str,
    partition: i32,
    bound: Bound,
) -> Result<i64, ClientError> {
    let mut attempt = 0;
    loop {
        let result = match bound {
            Bound::Earliest => session.offset_earliest(topic, partition).await,
            Bound::Latest => session.offset_latest(topic, partition).await,
        };
        match result {
            Ok(offset) => return Ok(offset),
            Err(err) if err.is_retriable() && attempt + 1 < OFFSET_ATTEMPTS => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::testing::MockCluster;

    fn config(num_conns: usize) -> PoolConfig {
        PoolConfig {
            num_conns,
            get_metadata_timeout: Duration::from_secs(1),
            metadata_cache_period: Duration::ZERO,
            get_offsets_timeout: Duration::from_secs(1),
            reconnect_period: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn borrow_is_nonblocking_and_sheds_load() {
        let cluster = MockCluster::new();
        let pool = Pool::connect(cluster.connector(), config(2)).await.unwrap();

        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        assert_ne!(a, b);
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));

        pool.release(a);
        assert_eq!(pool.borrow().unwrap(), a);
        pool.close().await;
    }

    #[tokio::test]
    async fn startup_fails_when_a_dial_fails() {
        let cluster = MockCluster::new();
        cluster.fail_dials(1);
        let result = Pool::connect(cluster.connector(), config(3)).await;
        assert_matches!(result, Err(ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn quarantined_id_returns_after_reconnect() {
        let cluster = MockCluster::new();
        let pool = Pool::connect(cluster.connector(), config(1)).await.unwrap();

        let id = pool.borrow().unwrap();
        pool.quarantine(id);
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));

        // The background task redials and releases the id again.
        let mut reborrowed = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Ok(id) = pool.borrow() {
                reborrowed = Some(id);
                break;
            }
        }
        assert_eq!(reborrowed, Some(id));
        assert!(cluster.dial_calls() > 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn quarantined_id_stays_out_while_redial_fails() {
        let cluster = MockCluster::new();
        let pool = Pool::connect(cluster.connector(), config(1)).await.unwrap();

        cluster.fail_dials(u32::MAX);
        let id = pool.borrow().unwrap();
        pool.quarantine(id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));
        pool.close().await;
    }

    #[tokio::test]
    async fn get_offsets_reports_the_partition_range() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);
        cluster.append("events", 0, b"one");
        cluster.append("events", 0, b"two");

        let pool = Pool::connect(cluster.connector(), config(1)).await.unwrap();
        assert_eq!(pool.get_offsets("events", 0).await.unwrap(), (0, 2));
        // The session went back to the free set.
        assert!(pool.borrow().is_ok());
        pool.close().await;
    }

    #[tokio::test]
    async fn metadata_timeout_quarantines_the_session() {
        let cluster = MockCluster::new();
        cluster.set_metadata_delay(Duration::from_millis(200));

        let mut conf = config(1);
        conf.get_metadata_timeout = Duration::from_millis(20);
        let pool = Pool::connect(cluster.connector(), conf).await.unwrap();
        // Keep the id dead afterwards so the quarantine is observable.
        cluster.fail_dials(u32::MAX);

        let err = pool.get_metadata().await.unwrap_err();
        assert_matches!(err, Error::App(AppError::MetadataReadTimeout));
        assert_matches!(pool.borrow(), Err(AppError::NoBrokers));
        pool.close().await;
    }

    #[tokio::test]
    async fn fetch_metadata_serves_cached_snapshots_within_ttl() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 1);

        let mut conf = config(1);
        conf.metadata_cache_period = Duration::from_secs(60);
        let pool = Pool::connect(cluster.connector(), conf).await.unwrap();

        // Seed the cache the way the background refresher would.
        let snapshot = pool.get_metadata().await.unwrap();
        pool.store_snapshot(snapshot);
        let calls = cluster.metadata_calls();

        for _ in 0..3 {
            pool.fetch_metadata().await.unwrap();
        }
        assert_eq!(cluster.metadata_calls(), calls);
        pool.close().await;
    }

    #[tokio::test]
    async fn fetch_metadata_goes_live_after_ttl() {
        let cluster = MockCluster::new();

        let mut conf = config(1);
        conf.metadata_cache_period = Duration::from_secs(10);
        let pool = Pool::connect(cluster.connector(), conf).await.unwrap();

        // Seed the cache with a snapshot that is already past the TTL.
        let snapshot = pool.get_metadata().await.unwrap();
        {
            let mut cache = pool.cache.write();
            cache.snapshot = Some(snapshot);
            cache.updated_at_nanos = now_nanos() - Duration::from_secs(20).as_nanos() as i64;
        }
        let calls = cluster.metadata_calls();

        pool.fetch_metadata().await.unwrap();
        assert_eq!(cluster.metadata_calls(), calls + 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn scheduled_refresher_populates_the_cache() {
        let cluster = MockCluster::new();
        cluster.create_topic("events", 2);

        let mut conf = config(1);
        conf.metadata_cache_period = Duration::from_millis(20);
        let pool = Pool::connect(cluster.connector(), conf).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cluster.metadata_calls() >= 1);

        let cache = pool.cache.read();
        let snapshot = cache.snapshot.as_ref().expect("refresher stored a snapshot");
        assert_eq!(snapshot.topics().unwrap(), vec!["events"]);
        assert!(cache.updated_at_nanos > 0);
        drop(cache);
        pool.close().await;
    }

    #[tokio::test]
    async fn rolling_reconnect_recycles_connections() {
        let cluster = MockCluster::new();

        let mut conf = config(2);
        conf.reconnect_period = Duration::from_millis(15);
        let pool = Pool::connect(cluster.connector(), conf).await.unwrap();
        let dials = cluster.dial_calls();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cluster.dial_calls() > dials);

        // Recycling keeps the pool at full strength.
        let a = pool.borrow();
        let b = pool.borrow();
        assert!(a.is_ok() || b.is_ok());
        pool.close().await;
    }
}
