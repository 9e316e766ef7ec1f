//! Gateway configuration.
//!
//! One TOML file with a section per subsystem; every field has a default so
//! a missing file or an empty table still yields a runnable gateway.
//! Durations are written human-style (`"500ms"`, `"3s"`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::{ConsumerConfig, DialConfig, OffsetCoordinatorConfig, ProducerConfig};
use crate::pool::PoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub global: GlobalSection,
    pub kafka: KafkaSection,
    pub broker: BrokerSection,
    pub producer: ProducerSection,
    pub consumer: ConsumerSection,
    pub offset_coordinator: OffsetCoordinatorSection,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn dial_config(&self) -> DialConfig {
        DialConfig {
            brokers: self.kafka.brokers.clone(),
            dial_timeout: self.broker.dial_timeout,
            leader_retry_limit: self.broker.leader_retry_limit,
            leader_retry_wait: self.broker.leader_retry_wait,
            allow_topic_creation: self.broker.allow_topic_creation,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            num_conns: self.broker.num_conns,
            get_metadata_timeout: self.broker.get_metadata_timeout,
            metadata_cache_period: self.broker.metadata_cache_period,
            get_offsets_timeout: self.broker.get_offsets_timeout,
            reconnect_period: self.broker.reconnect_period,
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            request_timeout: self.producer.request_timeout,
            retry_limit: self.producer.retry_limit,
            retry_wait: self.producer.retry_wait,
        }
    }

    pub fn offset_coordinator_config(&self, group: &str) -> OffsetCoordinatorConfig {
        OffsetCoordinatorConfig {
            group: group.to_owned(),
            retry_err_limit: self.offset_coordinator.retry_err_limit,
            retry_err_wait: self.offset_coordinator.retry_err_wait,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalSection {
    /// HTTP listen address.
    pub address: SocketAddr,
    pub verbose: bool,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KafkaSection {
    /// Bootstrap broker addresses (`host:port`).
    pub brokers: Vec<String>,
}

impl Default for KafkaSection {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    /// Size of the connection pool.
    pub num_conns: usize,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    pub leader_retry_limit: u32,
    #[serde(with = "humantime_serde")]
    pub leader_retry_wait: Duration,
    /// How often to recycle one pooled connection. Zero disables recycling.
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,
    /// Metadata cache TTL and refresh period. Zero disables the cache.
    #[serde(with = "humantime_serde")]
    pub metadata_cache_period: Duration,
    #[serde(with = "humantime_serde")]
    pub get_metadata_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub get_offsets_timeout: Duration,
    pub allow_topic_creation: bool,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            num_conns: 100,
            dial_timeout: Duration::from_millis(500),
            leader_retry_limit: 2,
            leader_retry_wait: Duration::from_millis(500),
            reconnect_period: Duration::from_secs(15),
            metadata_cache_period: Duration::from_secs(3),
            get_metadata_timeout: Duration::from_secs(1),
            get_offsets_timeout: Duration::from_secs(10),
            allow_topic_creation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerSection {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub retry_limit: u32,
    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,
    /// Deadline for one produce call; exceeding it poisons the session.
    #[serde(with = "humantime_serde")]
    pub send_message_timeout: Duration,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            retry_limit: 2,
            retry_wait: Duration::from_millis(200),
            send_message_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSection {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub retry_limit: u32,
    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,
    pub retry_err_limit: u32,
    #[serde(with = "humantime_serde")]
    pub retry_err_wait: Duration,
    /// Deadline for one consume call; exceeding it poisons the session.
    #[serde(with = "humantime_serde")]
    pub get_message_timeout: Duration,
    pub min_fetch_size: i32,
    /// Global ceiling for any single fetch budget. Also bounds POST bodies.
    pub max_fetch_size: i32,
    /// Seed and growth step for the adaptive fetch budget.
    pub default_fetch_size: i32,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(50),
            retry_limit: 2,
            retry_wait: Duration::from_millis(50),
            retry_err_limit: 2,
            retry_err_wait: Duration::from_millis(50),
            get_message_timeout: Duration::from_secs(15),
            min_fetch_size: 1,
            max_fetch_size: 4 * 1024 * 1024,
            default_fetch_size: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OffsetCoordinatorSection {
    pub retry_err_limit: u32,
    #[serde(with = "humantime_serde")]
    pub retry_err_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub commit_offset_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub fetch_offset_timeout: Duration,
}

impl Default for OffsetCoordinatorSection {
    fn default() -> Self {
        Self {
            retry_err_limit: 2,
            retry_err_wait: Duration::from_millis(200),
            commit_offset_timeout: Duration::from_secs(15),
            fetch_offset_timeout: Duration::from_secs(15),
        }
    }
}

impl ConsumerSection {
    /// Per-request consumer session config at a given cursor and budget.
    pub fn session_config(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        max_fetch_size: i32,
    ) -> ConsumerConfig {
        ConsumerConfig {
            topic: topic.to_owned(),
            partition,
            start_offset,
            request_timeout: self.request_timeout,
            retry_limit: self.retry_limit,
            retry_wait: self.retry_wait,
            retry_err_limit: self.retry_err_limit,
            retry_err_wait: self.retry_err_wait,
            min_fetch_size: self.min_fetch_size,
            max_fetch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.global.address.port(), 8080);
        assert_eq!(config.broker.num_conns, 100);
        assert_eq!(config.broker.dial_timeout, Duration::from_millis(500));
        assert_eq!(config.broker.metadata_cache_period, Duration::from_secs(3));
        assert_eq!(config.consumer.max_fetch_size, 4 * 1024 * 1024);
        assert_eq!(config.consumer.default_fetch_size, 512 * 1024);
        assert_eq!(
            config.offset_coordinator.commit_offset_timeout,
            Duration::from_secs(15)
        );
        assert!(!config.broker.allow_topic_creation);
    }

    #[test]
    fn parses_a_partial_file_with_humantime_durations() {
        let text = r#"
            [global]
            address = "127.0.0.1:9999"

            [kafka]
            brokers = ["broker-1:9092", "broker-2:9092"]

            [broker]
            num_conns = 8
            dial_timeout = "250ms"
            metadata_cache_period = "5s"

            [consumer]
            get_message_timeout = "2s"
            max_fetch_size = 1048576
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.global.address.port(), 9999);
        assert_eq!(config.kafka.brokers.len(), 2);
        assert_eq!(config.broker.num_conns, 8);
        assert_eq!(config.broker.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.broker.metadata_cache_period, Duration::from_secs(5));
        assert_eq!(config.consumer.get_message_timeout, Duration::from_secs(2));
        assert_eq!(config.consumer.max_fetch_size, 1048576);
        // Untouched sections keep their defaults.
        assert_eq!(config.producer.retry_limit, 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = r#"
            [broker]
            num_cons = 8
        "#;
        assert!(toml::from_str::<Config>(text).is_err());
    }

    #[test]
    fn reads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nnum_conns = 3").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.broker.num_conns, 3);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/gateway.toml").is_err());
    }
}
