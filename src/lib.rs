//! HTTP-fronted gateway to an Apache Kafka cluster.
//!
//! A fixed-size pool of broker sessions multiplexes unrelated HTTP requests
//! onto a bounded number of long-lived connections; around it sit the
//! metadata cache, the per-request session facades and the adaptive range
//! read loop that together make up the gateway.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hints;
pub mod http;
pub mod metadata;
pub mod metrics;
pub mod pool;
pub mod record;
pub mod session;
pub mod testing;

pub use error::{AppError, Error};
