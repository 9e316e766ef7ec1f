//! Counters and timers around pool and broker operations.
//!
//! Everything goes through the `metrics` facade; the binary installs a
//! Prometheus recorder and renders it at `GET /metrics`.

use std::time::Instant;

use metrics::{gauge, histogram, Gauge};

/// Number of pooled sessions currently waiting in the free set.
pub const FREE_BROKERS: &str = "gateway_free_brokers";
/// Number of quarantined sessions waiting for the reconnect task.
pub const DEAD_BROKERS: &str = "gateway_dead_brokers";

pub const GET_METADATA: &str = "gateway_get_metadata_seconds";
pub const GET_OFFSETS: &str = "gateway_get_offsets_seconds";
pub const GET_MESSAGE: &str = "gateway_get_message_seconds";
pub const SEND_MESSAGE: &str = "gateway_send_message_seconds";
pub const COMMIT_OFFSET: &str = "gateway_commit_offset_seconds";
pub const FETCH_OFFSET: &str = "gateway_fetch_offset_seconds";

/// Request duration, labelled with method and matched route.
pub const HTTP_SECONDS: &str = "gateway_http_seconds";
/// Responses by status code.
pub const HTTP_STATUS: &str = "gateway_http_status";

pub fn free_brokers() -> Gauge {
    gauge!(FREE_BROKERS)
}

pub fn dead_brokers() -> Gauge {
    gauge!(DEAD_BROKERS)
}

/// Records the elapsed wall time into a histogram when dropped, bracketing
/// an operation the way a deferred timer-stop would.
pub struct OpTimer {
    name: &'static str,
    started: Instant,
}

impl OpTimer {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        histogram!(self.name).record(self.started.elapsed().as_secs_f64());
    }
}
