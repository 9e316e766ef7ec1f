//! Response envelopes and error payloads for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::Error;

/// Placement of a message in the log; echoed by reads and writes.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Committed consumer-group offset for one partition.
#[derive(Debug, Clone, Serialize)]
pub struct GroupOffsetInfo {
    pub consumer: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
    #[serde(rename = "offsetfrom")]
    pub offset_from: i64,
    #[serde(rename = "offsetto")]
    pub offset_to: i64,
    pub writable: bool,
    #[serde(rename = "replicasnum")]
    pub replicas_num: usize,
    pub replicas: Vec<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub topic: String,
    pub partitions: usize,
}

/// Error payload rendered as `{"error": "..."}` with its HTTP status.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Gateway conditions shed load with 503; opaque broker answers are 500.
    pub fn from_error(context: &str, err: &Error) -> Self {
        let status = match err {
            Error::App(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{context}: {err}"),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// 416 payload for reads outside `[offsetfrom, offsetto)`.
#[derive(Debug, Serialize)]
pub struct OutOfRangeResponse {
    pub error: String,
    pub topic: String,
    pub partition: i32,
    #[serde(rename = "offsetfrom")]
    pub offset_from: i64,
    #[serde(rename = "offsetto")]
    pub offset_to: i64,
}

impl OutOfRangeResponse {
    pub fn new(topic: &str, partition: i32, offset_from: i64, offset_to: i64) -> Self {
        Self {
            error: "offset out of range".to_owned(),
            topic: topic.to_owned(),
            partition,
            offset_from,
            offset_to,
        }
    }
}

impl IntoResponse for OutOfRangeResponse {
    fn into_response(self) -> Response {
        (StatusCode::RANGE_NOT_SATISFIABLE, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_uses_the_wire_field_names() {
        let body = serde_json::to_value(Placement {
            topic: "t".to_owned(),
            partition: 0,
            offset: 3,
        })
        .unwrap();
        assert_eq!(body, json!({"topic": "t", "partition": 0, "offset": 3}));
    }

    #[test]
    fn partition_info_renames_offset_bounds() {
        let body = serde_json::to_value(PartitionInfo {
            topic: "t".to_owned(),
            partition: 1,
            leader: 2,
            offset_from: 0,
            offset_to: 10,
            writable: true,
            replicas_num: 1,
            replicas: vec![2],
        })
        .unwrap();
        assert_eq!(body["offsetfrom"], 0);
        assert_eq!(body["offsetto"], 10);
        assert_eq!(body["replicasnum"], 1);
    }
}
