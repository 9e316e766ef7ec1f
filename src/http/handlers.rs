//! Business logic behind the REST routes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::response::{
    ErrorResponse, GroupOffsetInfo, OutOfRangeResponse, PartitionInfo, Placement, TopicInfo,
};
use super::AppState;
use crate::client::ClientError;
use crate::error::Error;
use crate::fetch::{read_range, RangeRead, ReadError};
use crate::metadata::Metadata;
use crate::record::Message;
use crate::session::{OffsetCoordinator, Producer};

fn from_client(context: &str, err: ClientError) -> ErrorResponse {
    ErrorResponse::from_error(context, &Error::Client(err))
}

/// Reject requests naming topics or partitions the cluster does not know.
async fn validate(
    state: &AppState,
    topic: &str,
    partition: Option<i32>,
) -> Result<Arc<Metadata>, ErrorResponse> {
    if topic.is_empty() {
        return Err(ErrorResponse::bad_request("Topic name required"));
    }

    let meta = state
        .pool
        .fetch_metadata()
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to get metadata", &err))?;

    let found = meta
        .contains_topic(topic)
        .map_err(|err| from_client("Unable to get topic", err))?;
    if !found {
        return Err(ErrorResponse::bad_request("Topic unknown"));
    }

    if let Some(partition) = partition {
        let partitions = meta
            .partitions(topic)
            .map_err(|err| from_client("Unable to get partitions", err))?;
        if !partitions.contains(&partition) {
            return Err(ErrorResponse::bad_request(
                "Unknown partition for the specified topic",
            ));
        }
    }

    Ok(meta)
}

pub async fn send_message(
    State(state): State<AppState>,
    Path((topic, partition)): Path<(String, i32)>,
    body: Bytes,
) -> Result<Json<Placement>, ErrorResponse> {
    let max_size = state.config.consumer.max_fetch_size;
    if body.len() > max_size as usize {
        return Err(ErrorResponse::bad_request(format!(
            "Message too large: body must be at most {} bytes, but it is {}",
            max_size,
            body.len()
        )));
    }
    if serde_json::from_slice::<IgnoredAny>(&body).is_err() {
        return Err(ErrorResponse::bad_request("Message must be JSON"));
    }

    validate(&state, &topic, Some(partition)).await?;

    let mut producer = Producer::open(
        Arc::clone(&state.pool),
        state.config.producer_config(),
        state.config.producer.send_message_timeout,
    )
    .await
    .map_err(|err| ErrorResponse::from_error("Unable to make producer", &err))?;

    let payload_len = body.len() as i32;
    let offset = producer
        .send(&topic, partition, body)
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to store your data", &err))?;
    producer.close();

    state.hints.put(&topic, payload_len);
    Ok(Json(Placement {
        topic,
        partition,
        offset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReadParams {
    pub offset: Option<i64>,
    /// `relative >= 0` counts from the start of the range, `relative < 0`
    /// back from its end.
    pub relative: Option<i64>,
    pub limit: Option<i32>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path((topic, partition)): Path<(String, i32)>,
    Query(params): Query<ReadParams>,
) -> Response {
    match read_messages(state, topic, partition, params).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn read_messages(
    state: AppState,
    topic: String,
    partition: i32,
    params: ReadParams,
) -> Result<Response, ErrorResponse> {
    let limit = params.limit.unwrap_or(1).max(1);

    validate(&state, &topic, Some(partition)).await?;

    let (offset_from, offset_to) = state
        .pool
        .get_offsets(&topic, partition)
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to get offset", &err))?;

    let offset = if let Some(relative) = params.relative {
        if relative >= 0 {
            offset_from + relative
        } else {
            offset_to + relative
        }
    } else {
        params.offset.unwrap_or(offset_from)
    };

    if offset < offset_from || offset >= offset_to {
        return Ok(
            OutOfRangeResponse::new(&topic, partition, offset_from, offset_to).into_response(),
        );
    }

    let query = Placement {
        topic: topic.clone(),
        partition,
        offset,
    };
    let query_json = serde_json::to_vec(&query).map_err(|err| ErrorResponse {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("Unable to marshal json: {err}"),
    })?;

    let (tx, mut rx) = mpsc::channel::<Message>(16);
    let read = RangeRead {
        topic: topic.clone(),
        partition,
        offset,
        limit,
        offset_from,
        offset_to,
    };
    let reader = {
        let pool = Arc::clone(&state.pool);
        let hints = Arc::clone(&state.hints);
        let conf = state.config.consumer.clone();
        tokio::spawn(async move { read_range(pool, &conf, &hints, read, tx).await })
    };

    let mut envelope = Vec::with_capacity(query_json.len() + 24);
    envelope.extend_from_slice(b"{\"query\":");
    envelope.extend_from_slice(&query_json);
    envelope.extend_from_slice(b",\"messages\":[");

    // The status must be settled before the first byte goes out, so wait
    // for either the first message or the loop's verdict.
    match rx.recv().await {
        Some(first) => {
            envelope.extend_from_slice(&first.value);
            let opening = Bytes::from(envelope);
            let tail = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|msg| {
                    let mut chunk = Vec::with_capacity(msg.value.len() + 1);
                    chunk.push(b',');
                    chunk.extend_from_slice(&msg.value);
                    (Ok::<Bytes, Infallible>(Bytes::from(chunk)), rx)
                })
            });
            let body = futures::stream::once(async move { Ok::<Bytes, Infallible>(opening) })
                .chain(tail)
                .chain(futures::stream::once(async {
                    Ok(Bytes::from_static(b"]}"))
                }));
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                Body::from_stream(body),
            )
                .into_response())
        }
        None => match reader.await {
            Ok(Ok(_)) => {
                envelope.extend_from_slice(b"]}");
                Ok((
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    Body::from(envelope),
                )
                    .into_response())
            }
            Ok(Err(ReadError::OutOfRange { .. })) => Ok(OutOfRangeResponse::new(
                &topic,
                partition,
                offset_from,
                offset_to,
            )
            .into_response()),
            Ok(Err(ReadError::Gateway(err))) => {
                Err(ErrorResponse::from_error("Unable to get message", &err))
            }
            Err(err) => Err(ErrorResponse {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("Read task failed: {err}"),
            }),
        },
    }
}

pub async fn topic_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<TopicInfo>>, ErrorResponse> {
    let meta = state
        .pool
        .fetch_metadata()
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to get metadata", &err))?;
    let topics = meta
        .topics()
        .map_err(|err| from_client("Unable to get topics", err))?;

    let mut out = Vec::with_capacity(topics.len());
    for topic in topics {
        let partitions = meta
            .partitions(&topic)
            .map_err(|err| from_client("Unable to get partitions", err))?;
        out.push(TopicInfo {
            topic,
            partitions: partitions.len(),
        });
    }
    Ok(Json(out))
}

async fn partition_details(
    state: &AppState,
    meta: &Metadata,
    topic: &str,
    partition: i32,
) -> Result<PartitionInfo, ErrorResponse> {
    let leader = meta
        .leader(topic, partition)
        .map_err(|err| from_client("Unable to get broker", err))?;

    let replicas = match meta.replicas(topic, partition) {
        Ok(replicas) => replicas,
        Err(ClientError::ReplicaNotAvailable) => {
            warn!(topic, partition, "replica not available, reporting an empty set");
            Vec::new()
        }
        Err(err) => return Err(from_client("Unable to get replicas", err)),
    };

    let (offset_from, offset_to) = state
        .pool
        .get_offsets(topic, partition)
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to get offset", &err))?;

    let writable = meta
        .writable_partitions(topic)
        .map_err(|err| from_client("Unable to get writable partitions", err))?
        .contains(&partition);

    Ok(PartitionInfo {
        topic: topic.to_owned(),
        partition,
        leader,
        offset_from,
        offset_to,
        writable,
        replicas_num: replicas.len(),
        replicas,
    })
}

pub async fn topic_info(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<Vec<PartitionInfo>>, ErrorResponse> {
    let meta = validate(&state, &topic, None).await?;
    let partitions = meta
        .partitions(&topic)
        .map_err(|err| from_client("Unable to get partitions", err))?;

    let mut out = Vec::with_capacity(partitions.len());
    for partition in partitions {
        out.push(partition_details(&state, &meta, &topic, partition).await?);
    }
    Ok(Json(out))
}

pub async fn partition_info(
    State(state): State<AppState>,
    Path((topic, partition)): Path<(String, i32)>,
) -> Result<Json<PartitionInfo>, ErrorResponse> {
    let meta = validate(&state, &topic, Some(partition)).await?;
    let info = partition_details(&state, &meta, &topic, partition).await?;
    Ok(Json(info))
}

pub async fn fetch_group_offset(
    State(state): State<AppState>,
    Path((consumer, topic, partition)): Path<(String, String, i32)>,
) -> Result<Json<GroupOffsetInfo>, ErrorResponse> {
    validate(&state, &topic, Some(partition)).await?;
    if consumer.is_empty() {
        return Err(ErrorResponse::bad_request("Consumer name must be provided"));
    }

    let mut coordinator = OffsetCoordinator::open(
        Arc::clone(&state.pool),
        state.config.offset_coordinator_config(&consumer),
        state.config.offset_coordinator.commit_offset_timeout,
        state.config.offset_coordinator.fetch_offset_timeout,
    )
    .await
    .map_err(|err| ErrorResponse::from_error("Unable to make offset coordinator", &err))?;

    let (offset, metadata) = coordinator
        .fetch(&topic, partition)
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to fetch offset", &err))?;
    coordinator.close();

    Ok(Json(GroupOffsetInfo {
        consumer,
        topic,
        partition,
        offset,
        metadata,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CommitBody {
    #[serde(default = "default_commit_offset")]
    pub offset: i64,
    #[serde(default)]
    pub metadata: String,
}

fn default_commit_offset() -> i64 {
    -1
}

pub async fn commit_group_offset(
    State(state): State<AppState>,
    Path((consumer, topic, partition)): Path<(String, String, i32)>,
    body: Bytes,
) -> Result<Json<GroupOffsetInfo>, ErrorResponse> {
    let commit: CommitBody = serde_json::from_slice(&body)
        .map_err(|_| ErrorResponse::bad_request("Request body must be JSON"))?;
    if commit.offset < 0 {
        return Err(ErrorResponse::bad_request(
            "Offset must be provided not less than 0",
        ));
    }

    validate(&state, &topic, Some(partition)).await?;
    if consumer.is_empty() {
        return Err(ErrorResponse::bad_request("Consumer name must be provided"));
    }

    let mut coordinator = OffsetCoordinator::open(
        Arc::clone(&state.pool),
        state.config.offset_coordinator_config(&consumer),
        state.config.offset_coordinator.commit_offset_timeout,
        state.config.offset_coordinator.fetch_offset_timeout,
    )
    .await
    .map_err(|err| ErrorResponse::from_error("Unable to make offset coordinator", &err))?;

    coordinator
        .commit(&topic, partition, commit.offset)
        .await
        .map_err(|err| ErrorResponse::from_error("Unable to commit offset", &err))?;
    coordinator.close();

    Ok(Json(GroupOffsetInfo {
        consumer,
        topic,
        partition,
        offset: commit.offset,
        metadata: commit.metadata,
    }))
}

pub async fn ping() -> StatusCode {
    StatusCode::OK
}

pub async fn not_found() -> ErrorResponse {
    ErrorResponse::not_found("404 page not found")
}

pub async fn landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Endpoints | Kafka API v1</title>
  </head>
  <body>
    <h2>Kafka API v1</h2>
    <table border="1" cellpadding="4">
      <tr><th>Write to Kafka</th><td>POST</td><td><code>/v1/topics/{topic}/{partition}</code></td></tr>
      <tr><th>Read by absolute position</th><td>GET</td><td><code>/v1/topics/{topic}/{partition}?offset={offset}&amp;limit={limit}</code></td></tr>
      <tr><th>Read relative to the range bounds</th><td>GET</td><td><code>/v1/topics/{topic}/{partition}?relative={position}&amp;limit={limit}</code></td></tr>
      <tr><th>Topic list</th><td>GET</td><td><code>/v1/info/topics</code></td></tr>
      <tr><th>All partitions of a topic</th><td>GET</td><td><code>/v1/info/topics/{topic}</code></td></tr>
      <tr><th>Single partition</th><td>GET</td><td><code>/v1/info/topics/{topic}/{partition}</code></td></tr>
      <tr><th>Committed group offset</th><td>GET</td><td><code>/v1/offsets/{consumer}/{topic}/{partition}</code></td></tr>
      <tr><th>Commit group offset</th><td>POST</td><td><code>/v1/offsets/{consumer}/{topic}/{partition}</code></td></tr>
    </table>
  </body>
</html>
"#;
