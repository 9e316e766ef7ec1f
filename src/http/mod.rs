//! REST surface of the gateway.

pub mod handlers;
pub mod response;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics::{counter, histogram};

use crate::config::Config;
use crate::hints::MessageSizeHints;
use crate::metrics as names;
use crate::pool::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub hints: Arc<MessageSizeHints>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::landing))
        .route("/ping", get(handlers::ping))
        .route("/v1/info/topics", get(handlers::topic_list))
        .route("/v1/info/topics/:topic", get(handlers::topic_info))
        .route(
            "/v1/info/topics/:topic/:partition",
            get(handlers::partition_info),
        )
        .route(
            "/v1/topics/:topic/:partition",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route(
            "/v1/offsets/:consumer/:topic/:partition",
            get(handlers::fetch_group_offset).post(handlers::commit_group_offset),
        )
        .route_layer(middleware::from_fn(track_requests))
        .fallback(handlers::not_found)
        .with_state(state)
}

/// Time every matched route and count responses by status code.
async fn track_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let response = next.run(request).await;

    histogram!(names::HTTP_SECONDS, "method" => method.to_string(), "path" => path)
        .record(started.elapsed().as_secs_f64());
    counter!(names::HTTP_STATUS, "code" => response.status().as_u16().to_string()).increment(1);
    response
}
