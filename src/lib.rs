pub mod error;
pub mod live;
pub mod metrics;
pub mod process;
pub mod readiness;
pub mod recorded;
pub mod registry;
pub mod session;
pub mod settings;
pub mod streams_api;
pub mod tuner;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};
use futures::stream::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{info, warn};

use crate::error::StreamError;
use crate::registry::{StreamRegistry, ViewerGuard};
use crate::session::{Container, SessionInfo, SlotSnapshot};
use crate::streams_api::StreamsApi;

struct AppState {
    streams: StreamsApi,
}

/// Byte stream tied to a viewer guard: the slot's viewer count drops when the
/// HTTP body is dropped, and the registry then decides whether to stop.
struct GuardedStream {
    _guard: ViewerGuard,
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send>>,
    slot: usize,
    last_log_time: std::time::Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<bytes::Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= std::time::Duration::from_secs(5) {
                let bytes = self.bytes_since_last_log;
                let secs = elapsed.as_secs_f64();
                let rate_kb = (bytes as f64 / secs) / 1024.0;
                info!("Stream bandwidth: slot={} rate={:.2} KB/s", self.slot, rate_kb);
                self.last_log_time = std::time::Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

pub fn create_app(registry: Arc<StreamRegistry>) -> Router {
    let state = Arc::new(AppState {
        streams: StreamsApi::new(registry),
    });

    Router::new()
        .route("/api/streams", get(streams_list_handler))
        .route("/api/streams/live/{channel}/{format}", post(live_start_handler))
        .route(
            "/api/streams/recorded/{recorded}/{format}",
            post(recorded_start_handler),
        )
        .route("/api/streams/{slot}", delete(stream_stop_handler))
        .route("/stream/{slot}", get(stream_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn error_response(err: StreamError) -> axum::response::Response {
    let status = match err {
        StreamError::SlotExhausted(_) => 503,
        StreamError::Config { .. } => 400,
        StreamError::SourceAcquisition(_) => 502,
        StreamError::Spawn(_) | StreamError::Aborted => 500,
    };
    axum::response::Response::builder()
        .status(status)
        .header("Cache-Control", "no-store")
        .body(Body::from(err.to_string()))
        .unwrap()
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP 404: method={} uri={} UA=\"{}\"", method, uri, user_agent);
    axum::response::Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}

async fn streams_list_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SlotSnapshot>> {
    Json(state.streams.infos().await)
}

#[derive(Deserialize)]
struct LiveQuery {
    #[serde(default)]
    mode: usize,
}

async fn live_start_handler(
    Path((channel, format)): Path<(u64, String)>,
    Query(query): Query<LiveQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("HTTP live start: channel={} format={} mode={}", channel, format, query.mode);

    let result = match format.as_str() {
        "hls" => state.streams.live_hls(channel, query.mode).await,
        "mpegts" => state.streams.live_mpegts(channel, query.mode).await,
        "webm" => {
            state
                .streams
                .live_transcode(channel, query.mode, Container::WebM)
                .await
        }
        "mp4" => {
            state
                .streams
                .live_transcode(channel, query.mode, Container::Mp4)
                .await
        }
        "rtmp" => {
            return match state.streams.rtmp_live(channel, query.mode).await {
                Ok(handle) => Json(serde_json::json!({
                    "slot": handle.slot,
                    "streamKey": handle.stream_key,
                }))
                .into_response(),
                Err(err) => error_response(err),
            };
        }
        _ => {
            return axum::response::Response::builder()
                .status(404)
                .body(Body::from("Unknown stream format"))
                .unwrap();
        }
    };

    match result {
        Ok(slot) => Json(serde_json::json!({ "slot": slot })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct RecordedQuery {
    #[serde(default)]
    mode: usize,
    #[serde(default)]
    offset: u64,
    encoded: Option<u64>,
}

async fn recorded_start_handler(
    Path((recorded, format)): Path<(u64, String)>,
    Query(query): Query<RecordedQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(
        "HTTP recorded start: recorded={} format={} mode={} offset={}",
        recorded, format, query.mode, query.offset
    );

    let result = match format.as_str() {
        "hls" => {
            state
                .streams
                .recorded_hls(recorded, query.mode, query.encoded)
                .await
        }
        "mpegts" => {
            state
                .streams
                .recorded_stream(recorded, query.mode, Container::MpegTs, query.offset)
                .await
        }
        "webm" => {
            state
                .streams
                .recorded_stream(recorded, query.mode, Container::WebM, query.offset)
                .await
        }
        "mp4" => {
            state
                .streams
                .recorded_stream(recorded, query.mode, Container::Mp4, query.offset)
                .await
        }
        _ => {
            return axum::response::Response::builder()
                .status(404)
                .body(Body::from("Unknown stream format"))
                .unwrap();
        }
    };

    match result {
        Ok(slot) => Json(serde_json::json!({ "slot": slot })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn stream_stop_handler(
    Path(slot): Path<usize>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("HTTP stream stop: slot={}", slot);
    match state.streams.stop(slot).await {
        Ok(()) => axum::response::Response::builder()
            .status(204)
            .body(Body::empty())
            .unwrap(),
        Err(e) => {
            warn!("Stream stop failed: slot={} err={}", slot, e);
            axum::response::Response::builder()
                .status(500)
                .body(Body::from(format!("Failed to stop stream: {e}")))
                .unwrap()
        }
    }
}

fn content_type_for(info: &SessionInfo) -> Option<&'static str> {
    let container = match info {
        SessionInfo::LiveMpegTs { .. } => Container::MpegTs,
        SessionInfo::LiveTranscode { container, .. }
        | SessionInfo::RecordedStream { container, .. } => *container,
        _ => return None,
    };
    Some(match container {
        Container::MpegTs => "video/mp2t",
        Container::WebM => "video/webm",
        Container::Mp4 => "video/mp4",
    })
}

async fn stream_handler(
    Path(slot): Path<usize>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let registry = state.streams.registry();

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!("HTTP stream request: slot={} UA=\"{}\"", slot, user_agent);

    let content_type = match registry.info(slot).await.and_then(|s| s.info) {
        Some(info) => match content_type_for(&info) {
            Some(ct) => ct,
            None => {
                return axum::response::Response::builder()
                    .status(404)
                    .body(Body::from("Slot does not serve a byte stream"))
                    .unwrap();
            }
        },
        None => {
            return axum::response::Response::builder()
                .status(404)
                .body(Body::from("Stream not found"))
                .unwrap();
        }
    };

    let Some(rx) = registry.subscribe_output(slot).await else {
        return axum::response::Response::builder()
            .status(404)
            .body(Body::from("Stream not found"))
            .unwrap();
    };
    let Some(guard) = registry.guard(slot).await else {
        return axum::response::Response::builder()
            .status(404)
            .body(Body::from("Stream not found"))
            .unwrap();
    };

    // Explicit recv() loop so lag and shutdown are logged.
    let broadcast_stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(bytes) => return Some((Ok::<_, std::io::Error>(bytes), rx)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Stream lagged: slot={} skipped_messages={}", slot, skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    warn!("Stream ended (broadcast closed): slot={}", slot);
                    return None;
                }
            }
        }
    });

    let guarded_stream = GuardedStream {
        _guard: guard,
        inner: Box::pin(broadcast_stream),
        slot,
        last_log_time: std::time::Instant::now(),
        bytes_since_last_log: 0,
    };

    axum::response::Response::builder()
        .header("Content-Type", content_type)
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded_stream))
        .unwrap()
}

async fn metrics_handler() -> impl IntoResponse {
    axum::response::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap()
}
