use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use tower::util::ServiceExt;
use tvgate::registry::StreamRegistry;
use tvgate::session::ChannelId;
use tvgate::settings::{RtmpProfile, StreamProfile, StreamingSettings};
use tvgate::tuner::{SourceReader, TunerClient};

struct EmptyTuner;

#[async_trait]
impl TunerClient for EmptyTuner {
    async fn service_stream(
        &self,
        _channel_id: ChannelId,
        _priority: i32,
    ) -> anyhow::Result<SourceReader> {
        Ok(Box::new(tokio::io::empty()))
    }
}

fn test_settings(max_streams: usize, dir: &std::path::Path) -> StreamingSettings {
    let profile = || vec![StreamProfile { cmd: "cat".into() }];
    StreamingSettings {
        max_streams,
        ffmpeg_path: "cat".into(),
        stream_dir: dir.to_path_buf(),
        tuner_url: String::new(),
        recorded_dir: dir.to_path_buf(),
        priority: 0,
        live_hls: profile(),
        live_mpegts: profile(),
        live_webm: profile(),
        live_mp4: profile(),
        live_rtmp: vec![RtmpProfile {
            cmd: "cat".into(),
            url: "rtmp://127.0.0.1/live/%STREAM_KEY%".into(),
        }],
        recorded_hls: profile(),
        recorded_mpegts: profile(),
        recorded_webm: profile(),
        recorded_mp4: profile(),
    }
}

fn test_app(max_streams: usize, dir: &std::path::Path) -> Router {
    let registry = StreamRegistry::new(
        Arc::new(test_settings(max_streams, dir)),
        Arc::new(EmptyTuner),
    );
    tvgate::create_app(registry)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn streams_list_reports_every_slot() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(3, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/streams")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let slots = json.as_array().unwrap();
    assert_eq!(slots.len(), 3);
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(slot["slotNumber"], i);
        assert_eq!(slot["isEnabled"], false);
        assert_eq!(slot["viewerCount"], 0);
    }
}

#[tokio::test]
async fn start_then_list_then_stop() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(2, dir.path());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/live/10/mpegts?mode=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["slot"], 0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/streams")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json[0]["type"], "liveMpegTs");
    assert_eq!(json[0]["channelId"], 10);
    assert_eq!(json[0]["isEnabled"], true);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/streams/0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn exhausted_slots_reply_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(0, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/live/10/mpegts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get("Cache-Control").unwrap(),
        "no-store"
    );
}

#[tokio::test]
async fn unknown_profile_mode_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(2, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/live/10/mpegts?mode=9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_format_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(2, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/live/10/ogg")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rtmp_start_hands_back_a_stream_key() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(2, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/streams/live/5/rtmp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let key = json["streamKey"].as_str().unwrap();
    assert!(!key.is_empty() && key.len() <= 8);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(1, dir.path());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
