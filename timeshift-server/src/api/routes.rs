//! Route handlers for the stream and operator endpoints.

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use timeshift_engine::{PlaylistRequest, UNAVAILABLE_SEGMENT};

use super::{ApiError, ApiResult, AppState};

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const TS_CONTENT_TYPE: &str = "video/mp2t";
/// Playlists go stale within one target duration; segments are immutable.
const PLAYLIST_CACHE_CONTROL: &str = "no-cache, max-age=3";
const SEGMENT_CACHE_CONTROL: &str = "public, max-age=86400";

const MAX_PLAYLIST_DURATION_SECS: u64 = 3600;
const MAX_TIMESHIFT_MS: u64 = 86_400_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stream.m3u8", get(stream_playlist))
        .route("/stream/segment/{file}", get(stream_segment))
        .route("/stream/unavailable.ts", get(unavailable_segment))
        .route("/api/playlist", get(api_playlist))
        .route("/api/status", get(api_status))
}

/// The listener-facing playlist, anchored `delay` behind live.
async fn stream_playlist(State(state): State<AppState>) -> Response {
    let playlist = state.pipeline.generator().generate(&PlaylistRequest::default());
    (
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL),
        ],
        playlist.m3u8_content,
    )
        .into_response()
}

/// Raw segment bytes by sequence number.
///
/// 404 when the sequence is not cached; 500 when it is indexed but the
/// bytes cannot be produced (transient disk failure).
async fn stream_segment(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> ApiResult<Response> {
    let sequence = file
        .strip_suffix(".ts")
        .and_then(|id| id.parse::<u64>().ok())
        .ok_or_else(|| ApiError::not_found(format!("no such segment: {file}")))?;

    let segment = state
        .pipeline
        .cache()
        .get_by_sequence(sequence)
        .await
        .ok_or_else(|| ApiError::not_found(format!("segment {sequence} not in buffer")))?;

    let bytes = segment
        .bytes
        .ok_or_else(|| ApiError::internal(format!("segment {sequence} bytes unavailable")))?;

    Ok((
        [
            (header::CONTENT_TYPE, TS_CONTENT_TYPE),
            (header::CACHE_CONTROL, SEGMENT_CACHE_CONTROL),
        ],
        bytes,
    )
        .into_response())
}

/// A single empty MPEG-TS packet, referenced by the warm-up playlist.
async fn unavailable_segment() -> Response {
    (
        [
            (header::CONTENT_TYPE, TS_CONTENT_TYPE),
            (header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL),
        ],
        UNAVAILABLE_SEGMENT.to_vec(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct PlaylistQuery {
    /// Requested playlist span in seconds.
    duration: Option<u64>,
    /// `m3u8` (default) or `json`.
    format: Option<String>,
    /// Override of the configured delay, in milliseconds.
    timeshift: Option<u64>,
}

/// Parameterized playlist generation for tooling and the player UI.
async fn api_playlist(
    State(state): State<AppState>,
    Query(query): Query<PlaylistQuery>,
) -> ApiResult<Response> {
    let mut request = PlaylistRequest::default();

    if let Some(duration) = query.duration {
        if !(1..=MAX_PLAYLIST_DURATION_SECS).contains(&duration) {
            return Err(ApiError::bad_request(format!(
                "duration must be within 1..={MAX_PLAYLIST_DURATION_SECS} seconds"
            )));
        }
        // Convert the requested span to a segment count, assuming the
        // upstream's nominal segment length.
        let nominal = 6u64;
        request.window_count = Some(duration.div_ceil(nominal).max(1) as usize);
    }
    if let Some(timeshift) = query.timeshift {
        if timeshift > MAX_TIMESHIFT_MS {
            return Err(ApiError::bad_request(format!(
                "timeshift must be within 0..={MAX_TIMESHIFT_MS} milliseconds"
            )));
        }
        request.time_shift = Some(Duration::from_millis(timeshift));
    }

    let playlist = state.pipeline.generator().generate(&request);
    match query.format.as_deref().unwrap_or("m3u8") {
        "json" => Ok(Json(playlist).into_response()),
        "m3u8" => Ok((
            [
                (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
                (header::CACHE_CONTROL, PLAYLIST_CACHE_CONTROL),
            ],
            playlist.m3u8_content,
        )
            .into_response()),
        other => Err(ApiError::bad_request(format!(
            "unknown format `{other}`; expected m3u8 or json"
        ))),
    }
}

/// Pipeline status: monitor, downloader, and buffer state, plus the
/// buffer-ready predicate.
async fn api_status(State(state): State<AppState>) -> Json<timeshift_engine::PipelineStatus> {
    Json(state.pipeline.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use timeshift_engine::{IngestMetadata, TimeShiftConfig, TimeShiftPipeline};
    use tower::ServiceExt;

    async fn test_pipeline(dir: &std::path::Path) -> Arc<TimeShiftPipeline> {
        let mut config = TimeShiftConfig {
            upstream_url: "http://127.0.0.1:1/live/stream.m3u8".to_string(),
            delay: Duration::ZERO,
            ..Default::default()
        };
        config.storage.base_dir = dir.to_path_buf();
        config.cache.buffer_duration = Duration::from_secs(3600);
        Arc::new(TimeShiftPipeline::init(config).await.unwrap())
    }

    async fn seed(pipeline: &TimeShiftPipeline, seq: u64, payload: &'static [u8]) {
        pipeline
            .cache()
            .add(
                Bytes::from_static(payload),
                IngestMetadata {
                    url: format!("https://radio.example.com/seg/{seq}.ts"),
                    sequence_number: Some(seq),
                    duration: 6.0,
                },
            )
            .await
            .unwrap();
    }

    async fn body_bytes(response: axum::response::Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn playlist_endpoint_sets_hls_headers() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_pipeline(dir.path()).await);

        let response = app
            .oneshot(Request::get("/stream.m3u8").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HLS_CONTENT_TYPE
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            PLAYLIST_CACHE_CONTROL
        );
        let body = body_bytes(response).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("#EXTM3U"));
        // Cold cache: warm-up template.
        assert!(text.contains("/stream/unavailable.ts"));
    }

    #[tokio::test]
    async fn playlist_lists_cached_segments() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;
        seed(&pipeline, 1000, b"payload").await;
        let app = create_router(pipeline);

        let response = app
            .oneshot(Request::get("/stream.m3u8").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_bytes(response).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:1000"));
        assert!(text.contains("/stream/segment/1000.ts"));
    }

    #[tokio::test]
    async fn segment_endpoint_serves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;
        seed(&pipeline, 42, b"segment-bytes").await;
        let app = create_router(pipeline);

        let response = app
            .oneshot(
                Request::get("/stream/segment/42.ts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TS_CONTENT_TYPE);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            SEGMENT_CACHE_CONTROL
        );
        assert_eq!(body_bytes(response).await.as_ref(), b"segment-bytes");
    }

    #[tokio::test]
    async fn missing_segment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_pipeline(dir.path()).await);

        for path in ["/stream/segment/999.ts", "/stream/segment/junk.ts"] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn unavailable_segment_is_one_ts_packet() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_pipeline(dir.path()).await);

        let response = app
            .oneshot(
                Request::get("/stream/unavailable.ts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert_eq!(body.len(), 188);
        assert_eq!(body[0], 0x47);
    }

    #[tokio::test]
    async fn api_playlist_validates_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_pipeline(dir.path()).await);

        for uri in [
            "/api/playlist?duration=0",
            "/api/playlist?duration=3601",
            "/api/playlist?timeshift=86400001",
            "/api/playlist?format=xml",
        ] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn api_playlist_json_format_returns_structured_view() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;
        seed(&pipeline, 7, b"x").await;
        let app = create_router(pipeline);

        let response = app
            .oneshot(
                Request::get("/api/playlist?format=json&duration=30&timeshift=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mediaSequence"], 7);
        assert!(json["m3u8Content"].as_str().unwrap().contains("#EXTM3U"));
    }

    #[tokio::test]
    async fn status_reports_buffer_state() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_pipeline(dir.path()).await);

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["running"], false);
        assert!(json["cache"]["segment_count"].is_number());
    }
}
