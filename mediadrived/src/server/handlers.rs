use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::AppState;
use super::range::{ByteRange, RangeRequest, resolve};
use crate::media::{MP4_MIME, MediaKind, RemoteEntry};
use crate::provider::ProviderError;
use crate::sync::listing::Listing;
use crate::sync::pipeline::PipelineError;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(rename = "fileId")]
    file_id: Option<String>,
}

impl FileQuery {
    fn file_id(&self) -> Option<&str> {
        self.file_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

pub async fn media_list(State(state): State<AppState>) -> Response {
    list_response(state.listing.list(false).await, false)
}

pub async fn refresh_media_list(State(state): State<AppState>) -> Response {
    list_response(state.listing.list(true).await, true)
}

fn list_response(listing: Listing, forced: bool) -> Response {
    if let Some(err) = &listing.refresh_error {
        warn!(error = %err, forced, "failed to refresh media list");
        if forced || !listing.snapshot.is_loaded() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Drive fetch failed" })),
            )
                .into_response();
        }
    }
    Json(listing.snapshot.entries()).into_response()
}

pub async fn image(State(state): State<AppState>, Query(query): Query<FileQuery>) -> Response {
    let Some(file_id) = query.file_id() else {
        return (StatusCode::BAD_REQUEST, "Missing fileId").into_response();
    };
    let entry = match lookup(&state, file_id).await {
        Some(entry) if entry.kind().is_some_and(MediaKind::is_image) => entry,
        _ => return (StatusCode::NOT_FOUND, "Image not found").into_response(),
    };

    match state.pipeline.ensure(&entry).await {
        Ok(ready) => (
            [(header::CONTENT_TYPE, ready.mime_type)],
            Body::from(ready.bytes),
        )
            .into_response(),
        Err(err) => failure(&entry, &err, "Image not found", "Failed to fetch image"),
    }
}

pub async fn video(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(file_id) = query.file_id() else {
        return (StatusCode::BAD_REQUEST, "Missing fileId").into_response();
    };
    let entry = match lookup(&state, file_id).await {
        Some(entry) if entry.kind() == Some(MediaKind::Video) => entry,
        _ => return (StatusCode::NOT_FOUND, "Video not found").into_response(),
    };

    // Without a known size there is nothing to resolve ranges against.
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok())
        && entry.size > 0
    {
        match resolve(range, entry.size, state.range_chunk) {
            RangeRequest::Partial(span) => return ranged(&state, &entry, span).await,
            RangeRequest::Unsatisfiable => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", entry.size))],
                )
                    .into_response();
            }
            RangeRequest::Full => {}
        }
    }

    match state.pipeline.ensure(&entry).await {
        Ok(ready) => (
            [
                (header::CONTENT_TYPE, ready.mime_type),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            Body::from(ready.bytes),
        )
            .into_response(),
        Err(err) => failure(&entry, &err, "Video not found", "Failed to fetch video"),
    }
}

async fn ranged(state: &AppState, entry: &RemoteEntry, span: ByteRange) -> Response {
    debug!(file_id = %entry.id, start = span.start, end = span.end, "streaming range");
    let stream = state
        .retry
        .run(&entry.id, || {
            state.provider.get_range(&entry.id, span.start, span.end)
        })
        .await;
    match stream {
        Ok(stream) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, MP4_MIME.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_RANGE, span.content_range(entry.size)),
                (header::CONTENT_LENGTH, span.len().to_string()),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(err) => failure(
            entry,
            &PipelineError::Remote(err),
            "Video not found",
            "Failed to fetch video",
        ),
    }
}

/// Resolves an id against the listing, loading it first if nothing was fetched yet.
async fn lookup(state: &AppState, file_id: &str) -> Option<RemoteEntry> {
    let snapshot = state.listing.current();
    let snapshot = if snapshot.is_loaded() {
        snapshot
    } else {
        state.listing.list(false).await.snapshot
    };
    snapshot.get(file_id).cloned()
}

fn failure(
    entry: &RemoteEntry,
    err: &PipelineError,
    not_found: &'static str,
    failed: &'static str,
) -> Response {
    warn!(file_id = %entry.id, name = %entry.name, error = %err, "request failed");
    match err {
        PipelineError::Evicted(_) | PipelineError::Remote(ProviderError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, not_found).into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, failed).into_response(),
    }
}

pub async fn get_settings(State(state): State<AppState>) -> Response {
    match state.settings.load().await {
        Ok(raw) => ([(header::CONTENT_TYPE, "application/json")], raw).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to read settings");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to read settings" })),
            )
                .into_response()
        }
    }
}

pub async fn save_settings(
    State(state): State<AppState>,
    Json(settings): Json<Value>,
) -> Response {
    match state.settings.save(&settings).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to save settings");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to save settings" })),
            )
                .into_response()
        }
    }
}

pub async fn keepalive() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::provider::RemoteFileProvider;
    use crate::server::router;
    use crate::settings::SettingsStore;
    use crate::sync::backoff::{Backoff, RetryPolicy};
    use crate::sync::cache::CacheStore;
    use crate::sync::listing::ListingFetcher;
    use crate::sync::pipeline::TranscodePipeline;
    use crate::test_support::{FakeProvider, FakeTranscoder, remote};
    use crate::transcode::Transcoder;

    struct Harness {
        provider: Arc<FakeProvider>,
        app: Router,
        dir: TempDir,
    }

    fn harness(entries: Vec<RemoteEntry>) -> Harness {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FakeProvider::new());
        provider.set_listing(entries);
        let provider_dyn = Arc::clone(&provider) as Arc<dyn RemoteFileProvider>;
        let retry = RetryPolicy::new(2, Backoff::fixed(Duration::from_millis(1)));
        let pipeline = TranscodePipeline::new(
            Arc::clone(&provider_dyn),
            Arc::new(FakeTranscoder::new()) as Arc<dyn Transcoder>,
            Arc::new(CacheStore::new()),
            5,
        )
        .with_retry(retry);
        let state = AppState {
            listing: Arc::new(ListingFetcher::new(
                Arc::clone(&provider_dyn),
                Duration::from_secs(3600),
            )),
            pipeline,
            provider: provider_dyn,
            settings: SettingsStore::new(dir.path().join("settings.json")),
            retry,
            range_chunk: 1000,
        };
        Harness {
            provider,
            app: router(state),
            dir,
        }
    }

    fn video_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn ranged_get(uri: &str, range: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::RANGE, range)
            .body(Body::empty())
            .unwrap()
    }

    fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
        headers.get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn media_list_returns_supported_entries() {
        let h = harness(vec![
            remote("a", "a.jpg", "image/jpeg", 10),
            remote("q", "q.mov", "video/quicktime", 10),
            remote("v", "v.mp4", "video/mp4", 20),
        ]);

        let (status, _, body) = send(&h.app, get("/media-list")).await;

        assert_eq!(status, StatusCode::OK);
        let list: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            list,
            json!([
                { "id": "a", "name": "a.jpg", "mimeType": "image/jpeg", "size": 10 },
                { "id": "v", "name": "v.mp4", "mimeType": "video/mp4", "size": 20 }
            ])
        );
    }

    #[tokio::test]
    async fn refresh_endpoint_bypasses_the_ttl() {
        let h = harness(vec![remote("a", "a.jpg", "image/jpeg", 1)]);
        send(&h.app, get("/media-list")).await;
        h.provider.set_listing(vec![remote("b", "b.jpg", "image/jpeg", 1)]);

        let request = Request::builder()
            .method("POST")
            .uri("/media-list/refresh")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&h.app, request).await;

        assert_eq!(status, StatusCode::OK);
        let list: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list[0]["id"], "b");
        assert_eq!(h.provider.list_calls(), 2);
    }

    #[tokio::test]
    async fn media_list_fails_without_any_snapshot() {
        let h = harness(vec![]);
        h.provider
            .fail_listing(ProviderError::Unavailable("offline".into()));

        let (status, _, _) = send(&h.app, get("/media-list")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn missing_file_id_is_a_bad_request() {
        let h = harness(vec![]);

        let (image, _, body) = send(&h.app, get("/media/image")).await;
        let (video, _, _) = send(&h.app, get("/media/video?fileId=")).await;

        assert_eq!(image, StatusCode::BAD_REQUEST);
        assert_eq!(body, b"Missing fileId");
        assert_eq!(video, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_ids_and_wrong_kinds_are_not_found_before_fetching() {
        let h = harness(vec![
            remote("a", "a.jpg", "image/jpeg", 5),
            remote("v", "v.mp4", "video/mp4", 5),
        ]);

        let (unknown, _, _) = send(&h.app, get("/media/image?fileId=nope")).await;
        let (video_as_image, _, _) = send(&h.app, get("/media/image?fileId=v")).await;
        let (image_as_video, _, body) = send(&h.app, get("/media/video?fileId=a")).await;

        assert_eq!(unknown, StatusCode::NOT_FOUND);
        assert_eq!(video_as_image, StatusCode::NOT_FOUND);
        assert_eq!(image_as_video, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Video not found");
        assert_eq!(h.provider.fetch_calls(), 0);
        assert_eq!(h.provider.range_calls(), 0);
    }

    #[tokio::test]
    async fn images_are_transcoded_on_demand_and_then_cached() {
        let h = harness(vec![remote("a", "a.png", "image/png", 5)]);

        let (status, headers, body) = send(&h.app, get("/media/image?fileId=a")).await;
        let (again, _, _) = send(&h.app, get("/media/image?fileId=a")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&headers, header::CONTENT_TYPE), "image/jpeg");
        assert_eq!(body, b"a.png");
        assert_eq!(again, StatusCode::OK);
        assert_eq!(h.provider.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn image_fetch_failures_are_generic_errors() {
        let h = harness(vec![remote("a", "a.jpg", "image/jpeg", 5)]);
        h.provider
            .fail_fetches("a", [ProviderError::Rejected("403".into())]);

        let (status, _, body) = send(&h.app, get("/media/image?fileId=a")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, b"Failed to fetch image");
    }

    #[tokio::test]
    async fn open_ranges_are_served_one_chunk_at_a_time() {
        let h = harness(vec![remote("v", "v.mp4", "video/mp4", 2500)]);
        let bytes = video_bytes(2500);
        h.provider.put_file("v", bytes.clone());

        let (status, headers, body) =
            send(&h.app, ranged_get("/media/video?fileId=v", "bytes=0-")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes 0-999/2500");
        assert_eq!(header_str(&headers, header::CONTENT_LENGTH), "1000");
        assert_eq!(header_str(&headers, header::ACCEPT_RANGES), "bytes");
        assert_eq!(header_str(&headers, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(body, &bytes[..1000]);
        assert_eq!(h.provider.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn range_end_is_clipped_to_the_file_size() {
        let h = harness(vec![remote("v", "v.mp4", "video/mp4", 2500)]);
        let bytes = video_bytes(2500);
        h.provider.put_file("v", bytes.clone());

        let (status, headers, body) =
            send(&h.app, ranged_get("/media/video?fileId=v", "bytes=2000-9999")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes 2000-2499/2500");
        assert_eq!(header_str(&headers, header::CONTENT_LENGTH), "500");
        assert_eq!(body, &bytes[2000..]);
    }

    #[tokio::test]
    async fn ranges_past_the_end_are_unsatisfiable() {
        let h = harness(vec![remote("v", "v.mp4", "video/mp4", 2500)]);

        let (status, headers, _) =
            send(&h.app, ranged_get("/media/video?fileId=v", "bytes=2500-")).await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header_str(&headers, header::CONTENT_RANGE), "bytes */2500");
        assert_eq!(h.provider.range_calls(), 0);
    }

    #[tokio::test]
    async fn video_without_range_is_served_whole() {
        let h = harness(vec![remote("v", "v.mp4", "video/mp4", 2500)]);
        let bytes = video_bytes(2500);
        h.provider.put_file("v", bytes.clone());

        let (status, headers, body) = send(&h.app, get("/media/video?fileId=v")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&headers, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(body, bytes);
    }

    #[tokio::test]
    async fn unknown_size_ignores_the_range_header() {
        let h = harness(vec![remote("v", "v.mp4", "video/mp4", 0)]);
        h.provider.put_file("v", video_bytes(300));

        let (status, _, body) =
            send(&h.app, ranged_get("/media/video?fileId=v", "bytes=0-99")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 300);
        assert_eq!(h.provider.range_calls(), 0);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let h = harness(vec![]);

        let (missing, _, _) = send(&h.app, get("/settings")).await;
        let request = Request::builder()
            .method("POST")
            .uri("/settings")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"intervalSecs":30}"#))
            .unwrap();
        let (saved, _, saved_body) = send(&h.app, request).await;
        let (loaded, _, loaded_body) = send(&h.app, get("/settings")).await;

        assert_eq!(missing, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(saved, StatusCode::OK);
        assert_eq!(
            serde_json::from_slice::<Value>(&saved_body).unwrap(),
            json!({ "success": true })
        );
        assert_eq!(loaded, StatusCode::OK);
        assert_eq!(
            serde_json::from_slice::<Value>(&loaded_body).unwrap(),
            json!({ "intervalSecs": 30 })
        );
    }

    #[tokio::test]
    async fn settings_file_is_served_as_stored() {
        let h = harness(vec![]);
        let stored = "{ \"intervalSecs\": 30, }\n";
        std::fs::write(h.dir.path().join("settings.json"), stored).unwrap();

        let (status, headers, body) = send(&h.app, get("/settings")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header_str(&headers, header::CONTENT_TYPE), "application/json");
        assert_eq!(body, stored.as_bytes());
    }

    #[tokio::test]
    async fn keepalive_answers() {
        let h = harness(vec![]);

        let (status, _, body) = send(&h.app, get("/keepalive")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }
}
