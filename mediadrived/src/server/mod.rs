mod handlers;
pub mod range;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::provider::RemoteFileProvider;
use crate::settings::SettingsStore;
use crate::sync::backoff::RetryPolicy;
use crate::sync::listing::ListingFetcher;
use crate::sync::pipeline::TranscodePipeline;

/// Everything the handlers share; cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub listing: Arc<ListingFetcher>,
    pub pipeline: TranscodePipeline,
    pub provider: Arc<dyn RemoteFileProvider>,
    pub settings: SettingsStore,
    pub retry: RetryPolicy,
    pub range_chunk: u64,
}

pub fn router(state: AppState) -> Router {
    // Ranged video bodies must keep their exact Content-Length.
    let compress_when = DefaultPredicate::new().and(NotForContentType::const_new("video/"));

    Router::new()
        .route("/media-list", get(handlers::media_list))
        .route("/media-list/refresh", post(handlers::refresh_media_list))
        .route("/media/image", get(handlers::image))
        .route("/media/video", get(handlers::video))
        .route(
            "/settings",
            get(handlers::get_settings).post(handlers::save_settings),
        )
        .route("/keepalive", get(handlers::keepalive))
        .with_state(state)
        .layer(CompressionLayer::new().compress_when(compress_when))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
