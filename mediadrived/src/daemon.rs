use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mediadrive_core::DriveClient;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{DriveProvider, RemoteFileProvider};
use crate::server::{self, AppState};
use crate::settings::{DEFAULT_SETTINGS_PATH, SettingsStore};
use crate::sync::backoff::{Backoff, RetryPolicy};
use crate::sync::cache::CacheStore;
use crate::sync::listing::ListingFetcher;
use crate::sync::pipeline::TranscodePipeline;
use crate::sync::reconcile::{CycleReport, Reconciler};
use crate::transcode::{Dimensions, ImageSettings, MediaTranscoder, Transcoder, VideoSettings, tool_path};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_LISTING_TTL_SECS: u64 = 600;
const DEFAULT_RECONCILE_SECS: u64 = 5;
const DEFAULT_CONCURRENCY: u64 = 5;
const DEFAULT_FETCH_RETRIES: u64 = 3;
const DEFAULT_FETCH_RETRY_MS: u64 = 1000;
const DEFAULT_RANGE_CHUNK_BYTES: u64 = 1_000_000;
const DEFAULT_IMAGE_QUALITY: u64 = 80;
const DEFAULT_VIDEO_PRESET: &str = "veryfast";
const DEFAULT_KEEPALIVE_SECS: u64 = 45;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub access_token: String,
    pub api_base: Option<String>,
    pub bind_addr: SocketAddr,
    pub listing_ttl: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_force_refresh: bool,
    pub concurrency: usize,
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
    pub fetch_retry_max_delay: Duration,
    pub fetch_retry_jitter: bool,
    pub range_chunk_bytes: u64,
    pub image: ImageSettings,
    pub video: VideoSettings,
    pub heic_writeback: bool,
    pub settings_path: PathBuf,
    pub keepalive_url: Option<String>,
    pub keepalive_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let access_token = std::env::var("DRIVE_ACCESS_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .context("DRIVE_ACCESS_TOKEN is not set")?;
        let api_base = read_string_env("DRIVE_API_BASE");
        let bind_addr = parse_bind_addr(read_string_env("MEDIA_BIND_ADDR"), read_string_env("PORT"))?;

        let listing_ttl = Duration::from_secs(read_u64_env(
            "MEDIA_LISTING_TTL_SECS",
            DEFAULT_LISTING_TTL_SECS,
        ));
        let reconcile_interval =
            Duration::from_secs(read_u64_env("MEDIA_RECONCILE_SECS", DEFAULT_RECONCILE_SECS));
        let reconcile_force_refresh = read_bool_env("MEDIA_RECONCILE_FORCE_REFRESH", false);
        let concurrency = read_u64_env("MEDIA_CONCURRENCY", DEFAULT_CONCURRENCY) as usize;
        let fetch_attempts =
            u32::try_from(read_u64_env("MEDIA_FETCH_RETRIES", DEFAULT_FETCH_RETRIES)).unwrap_or(u32::MAX);
        let fetch_retry_delay =
            Duration::from_millis(read_u64_env("MEDIA_FETCH_RETRY_MS", DEFAULT_FETCH_RETRY_MS));
        // Unset means every retry waits the same.
        let fetch_retry_max_delay = read_opt_u64_env("MEDIA_FETCH_RETRY_MAX_MS")
            .map(Duration::from_millis)
            .unwrap_or(fetch_retry_delay);
        let fetch_retry_jitter = read_bool_env("MEDIA_FETCH_RETRY_JITTER", false);
        let range_chunk_bytes = read_u64_env("MEDIA_RANGE_CHUNK_BYTES", DEFAULT_RANGE_CHUNK_BYTES);

        let image = ImageSettings {
            target: read_dimensions("MEDIA_IMAGE_WIDTH", "MEDIA_IMAGE_HEIGHT"),
            quality: read_u64_env("MEDIA_IMAGE_QUALITY", DEFAULT_IMAGE_QUALITY).min(100) as u8,
            heif_convert: tool_path(read_string_env("MEDIA_HEIF_CONVERT_PATH"), "heif-convert"),
        };
        let video = VideoSettings {
            target: read_dimensions("MEDIA_VIDEO_WIDTH", "MEDIA_VIDEO_HEIGHT"),
            preset: read_string_env("MEDIA_VIDEO_PRESET")
                .unwrap_or_else(|| DEFAULT_VIDEO_PRESET.to_string()),
            ffmpeg: tool_path(read_string_env("MEDIA_FFMPEG_PATH"), "ffmpeg"),
        };

        let heic_writeback = read_bool_env("MEDIA_HEIC_WRITEBACK", false);
        let settings_path = read_string_env("MEDIA_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let keepalive_url = read_string_env("MEDIA_KEEPALIVE_URL");
        let keepalive_interval =
            Duration::from_secs(read_u64_env("MEDIA_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS));

        Ok(Self {
            access_token,
            api_base,
            bind_addr,
            listing_ttl,
            reconcile_interval,
            reconcile_force_refresh,
            concurrency,
            fetch_attempts,
            fetch_retry_delay,
            fetch_retry_max_delay,
            fetch_retry_jitter,
            range_chunk_bytes,
            image,
            video,
            heic_writeback,
            settings_path,
            keepalive_url,
            keepalive_interval,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = Backoff::new(
            self.fetch_retry_delay,
            self.fetch_retry_max_delay,
            self.fetch_retry_jitter,
        );
        RetryPolicy::new(self.fetch_attempts, backoff)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    state: AppState,
    reconciler: Arc<Reconciler>,
}

impl DaemonRuntime {
    pub fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = match config.api_base.as_deref() {
            Some(base) => DriveClient::with_base_url(base, config.access_token.clone())
                .with_context(|| format!("invalid DRIVE_API_BASE {base}"))?,
            None => DriveClient::new(config.access_token.clone())
                .context("failed to build drive client")?,
        };
        let provider: Arc<dyn RemoteFileProvider> = Arc::new(DriveProvider::new(client));
        let transcoder: Arc<dyn Transcoder> = Arc::new(MediaTranscoder::new(
            config.image.clone(),
            config.video.clone(),
        ));
        Ok(Self::with_parts(config, provider, transcoder))
    }

    /// Wires the runtime around an existing provider and transcoder.
    pub fn with_parts(
        config: DaemonConfig,
        provider: Arc<dyn RemoteFileProvider>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let retry = config.retry_policy();
        let listing = Arc::new(ListingFetcher::new(
            Arc::clone(&provider),
            config.listing_ttl,
        ));
        let pipeline = TranscodePipeline::new(
            Arc::clone(&provider),
            transcoder,
            Arc::new(CacheStore::new()),
            config.concurrency,
        )
        .with_retry(retry)
        .with_heic_writeback(config.heic_writeback);
        let reconciler = Arc::new(
            Reconciler::new(Arc::clone(&listing), pipeline.clone())
                .with_force_refresh(config.reconcile_force_refresh),
        );
        let state = AppState {
            listing,
            pipeline,
            provider,
            settings: SettingsStore::new(config.settings_path.clone()),
            retry,
            range_chunk: config.range_chunk_bytes,
        };

        Self {
            config,
            state,
            reconciler,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// One reconciliation cycle, as used by `--once`.
    pub async fn run_once(&self) -> Option<CycleReport> {
        self.reconciler.run_cycle().await
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            bind = %self.config.bind_addr,
            concurrency = self.config.concurrency,
            reconcile_secs = self.config.reconcile_interval.as_secs(),
            image_target = ?self.config.image.target,
            video_target = ?self.config.video.target,
            heic_writeback = self.config.heic_writeback,
            "mediadrived starting"
        );

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(err) => warn!(error = %err, "failed waiting for shutdown signal"),
            }
            signal_token.cancel();
        });

        let reconcile_handle = tokio::spawn(reconcile_loop(
            Arc::clone(&self.reconciler),
            self.config.reconcile_interval,
            shutdown.clone(),
        ));
        let keepalive_handle = self.config.keepalive_url.clone().map(|url| {
            tokio::spawn(keepalive_loop(
                url,
                self.config.keepalive_interval,
                shutdown.clone(),
            ))
        });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_addr))?;
        info!(addr = %self.config.bind_addr, "http server listening");

        let server_token = shutdown.clone();
        let served = axum::serve(listener, server::router(self.state.clone()))
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
            .context("http server failed");

        shutdown.cancel();
        self.state.pipeline.close();
        signal_handle.abort();
        if let Err(err) = reconcile_handle.await {
            warn!(error = %err, "reconcile loop ended abnormally");
        }
        if let Some(handle) = keepalive_handle {
            handle.abort();
        }
        info!("mediadrived stopped");
        served
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
