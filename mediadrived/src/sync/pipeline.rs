use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::cache::{CacheEntry, CacheStore, Claim, EntryState, PendingGuard};
use super::queue::TranscodeQueue;
use crate::media::{JPEG_MIME, MediaKind, RemoteEntry};
use crate::provider::{ProviderError, RemoteFileProvider};
use crate::transcode::Transcoder;

pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("unsupported media type {0}")]
    Unsupported(String),
    #[error(transparent)]
    Remote(#[from] ProviderError),
    #[error("transcode failed: {0}")]
    Transcode(String),
    #[error("checksum mismatch for {file_id}: expected {expected}, got {actual}")]
    Integrity {
        file_id: String,
        expected: String,
        actual: String,
    },
    #[error("earlier attempt failed: {0}")]
    Failed(String),
    #[error("{0} was evicted while in flight")]
    Evicted(String),
    #[error("transcode pipeline is shut down")]
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Ids already ready or in flight elsewhere, or evicted before completion.
    pub skipped: usize,
}

/// Fetch + transcode workers bounded by one semaphore shared with on-demand
/// requests.
#[derive(Clone)]
pub struct TranscodePipeline {
    provider: Arc<dyn RemoteFileProvider>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<CacheStore>,
    limit: Arc<Semaphore>,
    retry: RetryPolicy,
    heic_writeback: bool,
}

impl TranscodePipeline {
    pub fn new(
        provider: Arc<dyn RemoteFileProvider>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<CacheStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            transcoder,
            store,
            limit: Arc::new(Semaphore::new(concurrency.clamp(1, Semaphore::MAX_PERMITS))),
            retry: RetryPolicy::default(),
            heic_writeback: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heic_writeback(mut self, enabled: bool) -> Self {
        self.heic_writeback = enabled;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn available_permits(&self) -> usize {
        self.limit.available_permits()
    }

    /// Stops admitting work; running tasks finish, waiting ones get [`PipelineError::Closed`].
    pub fn close(&self) {
        self.limit.close();
    }

    /// Materializes every entry, at most `concurrency` at a time. Permits are taken
    /// in queue order, so work starts cheapest format first.
    pub async fn run_batch(&self, entries: Vec<RemoteEntry>) -> BatchReport {
        let mut queue = TranscodeQueue::from_entries(entries);
        let mut report = BatchReport::default();
        let mut tasks = JoinSet::new();

        while let Ok(entry) = queue.dequeue() {
            let Some(kind) = entry.kind() else {
                debug!(file_id = %entry.id, mime_type = %entry.mime_type, "skipping unsupported format");
                report.skipped += 1;
                continue;
            };
            let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await else {
                warn!(remaining = queue.len() + 1, "pipeline closed, abandoning batch");
                break;
            };
            let guard = match self.store.claim(&entry.id) {
                Claim::Claimed(guard) => guard,
                Claim::Ready(_) | Claim::InFlight(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            let pipeline = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.materialize(entry, kind, guard).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => report.succeeded += 1,
                Ok(Err(PipelineError::Evicted(_))) => report.skipped += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(err) => {
                    warn!(error = %err, "transcode task panicked");
                    report.failed += 1;
                }
            }
        }

        if report != BatchReport::default() {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "batch finished"
            );
        }
        report
    }

    /// On-demand path: returns the ready entry, waits for an in-flight one, or
    /// materializes it under the shared bound.
    pub async fn ensure(&self, entry: &RemoteEntry) -> Result<CacheEntry, PipelineError> {
        let kind = entry
            .kind()
            .ok_or_else(|| PipelineError::Unsupported(entry.mime_type.clone()))?;
        loop {
            match self.store.claim(&entry.id) {
                Claim::Ready(ready) => return Ok(ready),
                Claim::InFlight(waiter) => {
                    waiter.wait().await;
                    match self.store.get(&entry.id) {
                        Some(EntryState::Ready(ready)) => return Ok(ready),
                        Some(EntryState::Failed(reason)) => {
                            return Err(PipelineError::Failed(reason));
                        }
                        // Re-claimed by someone else in the meantime.
                        Some(EntryState::Pending) => continue,
                        None => return Err(PipelineError::Evicted(entry.id.clone())),
                    }
                }
                Claim::Claimed(guard) => {
                    let Ok(_permit) = self.limit.acquire().await else {
                        guard.fail("pipeline closed");
                        return Err(PipelineError::Closed);
                    };
                    return self.materialize(entry.clone(), kind, guard).await;
                }
            }
        }
    }

    async fn materialize(
        &self,
        entry: RemoteEntry,
        kind: MediaKind,
        guard: PendingGuard,
    ) -> Result<CacheEntry, PipelineError> {
        match self.produce(&entry, kind).await {
            Ok(ready) => {
                if guard.complete(ready.clone()) {
                    debug!(file_id = %entry.id, name = %entry.name, bytes = ready.bytes.len(), "cached");
                    Ok(ready)
                } else {
                    debug!(file_id = %entry.id, "discarding result for evicted entry");
                    Err(PipelineError::Evicted(entry.id))
                }
            }
            Err(err) => {
                warn!(file_id = %entry.id, name = %entry.name, error = %err, "failed to prepare media");
                guard.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn produce(
        &self,
        entry: &RemoteEntry,
        kind: MediaKind,
    ) -> Result<CacheEntry, PipelineError> {
        let raw = self
            .retry
            .run(&entry.id, || self.provider.get_bytes(&entry.id))
            .await?;
        verify_checksum(entry, &raw)?;

        let artifact = self
            .transcoder
            .transcode(entry, kind, raw)
            .await
            .map_err(|err| PipelineError::Transcode(err.to_string()))?;

        if self.heic_writeback
            && kind == MediaKind::HeifImage
            && let Some(jpeg) = &artifact.converted
        {
            self.write_back(entry, jpeg.clone()).await;
        }

        Ok(CacheEntry {
            id: entry.id.clone(),
            mime_type: artifact.mime_type,
            bytes: artifact.bytes,
        })
    }

    /// Replaces a HEIC original with its JPEG conversion in the remote store.
    /// Failures are logged; the cached artifact is unaffected.
    async fn write_back(&self, entry: &RemoteEntry, jpeg: Bytes) {
        let name = jpeg_name(&entry.name);
        match self.provider.upload(&name, JPEG_MIME, jpeg).await {
            Ok(new_id) => {
                info!(file_id = %entry.id, %new_id, name = %name, "uploaded converted jpeg");
                if let Err(err) = self.provider.move_to_trash(&entry.id).await {
                    warn!(file_id = %entry.id, error = %err, "failed to trash heic original");
                }
            }
            Err(err) => {
                warn!(file_id = %entry.id, name = %entry.name, error = %err, "failed to upload converted jpeg");
            }
        }
    }
}

fn verify_checksum(entry: &RemoteEntry, raw: &[u8]) -> Result<(), PipelineError> {
    let Some(expected) = entry.md5_checksum.as_deref() else {
        return Ok(());
    };
    let actual = format!("{:x}", md5::compute(raw));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PipelineError::Integrity {
            file_id: entry.id.clone(),
            expected: expected.to_string(),
            actual,
        })
    }
}

fn jpeg_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{stem}.jpg"),
        _ => format!("{name}.jpg"),
    }
}
