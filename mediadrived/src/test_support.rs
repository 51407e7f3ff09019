use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;

use crate::media::{JPEG_MIME, MP4_MIME, MediaKind, RemoteEntry};
use crate::provider::{ByteStream, ProviderError, RemoteFileProvider};
use crate::transcode::{Artifact, TranscodeError, Transcoder};

pub fn remote(id: &str, name: &str, mime_type: &str, size: u64) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        size,
        md5_checksum: None,
    }
}

/// In-memory remote store with scripted failures and call accounting.
#[derive(Default)]
pub struct FakeProvider {
    listing: Mutex<Vec<RemoteEntry>>,
    listing_error: Mutex<Option<ProviderError>>,
    files: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    fetch_delay: Mutex<Duration>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    range_calls: AtomicUsize,
    fetching: AtomicUsize,
    peak_fetching: AtomicUsize,
    trashed: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, String, Bytes)>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the listing and stores `name` bytes for every listed id.
    pub fn set_listing(&self, entries: Vec<RemoteEntry>) {
        {
            let mut files = self.files.lock();
            for entry in &entries {
                files
                    .entry(entry.id.clone())
                    .or_insert_with(|| Bytes::from(entry.name.clone().into_bytes()));
            }
        }
        *self.listing.lock() = entries;
        *self.listing_error.lock() = None;
    }

    pub fn fail_listing(&self, err: ProviderError) {
        *self.listing_error.lock() = Some(err);
    }

    pub fn put_file(&self, id: &str, bytes: impl Into<Bytes>) {
        self.files.lock().insert(id.to_string(), bytes.into());
    }

    /// Queues errors returned by the next fetches of `id`, one per call.
    pub fn fail_fetches(&self, id: &str, errors: impl IntoIterator<Item = ProviderError>) {
        self.failures
            .lock()
            .entry(id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn range_calls(&self) -> usize {
        self.range_calls.load(Ordering::SeqCst)
    }

    pub fn peak_fetching(&self) -> usize {
        self.peak_fetching.load(Ordering::SeqCst)
    }

    pub fn trashed(&self) -> Vec<String> {
        self.trashed.lock().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.uploads.lock().clone()
    }

    fn next_failure(&self, id: &str) -> Option<ProviderError> {
        self.failures.lock().get_mut(id).and_then(VecDeque::pop_front)
    }

    fn file(&self, id: &str) -> Result<Bytes, ProviderError> {
        self.files
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl RemoteFileProvider for FakeProvider {
    async fn list_files(&self, _query: &str) -> Result<Vec<RemoteEntry>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.listing_error.lock().clone() {
            return Err(err);
        }
        Ok(self.listing.lock().clone())
    }

    async fn get_bytes(&self, file_id: &str) -> Result<Bytes, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.fetching.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetching.fetch_max(now, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = match self.next_failure(file_id) {
            Some(err) => Err(err),
            None => self.file(file_id),
        };

        self.fetching.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, ProviderError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_failure(file_id) {
            return Err(err);
        }
        let bytes = self.file(file_id)?;
        let len = bytes.len() as u64;
        if start >= len {
            return Err(ProviderError::Rejected(format!("range {start}-{end} of {len}")));
        }
        let end = end.min(len - 1);
        let span = bytes.slice(start as usize..=end as usize);
        Ok(Box::pin(stream::iter([Ok(span)])))
    }

    async fn move_to_trash(&self, file_id: &str) -> Result<(), ProviderError> {
        self.trashed.lock().push(file_id.to_string());
        Ok(())
    }

    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, ProviderError> {
        let mut uploads = self.uploads.lock();
        uploads.push((name.to_string(), mime_type.to_string(), bytes));
        Ok(format!("uploaded-{}", uploads.len()))
    }
}

/// Transcoder that labels output with the target mime type and keeps the bytes.
#[derive(Default)]
pub struct FakeTranscoder {
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        entry: &RemoteEntry,
        kind: MediaKind,
        raw: Bytes,
    ) -> Result<Artifact, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().contains(&entry.id) {
            return Err(TranscodeError::Worker(format!("cannot decode {}", entry.name)));
        }
        let mime_type = if kind.is_image() { JPEG_MIME } else { MP4_MIME };
        Ok(Artifact {
            mime_type: mime_type.to_string(),
            converted: (kind == MediaKind::HeifImage).then(|| raw.clone()),
            bytes: raw,
        })
    }
}
