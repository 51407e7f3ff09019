use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use mediadrive_core::{ApiErrorClass, DriveClient, DriveError};
use thiserror::Error;

use crate::media::RemoteEntry;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
    #[error("remote store is throttling requests: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl ProviderError {
    /// Transient failures are retried; everything else fails the attempt at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::Throttled { .. }
        )
    }

    /// Delay the remote asked for before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<DriveError> for ProviderError {
    fn from(err: DriveError) -> Self {
        if let Some(ApiErrorClass::RateLimit) = err.classification() {
            return ProviderError::Throttled {
                retry_after: err.retry_after_secs().map(Duration::from_secs),
                message: err.to_string(),
            };
        }
        if err.is_retryable() {
            return ProviderError::Unavailable(err.to_string());
        }
        match err.classification() {
            Some(ApiErrorClass::NotFound) => ProviderError::NotFound(err.to_string()),
            Some(_) => ProviderError::Rejected(err.to_string()),
            // Plain transport errors (DNS, TLS, reset) count as an unavailable remote.
            None if matches!(err, DriveError::Request(_)) => {
                ProviderError::Unavailable(err.to_string())
            }
            None => ProviderError::Rejected(err.to_string()),
        }
    }
}

/// Remote file store the cache reconciles against.
#[async_trait]
pub trait RemoteFileProvider: Send + Sync {
    async fn list_files(&self, query: &str) -> Result<Vec<RemoteEntry>, ProviderError>;

    async fn get_bytes(&self, file_id: &str) -> Result<Bytes, ProviderError>;

    /// Streams the inclusive span `start..=end`.
    async fn get_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, ProviderError>;

    async fn move_to_trash(&self, file_id: &str) -> Result<(), ProviderError>;

    /// Returns the id of the created file.
    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, ProviderError>;
}

pub struct DriveProvider {
    client: DriveClient,
}

impl DriveProvider {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFileProvider for DriveProvider {
    async fn list_files(&self, query: &str) -> Result<Vec<RemoteEntry>, ProviderError> {
        let files = self.client.list_files_all(query).await?;
        Ok(files.into_iter().map(RemoteEntry::from).collect())
    }

    async fn get_bytes(&self, file_id: &str) -> Result<Bytes, ProviderError> {
        Ok(self.client.download(file_id).await?)
    }

    async fn get_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, ProviderError> {
        let stream = self.client.download_range(file_id, start, end).await?;
        Ok(Box::pin(stream.map_err(ProviderError::from)))
    }

    async fn move_to_trash(&self, file_id: &str) -> Result<(), ProviderError> {
        self.client.trash_file(file_id).await?;
        Ok(())
    }

    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        bytes: Bytes,
    ) -> Result<String, ProviderError> {
        let file = self.client.upload_file(name, mime_type, bytes).await?;
        Ok(file.id)
    }
}
