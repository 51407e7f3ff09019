use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,md5Checksum)";
const DEFAULT_PAGE_SIZE: u32 = 1000;
const MULTIPART_BOUNDARY: &str = "mediadrive-upload-boundary";

/// Drive query selecting every image plus mp4 videos.
pub const MEDIA_QUERY: &str = "mimeType contains 'image/' or mimeType = 'video/mp4'";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DriveError>> + Send>>;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("range request for {file_id} was answered with the full body")]
    RangeNotHonored { file_id: String },
    #[error("failed to encode upload metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_files(
        &self,
        query: &str,
        page_size: Option<u32>,
        page_token: Option<&str>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("fields", LIST_FIELDS)
                .append_pair(
                    "pageSize",
                    &page_size.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
                );
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_files_all(&self, query: &str) -> Result<Vec<DriveFile>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_files(query, Some(DEFAULT_PAGE_SIZE), page_token.as_deref())
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    pub async fn download(&self, file_id: &str) -> Result<Bytes, DriveError> {
        let response = self
            .http
            .get(self.media_url(file_id)?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?)
    }

    /// Streams the inclusive byte span `start..=end` of a file.
    pub async fn download_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, DriveError> {
        let response = self
            .http
            .get(self.media_url(file_id)?)
            .bearer_auth(&self.token)
            .header(header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DriveError::RangeNotHonored {
                file_id: file_id.to_string(),
            });
        }
        Ok(Box::pin(response.bytes_stream().map_err(DriveError::from)))
    }

    pub async fn trash_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files", file_id])?;
        url.query_pairs_mut().append_pair("fields", "id,name,mimeType,size");
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "trashed": true }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_file(
        &self,
        name: &str,
        mime_type: &str,
        body: Bytes,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint(&["upload", "drive", "v3", "files"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "multipart")
            .append_pair("fields", "id,name,mimeType,size");
        let metadata = serde_json::to_vec(&UploadMetadata { name, mime_type })?;
        let payload = multipart_related_body(&metadata, mime_type, &body);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn media_url(&self, file_id: &str) -> Result<Url, DriveError> {
        let mut url = self.endpoint(&["drive", "v3", "files", file_id])?;
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DriveError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api {
            status,
            body,
            retry_after,
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Network-level failures and throttling are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriveError::Request(err) => err.is_timeout() || err.is_connect() || err.is_body(),
            DriveError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
            _ => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|delay| delay.as_secs())
            .unwrap_or(0),
    )
}

fn multipart_related_body(metadata: &[u8], mime_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(metadata.len() + body.len() + 256);
    out.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    out.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    out.extend_from_slice(metadata);
    out.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    out
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Drive reports sizes as decimal strings; absent for native Docs files.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadMetadata<'a> {
    name: &'a str,
    mime_type: &'a str,
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(value)) => Ok(Some(value)),
        Some(Size::Text(text)) => text
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
