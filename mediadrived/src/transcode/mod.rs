pub mod image;
pub mod video;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::process::Command;

use crate::media::{MediaKind, RemoteEntry};

pub use self::image::ImageSettings;
pub use self::video::VideoSettings;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("image codec error: {0}")]
    Image(#[from] ::image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("transcode worker failed: {0}")]
    Worker(String),
}

/// Target box for resized output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Both sides must be set and non-zero, otherwise there is no target.
    pub fn from_parts(width: Option<u64>, height: Option<u64>) -> Option<Self> {
        let width = u32::try_from(width?).ok().filter(|w| *w > 0)?;
        let height = u32::try_from(height?).ok().filter(|h| *h > 0)?;
        Some(Self { width, height })
    }
}

/// Final bytes for one cache entry.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub mime_type: String,
    pub bytes: Bytes,
    /// Full-quality JPEG produced from a HEIC/HEIF source, before any resize.
    pub converted: Option<Bytes>,
}

impl Artifact {
    pub fn passthrough(entry: &RemoteEntry, bytes: Bytes) -> Self {
        Self {
            mime_type: entry.mime_type.clone(),
            bytes,
            converted: None,
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        entry: &RemoteEntry,
        kind: MediaKind,
        raw: Bytes,
    ) -> Result<Artifact, TranscodeError>;
}

/// Converts images in-process and videos through ffmpeg.
#[derive(Debug, Clone)]
pub struct MediaTranscoder {
    image: ImageSettings,
    video: VideoSettings,
}

impl MediaTranscoder {
    pub fn new(image: ImageSettings, video: VideoSettings) -> Self {
        Self { image, video }
    }
}

#[async_trait]
impl Transcoder for MediaTranscoder {
    async fn transcode(
        &self,
        entry: &RemoteEntry,
        kind: MediaKind,
        raw: Bytes,
    ) -> Result<Artifact, TranscodeError> {
        match kind {
            MediaKind::Image | MediaKind::HeifImage => {
                self::image::transcode(&self.image, entry, kind, raw).await
            }
            MediaKind::Video => self::video::transcode(&self.video, entry, raw).await,
        }
    }
}

/// Runs an external converter to completion, turning a non-zero exit into an error
/// that carries the tail of its stderr.
pub(crate) async fn run_tool(program: &Path, args: &[String]) -> Result<(), TranscodeError> {
    let program_name = program.display().to_string();
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TranscodeError::Spawn {
            program: program_name.clone(),
            source,
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    Err(TranscodeError::Command {
        program: program_name,
        status: output.status.to_string(),
        stderr: tail,
    })
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn tool_path(value: Option<String>, fallback: &str) -> PathBuf {
    value
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}
