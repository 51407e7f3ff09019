use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;
use tracing::debug;

use super::{Artifact, Dimensions, TranscodeError, path_arg, run_tool};
use crate::media::{MP4_MIME, RemoteEntry};

pub const DEFAULT_PRESET: &str = "veryfast";

#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// `None` stores videos as downloaded.
    pub target: Option<Dimensions>,
    pub preset: String,
    pub ffmpeg: PathBuf,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            target: None,
            preset: DEFAULT_PRESET.to_string(),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

pub async fn transcode(
    settings: &VideoSettings,
    entry: &RemoteEntry,
    raw: Bytes,
) -> Result<Artifact, TranscodeError> {
    let Some(target) = settings.target else {
        return Ok(Artifact::passthrough(entry, raw));
    };

    // Both files live in the tempdir and go away with it, on every path.
    let dir = TempDir::new()?;
    let input = dir.path().join("input.mp4");
    let output = dir.path().join("output.mp4");
    tokio::fs::write(&input, &raw).await?;

    let args = ffmpeg_args(&input, &output, target, &settings.preset);
    run_tool(&settings.ffmpeg, &args).await?;

    let bytes = Bytes::from(tokio::fs::read(&output).await?);
    debug!(
        file_id = %entry.id,
        input_bytes = raw.len(),
        output_bytes = bytes.len(),
        "video re-encoded"
    );
    Ok(Artifact {
        mime_type: MP4_MIME.to_string(),
        bytes,
        converted: None,
    })
}

/// Fit inside the target box keeping aspect ratio, then letterbox to exactly it.
pub fn scale_pad_filter(target: Dimensions) -> String {
    let Dimensions { width, height } = target;
    format!(
        "scale={width}:{height}:force_original_aspect_ratio=decrease,\
         pad={width}:{height}:(ow-iw)/2:(oh-ih)/2,setsar=1"
    )
}

pub fn ffmpeg_args(input: &Path, output: &Path, target: Dimensions, preset: &str) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-i",
    ]
    .into_iter()
    .map(String::from)
    .chain([path_arg(input)])
    .chain([
        "-vf".to_string(),
        scale_pad_filter(target),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        preset.to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_arg(output),
    ])
    .collect()
}
