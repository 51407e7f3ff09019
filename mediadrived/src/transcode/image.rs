use std::path::PathBuf;

use bytes::Bytes;
use image::ColorType;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tempfile::TempDir;
use tracing::debug;

use super::{Artifact, Dimensions, TranscodeError, path_arg, run_tool};
use crate::media::{JPEG_MIME, MediaKind, RemoteEntry};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone)]
pub struct ImageSettings {
    /// `None` stores images as downloaded (HEIC still becomes JPEG).
    pub target: Option<Dimensions>,
    pub quality: u8,
    pub heif_convert: PathBuf,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            target: None,
            quality: DEFAULT_JPEG_QUALITY,
            heif_convert: PathBuf::from("heif-convert"),
        }
    }
}

pub async fn transcode(
    settings: &ImageSettings,
    entry: &RemoteEntry,
    kind: MediaKind,
    raw: Bytes,
) -> Result<Artifact, TranscodeError> {
    let converted = if kind == MediaKind::HeifImage {
        Some(heif_to_jpeg(settings, raw.clone()).await?)
    } else {
        None
    };

    let Some(target) = settings.target else {
        return Ok(match converted {
            Some(jpeg) => Artifact {
                mime_type: JPEG_MIME.to_string(),
                bytes: jpeg.clone(),
                converted: Some(jpeg),
            },
            None => Artifact::passthrough(entry, raw),
        });
    };

    let source = converted.clone().unwrap_or(raw);
    let quality = settings.quality;
    let bytes = tokio::task::spawn_blocking(move || resize_to_jpeg(&source, target, quality))
        .await
        .map_err(|err| TranscodeError::Worker(err.to_string()))??;
    debug!(
        file_id = %entry.id,
        width = target.width,
        height = target.height,
        bytes = bytes.len(),
        "image resized"
    );

    Ok(Artifact {
        mime_type: JPEG_MIME.to_string(),
        bytes,
        converted,
    })
}

/// Crop-to-cover resize into `target`, re-encoded as JPEG.
pub fn resize_to_jpeg(
    raw: &[u8],
    target: Dimensions,
    quality: u8,
) -> Result<Bytes, TranscodeError> {
    let img = image::load_from_memory(raw)?;
    let filled = img.resize_to_fill(target.width, target.height, FilterType::Lanczos3);
    let rgb = filled.to_rgb8();

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8.into())?;
    Ok(Bytes::from(out))
}

async fn heif_to_jpeg(settings: &ImageSettings, raw: Bytes) -> Result<Bytes, TranscodeError> {
    let dir = TempDir::new()?;
    let input = dir.path().join("input.heic");
    let output = dir.path().join("output.jpg");
    tokio::fs::write(&input, &raw).await?;

    let args = vec![
        "-q".to_string(),
        "100".to_string(),
        path_arg(&input),
        path_arg(&output),
    ];
    run_tool(&settings.heif_convert, &args).await?;

    let jpeg = tokio::fs::read(&output).await?;
    Ok(Bytes::from(jpeg))
}
