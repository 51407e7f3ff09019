use mediadrive_core::DriveFile;
use serde::Serialize;

pub const JPEG_MIME: &str = "image/jpeg";
pub const MP4_MIME: &str = "video/mp4";

/// One file of the remote listing, as exposed by `GET /media-list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(skip)]
    pub md5_checksum: Option<String>,
}

impl RemoteEntry {
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::classify(&self.mime_type)
    }

    /// Lowercased file extension, falling back to one derived from the mime type.
    pub fn extension(&self) -> String {
        if let Some((stem, ext)) = self.name.rsplit_once('.')
            && !stem.is_empty()
            && !ext.is_empty()
        {
            return ext.to_ascii_lowercase();
        }
        match self.mime_type.as_str() {
            JPEG_MIME => "jpg".to_string(),
            MP4_MIME => "mp4".to_string(),
            other => other
                .split_once('/')
                .map(|(_, sub)| sub.to_ascii_lowercase())
                .unwrap_or_default(),
        }
    }
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            size: file.size.unwrap_or(0),
            md5_checksum: file.md5_checksum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    /// HEIC/HEIF stills, which need a JPEG conversion before anything else.
    HeifImage,
    Video,
}

impl MediaKind {
    /// `None` means the mime type is outside the accepted media set.
    pub fn classify(mime_type: &str) -> Option<Self> {
        let mime = mime_type.trim().to_ascii_lowercase();
        match mime.as_str() {
            "image/heic" | "image/heif" | "image/heic-sequence" | "image/heif-sequence" => {
                Some(MediaKind::HeifImage)
            }
            MP4_MIME => Some(MediaKind::Video),
            other if other.starts_with("image/") => Some(MediaKind::Image),
            _ => None,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::HeifImage)
    }
}

/// Processing rank by extension: cheap formats first, conversions last.
pub fn extension_priority(extension: &str) -> u8 {
    match extension {
        "jpg" | "jpeg" => 0,
        "png" => 1,
        "mp4" => 2,
        "heic" | "heif" => 3,
        _ => 4,
    }
}
