//! Upload preparation and asset URLs.
//!
//! Avatars are decoded, bounded, downscaled and re-encoded as JPEG before
//! upload, which also drops EXIF and other metadata. Gallery images are only
//! sniffed and size-checked. Both go to the server as `multipart/form-data`.

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::client::Body;
use crate::{AppError, ErrorKind};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const AVATAR_MAX_DIMENSION: u32 = 512;
pub const MAX_SOURCE_DIMENSION: u32 = 12_000;
pub const MAX_SOURCE_PIXELS: u64 = 48_000_000;
pub const AVATAR_JPEG_QUALITY: u8 = 85;

#[cfg(feature = "media")]
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("image too large: {width}x{height}, max {max_dimension} per side / {max_pixels} pixels")]
    ImageTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
        max_pixels: u64,
    },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("image task failed")]
    Aborted,
}

impl From<MediaError> for AppError {
    fn from(e: MediaError) -> Self {
        let message = match &e {
            MediaError::EmptyInput => "The selected file is empty.".to_string(),
            MediaError::InputTooLarge { max_size, .. } => {
                format!("Images must be smaller than {} MB.", max_size / (1024 * 1024))
            }
            MediaError::ImageTooLarge { .. } => "This image is too large to upload.".to_string(),
            MediaError::UnsupportedFormat | MediaError::Decode(_) => {
                "Please choose a JPEG, PNG, WebP or GIF image.".to_string()
            }
            MediaError::Encode(_) | MediaError::Aborted => {
                "The image could not be processed.".to_string()
            }
        };
        AppError::new(ErrorKind::Media, message).with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
    Gif,
}

impl ImageKind {
    /// Identifies an image by its magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(ImageKind::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageKind::Png),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageKind::Webp),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(ImageKind::Gif),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Webp => "image/webp",
            ImageKind::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Webp => "webp",
            ImageKind::Gif => "gif",
        }
    }
}

/// Bytes ready to attach to a multipart upload.
#[derive(Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    pub file_name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl std::fmt::Debug for PreparedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedImage")
            .field("len", &self.bytes.len())
            .field("kind", &self.kind)
            .field("file_name", &self.file_name)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl PreparedImage {
    /// Wraps the image as the single `field` of a multipart body.
    pub fn into_multipart(self, field: &str) -> Body {
        let mut form = Multipart::new();
        form.file(field, &self.file_name, self.kind.mime(), &self.bytes);
        form.into_body()
    }
}

fn check_size(bytes: &[u8]) -> Result<(), MediaError> {
    if bytes.is_empty() {
        return Err(MediaError::EmptyInput);
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(MediaError::InputTooLarge {
            size: bytes.len(),
            max_size: MAX_UPLOAD_BYTES,
        });
    }
    Ok(())
}

/// Size and format check for gallery uploads. Bytes are sent unchanged.
pub fn prepare_upload(bytes: Vec<u8>) -> Result<PreparedImage, MediaError> {
    check_size(&bytes)?;
    let kind = ImageKind::sniff(&bytes).ok_or(MediaError::UnsupportedFormat)?;
    Ok(PreparedImage {
        file_name: format!("{}.{}", Uuid::new_v4().simple(), kind.extension()),
        bytes,
        kind,
        width: None,
        height: None,
    })
}

/// Decodes, downscales to [`AVATAR_MAX_DIMENSION`] and re-encodes as JPEG
/// on the blocking pool.
#[instrument(skip(bytes), fields(input_size = bytes.len()))]
pub async fn prepare_avatar(bytes: Vec<u8>) -> Result<PreparedImage, MediaError> {
    let result = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime
            .spawn_blocking(move || prepare_avatar_sync(&bytes))
            .await
            .map_err(|_| MediaError::Aborted)?,
        Err(_) => prepare_avatar_sync(&bytes),
    };
    if let Err(e) = &result {
        warn!(error = %e, "avatar preparation failed");
    }
    result
}

#[cfg(feature = "media")]
pub fn prepare_avatar_sync(bytes: &[u8]) -> Result<PreparedImage, MediaError> {
    use image::imageops::FilterType;
    use image::GenericImageView;

    check_size(bytes)?;
    if ImageKind::sniff(bytes).is_none() {
        return Err(MediaError::UnsupportedFormat);
    }
    let img = decode_bounded(bytes)?;
    let (w, h) = img.dimensions();

    let img = if w > AVATAR_MAX_DIMENSION || h > AVATAR_MAX_DIMENSION {
        img.resize(AVATAR_MAX_DIMENSION, AVATAR_MAX_DIMENSION, FilterType::Triangle)
    } else {
        img
    };
    let encoded = encode_jpeg(&img)?;
    let (width, height) = img.dimensions();
    debug!(from = ?(w, h), to = ?(width, height), size = encoded.len(), "avatar prepared");

    Ok(PreparedImage {
        bytes: encoded,
        kind: ImageKind::Jpeg,
        file_name: format!("avatar-{}.jpg", Uuid::new_v4().simple()),
        width: Some(width),
        height: Some(height),
    })
}

/// Without an image codec the avatar is only checked and sent as-is.
#[cfg(not(feature = "media"))]
pub fn prepare_avatar_sync(bytes: &[u8]) -> Result<PreparedImage, MediaError> {
    let prepared = prepare_upload(bytes.to_vec())?;
    Ok(PreparedImage {
        file_name: format!("avatar-{}.{}", Uuid::new_v4().simple(), prepared.kind.extension()),
        ..prepared
    })
}

#[cfg(feature = "media")]
fn decode_bounded(bytes: &[u8]) -> Result<image::DynamicImage, MediaError> {
    use image::{GenericImageView, ImageReader, Limits};
    use std::io::Cursor;

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| MediaError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        return Err(MediaError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIMENSION);
    limits.max_image_height = Some(MAX_SOURCE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);
    reader.limits(limits);

    let img = reader.decode().map_err(|e| match e {
        image::ImageError::Limits(_) => MediaError::ImageTooLarge {
            width: 0,
            height: 0,
            max_dimension: MAX_SOURCE_DIMENSION,
            max_pixels: MAX_SOURCE_PIXELS,
        },
        image::ImageError::Unsupported(_) => MediaError::UnsupportedFormat,
        other => MediaError::Decode(other.to_string()),
    })?;

    let (w, h) = img.dimensions();
    if u64::from(w) * u64::from(h) > MAX_SOURCE_PIXELS {
        return Err(MediaError::ImageTooLarge {
            width: w,
            height: h,
            max_dimension: MAX_SOURCE_DIMENSION,
            max_pixels: MAX_SOURCE_PIXELS,
        });
    }
    Ok(img)
}

#[cfg(feature = "media")]
fn encode_jpeg(img: &image::DynamicImage) -> Result<Vec<u8>, MediaError> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, ImageEncoder};

    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(MediaError::Encode("zero dimension".into()));
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, AVATAR_JPEG_QUALITY)
        .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| MediaError::Encode(e.to_string()))?;
    Ok(out)
}

/// `multipart/form-data` body builder.
#[derive(Debug, Clone)]
pub struct Multipart {
    boundary: String,
    body: Vec<u8>,
}

impl Multipart {
    pub fn new() -> Self {
        Self {
            boundary: format!("----contacts-{}", Uuid::new_v4().simple()),
            body: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn open_part(&mut self, disposition: &str) {
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"\r\nContent-Disposition: form-data; ");
        self.body.extend_from_slice(disposition.as_bytes());
        self.body.extend_from_slice(b"\r\n");
    }

    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        self.open_part(&format!("name=\"{}\"", quote(name)));
        self.body.extend_from_slice(b"\r\n");
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(&mut self, name: &str, file_name: &str, content_type: &str, bytes: &[u8]) -> &mut Self {
        self.open_part(&format!(
            "name=\"{}\"; filename=\"{}\"",
            quote(name),
            quote(file_name)
        ));
        self.body.extend_from_slice(b"Content-Type: ");
        self.body.extend_from_slice(content_type.as_bytes());
        self.body.extend_from_slice(b"\r\n\r\n");
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn into_body(mut self) -> Body {
        self.body.extend_from_slice(b"--");
        self.body.extend_from_slice(self.boundary.as_bytes());
        self.body.extend_from_slice(b"--\r\n");
        Body::Raw {
            content_type: self.content_type(),
            bytes: self.body,
        }
    }
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

fn quote(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n'))
        .map(|c| if c == '"' { '\'' } else { c })
        .collect()
}

/// Absolute `http(s)` URLs pass through; anything else is a storage path
/// joined onto `asset_base`. Blank paths have no URL.
pub fn resolve_asset_url(path: Option<&str>, asset_base: &str) -> Option<String> {
    let path = path.map(str::trim).filter(|p| !p.is_empty())?;
    if path.starts_with("https://") || path.starts_with("http://") {
        return Some(path.to_string());
    }
    let joined = format!(
        "{}/{}",
        asset_base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    match url::Url::parse(&joined) {
        Ok(url) => Some(url.to_string()),
        Err(e) => {
            debug!(%path, error = %e, "asset path does not form a URL");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_recognises_common_formats() {
        assert_eq!(ImageKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(
            ImageKind::sniff(b"\x89PNG\r\n\x1a\n...."),
            Some(ImageKind::Png)
        );
        assert_eq!(ImageKind::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageKind::Webp));
        assert_eq!(ImageKind::sniff(b"GIF89a"), Some(ImageKind::Gif));
        assert_eq!(ImageKind::sniff(b"%PDF-1.7"), None);
        assert_eq!(ImageKind::sniff(&[]), None);
    }

    #[test]
    fn upload_rejects_empty_oversize_and_unknown() {
        assert!(matches!(prepare_upload(Vec::new()), Err(MediaError::EmptyInput)));
        let mut huge = vec![0xFF, 0xD8, 0xFF];
        huge.resize(MAX_UPLOAD_BYTES + 1, 0);
        assert!(matches!(
            prepare_upload(huge),
            Err(MediaError::InputTooLarge { .. })
        ));
        assert!(matches!(
            prepare_upload(b"hello".to_vec()),
            Err(MediaError::UnsupportedFormat)
        ));

        let ok = prepare_upload(b"GIF89a-rest".to_vec()).unwrap();
        assert_eq!(ok.kind, ImageKind::Gif);
        assert!(ok.file_name.ends_with(".gif"));
    }

    #[test]
    fn media_errors_carry_friendly_messages() {
        let err = AppError::from(MediaError::InputTooLarge {
            size: 11 * 1024 * 1024,
            max_size: MAX_UPLOAD_BYTES,
        });
        assert_eq!(err.kind, ErrorKind::Media);
        assert_eq!(err.user_facing_message(), "Images must be smaller than 10 MB.");
        assert!(err.internal_message.is_some());
    }

    #[test]
    fn multipart_layout() {
        let mut form = Multipart::new();
        form.text("caption", "hi").file("image", "a\".png", "image/png", b"PNGDATA");
        let boundary = form.boundary().to_string();
        let Body::Raw { bytes, content_type } = form.into_body() else {
            panic!("multipart must be raw");
        };
        assert_eq!(content_type, format!("multipart/form-data; boundary={boundary}"));

        let text = String::from_utf8(bytes).unwrap();
        let expected = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"caption\"\r\n\r\nhi\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a'.png\"\r\n\
             Content-Type: image/png\r\n\r\nPNGDATA\r\n--{b}--\r\n",
            b = boundary
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(Multipart::new().boundary(), Multipart::new().boundary());
    }

    #[test]
    fn asset_urls() {
        let base = "https://cdn.example.com/media/";
        assert_eq!(resolve_asset_url(None, base), None);
        assert_eq!(resolve_asset_url(Some("  "), base), None);
        assert_eq!(
            resolve_asset_url(Some("https://other.example/a.jpg"), base).as_deref(),
            Some("https://other.example/a.jpg")
        );
        assert_eq!(
            resolve_asset_url(Some("/avatars/1.jpg"), base).as_deref(),
            Some("https://cdn.example.com/media/avatars/1.jpg")
        );
        assert_eq!(
            resolve_asset_url(Some("avatars/1.jpg"), "https://cdn.example.com").as_deref(),
            Some("https://cdn.example.com/avatars/1.jpg")
        );
        assert_eq!(resolve_asset_url(Some("x.jpg"), "not a base"), None);
    }

    #[cfg(feature = "media")]
    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 40, 90]),
        ));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[cfg(feature = "media")]
    #[tokio::test]
    async fn avatar_is_downscaled_to_jpeg() {
        let prepared = prepare_avatar(png(1024, 600)).await.unwrap();
        assert_eq!(prepared.kind, ImageKind::Jpeg);
        assert_eq!(ImageKind::sniff(&prepared.bytes), Some(ImageKind::Jpeg));
        assert_eq!(prepared.width, Some(512));
        assert_eq!(prepared.height, Some(300));
    }

    #[cfg(feature = "media")]
    #[test]
    fn small_avatar_keeps_its_size() {
        let prepared = prepare_avatar_sync(&png(64, 48)).unwrap();
        assert_eq!((prepared.width, prepared.height), (Some(64), Some(48)));
    }

    #[cfg(feature = "media")]
    #[test]
    fn corrupt_avatar_fails_to_decode() {
        let mut bytes = png(8, 8);
        bytes.truncate(20);
        assert!(matches!(
            prepare_avatar_sync(&bytes),
            Err(MediaError::Decode(_))
        ));
    }
}
