use std::io::Cursor;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::utils::http::get_http_client;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    #[error("file is too large ({size} bytes, limit {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
    #[error("download failed: {0}")]
    Download(String),
    #[error("unsupported file type: {0}")]
    Unsupported(String),
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Document,
}

pub fn kind_for_mime(mime_type: &str) -> MediaKind {
    if mime_type.starts_with("image/") {
        MediaKind::Image
    } else if mime_type.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub kind: MediaKind,
    pub display_name: Option<String>,
}

impl MediaFile {
    /// Builds a file from downloaded bytes, trusting the sniffed type over the
    /// one Telegram reported.
    pub fn from_download(
        bytes: Vec<u8>,
        reported_mime: Option<&str>,
        display_name: Option<String>,
    ) -> Self {
        let mime_type = detect_mime_type(&bytes)
            .or_else(|| reported_mime.map(|mime| mime.to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mime_type = normalize_gemini_mime_type(&mime_type);
        Self {
            kind: kind_for_mime(&mime_type),
            bytes,
            mime_type,
            display_name,
        }
    }
}

pub fn normalize_gemini_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        "audio/mpeg" => "audio/mp3".to_string(),
        "audio/x-wav" => "audio/wav".to_string(),
        "audio/opus" => "audio/ogg".to_string(),
        "text/x-python" | "application/x-python-code" => "text/x-python".to_string(),
        _ => lowered,
    }
}

/// Types Gemini accepts as inline data for the given kind.
pub fn gemini_supports_mime(kind: MediaKind, mime_type: &str) -> bool {
    match kind {
        MediaKind::Image => matches!(
            mime_type,
            "image/png" | "image/jpeg" | "image/webp" | "image/heic" | "image/heif"
        ),
        MediaKind::Audio => matches!(
            mime_type,
            "audio/wav" | "audio/mp3" | "audio/aiff" | "audio/aac" | "audio/ogg" | "audio/flac"
        ),
        MediaKind::Document => {
            mime_type == "application/pdf"
                || mime_type.starts_with("text/")
                || matches!(
                    mime_type,
                    "application/json" | "application/xml" | "application/x-javascript"
                )
        }
    }
}

/// Validates a file for inline upload. Images in formats Gemini rejects are
/// decoded and re-encoded as PNG.
pub fn prepare_for_gemini(file: MediaFile) -> Result<MediaFile, AttachmentError> {
    if gemini_supports_mime(file.kind, &file.mime_type) {
        return Ok(file);
    }
    if file.kind != MediaKind::Image {
        return Err(AttachmentError::Unsupported(file.mime_type));
    }

    let decoded = image::load_from_memory(&file.bytes)
        .map_err(|err| AttachmentError::Unsupported(format!("{} ({err})", file.mime_type)))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|err| AttachmentError::Unsupported(format!("{} ({err})", file.mime_type)))?;
    debug!(
        from = %file.mime_type,
        width = decoded.width(),
        height = decoded.height(),
        "Re-encoded image as PNG"
    );

    Ok(MediaFile {
        bytes: png,
        mime_type: "image/png".to_string(),
        kind: MediaKind::Image,
        display_name: file.display_name,
    })
}

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;
const MEDIA_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Downloads `url`, retrying transient failures and refusing bodies over `max_bytes`.
/// `log_label` stands in for the URL in logs since Telegram file URLs embed the bot token.
pub async fn download_media(
    url: &str,
    log_label: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, AttachmentError> {
    let client = get_http_client();
    let mut last_error = String::new();

    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let delay = Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt);
        let response = match client.get(url).timeout(MEDIA_DOWNLOAD_TIMEOUT).send().await {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to fetch media {log_label}: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = err.to_string();
                if !should_retry_error(&err) || attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed for {log_label} with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            last_error = format!("HTTP {status}");
            if !should_retry_status(status) || attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS {
                break;
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(AttachmentError::TooLarge {
                    size: length,
                    limit: max_bytes,
                });
            }
        }

        match response.bytes().await {
            Ok(bytes) => {
                if bytes.len() as u64 > max_bytes {
                    return Err(AttachmentError::TooLarge {
                        size: bytes.len() as u64,
                        limit: max_bytes,
                    });
                }
                return Ok(bytes.to_vec());
            }
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to read media bytes {log_label}: {err} (attempt={}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = err.to_string();
                if attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(AttachmentError::Download(last_error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 10, 10]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn sniffed_type_wins_over_reported_type() {
        let file = MediaFile::from_download(tiny_png(), Some("application/octet-stream"), None);
        assert_eq!(file.mime_type, "image/png");
        assert_eq!(file.kind, MediaKind::Image);
    }

    #[test]
    fn reported_type_is_used_for_plain_text() {
        let file = MediaFile::from_download(
            b"fn main() {}".to_vec(),
            Some("text/x-rust"),
            Some("main.rs".to_string()),
        );
        assert_eq!(file.mime_type, "text/x-rust");
        assert_eq!(file.kind, MediaKind::Document);
        assert!(prepare_for_gemini(file).is_ok());
    }

    #[test]
    fn voice_notes_map_to_ogg() {
        assert_eq!(normalize_gemini_mime_type("audio/opus"), "audio/ogg");
        assert!(gemini_supports_mime(MediaKind::Audio, "audio/ogg"));
    }

    #[test]
    fn unsupported_documents_are_rejected() {
        let file = MediaFile {
            bytes: vec![0x50, 0x4b, 0x03, 0x04],
            mime_type: "application/zip".to_string(),
            kind: MediaKind::Document,
            display_name: None,
        };
        assert_eq!(
            prepare_for_gemini(file).unwrap_err(),
            AttachmentError::Unsupported("application/zip".to_string())
        );
    }

    #[test]
    fn odd_image_formats_are_reencoded_as_png() {
        let file = MediaFile {
            bytes: tiny_png(),
            mime_type: "image/x-unknown".to_string(),
            kind: MediaKind::Image,
            display_name: None,
        };
        let prepared = prepare_for_gemini(file).unwrap();
        assert_eq!(prepared.mime_type, "image/png");
        assert_eq!(detect_mime_type(&prepared.bytes).as_deref(), Some("image/png"));
    }
}
