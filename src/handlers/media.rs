use teloxide::prelude::*;
use teloxide::types::{FileMeta, PhotoSize};
use tracing::warn;

use crate::config::CONFIG;
use crate::llm::media::{download_media, prepare_for_gemini, AttachmentError, MediaFile};

/// Largest rendition of the photo attached to `message`, if any.
pub fn largest_photo(message: &Message) -> Option<&PhotoSize> {
    message.photo()?.last()
}

async fn get_file_url(bot: &Bot, file: &FileMeta) -> Result<String, AttachmentError> {
    let file = bot.get_file(file.id.clone()).await.map_err(|err| {
        warn!("get_file failed: {err}");
        AttachmentError::Download(err.to_string())
    })?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    ))
}

/// Downloads a Telegram file and checks it can be sent to Gemini inline.
pub async fn fetch_attachment(
    bot: &Bot,
    file: &FileMeta,
    reported_mime: Option<&str>,
    display_name: Option<String>,
) -> Result<MediaFile, AttachmentError> {
    let limit = CONFIG.max_attachment_bytes;
    let declared = u64::from(file.size);
    if declared > limit {
        return Err(AttachmentError::TooLarge {
            size: declared,
            limit,
        });
    }

    let url = get_file_url(bot, file).await?;
    let label = format!("file={:?}", file.unique_id);
    let bytes = download_media(&url, &label, limit).await?;
    prepare_for_gemini(MediaFile::from_download(bytes, reported_mime, display_name))
}

pub async fn fetch_photo(bot: &Bot, photo: &PhotoSize) -> Result<MediaFile, AttachmentError> {
    fetch_attachment(bot, &photo.file, Some("image/jpeg"), None).await
}
