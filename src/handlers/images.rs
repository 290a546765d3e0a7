use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, MessageId, ReplyParameters};
use tracing::{error, info, warn};

use crate::config::messages;
use crate::handlers::chat::attachment_error_text;
use crate::handlers::media::{fetch_photo, largest_photo};
use crate::handlers::responses::{reply_markdown, reply_text, show_error, TelegramMessage};
use crate::llm::gemini::{generate_image, ImageGenerationError, ImageResponse};
use crate::relay::{finish, send_formatted, MessageTarget, RelayOptions};
use crate::state::AppState;
use crate::store::UsageKind;
use crate::utils::markdown::escape_markdown_v2;
use crate::utils::telegram::{user_key, ChatActionHeartbeat};
use crate::utils::timing::{complete_command_timer, start_command_timer};

const CAPTION_LIMIT: usize = 1024;
const CAPTION_PROMPT_CHARS: usize = 100;

/// Prompt of a photo caption of the form `/edit <prompt>`.
pub fn caption_edit_prompt(caption: &str) -> Option<&str> {
    let trimmed = caption.trim_start();
    let (command, rest) = trimmed
        .split_once(char::is_whitespace)
        .unwrap_or((trimmed, ""));
    let command = command.split('@').next().unwrap_or(command);
    command
        .eq_ignore_ascii_case("/edit")
        .then(|| rest.trim())
}

fn generated_caption(prompt: &str) -> String {
    let prompt: String = prompt.chars().take(CAPTION_PROMPT_CHARS).collect();
    truncate_caption(format!("{} {}", messages::IMAGE_GENERATED_CAPTION, prompt))
}

fn truncate_caption(caption: String) -> String {
    if caption.chars().count() <= CAPTION_LIMIT {
        caption
    } else {
        caption.chars().take(CAPTION_LIMIT).collect()
    }
}

/// Where generated photos go: replies to the request, plus removal of the
/// progress message once they are out.
#[async_trait]
trait PhotoReply: Send + Sync {
    async fn send_photo(&self, image: Vec<u8>, caption: Option<String>) -> Result<()>;
    async fn delete_progress(&self);
}

struct TelegramPhotoReply<'a> {
    bot: &'a Bot,
    request: &'a Message,
    progress: MessageId,
}

#[async_trait]
impl PhotoReply for TelegramPhotoReply<'_> {
    async fn send_photo(&self, image: Vec<u8>, caption: Option<String>) -> Result<()> {
        let mut request = self
            .bot
            .send_photo(self.request.chat.id, InputFile::memory(image))
            .reply_parameters(ReplyParameters::new(self.request.id));
        if let Some(caption) = caption {
            request = request.caption(caption);
        }
        request.await?;
        Ok(())
    }

    async fn delete_progress(&self) {
        if let Err(err) = self.bot.delete_message(self.request.chat.id, self.progress).await {
            warn!("Failed to delete progress message: {err}");
        }
    }
}

/// Delivers an image response: photos as replies, model text after them.
/// The progress message is removed when photos were sent, otherwise it
/// carries the text. When a photo cannot be sent the progress message shows
/// the error and the error is returned.
async fn deliver_image_response(
    reply: &dyn PhotoReply,
    progress: &dyn MessageTarget,
    response: ImageResponse,
    caption: &str,
) -> Result<usize> {
    let ImageResponse { images, text } = response;
    if images.is_empty() {
        let body = format!("{}\n{}", messages::IMAGE_TEXT_ONLY, text.trim());
        finish(progress, &body, &RelayOptions::from_config()).await;
        return Ok(0);
    }

    let mut sent = 0;
    for image in images {
        let caption = (sent == 0).then(|| caption.to_string());
        if let Err(err) = reply.send_photo(image, caption).await {
            show_error(progress, &format!("{err:#}")).await;
            return Err(err.context(format!("sending photo {} failed", sent + 1)));
        }
        sent += 1;
    }
    if !text.trim().is_empty() {
        send_formatted(progress, text.trim()).await;
    }
    reply.delete_progress().await;
    Ok(sent)
}

async fn report_image_error(progress: &TelegramMessage, err: &ImageGenerationError) {
    match err {
        ImageGenerationError::Empty => {
            progress.show_error(messages::IMAGE_NOTHING).await;
        }
        ImageGenerationError::Request(detail) => progress.show_error(detail).await,
    }
}

pub async fn img_handler(bot: Bot, state: AppState, message: Message, prompt: String) -> Result<()> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        reply_markdown(&bot, &message, &escape_markdown_v2(messages::ADD_PROMPT_IMG)).await?;
        return Ok(());
    }
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("img", &message);

    let progress_message = reply_text(&bot, &message, messages::DRAWING_IN_PROGRESS).await?;
    let progress = TelegramMessage::from_message(&bot, &progress_message);
    let _upload = ChatActionHeartbeat::start(bot.clone(), message.chat.id, ChatAction::UploadPhoto);

    let reply = TelegramPhotoReply {
        bot: &bot,
        request: &message,
        progress: progress.message_id(),
    };
    let delivered = match generate_image(prompt, None).await {
        Ok(response) => {
            deliver_image_response(&reply, &progress, response, &generated_caption(prompt)).await
        }
        Err(err) => {
            error!(user_id = %user_id, "Image generation failed: {err}");
            report_image_error(&progress, &err).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };
    match delivered {
        Ok(sent) => {
            if sent > 0 {
                state.store.record_usage(&user_id, UsageKind::GeneratedImage);
                state.store.persist_in_background();
            }
            info!(user_id = %user_id, images = sent, "Image generated");
            complete_command_timer(&mut timer, "success", Some(format!("images={sent}")));
        }
        Err(err) => {
            error!(user_id = %user_id, "Generated image could not be sent: {err:#}");
            complete_command_timer(&mut timer, "error", Some(format!("{err:#}")));
        }
    }
    Ok(())
}

/// Edits the photo attached to `message`, or the photo it replies to.
pub async fn edit_handler(bot: Bot, state: AppState, message: Message, prompt: String) -> Result<()> {
    let photo = largest_photo(&message)
        .or_else(|| message.reply_to_message().and_then(largest_photo))
        .cloned();
    let Some(photo) = photo else {
        reply_text(&bot, &message, messages::PHOTO_EDIT_PROMPT).await?;
        return Ok(());
    };
    let prompt = prompt.trim();
    if prompt.is_empty() {
        reply_markdown(&bot, &message, &escape_markdown_v2(messages::EDIT_PROMPT_NEEDED)).await?;
        return Ok(());
    }
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("edit", &message);

    let progress_message = reply_text(&bot, &message, messages::EDITING_IN_PROGRESS).await?;
    let progress = TelegramMessage::from_message(&bot, &progress_message);
    let _upload = ChatActionHeartbeat::start(bot.clone(), message.chat.id, ChatAction::UploadPhoto);

    let source = match fetch_photo(&bot, &photo).await {
        Ok(source) => source,
        Err(err) => {
            warn!(user_id = %user_id, "Photo to edit could not be used: {err}");
            progress.show_error(&attachment_error_text(&err)).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };

    let reply = TelegramPhotoReply {
        bot: &bot,
        request: &message,
        progress: progress.message_id(),
    };
    let delivered = match generate_image(prompt, Some(&source)).await {
        Ok(response) => {
            deliver_image_response(&reply, &progress, response, messages::IMAGE_RESULT_CAPTION)
                .await
        }
        Err(err) => {
            error!(user_id = %user_id, "Image edit failed: {err}");
            report_image_error(&progress, &err).await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };
    match delivered {
        Ok(sent) => {
            if sent > 0 {
                state.store.record_usage(&user_id, UsageKind::EditedImage);
                state.store.persist_in_background();
            }
            info!(user_id = %user_id, images = sent, "Image edited");
            complete_command_timer(&mut timer, "success", Some(format!("images={sent}")));
        }
        Err(err) => {
            error!(user_id = %user_id, "Edited image could not be sent: {err:#}");
            complete_command_timer(&mut timer, "error", Some(format!("{err:#}")));
        }
    }
    Ok(())
}
