use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ReplyParameters};
use teloxide::{ApiError, RequestError};
use tracing::warn;

use crate::config::messages;
use crate::relay::{EditError, MessageTarget, RenderMode};
use crate::utils::markdown::markdown_v2_to_plain;

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;
const ERROR_DETAIL_LIMIT: usize = 300;

impl From<RequestError> for EditError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Api(ApiError::MessageNotModified) => EditError::NotModified,
            RequestError::Api(ApiError::CantParseEntities(detail)) => EditError::Markup(detail),
            RequestError::Api(ApiError::MessageIsTooLong) => {
                EditError::Markup("message is too long".to_string())
            }
            other => {
                let text = other.to_string();
                let lowered = text.to_lowercase();
                if lowered.contains("message is not modified") {
                    EditError::NotModified
                } else if lowered.contains("can't parse entities") {
                    EditError::Markup(text)
                } else {
                    EditError::Other(text)
                }
            }
        }
    }
}

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn wait_before_retry(err: &RequestError, delay: &mut Duration) {
    if let RequestError::RetryAfter(wait) = err {
        tokio::time::sleep(wait.duration()).await;
    } else {
        tokio::time::sleep(*delay).await;
        *delay *= 2;
    }
}

fn parse_mode_for(mode: RenderMode) -> Option<ParseMode> {
    match mode {
        RenderMode::MarkdownV2 => Some(ParseMode::MarkdownV2),
        RenderMode::Plain => None,
    }
}

/// A bot message that streamed answers are written into.
#[derive(Clone)]
pub struct TelegramMessage {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

impl TelegramMessage {
    pub fn new(bot: Bot, chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            message_id,
        }
    }

    pub fn from_message(bot: &Bot, message: &Message) -> Self {
        Self::new(bot.clone(), message.chat.id, message.id)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub async fn show_error(&self, detail: &str) {
        show_error(self, detail).await;
    }
}

/// Replaces the placeholder with the localized failure notice and a short
/// diagnostic.
pub async fn show_error(target: &dyn MessageTarget, detail: &str) {
    let text = error_text(detail);
    if let Err(err) = target.edit(&text, RenderMode::Plain).await {
        warn!("Failed to show error message: {err}");
    }
}

#[async_trait]
impl MessageTarget for TelegramMessage {
    async fn edit(&self, text: &str, mode: RenderMode) -> Result<(), EditError> {
        let mut delay = Duration::from_secs_f32(1.5);
        for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
            let mut request =
                self.bot
                    .edit_message_text(self.chat_id, self.message_id, text.to_string());
            if let Some(parse_mode) = parse_mode_for(mode) {
                request = request.parse_mode(parse_mode);
            }
            match request.await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                        return Err(err.into());
                    }
                    warn!("edit_message_text attempt {} failed: {err}", attempt + 1);
                    wait_before_retry(&err, &mut delay).await;
                }
            }
        }
        Ok(())
    }

    async fn send(&self, text: &str, mode: RenderMode) -> Result<(), EditError> {
        let mut delay = Duration::from_secs_f32(1.5);
        for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
            let mut request = self.bot.send_message(self.chat_id, text.to_string());
            if let Some(parse_mode) = parse_mode_for(mode) {
                request = request.parse_mode(parse_mode);
            }
            match request.await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                        return Err(err.into());
                    }
                    warn!("send_message attempt {} failed: {err}", attempt + 1);
                    wait_before_retry(&err, &mut delay).await;
                }
            }
        }
        Ok(())
    }
}

pub fn error_text(detail: &str) -> String {
    let detail: String = detail.chars().take(ERROR_DETAIL_LIMIT).collect();
    format!(
        "{}\n\n{} {}",
        messages::ERROR_INFO,
        messages::ERROR_DETAILS,
        detail
    )
}

/// Sends `text` as a reply to `message`.
pub async fn reply_text(bot: &Bot, message: &Message, text: &str) -> Result<Message> {
    let sent = bot
        .send_message(message.chat.id, text.to_string())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(sent)
}

/// Sends `text` as a MarkdownV2 reply, falling back to its plain form when
/// Telegram rejects the formatting.
pub async fn reply_markdown(bot: &Bot, message: &Message, text: &str) -> Result<Message> {
    let formatted = bot
        .send_message(message.chat.id, text.to_string())
        .parse_mode(ParseMode::MarkdownV2)
        .reply_parameters(ReplyParameters::new(message.id))
        .await;
    match formatted {
        Ok(sent) => Ok(sent),
        Err(err) => {
            warn!("Failed to send formatted reply: {err}");
            reply_text(bot, message, &markdown_v2_to_plain(text)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_errors_map_to_edit_errors() {
        assert_eq!(
            EditError::from(RequestError::Api(ApiError::MessageNotModified)),
            EditError::NotModified
        );
        assert!(matches!(
            EditError::from(RequestError::Api(ApiError::CantParseEntities(
                "Bad Request: can't parse entities: unclosed".to_string()
            ))),
            EditError::Markup(_)
        ));
        assert!(matches!(
            EditError::from(RequestError::Api(ApiError::MessageIsTooLong)),
            EditError::Markup(_)
        ));
        assert!(matches!(
            EditError::from(RequestError::Api(ApiError::BotBlocked)),
            EditError::Other(_)
        ));
    }

    #[test]
    fn error_text_is_bounded() {
        let text = error_text(&"x".repeat(5000));
        assert!(text.starts_with(messages::ERROR_INFO));
        assert!(text.chars().count() < messages::ERROR_INFO.chars().count() + 400);
    }
}
