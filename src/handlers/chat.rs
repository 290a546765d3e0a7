//! Conversational handlers: text, photos, voice notes and documents.
//!
//! Every handler ends in [`run_chat_turn`], which streams the model answer into
//! a placeholder message and records the exchange in the user's history.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{error, info, warn};

use crate::config::{
    messages, ModelPreference, CONFIG, FILE_PROMPT, REPLY_CONTEXT_TEMPLATE, VOICE_PROMPT,
};
use crate::handlers::images::{caption_edit_prompt, edit_handler};
use crate::handlers::media::{fetch_attachment, fetch_photo, largest_photo};
use crate::handlers::responses::{reply_markdown, reply_text, TelegramMessage};
use crate::llm::gemini::stream_chat;
use crate::llm::media::{AttachmentError, MediaFile};
use crate::relay::{relay_stream, RelayOptions};
use crate::state::AppState;
use crate::store::{ContentPart, ConversationStore, Turn, UsageKind};
use crate::utils::markdown::escape_markdown_v2;
use crate::utils::telegram::{user_key, ChatActionHeartbeat};
use crate::utils::timing::{complete_command_timer, start_command_timer, CommandTimer};

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Prompt of a group message addressed to the bot with a leading `.`.
/// Returns `None` when the message is not addressed to the bot.
pub fn group_prompt(text: &str) -> Option<&str> {
    text.trim().strip_prefix('.').map(str::trim)
}

pub fn reply_context_prefix(sender_is_bot: bool, quoted: &str) -> String {
    let sender = if sender_is_bot {
        messages::BOT_SENDER
    } else {
        messages::USER_SENDER
    };
    REPLY_CONTEXT_TEMPLATE
        .replace("{sender}", sender)
        .replace("{text}", quoted)
}

fn caption_is_img_command(caption: &str) -> bool {
    caption.trim_start().to_lowercase().starts_with("/img")
}

pub fn attachment_error_text(err: &AttachmentError) -> String {
    match err {
        AttachmentError::TooLarge { size, limit } => messages::ATTACHMENT_TOO_LARGE
            .replace("{size}", &format!("{:.1}", *size as f64 / MEGABYTE))
            .replace("{limit}", &format!("{:.0}", *limit as f64 / MEGABYTE)),
        AttachmentError::Unsupported(mime) => {
            messages::ATTACHMENT_UNSUPPORTED.replace("{mime}", mime)
        }
        AttachmentError::Download(detail) => {
            format!("{}\n{} {}", messages::ERROR_INFO, messages::ATTACHMENT_DOWNLOAD_FAILED, detail)
        }
    }
}

struct ChatTurn {
    user_id: String,
    user_turn: Turn,
    model: String,
    system_prompt: &'static str,
    placeholder: Message,
    /// Counter bumped once the answer is stored.
    usage: Option<UsageKind>,
}

/// Stores a delivered exchange and counts the attachment that started it.
fn record_answer(
    store: &ConversationStore,
    user_id: &str,
    user_turn: Turn,
    answer: &str,
    usage: Option<UsageKind>,
) {
    store.append_turn(user_id, user_turn, Turn::model_text(answer));
    if let Some(kind) = usage {
        store.record_usage(user_id, kind);
    }
}

/// Streams the answer to one user turn into the placeholder and stores the
/// exchange. Turns of one user run one at a time.
async fn run_chat_turn(bot: &Bot, state: &AppState, turn: ChatTurn, timer: &mut CommandTimer) {
    let target = TelegramMessage::from_message(bot, &turn.placeholder);
    let lock = state.user_lock(&turn.user_id);
    let _turn_guard = lock.lock().await;
    let _typing = ChatActionHeartbeat::start(bot.clone(), turn.placeholder.chat.id, ChatAction::Typing);

    let history = state.store.get_or_create(&turn.user_id).history;
    let stream = match stream_chat(&turn.model, turn.system_prompt, &history, &turn.user_turn).await
    {
        Ok(stream) => stream,
        Err(err) => {
            error!(user_id = %turn.user_id, model = %turn.model, "Gemini request failed: {err:#}");
            target.show_error(&format!("{err:#}")).await;
            complete_command_timer(timer, "error", Some(err.to_string()));
            return;
        }
    };

    let outcome = relay_stream(stream, &target, &RelayOptions::from_config()).await;
    if outcome.text.is_empty() {
        if let Some(reason) = &outcome.interrupted {
            target.show_error(reason).await;
        }
        complete_command_timer(timer, "empty", outcome.interrupted);
        return;
    }

    record_answer(
        &state.store,
        &turn.user_id,
        turn.user_turn,
        &outcome.text,
        turn.usage,
    );
    state.store.persist_in_background();
    info!(
        user_id = %turn.user_id,
        model = %turn.model,
        chars = outcome.text.chars().count(),
        interrupted = outcome.interrupted.is_some(),
        "Answer delivered"
    );
    let status = if outcome.interrupted.is_some() {
        "partial"
    } else {
        "success"
    };
    complete_command_timer(timer, status, outcome.interrupted);
}

fn model_for_user(state: &AppState, user_id: &str) -> String {
    CONFIG.model_for(state.preference(user_id)).to_string()
}

struct PreparedPrompt {
    parts: Vec<ContentPart>,
    /// Status message already sent while fetching a replied-to photo.
    photo_status: Option<Message>,
}

impl PreparedPrompt {
    fn text(prompt: String) -> Self {
        PreparedPrompt {
            parts: vec![ContentPart::Text(prompt)],
            photo_status: None,
        }
    }
}

/// Attaches the replied-to photo, or quotes the replied-to text.
/// Returns `None` after telling the user when the photo could not be used.
async fn apply_reply_context(
    bot: &Bot,
    message: &Message,
    prompt: String,
) -> Result<Option<PreparedPrompt>> {
    let Some(replied) = message.reply_to_message() else {
        return Ok(Some(PreparedPrompt::text(prompt)));
    };

    if let Some(photo) = largest_photo(replied) {
        let status = reply_text(bot, message, messages::PHOTO_PROCESSING).await?;
        let file = match fetch_photo(bot, photo).await {
            Ok(file) => file,
            Err(err) => {
                warn!("Reply photo could not be used: {err}");
                let target = TelegramMessage::from_message(bot, &status);
                target.show_error(&attachment_error_text(&err)).await;
                return Ok(None);
            }
        };
        let prompt = if prompt.trim().is_empty() {
            CONFIG.image_processing_prompt.clone()
        } else {
            prompt
        };
        let parts = vec![
            ContentPart::Text(prompt),
            ContentPart::binary(file.mime_type, file.bytes),
        ];
        return Ok(Some(PreparedPrompt {
            parts,
            photo_status: Some(status),
        }));
    }

    if let Some(quoted) = replied.text() {
        let sender_is_bot = replied.from.as_ref().map(|user| user.is_bot).unwrap_or(false);
        let prompt = format!("{}{}", reply_context_prefix(sender_is_bot, quoted), prompt);
        return Ok(Some(PreparedPrompt::text(prompt)));
    }

    Ok(Some(PreparedPrompt::text(prompt)))
}

pub async fn text_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(text) = message.text() else {
        return Ok(());
    };
    let prompt = if message.chat.is_private() {
        text.trim().to_string()
    } else {
        match group_prompt(text) {
            None => return Ok(()),
            Some("") => {
                reply_markdown(&bot, &message, &escape_markdown_v2(messages::GROUP_PROMPT_NEEDED))
                    .await?;
                return Ok(());
            }
            Some(prompt) => prompt.to_string(),
        }
    };
    if prompt.is_empty() {
        return Ok(());
    }
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("chat", &message);

    let Some(prepared) = apply_reply_context(&bot, &message, prompt).await? else {
        complete_command_timer(&mut timer, "error", Some("reply photo unavailable".to_string()));
        return Ok(());
    };
    let (placeholder, system_prompt) = match prepared.photo_status {
        Some(status) => (status, CONFIG.image_processing_prompt.as_str()),
        None => (
            reply_text(&bot, &message, messages::BEFORE_GENERATE).await?,
            CONFIG.system_prompt.as_str(),
        ),
    };

    let turn = ChatTurn {
        model: model_for_user(&state, &user_id),
        user_id,
        user_turn: Turn::user(prepared.parts),
        system_prompt,
        placeholder,
        usage: None,
    };
    run_chat_turn(&bot, &state, turn, &mut timer).await;
    Ok(())
}

pub async fn photo_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(photo) = largest_photo(&message) else {
        return Ok(());
    };
    let caption = message.caption().unwrap_or_default().trim();
    if let Some(prompt) = caption_edit_prompt(caption) {
        let prompt = prompt.to_string();
        return edit_handler(bot, state, message, prompt).await;
    }
    let prompt = if message.chat.is_private() {
        if caption_is_img_command(caption) {
            reply_markdown(
                &bot,
                &message,
                &escape_markdown_v2(messages::PHOTO_COMMAND_CAPTION_INFO),
            )
            .await?;
            return Ok(());
        }
        caption.to_string()
    } else {
        match group_prompt(caption) {
            None => return Ok(()),
            Some(prompt) => prompt.to_string(),
        }
    };
    let prompt = if prompt.is_empty() {
        CONFIG.image_processing_prompt.clone()
    } else {
        prompt
    };
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("photo", &message);

    let placeholder = reply_text(&bot, &message, messages::PHOTO_PROCESSING).await?;
    let file = match fetch_photo(&bot, photo).await {
        Ok(file) => file,
        Err(err) => {
            warn!(user_id = %user_id, "Photo could not be used: {err}");
            TelegramMessage::from_message(&bot, &placeholder)
                .show_error(&attachment_error_text(&err))
                .await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };

    let turn = ChatTurn {
        model: model_for_user(&state, &user_id),
        user_turn: Turn::user(vec![
            ContentPart::Text(prompt),
            ContentPart::binary(file.mime_type, file.bytes),
        ]),
        user_id,
        system_prompt: CONFIG.image_processing_prompt.as_str(),
        placeholder,
        usage: None,
    };
    run_chat_turn(&bot, &state, turn, &mut timer).await;
    Ok(())
}

pub async fn voice_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !message.chat.is_private() {
        return Ok(());
    }
    let Some(voice) = message.voice() else {
        return Ok(());
    };
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    if state.preference(&user_id) != ModelPreference::Primary {
        let notice = messages::VOICE_ONLY_PRIMARY.replace("{}", &CONFIG.gemini_model);
        reply_text(&bot, &message, &notice).await?;
        return Ok(());
    }
    let mut timer = start_command_timer("voice", &message);

    let placeholder = reply_text(&bot, &message, messages::VOICE_PROCESSING).await?;
    let reported_mime = voice.mime_type.as_ref().map(|mime| mime.essence_str());
    let file = match fetch_attachment(&bot, &voice.file, reported_mime.or(Some("audio/ogg")), None).await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(user_id = %user_id, "Voice note could not be used: {err}");
            TelegramMessage::from_message(&bot, &placeholder)
                .show_error(&attachment_error_text(&err))
                .await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };

    let turn = ChatTurn {
        model: CONFIG.gemini_model.clone(),
        user_turn: Turn::user(vec![
            ContentPart::text(VOICE_PROMPT),
            ContentPart::binary(file.mime_type, file.bytes),
        ]),
        user_id,
        system_prompt: CONFIG.system_prompt.as_str(),
        placeholder,
        usage: Some(UsageKind::Voice),
    };
    run_chat_turn(&bot, &state, turn, &mut timer).await;
    Ok(())
}

fn document_prompt(caption: &str, file: &MediaFile) -> String {
    let mut prompt = if caption.is_empty() {
        FILE_PROMPT.to_string()
    } else {
        caption.to_string()
    };
    if let Some(name) = &file.display_name {
        prompt.push_str(&format!("\n\n({name})"));
    }
    prompt
}

pub async fn document_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(document) = message.document() else {
        return Ok(());
    };
    let caption = message.caption().unwrap_or_default().trim();
    let caption = if message.chat.is_private() {
        caption
    } else {
        match group_prompt(caption) {
            None => return Ok(()),
            Some(prompt) => prompt,
        }
    };
    let Some(user_id) = user_key(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("document", &message);

    let placeholder = reply_text(&bot, &message, messages::FILE_PROCESSING).await?;
    let reported_mime = document.mime_type.as_ref().map(|mime| mime.essence_str());
    let file = match fetch_attachment(
        &bot,
        &document.file,
        reported_mime,
        document.file_name.clone(),
    )
    .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(user_id = %user_id, "Document could not be used: {err}");
            TelegramMessage::from_message(&bot, &placeholder)
                .show_error(&attachment_error_text(&err))
                .await;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
            return Ok(());
        }
    };

    let prompt = document_prompt(caption, &file);
    let turn = ChatTurn {
        model: model_for_user(&state, &user_id),
        user_turn: Turn::user(vec![
            ContentPart::Text(prompt),
            ContentPart::binary(file.mime_type, file.bytes),
        ]),
        user_id,
        system_prompt: CONFIG.system_prompt.as_str(),
        placeholder,
        usage: Some(UsageKind::File),
    };
    run_chat_turn(&bot, &state, turn, &mut timer).await;
    Ok(())
}
