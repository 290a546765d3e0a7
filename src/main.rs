use std::error::Error;
use std::future::Future;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod config;
mod handlers;
mod llm;
mod relay;
mod state;
mod store;
mod utils;

use config::CONFIG;
use handlers::{chat, commands, images};
use state::AppState;
use store::schedule::spawn_daily_reset;
use store::ConversationStore;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Info,
    Clear,
    Switch,
    Img(String),
    Edit(String),
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Runs a handler off the dispatcher so slow model calls do not block
/// other chats.
fn spawn_handler<F>(name: &'static str, handler: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = handler.await {
            error!("{name} handler failed: {err:#}");
        }
    });
}

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    let store = ConversationStore::load(&CONFIG.user_chats_file, CONFIG.history_window).await;
    info!(
        users = store.len(),
        path = %store.path().display(),
        "Conversation store loaded"
    );
    let daily_reset = spawn_daily_reset(store.clone(), CONFIG.local_offset());

    let bot = Bot::new(CONFIG.bot_token.clone());
    if let Err(err) = bot.delete_webhook().drop_pending_updates(true).await {
        warn!("Failed to drop pending updates: {err}");
    }
    info!(
        model = %CONFIG.gemini_model,
        alt_model = %CONFIG.gemini_alt_model,
        "Starting Gemini Telegram bot"
    );

    let state = AppState::new(store.clone());

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handle_photo))
        .branch(dptree::filter(|msg: Message| msg.voice().is_some()).endpoint(handle_voice))
        .branch(
            dptree::filter(|msg: Message| msg.document().is_some()).endpoint(handle_document),
        )
        .branch(
            dptree::filter(|msg: Message| {
                msg.text()
                    .is_some_and(|text| !text.trim_start().starts_with('/'))
            })
            .endpoint(handle_text),
        )
        .endpoint(ignore_message);

    Dispatcher::builder(bot, message_handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down");
    daily_reset.shutdown().await;
    if let Err(err) = store.persist().await {
        error!("Final save of the conversation store failed: {err}");
    }
    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Info => commands::info_handler(bot, state, message).await?,
        Command::Clear => spawn_handler("clear", commands::clear_handler(bot, state, message)),
        Command::Switch => commands::switch_handler(bot, state, message).await?,
        Command::Img(prompt) => {
            spawn_handler("img", images::img_handler(bot, state, message, prompt))
        }
        Command::Edit(prompt) => {
            spawn_handler("edit", images::edit_handler(bot, state, message, prompt))
        }
    }
    Ok(())
}

async fn handle_text(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    spawn_handler("text", chat::text_handler(bot, state, message));
    Ok(())
}

async fn handle_photo(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    spawn_handler("photo", chat::photo_handler(bot, state, message));
    Ok(())
}

async fn handle_voice(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    spawn_handler("voice", chat::voice_handler(bot, state, message));
    Ok(())
}

async fn handle_document(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    spawn_handler("document", chat::document_handler(bot, state, message));
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
