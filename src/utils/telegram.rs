use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, Message};
use tokio::task::JoinHandle;
use tracing::debug;

// Telegram clears a chat action after about five seconds.
const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Repeats a chat action ("typing…", "sending photo…") until dropped.
pub struct ChatActionHeartbeat {
    task_handle: JoinHandle<()>,
}

impl ChatActionHeartbeat {
    pub fn start(bot: Bot, chat_id: ChatId, action: ChatAction) -> Self {
        let task_handle = tokio::spawn(async move {
            loop {
                if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                    debug!("send_chat_action failed: {err}");
                }
                tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL).await;
            }
        });
        ChatActionHeartbeat { task_handle }
    }
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

/// Key under which a user's conversation is stored.
pub fn user_key(message: &Message) -> Option<String> {
    message.from.as_ref().map(|user| user.id.0.to_string())
}
