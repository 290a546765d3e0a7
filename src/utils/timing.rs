use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use teloxide::types::Message;
use tracing::info;

const LOGGED_TEXT_LIMIT: usize = 300;
const ABORTED_STATUS: &str = "aborted";

/// Timing record for one handled update. Logs `command_received` when
/// started and `command_completed` exactly once when finished or dropped.
/// A timer dropped without an explicit status is logged as `aborted`.
#[derive(Debug)]
pub struct CommandTimer {
    command: String,
    chat_id: i64,
    user_id: Option<u64>,
    username: Option<String>,
    message_id: i32,
    text: Option<String>,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl CommandTimer {
    pub fn from_message(command: &str, message: &Message) -> Self {
        let text = message
            .text()
            .or_else(|| message.caption())
            .map(|value| {
                value
                    .replace('\n', " ")
                    .chars()
                    .take(LOGGED_TEXT_LIMIT)
                    .collect::<String>()
            });

        let user = message.from.as_ref();
        CommandTimer {
            command: command.to_string(),
            chat_id: message.chat.id.0,
            user_id: user.map(|u| u.id.0),
            username: user.and_then(|u| u.username.clone()),
            message_id: message.id.0,
            text,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: ABORTED_STATUS.to_string(),
            detail: None,
            completed: false,
        }
    }

    fn log_received(&self) {
        info!(
            target: "bot.timing",
            "event=command_received command={} chat_id={} user_id={:?} username={:?} message_id={} received_at={} text={:?}",
            self.command,
            self.chat_id,
            self.user_id,
            self.username,
            self.message_id,
            self.started_at.to_rfc3339(),
            self.text
        );
    }

    pub fn mark_status(&mut self, status: &str, detail: Option<String>) {
        self.status = status.to_string();
        self.detail = detail;
    }

    pub fn log_completed(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            target: "bot.timing",
            "event=command_completed command={} chat_id={} user_id={:?} message_id={} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.command,
            self.chat_id,
            self.user_id,
            self.message_id,
            self.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            self.started_perf.elapsed().as_secs_f64(),
            self.status,
            self.detail.as_deref().unwrap_or_default()
        );
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        self.log_completed();
    }
}

pub fn start_command_timer(command: &str, message: &Message) -> CommandTimer {
    let timer = CommandTimer::from_message(command, message);
    timer.log_received();
    timer
}

pub fn complete_command_timer(timer: &mut CommandTimer, status: &str, detail: Option<String>) {
    timer.mark_status(status, detail);
    timer.log_completed();
}

/// Runs one model call and logs its start, end and duration.
pub async fn log_llm_timing<T, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, anyhow::Error>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: "bot.timing",
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_ok() { "success" } else { "error" };

    info!(
        target: "bot.timing",
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status,
        metadata_text
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_text_message(text: &str) -> Message {
        serde_json::from_value(serde_json::json!({
            "message_id": 10,
            "date": 1_700_000_000,
            "chat": { "id": 42, "type": "private", "first_name": "Sara" },
            "from": { "id": 42, "is_bot": false, "first_name": "Sara" },
            "text": text
        }))
        .unwrap()
    }

    #[test]
    fn unfinished_timer_is_not_reported_as_success() {
        let mut timer = start_command_timer("chat", &private_text_message("سلام"));
        assert_eq!(timer.status, ABORTED_STATUS);
        assert_eq!(timer.user_id, Some(42));

        complete_command_timer(&mut timer, "success", None);
        assert_eq!(timer.status, "success");
        assert!(timer.completed);
    }

    #[tokio::test]
    async fn llm_timing_passes_the_result_through() {
        let ok = log_llm_timing("gemini", "m", "op", None, || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<(), _> = log_llm_timing("gemini", "m", "op", None, || async {
            Err(anyhow::anyhow!("boom"))
        })
        .await;
        assert_eq!(err.unwrap_err().to_string(), "boom");
    }
}
