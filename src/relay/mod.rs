//! Mirrors a streamed model answer into one Telegram message.
//!
//! The placeholder message is edited while fragments arrive (at most once per
//! update interval) and finally replaced by the complete answer. Answers over
//! the single-message limit continue in follow-up messages.

pub mod split;

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{messages, CONFIG};
use crate::utils::markdown::markdown_to_telegram;
use split::{chunk_end, split_message, telegram_len};

/// Hard Telegram limit for the text of one message after formatting, in UTF-16 code units.
const TELEGRAM_HARD_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    MarkdownV2,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("message is not modified")]
    NotModified,
    #[error("formatting rejected: {0}")]
    Markup(String),
    #[error("{0}")]
    Other(String),
}

/// The outbound message a relay writes into.
#[async_trait]
pub trait MessageTarget: Send + Sync {
    /// Replaces the text of the placeholder message.
    async fn edit(&self, text: &str, mode: RenderMode) -> Result<(), EditError>;
    /// Sends an additional message to the same chat.
    async fn send(&self, text: &str, mode: RenderMode) -> Result<(), EditError>;
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub update_interval: Duration,
    pub max_length: usize,
    pub typing_suffix: String,
    pub empty_text: String,
}

impl RelayOptions {
    pub fn from_config() -> Self {
        RelayOptions {
            update_interval: CONFIG.streaming_update_interval,
            max_length: CONFIG.telegram_max_length,
            typing_suffix: messages::TYPING_SUFFIX.to_string(),
            empty_text: messages::NO_RESPONSE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Complete trimmed answer; empty when nothing usable arrived.
    pub text: String,
    /// Error that ended the stream early, if any.
    pub interrupted: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Unchanged,
    Dropped,
}

#[derive(Debug, Clone, Copy)]
enum RenderStrategy {
    Markdown,
    Plain,
}

/// Tried in order until one is accepted; if none is, the update is dropped.
const RENDER_STRATEGIES: [RenderStrategy; 2] = [RenderStrategy::Markdown, RenderStrategy::Plain];

impl RenderStrategy {
    fn render(self, text: &str) -> Option<(String, RenderMode)> {
        match self {
            RenderStrategy::Markdown => {
                let formatted = markdown_to_telegram(text);
                if telegram_len(&formatted) > TELEGRAM_HARD_LIMIT {
                    None
                } else {
                    Some((formatted, RenderMode::MarkdownV2))
                }
            }
            RenderStrategy::Plain => Some((text.to_string(), RenderMode::Plain)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Edit,
    Send,
}

async fn deliver(target: &dyn MessageTarget, operation: Operation, text: &str) -> Delivery {
    for strategy in RENDER_STRATEGIES {
        let Some((rendered, mode)) = strategy.render(text) else {
            continue;
        };
        let result = match operation {
            Operation::Edit => target.edit(&rendered, mode).await,
            Operation::Send => target.send(&rendered, mode).await,
        };
        match result {
            Ok(()) => return Delivery::Delivered,
            Err(EditError::NotModified) => return Delivery::Unchanged,
            Err(EditError::Markup(reason)) => {
                debug!(?strategy, "Formatted update rejected, trying next strategy: {reason}");
            }
            Err(EditError::Other(reason)) => {
                warn!(?operation, "Failed to update message: {reason}");
                return Delivery::Dropped;
            }
        }
    }
    warn!(?operation, "No render strategy was accepted; update dropped");
    Delivery::Dropped
}

/// Edits the target with `text`, falling back from MarkdownV2 to plain text.
pub async fn edit_formatted(target: &dyn MessageTarget, text: &str) -> Delivery {
    deliver(target, Operation::Edit, text).await
}

/// Sends `text` as a new message, falling back from MarkdownV2 to plain text.
pub async fn send_formatted(target: &dyn MessageTarget, text: &str) -> Delivery {
    deliver(target, Operation::Send, text).await
}

fn preview_text(buffer: &str, options: &RelayOptions) -> String {
    let text = buffer.trim();
    let budget = options
        .max_length
        .saturating_sub(telegram_len(&options.typing_suffix))
        .max(1);
    let end = chunk_end(text, budget);
    format!("{}{}", text[..end].trim_end(), options.typing_suffix)
}

/// Writes the final answer: one edit for the first chunk, new messages for the rest.
pub async fn finish(target: &dyn MessageTarget, text: &str, options: &RelayOptions) {
    if text.is_empty() {
        edit_formatted(target, &options.empty_text).await;
        return;
    }

    let mut chunks = split_message(text, options.max_length).into_iter();
    if let Some(first) = chunks.next() {
        edit_formatted(target, first).await;
    }
    for chunk in chunks {
        send_formatted(target, chunk).await;
    }
}

/// Consumes `stream` into `target` and returns the accumulated answer.
///
/// A failing stream ends consumption early; whatever arrived before the error
/// is still rendered and returned.
pub async fn relay_stream<S>(
    stream: S,
    target: &dyn MessageTarget,
    options: &RelayOptions,
) -> RelayOutcome
where
    S: Stream<Item = anyhow::Result<String>>,
{
    let mut stream = Box::pin(stream);
    let mut buffer = String::new();
    let mut last_update = Instant::now();
    let mut interrupted = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(fragment) => {
                if fragment.is_empty() {
                    continue;
                }
                buffer.push_str(&fragment);
                if last_update.elapsed() >= options.update_interval && !buffer.trim().is_empty() {
                    edit_formatted(target, &preview_text(&buffer, options)).await;
                    last_update = Instant::now();
                }
            }
            Err(err) => {
                warn!(
                    received_chars = buffer.chars().count(),
                    "Response stream failed: {err:#}"
                );
                interrupted = Some(format!("{err:#}"));
                break;
            }
        }
    }

    let text = buffer.trim().to_string();
    finish(target, &text, options).await;
    RelayOutcome { text, interrupted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures::stream;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Edit(String, RenderMode),
        Send(String, RenderMode),
    }

    /// Records accepted updates; can be told to reject MarkdownV2.
    #[derive(Default)]
    struct RecordingTarget {
        pub calls: Mutex<Vec<Call>>,
        pub reject_markdown: bool,
        pub fail_everything: bool,
    }

    impl RecordingTarget {
        fn plain_only() -> Self {
            RecordingTarget {
                reject_markdown: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn check(&self, mode: RenderMode) -> Result<(), EditError> {
            if self.fail_everything {
                return Err(EditError::Other("Too Many Requests".to_string()));
            }
            if self.reject_markdown && mode == RenderMode::MarkdownV2 {
                return Err(EditError::Markup("can't parse entities".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageTarget for RecordingTarget {
        async fn edit(&self, text: &str, mode: RenderMode) -> Result<(), EditError> {
            self.check(mode)?;
            let mut calls = self.calls.lock();
            if let Some(Call::Edit(previous, _)) =
                calls.iter().rev().find(|call| matches!(call, Call::Edit(..)))
            {
                if previous == text {
                    return Err(EditError::NotModified);
                }
            }
            calls.push(Call::Edit(text.to_string(), mode));
            Ok(())
        }

        async fn send(&self, text: &str, mode: RenderMode) -> Result<(), EditError> {
            self.check(mode)?;
            self.calls.lock().push(Call::Send(text.to_string(), mode));
            Ok(())
        }
    }

    fn options(update_interval: Duration) -> RelayOptions {
        RelayOptions {
            update_interval,
            max_length: 4000,
            typing_suffix: " ...".to_string(),
            empty_text: "no response received".to_string(),
        }
    }

    fn fragments(parts: &[&str]) -> impl Stream<Item = anyhow::Result<String>> {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(part.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn streams_intermediate_edits_then_one_clean_final_edit() {
        let target = RecordingTarget::plain_only();
        let outcome = relay_stream(
            fragments(&["Hel", "lo, ", "world!"]),
            &target,
            &options(Duration::ZERO),
        )
        .await;

        assert_eq!(outcome.text, "Hello, world!");
        assert_eq!(outcome.interrupted, None);

        let calls = target.calls();
        let edits: Vec<&String> = calls
            .iter()
            .filter_map(|call| match call {
                Call::Edit(text, _) => Some(text),
                Call::Send(..) => None,
            })
            .collect();
        assert!(edits.len() >= 2);
        assert!(edits[..edits.len() - 1]
            .iter()
            .all(|text| text.ends_with(" ...")));
        assert_eq!(edits.last().unwrap().as_str(), "Hello, world!");
        assert_eq!(
            edits
                .iter()
                .filter(|text| text.as_str() == "Hello, world!")
                .count(),
            1
        );
        assert!(calls.iter().all(|call| matches!(call, Call::Edit(_, RenderMode::Plain))));
    }

    #[tokio::test]
    async fn prefers_markdown_when_accepted() {
        let target = RecordingTarget::default();
        relay_stream(
            fragments(&["**Done**", "!"]),
            &target,
            &options(Duration::from_secs(3600)),
        )
        .await;

        assert_eq!(
            target.calls(),
            vec![Call::Edit("*Done*\\!".to_string(), RenderMode::MarkdownV2)]
        );
    }

    #[tokio::test]
    async fn long_answer_is_split_into_edit_and_follow_ups() {
        let text = format!("{}\n{}", "a".repeat(3499), "b".repeat(5500));
        let pieces: Vec<String> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(250)
            .map(|chunk| chunk.iter().collect())
            .collect();
        let target = RecordingTarget::plain_only();

        let outcome = relay_stream(
            stream::iter(pieces.into_iter().map(Ok)),
            &target,
            &options(Duration::from_secs(3600)),
        )
        .await;
        assert_eq!(outcome.text, text);

        let calls = target.calls();
        assert_eq!(calls.len(), 3);
        let mut rebuilt = String::new();
        for (index, call) in calls.iter().enumerate() {
            match call {
                Call::Edit(chunk, _) => {
                    assert_eq!(index, 0);
                    assert!(chunk.chars().count() <= 4000);
                    assert!(chunk.ends_with('\n'));
                    rebuilt.push_str(chunk);
                }
                Call::Send(chunk, _) => {
                    assert!(index > 0);
                    assert!(chunk.chars().count() <= 4000);
                    rebuilt.push_str(chunk);
                }
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[tokio::test]
    async fn intermediate_preview_never_exceeds_the_limit() {
        let target = RecordingTarget::plain_only();
        let big = "x".repeat(5000);
        relay_stream(fragments(&[big.as_str()]), &target, &options(Duration::ZERO)).await;

        match &target.calls()[0] {
            Call::Edit(preview, _) => {
                assert_eq!(preview.chars().count(), 4000);
                assert!(preview.ends_with(" ..."));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn preview_limit_counts_utf16_units() {
        let target = RecordingTarget::plain_only();
        let emoji = "😀".repeat(3000);
        relay_stream(fragments(&[emoji.as_str()]), &target, &options(Duration::ZERO)).await;

        for call in target.calls() {
            let (Call::Edit(text, _) | Call::Send(text, _)) = call;
            assert!(telegram_len(&text) <= 4000);
        }
        match &target.calls()[0] {
            Call::Edit(preview, _) => assert_eq!(telegram_len(preview), 4000),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_answer_shows_the_no_response_text() {
        let target = RecordingTarget::plain_only();
        let outcome =
            relay_stream(fragments(&["  ", "\n"]), &target, &options(Duration::ZERO)).await;

        assert_eq!(outcome.text, "");
        assert_eq!(
            target.calls(),
            vec![Call::Edit("no response received".to_string(), RenderMode::Plain)]
        );
    }

    #[tokio::test]
    async fn stream_error_keeps_the_partial_answer() {
        let target = RecordingTarget::plain_only();
        let items: Vec<anyhow::Result<String>> = vec![
            Ok("partial ".to_string()),
            Ok("answer".to_string()),
            Err(anyhow!("connection reset")),
            Ok("never seen".to_string()),
        ];

        let outcome = relay_stream(
            stream::iter(items),
            &target,
            &options(Duration::from_secs(3600)),
        )
        .await;

        assert_eq!(outcome.text, "partial answer");
        assert_eq!(outcome.interrupted.as_deref(), Some("connection reset"));
        assert_eq!(
            target.calls(),
            vec![Call::Edit("partial answer".to_string(), RenderMode::Plain)]
        );
    }

    #[tokio::test]
    async fn failed_updates_do_not_abort_the_stream() {
        let target = RecordingTarget {
            fail_everything: true,
            ..Default::default()
        };
        let outcome =
            relay_stream(fragments(&["a", "b", "c"]), &target, &options(Duration::ZERO)).await;

        assert_eq!(outcome.text, "abc");
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn unchanged_content_is_not_retried_as_plain_text() {
        let target = RecordingTarget::default();
        assert_eq!(edit_formatted(&target, "same").await, Delivery::Delivered);
        assert_eq!(edit_formatted(&target, "same").await, Delivery::Unchanged);
        assert_eq!(target.calls().len(), 1);
    }
}
