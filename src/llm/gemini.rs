use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, FixedOffset, Utc};
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{CONFIG, TIME_PROMPT_TEMPLATE};
use crate::llm::media::MediaFile;
use crate::store::{ContentPart, Turn};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, thiserror::Error)]
pub enum ImageGenerationError {
    #[error("image request failed: {0}")]
    Request(String),
    #[error("the model returned neither an image nor text")]
    Empty,
}

/// Output of an image request. At least one of the fields is non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageResponse {
    pub images: Vec<Vec<u8>>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
        #[serde(default)]
        thought: bool,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

impl GeminiResponse {
    fn block_reason(&self) -> Option<String> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.clone())
        {
            return Some(reason);
        }
        self.candidates
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter_map(|candidate| candidate.finish_reason.as_deref())
            .find(|reason| matches!(*reason, "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST"))
            .map(|reason| reason.to_string())
    }

    fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        Some(
            error
                .get("message")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string())
                .unwrap_or_else(|| error.to_string()),
        )
    }

    /// Converts the first candidate's parts into conversation parts. Thought
    /// summaries and unknown part kinds are skipped.
    fn into_parts(self) -> Vec<ContentPart> {
        let parts = self
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .unwrap_or_default();

        let mut converted = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                GeminiPart::Text { thought: true, .. } => {}
                GeminiPart::Text { text, .. } => converted.push(ContentPart::Text(text)),
                GeminiPart::InlineData { inline_data } => {
                    match general_purpose::STANDARD.decode(inline_data.data.as_bytes()) {
                        Ok(bytes) => {
                            converted.push(ContentPart::binary(inline_data.mime_type, bytes))
                        }
                        Err(err) => warn!(
                            "Dropping undecodable {} part from Gemini: {err}",
                            inline_data.mime_type
                        ),
                    }
                }
                GeminiPart::FunctionCall { function_call } => {
                    converted.push(ContentPart::FunctionCall {
                        name: function_call.name,
                        args: function_call.args,
                    })
                }
                GeminiPart::Other(value) => {
                    debug!(target: "llm.gemini", part = %truncate_for_log(&value.to_string(), 200), "Skipping unknown part");
                }
            }
        }
        converted
    }
}

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn pick_api_key() -> Result<&'static str> {
    CONFIG
        .gemini_api_keys
        .choose(&mut rand::thread_rng())
        .map(|key| key.as_str())
        .ok_or_else(|| anyhow!("No Gemini API key configured"))
}

fn redact_secrets(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .map(|secret| secret.trim())
        .filter(|secret| !secret.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, "[redacted]"))
}

fn redact_gemini_api_keys(text: &str) -> String {
    redact_secrets(text, &CONFIG.gemini_api_keys)
}

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn build_safety_settings() -> Vec<Value> {
    HARM_CATEGORIES
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect()
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else if let Some(call) = part.get("functionCall") {
                json!({ "functionCall": call.get("name") })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(instruction) = payload
        .pointer("/systemInstruction/parts/0/text")
        .and_then(|value| value.as_str())
    {
        summary.insert(
            "systemInstructionChars".to_string(),
            json!(instruction.chars().count()),
        );
    }

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        summary.insert("turns".to_string(), json!(contents.len()));
        if let Some(last) = contents.last() {
            let parts = last
                .get("parts")
                .and_then(|value| value.as_array())
                .map(|parts| summarize_gemini_parts(parts))
                .unwrap_or_default();
            summary.insert("lastTurn".to_string(), Value::Array(parts));
        }
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    if let Some(tools) = payload.get("tools") {
        summary.insert("tools".to_string(), tools.clone());
    }

    Value::Object(summary)
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn part_json(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text(text) => json!({ "text": text }),
        ContentPart::InlineBinary { mime_type, bytes } => json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": general_purpose::STANDARD.encode(bytes)
            }
        }),
        ContentPart::FunctionCall { name, args } => json!({
            "functionCall": { "name": name, "args": args }
        }),
        ContentPart::FunctionResponse { name, response } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
    }
}

fn turn_json(turn: &Turn) -> Value {
    let parts: Vec<Value> = turn.parts.iter().map(part_json).collect();
    json!({ "role": turn.role.as_str(), "parts": parts })
}

/// Base prompt followed by the current date and time at `now`'s offset.
pub fn system_instruction(base: &str, now: DateTime<FixedOffset>) -> String {
    let time_line = TIME_PROMPT_TEMPLATE
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{time}", &now.format("%H:%M:%S").to_string());
    format!("{base}\n\n{time_line}")
}

fn build_chat_payload(system_instruction: &str, history: &[Turn], user_turn: &Turn) -> Value {
    let contents: Vec<Value> = history
        .iter()
        .chain(std::iter::once(user_turn))
        .filter(|turn| !turn.is_empty())
        .map(turn_json)
        .collect();

    json!({
        "systemInstruction": { "parts": [{ "text": system_instruction }] },
        "contents": contents,
        "safetySettings": build_safety_settings(),
        "tools": [{ "google_search": {} }],
    })
}

fn build_image_payload(prompt: &str, source: Option<&MediaFile>) -> Value {
    let mut parts = vec![ContentPart::text(prompt)];
    if let Some(file) = source {
        parts.push(ContentPart::binary(file.mime_type.clone(), file.bytes.clone()));
    }

    json!({
        "contents": [turn_json(&Turn::user(parts))],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        "safetySettings": build_safety_settings(),
    })
}

/// Sends `payload`, retrying once on throttling, server errors and network
/// failures. Each attempt picks a fresh API key.
async fn send_gemini_request(url: &str, payload: &Value) -> Result<reqwest::Response> {
    let client = get_http_client();
    let timeout = CONFIG.gemini_request_timeout;

    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!(target: "llm.gemini", url = url, payload = %summarize_gemini_payload(payload));
    }

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let request = client
            .post(url)
            .header("x-goog-api-key", pick_api_key()?)
            .json(payload);

        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => {
                let should_retry = attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini request got no response within {}s (retrying={})",
                    timeout.as_secs(),
                    should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(anyhow!(
                    "Gemini request timed out after {}s",
                    timeout.as_secs()
                ));
            }
            Ok(Err(err)) => {
                let err_text = redact_gemini_api_keys(&err.to_string());
                let should_retry =
                    gemini_should_retry_error(&err) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={}, status={:?}, retrying={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect(),
                    err.status(),
                    should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(anyhow!("Gemini request failed: {}", err_text));
            }
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            let should_retry =
                gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
            warn!(
                "Gemini API error: status={}, body={}, retrying={}",
                status,
                redact_gemini_api_keys(&body_summary),
                should_retry
            );
            if should_retry {
                tokio::time::sleep(gemini_retry_delay(attempt)).await;
                continue;
            }
            let detail = redact_gemini_api_keys(&message.unwrap_or(body_summary));
            return Err(anyhow!(
                "Gemini request failed with status {}: {}",
                status,
                detail
            ));
        }

        return Ok(response);
    }
}

async fn call_gemini_api(model: &str, payload: &Value) -> Result<GeminiResponse> {
    let url = format!("{GEMINI_API_BASE}/{model}:generateContent");
    let response = send_gemini_request(&url, payload).await?;
    let value = tokio::time::timeout(
        CONFIG.gemini_request_timeout,
        response.json::<GeminiResponse>(),
    )
    .await
    .map_err(|_| anyhow!("Gemini response body timed out"))??;

    if let Some(message) = value.error_message() {
        return Err(anyhow!("Gemini returned an error: {}", message));
    }
    Ok(value)
}

/// Text carried by one streamed chunk, `None` when it carries none.
fn parse_stream_chunk(data: &str) -> Result<Option<String>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let response = match serde_json::from_str::<GeminiResponse>(data) {
        Ok(response) => response,
        Err(err) => {
            warn!(
                "Skipping unreadable Gemini stream chunk: {err}; data={}",
                truncate_for_log(data, 300)
            );
            return Ok(None);
        }
    };
    if let Some(message) = response.error_message() {
        return Err(anyhow!("Gemini stream error: {}", message));
    }

    let blocked = response.block_reason();
    let mut text = String::new();
    for part in response.into_parts() {
        match part {
            ContentPart::Text(fragment) => text.push_str(&fragment),
            ContentPart::InlineBinary { mime_type, .. } => {
                debug!(target: "llm.gemini", "Ignoring streamed {mime_type} part");
            }
            ContentPart::FunctionCall { name, .. } => {
                debug!(target: "llm.gemini", "Ignoring streamed function call {name}");
            }
            ContentPart::FunctionResponse { .. } => {}
        }
    }

    if text.is_empty() {
        if let Some(reason) = blocked {
            return Err(anyhow!("Gemini blocked the answer ({reason})"));
        }
        return Ok(None);
    }
    Ok(Some(text))
}

/// Turns an SSE body into a stream of text fragments. The stream ends with an
/// error when the body breaks or stays silent for `idle_timeout`.
fn sse_text_stream<S, B, E>(body: S, idle_timeout: Duration) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(body.eventsource());
    stream::unfold(Some(events), move |state| async move {
        let mut events = state?;
        loop {
            match tokio::time::timeout(idle_timeout, events.next()).await {
                Err(_) => {
                    let err = anyhow!(
                        "Gemini stream stalled for {}s",
                        idle_timeout.as_secs()
                    );
                    return Some((Err(err), None));
                }
                Ok(None) => return None,
                Ok(Some(Err(err))) => {
                    let err = anyhow!("Gemini stream broke: {}", err);
                    return Some((Err(err), None));
                }
                Ok(Some(Ok(event))) => match parse_stream_chunk(&event.data) {
                    Ok(Some(text)) => return Some((Ok(text), Some(events))),
                    Ok(None) => continue,
                    Err(err) => return Some((Err(err), None)),
                },
            }
        }
    })
    .boxed()
}

/// Opens a streamed answer to `user_turn` given the prior `history`.
pub async fn stream_chat(
    model: &str,
    system_prompt: &str,
    history: &[Turn],
    user_turn: &Turn,
) -> Result<BoxStream<'static, Result<String>>> {
    let now = Utc::now().with_timezone(&CONFIG.local_offset());
    let payload = build_chat_payload(&system_instruction(system_prompt, now), history, user_turn);
    let url = format!("{GEMINI_API_BASE}/{model}:streamGenerateContent?alt=sse");

    let response = log_llm_timing(
        "gemini",
        model,
        "stream_chat",
        Some(json!({ "history_turns": history.len() })),
        || send_gemini_request(&url, &payload),
    )
    .await?;

    Ok(sse_text_stream(
        response.bytes_stream(),
        CONFIG.gemini_stream_idle_timeout,
    ))
}

fn image_response(response: GeminiResponse) -> ImageResponse {
    let mut result = ImageResponse::default();
    let mut texts = Vec::new();
    for part in response.into_parts() {
        match part {
            ContentPart::Text(text) => {
                if !text.trim().is_empty() {
                    texts.push(text);
                }
            }
            ContentPart::InlineBinary { mime_type, bytes } => {
                if mime_type.starts_with("image/") {
                    result.images.push(bytes);
                }
            }
            ContentPart::FunctionCall { .. } | ContentPart::FunctionResponse { .. } => {}
        }
    }
    result.text = texts.join("\n");
    result
}

/// Generates a new image from `prompt`, or edits `source` when given.
pub async fn generate_image(
    prompt: &str,
    source: Option<&MediaFile>,
) -> Result<ImageResponse, ImageGenerationError> {
    let model = CONFIG.gemini_image_model.as_str();
    let payload = build_image_payload(prompt, source);
    let operation = if source.is_some() {
        "edit_image"
    } else {
        "generate_image"
    };

    let response = log_llm_timing("gemini", model, operation, None, || {
        call_gemini_api(model, &payload)
    })
    .await
    .map_err(|err| ImageGenerationError::Request(err.to_string()))?;

    let result = image_response(response);
    debug!(
        target: "llm.gemini",
        images = result.images.len(),
        text = %truncate_for_log(&result.text, 200),
        "Image response"
    );
    if result.images.is_empty() && result.text.trim().is_empty() {
        return Err(ImageGenerationError::Empty);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::media::MediaKind;
    use crate::store::Role;
    use chrono::TimeZone;
    use std::convert::Infallible;

    fn parse(value: Value) -> GeminiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn system_instruction_carries_local_date_and_time() {
        let offset = FixedOffset::east_opt(210 * 60).unwrap();
        let now = Utc
            .with_ymd_and_hms(2024, 3, 20, 21, 0, 5)
            .unwrap()
            .with_timezone(&offset);

        let instruction = system_instruction("Be brief.", now);
        assert!(instruction.starts_with("Be brief.\n\n"));
        assert!(instruction.contains("2024-03-21"));
        assert!(instruction.contains("00:30:05"));
    }

    #[test]
    fn chat_payload_orders_history_before_the_new_turn() {
        let history = vec![Turn::user_text("hi"), Turn::model_text("hello")];
        let user_turn = Turn::user(vec![
            ContentPart::text("what is this?"),
            ContentPart::binary("image/png", vec![1, 2, 3]),
        ]);

        let payload = build_chat_payload("sys", &history, &user_turn);
        let contents = payload["contents"].as_array().unwrap();

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "hello");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(contents[2]["parts"][1]["inlineData"]["data"], "AQID");
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(payload["tools"][0], json!({ "google_search": {} }));
        assert_eq!(payload["safetySettings"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn chat_payload_skips_empty_turns() {
        let history = vec![Turn::new(Role::Model, Vec::new())];
        let payload = build_chat_payload("sys", &history, &Turn::user_text("hi"));
        assert_eq!(payload["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn image_payload_requests_both_modalities() {
        let source = MediaFile {
            bytes: vec![9, 9],
            mime_type: "image/jpeg".to_string(),
            kind: MediaKind::Image,
            display_name: None,
        };
        let payload = build_image_payload("make it blue", Some(&source));

        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["TEXT", "IMAGE"])
        );
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "make it blue");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert!(payload.get("systemInstruction").is_none());
    }

    #[test]
    fn response_parts_keep_calls_and_drop_thoughts() {
        let response = parse(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "thinking...", "thought": true },
                        { "text": "answer" },
                        { "functionCall": { "name": "lookup", "args": { "q": "x" } } },
                        { "executableCode": { "code": "1+1" } }
                    ]
                }
            }]
        }));

        assert_eq!(
            response.into_parts(),
            vec![
                ContentPart::text("answer"),
                ContentPart::FunctionCall {
                    name: "lookup".to_string(),
                    args: json!({ "q": "x" }),
                },
            ]
        );
    }

    #[test]
    fn stream_chunk_text_is_extracted() {
        let chunk = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]}"#;
        assert_eq!(parse_stream_chunk(chunk).unwrap().as_deref(), Some("Hello"));
    }

    #[test]
    fn stream_chunk_without_text_is_skipped() {
        let chunk = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":3}}"#;
        assert_eq!(parse_stream_chunk(chunk).unwrap(), None);
        assert_eq!(parse_stream_chunk("not json").unwrap(), None);
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let chunk = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let err = parse_stream_chunk(chunk).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn streamed_error_object_is_an_error() {
        let chunk = r#"{"error":{"code":503,"message":"The model is overloaded."}}"#;
        let err = parse_stream_chunk(chunk).unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn sse_body_becomes_text_fragments() {
        let body = stream::iter(vec![
            Ok::<_, Infallible>(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n"
                    .to_vec(),
            ),
            Ok(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"te".to_vec()),
            Ok(b"xt\":\"lo\"}]}}]}\r\n\r\n".to_vec()),
        ]);

        let fragments: Vec<String> = sse_text_stream(body, Duration::from_secs(5))
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_times_out() {
        let body = stream::iter(vec![Ok::<_, Infallible>(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"partial\"}]}}]}\n\n"
                .to_vec(),
        )])
        .chain(stream::pending());

        let items: Vec<Result<String>> = sse_text_stream(body, Duration::from_secs(60))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(items[1]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("stalled"));
    }

    #[test]
    fn image_response_collects_images_and_text() {
        let response = parse(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "Here you go" },
                        { "inlineData": { "mimeType": "image/png", "data": "AQID" } }
                    ]
                }
            }]
        }));

        let result = image_response(response);
        assert_eq!(result.images, vec![vec![1, 2, 3]]);
        assert_eq!(result.text, "Here you go");
    }

    #[test]
    fn secrets_are_redacted() {
        let keys = vec!["AIzaSECRET".to_string(), " ".to_string()];
        assert_eq!(
            redact_secrets("bad key AIzaSECRET", &keys),
            "bad key [redacted]"
        );
    }
}
