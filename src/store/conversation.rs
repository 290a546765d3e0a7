use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One fragment of a turn. Function calls and responses only live for a single
/// request/response cycle and are dropped when the history is written to disk.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    InlineBinary { mime_type: String, bytes: Vec<u8> },
    FunctionCall { name: String, args: Value },
    FunctionResponse { name: String, response: Value },
}

impl ContentPart {
    pub fn text(value: impl Into<String>) -> Self {
        ContentPart::Text(value.into())
    }

    pub fn binary(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        ContentPart::InlineBinary {
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::User, parts)
    }

    #[cfg(test)]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![ContentPart::text(text)])
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Concatenated text parts, ignoring binary and tool parts.
    #[cfg(test)]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                ContentPart::Text(text) => out.push_str(text),
                ContentPart::InlineBinary { .. }
                | ContentPart::FunctionCall { .. }
                | ContentPart::FunctionResponse { .. } => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub generated_images: u64,
    #[serde(default)]
    pub edited_images: u64,
    #[serde(default)]
    pub voices: u64,
    #[serde(default)]
    pub files: u64,
}

impl UsageStats {
    pub fn record(&mut self, kind: UsageKind) {
        let counter = match kind {
            UsageKind::GeneratedImage => &mut self.generated_images,
            UsageKind::EditedImage => &mut self.edited_images,
            UsageKind::Voice => &mut self.voices,
            UsageKind::File => &mut self.files,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn reset_daily(&mut self) {
        self.generated_images = 0;
        self.edited_images = 0;
        self.voices = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    GeneratedImage,
    EditedImage,
    Voice,
    File,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationRecord {
    pub history: Vec<Turn>,
    pub stats: UsageStats,
}

// On-disk shape of a record. Field names follow the JSON file layout.

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    #[serde(default)]
    history: Vec<StoredTurn>,
    #[serde(default)]
    stats: UsageStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTurn {
    role: Role,
    #[serde(default)]
    parts: Vec<StoredPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredPart {
    Text { text: String },
    InlineData { inline_data: StoredInlineData },
    Unknown(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredInlineData {
    mime_type: String,
    data: String,
}

impl From<&ConversationRecord> for StoredRecord {
    fn from(record: &ConversationRecord) -> Self {
        let history = record
            .history
            .iter()
            .filter_map(|turn| {
                let parts: Vec<StoredPart> = turn
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text(text) => Some(StoredPart::Text { text: text.clone() }),
                        ContentPart::InlineBinary { mime_type, bytes } => {
                            Some(StoredPart::InlineData {
                                inline_data: StoredInlineData {
                                    mime_type: mime_type.clone(),
                                    data: general_purpose::STANDARD.encode(bytes),
                                },
                            })
                        }
                        ContentPart::FunctionCall { .. } | ContentPart::FunctionResponse { .. } => {
                            None
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(StoredTurn {
                        role: turn.role,
                        parts,
                    })
                }
            })
            .collect();

        StoredRecord {
            history,
            stats: record.stats,
        }
    }
}

impl StoredRecord {
    pub(crate) fn into_record(self, user_id: &str) -> ConversationRecord {
        let mut history = Vec::with_capacity(self.history.len());
        for stored_turn in self.history {
            let mut parts = Vec::with_capacity(stored_turn.parts.len());
            for part in stored_turn.parts {
                match part {
                    StoredPart::Text { text } => parts.push(ContentPart::Text(text)),
                    StoredPart::InlineData { inline_data } => {
                        match general_purpose::STANDARD.decode(inline_data.data.as_bytes()) {
                            Ok(bytes) => parts.push(ContentPart::InlineBinary {
                                mime_type: inline_data.mime_type,
                                bytes,
                            }),
                            Err(err) => warn!(
                                user_id = user_id,
                                "Dropping undecodable inline_data part: {err}"
                            ),
                        }
                    }
                    StoredPart::Unknown(value) => warn!(
                        user_id = user_id,
                        "Dropping unrecognized history part: {}",
                        truncate_json(&value)
                    ),
                }
            }
            if !parts.is_empty() {
                history.push(Turn::new(stored_turn.role, parts));
            }
        }

        ConversationRecord {
            history,
            stats: self.stats,
        }
    }
}

fn truncate_json(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= 120 {
        return text;
    }
    let truncated: String = text.chars().take(120).collect();
    format!("{truncated}...")
}
