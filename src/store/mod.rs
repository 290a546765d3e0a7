pub mod conversation;
pub mod schedule;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

pub use conversation::{ContentPart, ConversationRecord, Role, Turn, UsageKind, UsageStats};
use conversation::StoredRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to serialize conversation store: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write conversation store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct StoreInner {
    records: Mutex<HashMap<String, ConversationRecord>>,
    save_lock: tokio::sync::Mutex<()>,
    path: PathBuf,
    history_window: usize,
}

/// Per-user conversation records backed by a single JSON file.
///
/// The record map is only locked for in-memory work; file writes are
/// serialized by a separate async lock shared by every user.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>, history_window: usize) -> Self {
        Self::with_records(path.into(), history_window, HashMap::new())
    }

    fn with_records(
        path: PathBuf,
        history_window: usize,
        records: HashMap<String, ConversationRecord>,
    ) -> Self {
        ConversationStore {
            inner: Arc::new(StoreInner {
                records: Mutex::new(records),
                save_lock: tokio::sync::Mutex::new(()),
                path,
                history_window: history_window.max(1),
            }),
        }
    }

    /// Reads the store file. A missing file means a fresh install; an
    /// unreadable or corrupt file is logged and replaced by an empty store.
    pub async fn load(path: impl Into<PathBuf>, history_window: usize) -> Self {
        let path = path.into();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    "{} not found. Starting with empty conversations.",
                    path.display()
                );
                return Self::new(path, history_window);
            }
            Err(err) => {
                error!(
                    "Could not read conversations from {}: {}. Starting with empty conversations.",
                    path.display(),
                    err
                );
                return Self::new(path, history_window);
            }
        };

        let parsed: BTreeMap<String, StoredRecord> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(
                    "Could not parse conversations from {}: {}. Starting with empty conversations.",
                    path.display(),
                    err
                );
                return Self::new(path, history_window);
            }
        };

        let records: HashMap<String, ConversationRecord> = parsed
            .into_iter()
            .map(|(user_id, stored)| {
                let mut record = stored.into_record(&user_id);
                truncate_history(&mut record.history, history_window.max(1));
                (user_id, record)
            })
            .collect();

        info!(
            "Loaded {} conversation(s) from {}",
            records.len(),
            path.display()
        );
        Self::with_records(path, history_window, records)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    #[cfg(test)]
    pub fn get(&self, user_id: &str) -> Option<ConversationRecord> {
        self.inner.records.lock().get(user_id).cloned()
    }

    pub fn get_or_create(&self, user_id: &str) -> ConversationRecord {
        self.inner
            .records
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    pub fn stats(&self, user_id: &str) -> UsageStats {
        self.inner
            .records
            .lock()
            .get(user_id)
            .map(|record| record.stats)
            .unwrap_or_default()
    }

    /// Appends a completed exchange and keeps only the newest `history_window` turns.
    pub fn append_turn(&self, user_id: &str, user_turn: Turn, model_turn: Turn) {
        let window = self.inner.history_window;
        let mut records = self.inner.records.lock();
        let record = records.entry(user_id.to_string()).or_default();
        record.history.push(user_turn);
        record.history.push(model_turn);
        truncate_history(&mut record.history, window);
        record.stats.messages = record.stats.messages.saturating_add(1);
    }

    /// Empties the history and resets the message counter. Returns whether the
    /// user had a record at all.
    pub fn clear(&self, user_id: &str) -> bool {
        let mut records = self.inner.records.lock();
        match records.get_mut(user_id) {
            Some(record) => {
                record.history.clear();
                record.stats.messages = 0;
                true
            }
            None => false,
        }
    }

    pub fn record_usage(&self, user_id: &str, kind: UsageKind) {
        self.inner
            .records
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .stats
            .record(kind);
    }

    pub fn reset_daily_counters(&self) {
        let mut records = self.inner.records.lock();
        for record in records.values_mut() {
            record.stats.reset_daily();
        }
        info!("Daily counters reset for {} user(s)", records.len());
    }

    /// Writes every record to the store file. Concurrent calls queue on one lock.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.inner.save_lock.lock().await;

        let snapshot: Vec<(String, ConversationRecord)> = {
            let records = self.inner.records.lock();
            records
                .iter()
                .map(|(user_id, record)| (user_id.clone(), record.clone()))
                .collect()
        };
        let stored: BTreeMap<String, StoredRecord> = snapshot
            .iter()
            .map(|(user_id, record)| (user_id.clone(), StoredRecord::from(record)))
            .collect();
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let path = &self.inner.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let temp_path = temp_path_for(path);
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Fire-and-forget persist. Failures are logged; memory stays authoritative.
    pub fn persist_in_background(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(err) = store.persist().await {
                error!(
                    "Conversation store NOT saved; changes since the last save will be lost on restart: {err}"
                );
            }
        });
    }
}

fn truncate_history(history: &mut Vec<Turn>, window: usize) {
    if history.len() > window {
        let excess = history.len() - window;
        history.drain(..excess);
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    if name.is_empty() {
        warn!("Conversation store path has no file name: {}", path.display());
        name.push("conversations.json");
    }
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn turn_pair(index: usize) -> (Turn, Turn) {
        (
            Turn::user_text(format!("question {index}")),
            Turn::model_text(format!("answer {index}")),
        )
    }

    #[test]
    fn get_or_create_inserts_an_empty_record_once() {
        let store = ConversationStore::new("unused.json", 10);
        assert!(store.get("1").is_none());
        assert_eq!(store.get_or_create("1"), ConversationRecord::default());
        store.append_turn("1", Turn::user_text("a"), Turn::model_text("b"));
        assert_eq!(store.get_or_create("1").history.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_resets_history_and_messages_and_is_idempotent() {
        let store = ConversationStore::new("unused.json", 10);
        assert!(!store.clear("7"));

        let (user, model) = turn_pair(0);
        store.append_turn("7", user, model);
        store.record_usage("7", UsageKind::GeneratedImage);
        store.record_usage("7", UsageKind::Voice);

        assert!(store.clear("7"));
        assert!(store.clear("7"));
        let record = store.get("7").unwrap();
        assert!(record.history.is_empty());
        assert_eq!(record.stats.messages, 0);
        assert_eq!(record.stats.generated_images, 1);
        assert_eq!(record.stats.voices, 1);
    }

    #[test]
    fn history_keeps_only_the_newest_window() {
        let store = ConversationStore::new("unused.json", 6);
        for index in 0..5 {
            let (user, model) = turn_pair(index);
            store.append_turn("u", user, model);
        }

        let record = store.get("u").unwrap();
        let texts: Vec<String> = record.history.iter().map(Turn::text).collect();
        assert_eq!(
            texts,
            vec![
                "question 2",
                "answer 2",
                "question 3",
                "answer 3",
                "question 4",
                "answer 4"
            ]
        );
        assert_eq!(record.stats.messages, 5);
    }

    #[test]
    fn reset_daily_counters_touches_every_user() {
        let store = ConversationStore::new("unused.json", 10);
        for user_id in ["a", "b"] {
            let (user, model) = turn_pair(1);
            store.append_turn(user_id, user, model);
            store.record_usage(user_id, UsageKind::GeneratedImage);
            store.record_usage(user_id, UsageKind::EditedImage);
            store.record_usage(user_id, UsageKind::Voice);
            store.record_usage(user_id, UsageKind::File);
        }

        store.reset_daily_counters();

        for user_id in ["a", "b"] {
            let record = store.get(user_id).unwrap();
            assert_eq!(record.history.len(), 2);
            assert_eq!(
                record.stats,
                UsageStats {
                    messages: 1,
                    generated_images: 0,
                    edited_images: 0,
                    voices: 0,
                    files: 1,
                }
            );
        }
    }

    #[tokio::test]
    async fn persisted_records_load_back_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let store = ConversationStore::new(&path, 100);

        let photo: Vec<u8> = (0..=255).collect();
        store.append_turn(
            "1001",
            Turn::user(vec![
                ContentPart::text("چه چیزی در این عکس است؟"),
                ContentPart::binary("image/jpeg", photo.clone()),
            ]),
            Turn::model_text("A cat on a sofa."),
        );
        store.append_turn("1001", Turn::user_text("thanks"), Turn::model_text("🙂"));
        store.record_usage("1001", UsageKind::File);
        store.get_or_create("2002");

        store.persist().await.unwrap();
        assert!(!temp_path_for(&path).exists());

        let loaded = ConversationStore::load(&path, 100).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("1001"), store.get("1001"));
        assert_eq!(loaded.get("2002"), Some(ConversationRecord::default()));
        match &loaded.get("1001").unwrap().history[0].parts[1] {
            ContentPart::InlineBinary { mime_type, bytes } => {
                assert_eq!(mime_type, "image/jpeg");
                assert_eq!(bytes, &photo);
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_keeps_non_ascii_text_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let store = ConversationStore::new(&path, 10);
        store.append_turn("1", Turn::user_text("سلام"), Turn::model_text("درود"));
        store.persist().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("سلام"));
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["1"]["stats"]["messages"], 1);
        assert_eq!(value["1"]["history"][1]["role"], "model");
    }

    #[tokio::test]
    async fn tool_call_turns_do_not_survive_a_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let store = ConversationStore::new(&path, 10);
        store.append_turn(
            "1",
            Turn::user_text("search this"),
            Turn::new(
                Role::Model,
                vec![ContentPart::FunctionCall {
                    name: "search".to_string(),
                    args: serde_json::json!({}),
                }],
            ),
        );
        store.persist().await.unwrap();

        let loaded = ConversationStore::load(&path, 10).await;
        assert_eq!(
            loaded.get("1").unwrap().history,
            vec![Turn::user_text("search this")]
        );
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = ConversationStore::load(dir.path().join("absent.json"), 10).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chats.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        let store = ConversationStore::load(&path, 10).await;
        assert_eq!(store.len(), 0);
        assert_eq!(store.path(), path.as_path());
    }

    #[tokio::test]
    async fn concurrent_persists_leave_a_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let store = ConversationStore::new(&path, 50);

        let mut handles = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (user, model) = turn_pair(index);
                store.append_turn(&index.to_string(), user, model);
                store.persist().await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        store.persist().await.unwrap();

        let loaded = ConversationStore::load(&path, 50).await;
        assert_eq!(loaded.len(), 8);
    }
}
