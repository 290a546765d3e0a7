use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ModelPreference;
use crate::store::ConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub store: ConversationStore,
    preferences: Arc<Mutex<HashMap<String, ModelPreference>>>,
    user_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AppState {
    pub fn new(store: ConversationStore) -> Self {
        AppState {
            store,
            preferences: Arc::new(Mutex::new(HashMap::new())),
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock held for a whole request/response cycle so a user's turns land in
    /// the history in order.
    pub fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    pub fn preference(&self, user_id: &str) -> ModelPreference {
        self.preferences
            .lock()
            .get(user_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn toggle_preference(&self, user_id: &str) -> ModelPreference {
        let mut preferences = self.preferences.lock();
        let entry = preferences.entry(user_id.to_string()).or_default();
        *entry = entry.toggled();
        *entry
    }

    pub fn reset_preference(&self, user_id: &str) {
        self.preferences.lock().remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(ConversationStore::new("unused.json", 10))
    }

    #[test]
    fn preference_toggles_per_user() {
        let state = state();
        assert_eq!(state.preference("1"), ModelPreference::Primary);
        assert_eq!(state.toggle_preference("1"), ModelPreference::Alternate);
        assert_eq!(state.preference("1"), ModelPreference::Alternate);
        assert_eq!(state.preference("2"), ModelPreference::Primary);

        state.reset_preference("1");
        assert_eq!(state.preference("1"), ModelPreference::Primary);
    }

    #[tokio::test]
    async fn user_lock_is_shared_per_user() {
        let state = state();
        let first = state.user_lock("1");
        let _guard = first.lock().await;

        assert!(state.user_lock("1").try_lock().is_err());
        assert!(state.user_lock("2").try_lock().is_ok());
    }
}
