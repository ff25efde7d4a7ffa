//! State repository: the store fronted by a bounded cache, plus the
//! buffered history writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::store::{DialogState, Store, StoreError};
use crate::types::{ConversationKey, HistoryEntry};

/// Cache-first access to dialog states.
///
/// The cache is write-through: `update` invalidates the entry before
/// acknowledging success, then refills it with the fresh row, so the next
/// event for the conversation never observes a stale state.
pub struct StateRepository {
    store: Arc<Store>,
    cache: moka::sync::Cache<ConversationKey, DialogState>,
    history: HistoryBuffer,
}

impl StateRepository {
    pub fn new(store: Arc<Store>, config: &EngineConfig) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(config.state_cache_size)
            .time_to_live(Duration::from_secs(config.state_cache_ttl_secs))
            .build();
        Self {
            store,
            cache,
            history: HistoryBuffer::new(config.history_buffer_cap),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Look up a conversation's state, cache-first.
    pub fn get(&self, key: &ConversationKey) -> Result<Option<DialogState>, StoreError> {
        if let Some(state) = self.cache.get(key) {
            return Ok(Some(state));
        }
        let state = self
            .store
            .get_dialog_state(&key.bot_id, key.platform, &key.chat_id)?;
        if let Some(state) = &state {
            self.cache.insert(key.clone(), state.clone());
        }
        Ok(state)
    }

    /// Create the state for a new conversation. Fails with `Conflict` if one
    /// already exists.
    pub fn create(
        &self,
        key: &ConversationKey,
        scenario_id: Option<&str>,
        current_step: &str,
        collected: &Map<String, Value>,
    ) -> Result<DialogState, StoreError> {
        let state = self.store.create_dialog_state(
            &key.bot_id,
            key.platform,
            &key.chat_id,
            scenario_id,
            current_step,
            collected,
        )?;
        self.cache.insert(key.clone(), state.clone());
        Ok(state)
    }

    /// Optimistic-concurrency update. Invalidate-then-refill keeps readers
    /// from seeing the old row after this returns.
    pub fn update(
        &self,
        key: &ConversationKey,
        state_id: &str,
        expected_version: i64,
        scenario_id: Option<&str>,
        current_step: &str,
        collected: &Map<String, Value>,
    ) -> Result<DialogState, StoreError> {
        let updated = self.store.update_dialog_state(
            state_id,
            expected_version,
            scenario_id,
            current_step,
            collected,
        )?;
        self.cache.invalidate(key);
        self.cache.insert(key.clone(), updated.clone());
        Ok(updated)
    }

    /// Remove a conversation's state. Persisted history cascades in the
    /// store; buffered entries are flushed first so nothing is lost silently.
    pub fn delete(&self, key: &ConversationKey, state_id: &str) -> Result<bool, StoreError> {
        self.history.flush(&self.store, state_id)?;
        let deleted = self.store.delete_dialog_state(state_id)?;
        self.cache.invalidate(key);
        Ok(deleted)
    }

    /// Buffer a history entry. The write is deferred until `flush_history`
    /// or until the per-conversation buffer cap forces it out.
    pub fn append_history(&self, dialog_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        self.history.append(&self.store, dialog_id, entry)
    }

    /// Flush buffered history for one conversation.
    pub fn flush_history(&self, dialog_id: &str) -> Result<(), StoreError> {
        self.history.flush(&self.store, dialog_id)
    }

    /// Read a conversation's full history (flushing the buffer first).
    pub fn history(&self, dialog_id: &str) -> Result<Vec<(i64, HistoryEntry)>, StoreError> {
        self.history.flush(&self.store, dialog_id)?;
        self.store.get_history(dialog_id)
    }
}

/// Per-conversation buffered history appends. Entries stay in order; a
/// buffer that reaches its cap is flushed to the store immediately.
struct HistoryBuffer {
    cap: usize,
    pending: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl HistoryBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn append(&self, store: &Store, dialog_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        let to_flush = {
            let mut pending = self.pending.lock().unwrap();
            let buf = pending.entry(dialog_id.to_string()).or_default();
            buf.push(entry);
            if buf.len() >= self.cap {
                Some(std::mem::take(buf))
            } else {
                None
            }
        };
        if let Some(entries) = to_flush {
            store.append_history_batch(dialog_id, &entries)?;
        }
        Ok(())
    }

    fn flush(&self, store: &Store, dialog_id: &str) -> Result<(), StoreError> {
        let entries = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(dialog_id)
        };
        if let Some(entries) = entries {
            if !entries.is_empty() {
                store.append_history_batch(dialog_id, &entries)?;
            }
        }
        Ok(())
    }
}
