//! Test and simulation helpers.
//!
//! `MockAdapter` implements `PlatformAdapter` against in-memory queues: it
//! records every send and replays scripted upload/send outcomes. The CLI's
//! offline `simulate` command drives the real engine with it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde_json::Value;

use crate::adapter::PlatformAdapter;
use crate::store::Store;
use crate::types::{
    Button, Event, EventKind, GroupSendError, OutboundMedia, Platform, SendError, WebhookInfo,
};

/// One recorded outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: Option<String>,
    pub buttons: Vec<Button>,
    pub media: Vec<OutboundMedia>,
}

#[derive(Default)]
pub struct MockAdapter {
    sent: Mutex<Vec<SentMessage>>,
    upload_results: Mutex<VecDeque<Result<String, SendError>>>,
    send_failures: Mutex<VecDeque<SendError>>,
    uploads: AtomicU32,
    next_message_id: AtomicU64,
    webhook_url: Mutex<Option<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of the next `upload_media` call (FIFO).
    pub fn push_upload_result(&self, result: Result<String, SendError>) {
        self.upload_results.lock().unwrap().push_back(result);
    }

    /// Script a failure for the next send call (FIFO); sends succeed once
    /// the queue is drained.
    pub fn fail_next_send(&self, error: SendError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| m.text)
            .collect()
    }

    pub fn upload_count(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> String {
        format!("mock-msg-{}", self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    fn pop_send_failure(&self) -> Option<SendError> {
        self.send_failures.lock().unwrap().pop_front()
    }
}

impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    /// Parses the mock wire format:
    /// `{"update_id": 1, "chat": "c", "text"|"button"|"command": "..."}`.
    fn parse_event(&self, raw: &Value) -> Event {
        let id = raw
            .get("update_id")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let chat_id = raw
            .get("chat")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = if let Some(text) = raw.get("text").and_then(|v| v.as_str()) {
            EventKind::Text { text: text.to_string() }
        } else if let Some(value) = raw.get("button").and_then(|v| v.as_str()) {
            EventKind::ButtonPress { value: value.to_string() }
        } else if let Some(name) = raw.get("command").and_then(|v| v.as_str()) {
            EventKind::Command { name: name.trim_start_matches('/').to_string() }
        } else {
            EventKind::Unknown
        };
        Event { id, chat_id, kind }
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> Result<String, SendError> {
        if let Some(error) = self.pop_send_failure() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(SentMessage {
            chat_id: chat_id.to_string(),
            text: Some(text.to_string()),
            buttons: buttons.to_vec(),
            media: Vec::new(),
        });
        Ok(self.next_id())
    }

    async fn send_media(
        &self,
        chat_id: &str,
        items: &[OutboundMedia],
        caption: Option<&str>,
    ) -> Result<Vec<String>, GroupSendError> {
        if let Some(error) = self.pop_send_failure() {
            return Err(GroupSendError { index: 0, error });
        }
        self.sent.lock().unwrap().push(SentMessage {
            chat_id: chat_id.to_string(),
            text: caption.map(str::to_string),
            buttons: Vec::new(),
            media: items.to_vec(),
        });
        Ok(items.iter().map(|_| self.next_id()).collect())
    }

    async fn upload_media(&self, _bytes: &[u8], _mime: &str) -> Result<String, SendError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.upload_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SendError::Transient("no scripted upload result".into())))
    }

    async fn set_webhook(&self, url: &str, _secret: Option<&str>) -> Result<(), SendError> {
        *self.webhook_url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn get_webhook_info(&self) -> Result<WebhookInfo, SendError> {
        Ok(WebhookInfo {
            url: self.webhook_url.lock().unwrap().clone().unwrap_or_default(),
            pending_update_count: 0,
            last_error_message: None,
        })
    }

    async fn delete_webhook(&self) -> Result<(), SendError> {
        *self.webhook_url.lock().unwrap() = None;
        Ok(())
    }
}

/// Seed a bot with an activated scenario; returns (bot_id, scenario_id).
pub fn seed_bot_with_scenario(store: &Store, graph_json: &str) -> (String, String) {
    let bot = store.create_bot("test-account", "test-bot").expect("create bot");
    let record = store
        .insert_scenario(&bot.id, graph_json)
        .expect("insert scenario");
    store.activate_scenario(&record.id).expect("activate scenario");
    (bot.id, record.id)
}
