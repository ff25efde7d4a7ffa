//! `PlatformAdapter` implementation for Telegram.

use serde_json::Value;

use patter_core::adapter::PlatformAdapter;
use patter_core::types::{
    Button, Event, GroupSendError, OutboundMedia, Platform, SendError, WebhookInfo,
};

use crate::client::{TELEGRAM_MAX_LENGTH, TelegramClient};
use crate::parse::parse_update;

pub struct TelegramAdapter {
    client: TelegramClient,
}

impl TelegramAdapter {
    pub fn new(client: TelegramClient) -> Self {
        Self { client }
    }

    /// Build an adapter from a credential's opaque secrets:
    /// `{"token": "..."}` or `{"token_env": "VAR"}`, optionally with
    /// `"storage_chat_id"` for media uploads.
    pub fn from_secrets(secrets: &Value) -> Result<Self, String> {
        let token = match secrets.get("token").and_then(|v| v.as_str()) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => match secrets.get("token_env").and_then(|v| v.as_str()) {
                Some(var) => std::env::var(var)
                    .map_err(|_| format!("environment variable '{var}' is not set"))?,
                None => return Err("telegram secrets carry neither 'token' nor 'token_env'".into()),
            },
        };
        let storage_chat_id = secrets
            .get("storage_chat_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Self::new(TelegramClient::new(token, storage_chat_id)))
    }
}

impl PlatformAdapter for TelegramAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn parse_event(&self, raw: &Value) -> Event {
        parse_update(raw)
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> Result<String, SendError> {
        // Long texts are split; the keyboard goes on the last chunk so it
        // lands under the end of the message.
        let chunks = split_message(text);
        let no_buttons: &[Button] = &[];
        let mut last_id = String::new();
        let last_index = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_buttons = if i == last_index { buttons } else { no_buttons };
            last_id = self.client.send_message(chat_id, chunk, chunk_buttons).await?;
        }
        Ok(last_id)
    }

    async fn send_media(
        &self,
        chat_id: &str,
        items: &[OutboundMedia],
        caption: Option<&str>,
    ) -> Result<Vec<String>, GroupSendError> {
        match items {
            [] => Ok(Vec::new()),
            [single] => self
                .client
                .send_single_media(chat_id, single, caption)
                .await
                .map(|id| vec![id])
                .map_err(|error| GroupSendError { index: 0, error }),
            group => self
                .client
                .send_media_group(chat_id, group, caption)
                .await
                // The Bot API accepts or rejects the group as a unit.
                .map_err(|error| GroupSendError { index: 0, error }),
        }
    }

    async fn upload_media(&self, bytes: &[u8], mime: &str) -> Result<String, SendError> {
        self.client.upload(bytes, mime).await
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), SendError> {
        self.client.set_webhook(url, secret).await
    }

    async fn get_webhook_info(&self) -> Result<WebhookInfo, SendError> {
        self.client.get_webhook_info().await
    }

    async fn delete_webhook(&self) -> Result<(), SendError> {
        self.client.delete_webhook().await
    }
}

/// Split text into chunks that fit within Telegram's message length limit.
///
/// Prefers splitting at newline or space boundaries for readability.
pub fn split_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_LENGTH {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= TELEGRAM_MAX_LENGTH {
            parts.push(chars[start..].iter().collect());
            break;
        }

        let end = start + TELEGRAM_MAX_LENGTH;
        let chunk = &chars[start..end];

        let split_offset = chunk
            .iter()
            .rposition(|&c| c == '\n')
            .or_else(|| chunk.iter().rposition(|&c| c == ' '))
            .map(|i| i + 1)
            .unwrap_or(TELEGRAM_MAX_LENGTH);

        parts.push(chars[start..start + split_offset].iter().collect());
        start += split_offset;
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello"), vec!["hello"]);
    }

    #[test]
    fn long_message_splits_at_word_boundaries() {
        let word = "word ";
        let long: String = word.repeat(1000); // 5000 chars
        let parts = split_message(&long);
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(part.chars().count() <= TELEGRAM_MAX_LENGTH);
        }
        assert_eq!(parts.concat(), long);
        // No chunk starts mid-word.
        for part in &parts[1..] {
            assert!(part.starts_with("word"));
        }
    }

    #[test]
    fn unbroken_text_splits_hard() {
        let long = "x".repeat(TELEGRAM_MAX_LENGTH + 10);
        let parts = split_message(&long);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), TELEGRAM_MAX_LENGTH);
        assert_eq!(parts[1].chars().count(), 10);
    }

    #[test]
    fn from_secrets_requires_a_token() {
        assert!(TelegramAdapter::from_secrets(&json!({"token": "123:abc"})).is_ok());
        assert!(TelegramAdapter::from_secrets(&json!({})).is_err());
        assert!(TelegramAdapter::from_secrets(&json!({"token": ""})).is_err());
    }

    #[test]
    fn adapter_parses_updates() {
        let adapter = TelegramAdapter::from_secrets(&json!({"token": "123:abc"})).unwrap();
        let event = adapter.parse_event(&json!({
            "update_id": 5,
            "message": {"chat": {"id": 1}, "text": "hi"}
        }));
        assert_eq!(event.id, "5");
        assert_eq!(event.chat_id, "1");
    }
}
