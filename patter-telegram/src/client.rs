//! Thin client for the Telegram Bot API.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use patter_core::types::{Button, MediaKind, OutboundMedia, SendError, WebhookInfo};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram's maximum message length (in characters after entity parsing).
pub const TELEGRAM_MAX_LENGTH: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

pub struct TelegramClient {
    http: Client,
    token: String,
    api_base: String,
    /// Chat used as the upload target when a file needs a reusable file id;
    /// usually a private channel the bot administers.
    storage_chat_id: Option<String>,
}

impl TelegramClient {
    pub fn new(token: String, storage_chat_id: Option<String>) -> Self {
        Self {
            http: Client::new(),
            token,
            api_base: API_BASE.to_string(),
            storage_chat_id,
        }
    }

    /// Point the client at a different API host (tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, SendError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.token);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("{method}: {e}")))?;
        self.decode(method, response).await
    }

    async fn call_multipart(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Value, SendError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.token);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("{method}: {e}")))?;
        self.decode(method, response).await
    }

    async fn decode(&self, method: &str, response: reqwest::Response) -> Result<Value, SendError> {
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("{method}: invalid response: {e}")))?;
        if parsed.ok {
            return Ok(parsed.result);
        }
        let description = parsed.description.unwrap_or_else(|| "unknown error".into());
        Err(classify_error(
            parsed.error_code.unwrap_or(0),
            &format!("{method}: {description}"),
        ))
    }

    /// Send a text message with an optional inline keyboard. Returns the
    /// message id.
    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> Result<String, SendError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if !buttons.is_empty() {
            body["reply_markup"] = inline_keyboard(buttons);
        }
        let result = self.call("sendMessage", body).await?;
        Ok(message_id_of(&result))
    }

    /// Send one media item by platform file id, with an optional caption.
    pub async fn send_single_media(
        &self,
        chat_id: &str,
        item: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<String, SendError> {
        let (method, field) = media_method(item.kind);
        let mut body = json!({ "chat_id": chat_id, field: item.file_id });
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
        }
        let result = self.call(method, body).await?;
        Ok(message_id_of(&result))
    }

    /// Send an ordered media group (2..=10 items). The caption rides on the
    /// first item, which is where Telegram displays it.
    pub async fn send_media_group(
        &self,
        chat_id: &str,
        items: &[OutboundMedia],
        caption: Option<&str>,
    ) -> Result<Vec<String>, SendError> {
        let media: Vec<Value> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut entry = json!({
                    "type": input_media_type(item.kind),
                    "media": item.file_id,
                });
                if i == 0 {
                    if let Some(caption) = caption {
                        entry["caption"] = json!(caption);
                    }
                }
                entry
            })
            .collect();
        let body = json!({ "chat_id": chat_id, "media": media });
        let result = self.call("sendMediaGroup", body).await?;
        let ids = result
            .as_array()
            .map(|messages| messages.iter().map(message_id_of).collect())
            .unwrap_or_default();
        Ok(ids)
    }

    /// Upload bytes by sending them to the storage chat and harvesting the
    /// reusable file id from the response.
    pub async fn upload(&self, bytes: &[u8], mime: &str) -> Result<String, SendError> {
        let Some(storage_chat) = &self.storage_chat_id else {
            return Err(SendError::InvalidInput(
                "no storage_chat_id configured for media uploads".into(),
            ));
        };
        let kind = kind_for_mime(mime);
        let (method, field) = media_method(kind);
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name("upload")
            .mime_str(mime)
            .map_err(|e| SendError::InvalidInput(format!("invalid mime '{mime}': {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", storage_chat.clone())
            .part(field.to_string(), part);
        let result = self.call_multipart(method, form).await?;
        extract_file_id(&result, kind).ok_or_else(|| {
            SendError::Transient(format!("{method}: response carried no file id"))
        })
    }

    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), SendError> {
        let mut body = json!({ "url": url });
        if let Some(secret) = secret {
            body["secret_token"] = json!(secret);
        }
        self.call("setWebhook", body).await?;
        Ok(())
    }

    pub async fn get_webhook_info(&self) -> Result<WebhookInfo, SendError> {
        let result = self.call("getWebhookInfo", json!({})).await?;
        Ok(WebhookInfo {
            url: result
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            pending_update_count: result
                .get("pending_update_count")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            last_error_message: result
                .get("last_error_message")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    pub async fn delete_webhook(&self) -> Result<(), SendError> {
        self.call("deleteWebhook", json!({})).await?;
        Ok(())
    }
}

/// Map a Bot API error code onto the engine's failure kinds.
fn classify_error(code: i64, detail: &str) -> SendError {
    match code {
        401 | 403 => SendError::Unauthorized(detail.to_string()),
        400 | 404 => SendError::InvalidInput(detail.to_string()),
        // 429 and 5xx are retryable.
        _ => SendError::Transient(detail.to_string()),
    }
}

fn inline_keyboard(buttons: &[Button]) -> Value {
    // One button per row keeps labels readable on narrow screens.
    let rows: Vec<Value> = buttons
        .iter()
        .map(|b| json!([{ "text": b.text, "callback_data": b.value }]))
        .collect();
    json!({ "inline_keyboard": rows })
}

fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Image => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Document => ("sendDocument", "document"),
    }
}

fn input_media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "photo",
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::Document => "document",
    }
}

pub fn kind_for_mime(mime: &str) -> MediaKind {
    if mime.starts_with("image/") {
        MediaKind::Image
    } else if mime.starts_with("video/") {
        MediaKind::Video
    } else if mime.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

fn message_id_of(message: &Value) -> String {
    message
        .get("message_id")
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Pull the reusable file id out of a sent-message result. Photos come as a
/// size array; the largest rendition is last.
fn extract_file_id(message: &Value, kind: MediaKind) -> Option<String> {
    let file = match kind {
        MediaKind::Image => message.get("photo")?.as_array()?.last()?,
        MediaKind::Video => message.get("video")?,
        MediaKind::Audio => message.get("audio")?,
        MediaKind::Document => message.get("document")?,
    };
    file.get("file_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_failure_kinds() {
        assert!(matches!(classify_error(401, "x"), SendError::Unauthorized(_)));
        assert!(matches!(classify_error(403, "x"), SendError::Unauthorized(_)));
        assert!(matches!(classify_error(400, "x"), SendError::InvalidInput(_)));
        assert!(matches!(classify_error(404, "x"), SendError::InvalidInput(_)));
        assert!(matches!(classify_error(429, "x"), SendError::Transient(_)));
        assert!(matches!(classify_error(500, "x"), SendError::Transient(_)));
    }

    #[test]
    fn inline_keyboard_is_one_button_per_row() {
        let buttons = vec![
            Button { text: "Yes".into(), value: "yes".into() },
            Button { text: "No".into(), value: "no".into() },
        ];
        let markup = inline_keyboard(&buttons);
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0]["text"], "Yes");
        assert_eq!(rows[0][0]["callback_data"], "yes");
    }

    #[test]
    fn mime_chooses_the_upload_method() {
        assert_eq!(kind_for_mime("image/jpeg"), MediaKind::Image);
        assert_eq!(kind_for_mime("video/mp4"), MediaKind::Video);
        assert_eq!(kind_for_mime("audio/ogg"), MediaKind::Audio);
        assert_eq!(kind_for_mime("application/pdf"), MediaKind::Document);
    }

    #[test]
    fn file_id_extraction_takes_largest_photo() {
        let message = serde_json::json!({
            "message_id": 5,
            "photo": [
                {"file_id": "small", "width": 90},
                {"file_id": "large", "width": 800}
            ]
        });
        assert_eq!(
            extract_file_id(&message, MediaKind::Image),
            Some("large".into())
        );

        let doc = serde_json::json!({"message_id": 6, "document": {"file_id": "doc1"}});
        assert_eq!(
            extract_file_id(&doc, MediaKind::Document),
            Some("doc1".into())
        );
        assert_eq!(extract_file_id(&doc, MediaKind::Video), None);
    }

    #[tokio::test]
    async fn send_message_formats_the_bot_api_request() {
        // Minimal one-shot HTTP server capturing the request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut total = 0;
            loop {
                stream.readable().await.unwrap();
                match stream.try_read(&mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        let request = String::from_utf8_lossy(&buf[..total]);
                        if let Some(header_end) = request.find("\r\n\r\n") {
                            let content_length = request
                                .lines()
                                .find(|l| l.to_lowercase().starts_with("content-length:"))
                                .and_then(|l| l.split(':').nth(1))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if total - (header_end + 4) >= content_length {
                                break;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => break,
                }
            }

            let body = r#"{"ok":true,"result":{"message_id":42}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.writable().await.unwrap();
            stream.try_write(response.as_bytes()).unwrap();

            String::from_utf8_lossy(&buf[..total]).to_string()
        });

        let client = TelegramClient::new("123:abc".into(), None)
            .with_api_base(&format!("http://{addr}"));
        let buttons = vec![Button { text: "Go".into(), value: "go".into() }];
        let message_id = client.send_message("777", "Hello!", &buttons).await.unwrap();
        assert_eq!(message_id, "42");

        let captured = server.await.unwrap();
        assert!(captured.contains("POST /bot123:abc/sendMessage"));
        assert!(captured.contains("\"chat_id\":\"777\""));
        assert!(captured.contains("Hello!"));
        assert!(captured.contains("callback_data"));
    }

    #[tokio::test]
    async fn upload_without_storage_chat_is_rejected() {
        let client = TelegramClient::new("123:abc".into(), None);
        let err = client.upload(b"bytes", "image/png").await.unwrap_err();
        assert!(matches!(err, SendError::InvalidInput(_)));
    }
}
