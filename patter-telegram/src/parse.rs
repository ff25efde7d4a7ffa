//! Pure conversion of Telegram webhook updates into neutral events.

use serde::Deserialize;
use serde_json::Value;

use patter_core::types::{Event, EventKind};

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<Message>,
}

/// Classify a raw update. Total: anything unrecognized becomes
/// `EventKind::Unknown` with whatever update id could be recovered.
pub fn parse_update(raw: &Value) -> Event {
    let update: Update = match serde_json::from_value(raw.clone()) {
        Ok(update) => update,
        Err(_) => {
            return Event {
                id: raw
                    .get("update_id")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                chat_id: String::new(),
                kind: EventKind::Unknown,
            };
        }
    };
    let id = update.update_id.to_string();

    if let Some(query) = update.callback_query {
        if let (Some(data), Some(message)) = (query.data, query.message) {
            return Event {
                id,
                chat_id: message.chat.id.to_string(),
                kind: EventKind::ButtonPress { value: data },
            };
        }
        return Event {
            id,
            chat_id: String::new(),
            kind: EventKind::Unknown,
        };
    }

    if let Some(message) = update.message {
        let chat_id = message.chat.id.to_string();
        let text = message.text.or(message.caption);
        return match text {
            Some(text) if text.starts_with('/') => Event {
                id,
                chat_id,
                kind: EventKind::Command {
                    name: command_name(&text),
                },
            },
            Some(text) => Event {
                id,
                chat_id,
                kind: EventKind::Text { text },
            },
            // Stickers, locations, contacts and the rest.
            None => Event {
                id,
                chat_id,
                kind: EventKind::Unknown,
            },
        };
    }

    Event {
        id,
        chat_id: String::new(),
        kind: EventKind::Unknown,
    }
}

/// `/start@my_bot arg` → `start`.
fn command_name(text: &str) -> String {
    text.trim_start_matches('/')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .split('@')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_message_parses() {
        let event = parse_update(&json!({
            "update_id": 1001,
            "message": {
                "message_id": 1,
                "date": 1_700_000_000,
                "chat": {"id": 555, "type": "private"},
                "text": "hello there"
            }
        }));
        assert_eq!(event.id, "1001");
        assert_eq!(event.chat_id, "555");
        assert_eq!(event.kind, EventKind::Text { text: "hello there".into() });
    }

    #[test]
    fn command_parses_with_bot_suffix_and_args() {
        let event = parse_update(&json!({
            "update_id": 1002,
            "message": {
                "chat": {"id": 555},
                "text": "/Start@menu_bot now please"
            }
        }));
        assert_eq!(event.kind, EventKind::Command { name: "start".into() });
    }

    #[test]
    fn callback_query_becomes_button_press() {
        let event = parse_update(&json!({
            "update_id": 1003,
            "callback_query": {
                "id": "cbq1",
                "from": {"id": 9, "is_bot": false, "first_name": "A"},
                "data": "yes",
                "message": {"message_id": 3, "chat": {"id": 555}}
            }
        }));
        assert_eq!(event.id, "1003");
        assert_eq!(event.chat_id, "555");
        assert_eq!(event.kind, EventKind::ButtonPress { value: "yes".into() });
    }

    #[test]
    fn photo_without_caption_is_unknown() {
        let event = parse_update(&json!({
            "update_id": 1004,
            "message": {
                "chat": {"id": 555},
                "photo": [{"file_id": "abc", "file_unique_id": "d", "width": 1, "height": 1}]
            }
        }));
        assert_eq!(event.chat_id, "555");
        assert_eq!(event.kind, EventKind::Unknown);
    }

    #[test]
    fn caption_counts_as_text() {
        let event = parse_update(&json!({
            "update_id": 1005,
            "message": {
                "chat": {"id": 555},
                "photo": [{"file_id": "abc", "file_unique_id": "d", "width": 1, "height": 1}],
                "caption": "look at this"
            }
        }));
        assert_eq!(event.kind, EventKind::Text { text: "look at this".into() });
    }

    #[test]
    fn garbage_is_unknown_not_an_error() {
        let event = parse_update(&json!({"something": "else"}));
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.id, "");

        let event = parse_update(&json!({"update_id": 77, "edited_message": {"chat": {"id": 1}}}));
        assert_eq!(event.id, "77");
        assert_eq!(event.kind, EventKind::Unknown);
    }
}
