use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A messaging platform the engine can speak on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Whatsapp,
    Viber,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Viber => "viber",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Self::Telegram),
            "whatsapp" => Ok(Self::Whatsapp),
            "viber" => Ok(Self::Viber),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Identifies one conversation: a bot talking to one chat on one platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub bot_id: String,
    pub platform: Platform,
    pub chat_id: String,
}

impl ConversationKey {
    pub fn new(bot_id: &str, platform: Platform, chat_id: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            platform,
            chat_id: chat_id.to_string(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.bot_id, self.platform, self.chat_id)
    }
}

/// A platform-neutral inbound event, produced by `PlatformAdapter::parse_event`.
///
/// `id` is the platform's update id, normalized to a string; the dialog
/// manager uses it to drop webhook replays.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub id: String,
    pub chat_id: String,
    pub kind: EventKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Free-form text typed by the user.
    Text { text: String },
    /// An interactive button was pressed; `value` is the declared button value.
    ButtonPress { value: String },
    /// A slash command, name without the leading `/` (e.g. "start").
    Command { name: String },
    /// Anything the adapter could not classify. Always ignored.
    Unknown,
}

impl EventKind {
    /// The user-supplied payload as input text, where one exists.
    pub fn input_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ButtonPress { value } => Some(value),
            _ => None,
        }
    }
}

/// An interactive button attached to an outgoing message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Button {
    pub text: String,
    pub value: String,
}

/// Kind of a media item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

/// A media reference inside a scenario step. `file_id` is the bot-scoped
/// logical id of a stored `MediaAsset`, not a platform file id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaRef {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default)]
    pub description: String,
    pub file_id: String,
}

/// A media item resolved to a platform-native file id, ready to send.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub file_id: String,
}

/// A fully rendered outgoing message produced by the scenario processor.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub buttons: Vec<Button>,
    pub media: Vec<MediaRef>,
}

/// Failure kinds surfaced by platform adapters.
#[derive(Clone, Debug, PartialEq)]
pub enum SendError {
    /// Network-level or rate-limit failure; the caller may retry.
    Transient(String),
    /// The platform rejected the request; retrying will not help.
    InvalidInput(String),
    /// Bot credentials are invalid; the caller must surface and deactivate.
    Unauthorized(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient send failure: {msg}"),
            Self::InvalidInput(msg) => write!(f, "platform rejected request: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Failure of a media-group send: the index of the first item that failed,
/// so the caller can downgrade the group to individual sends.
#[derive(Clone, Debug)]
pub struct GroupSendError {
    pub index: usize,
    pub error: SendError,
}

impl std::fmt::Display for GroupSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "media group item {} failed: {}", self.index, self.error)
    }
}

impl std::error::Error for GroupSendError {}

/// Webhook registration state reported by the platform.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebhookInfo {
    pub url: String,
    pub pending_update_count: i64,
    pub last_error_message: Option<String>,
}

/// Who produced a dialog history entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    User,
    Bot,
    System,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::System => "system",
        }
    }
}

/// One entry of a dialog's append-only history. The monotonic `seq` is
/// assigned by the store on insert.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(payload: serde_json::Value) -> Self {
        Self {
            kind: HistoryKind::User,
            payload,
            ts: Utc::now(),
        }
    }

    pub fn bot(payload: serde_json::Value) -> Self {
        Self {
            kind: HistoryKind::Bot,
            payload,
            ts: Utc::now(),
        }
    }

    /// A system entry with an `event` discriminator, e.g.
    /// `system("invalid_button", json!({"value": "maybe"}))`.
    pub fn system(event: &str, detail: serde_json::Value) -> Self {
        Self {
            kind: HistoryKind::System,
            payload: serde_json::json!({ "event": event, "detail": detail }),
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for p in [Platform::Telegram, Platform::Whatsapp, Platform::Viber] {
            let parsed: Platform = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert!("smoke-signals".parse::<Platform>().is_err());
    }

    #[test]
    fn event_kind_serde_round_trip() {
        let events = vec![
            EventKind::Text { text: "hello".into() },
            EventKind::ButtonPress { value: "yes".into() },
            EventKind::Command { name: "start".into() },
            EventKind::Unknown,
        ];
        let json = serde_json::to_string(&events).unwrap();
        let back: Vec<EventKind> = serde_json::from_str(&json).unwrap();
        assert_eq!(events, back);
    }

    #[test]
    fn media_ref_matches_wire_format() {
        let raw = r#"{"type":"image","description":"menu photo","file_id":"menu_main"}"#;
        let parsed: MediaRef = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.kind, MediaKind::Image);
        assert_eq!(parsed.description, "menu photo");
        assert_eq!(parsed.file_id, "menu_main");

        // Description is optional on the wire.
        let bare: MediaRef =
            serde_json::from_str(r#"{"type":"video","file_id":"intro"}"#).unwrap();
        assert_eq!(bare.description, "");
    }

    #[test]
    fn input_text_extraction() {
        assert_eq!(
            EventKind::Text { text: "Ada".into() }.input_text(),
            Some("Ada")
        );
        assert_eq!(
            EventKind::ButtonPress { value: "yes".into() }.input_text(),
            Some("yes")
        );
        assert_eq!(EventKind::Unknown.input_text(), None);
    }
}
