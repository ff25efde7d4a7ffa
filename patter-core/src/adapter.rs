//! Platform adapter seam.
//!
//! An adapter translates between one platform's native payloads and the
//! neutral message/event model in `types`. Production code is generic over
//! the adapter (no trait objects); tests use `testutil::MockAdapter`.

use std::future::Future;
use std::time::Duration;

use crate::types::{
    Button, Event, GroupSendError, OutboundMedia, Platform, SendError, WebhookInfo,
};

/// Capability set of a messaging platform.
///
/// `parse_event` must be pure and total: anything unrecognized maps to
/// `EventKind::Unknown`, never an error. All send operations report failures
/// through the three `SendError` kinds so callers can apply one retry policy.
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Convert a raw webhook update into a neutral `Event`, normalizing the
    /// platform's update id into `Event.id`.
    fn parse_event(&self, raw: &serde_json::Value) -> Event;

    /// Send a text message, optionally with interactive buttons. Returns the
    /// platform message id.
    fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[Button],
    ) -> impl Future<Output = Result<String, SendError>> + Send;

    /// Send a batch of media items, preserving input order. A caption, when
    /// given, rides on the batch. On partial failure the error reports the
    /// index of the first failed item.
    fn send_media(
        &self,
        chat_id: &str,
        items: &[OutboundMedia],
        caption: Option<&str>,
    ) -> impl Future<Output = Result<Vec<String>, GroupSendError>> + Send;

    /// Upload raw bytes and return the platform's reusable file id.
    fn upload_media(
        &self,
        bytes: &[u8],
        mime: &str,
    ) -> impl Future<Output = Result<String, SendError>> + Send;

    fn set_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
    ) -> impl Future<Output = Result<(), SendError>> + Send;

    fn get_webhook_info(&self) -> impl Future<Output = Result<WebhookInfo, SendError>> + Send;

    fn delete_webhook(&self) -> impl Future<Output = Result<(), SendError>> + Send;
}

/// Base delay of the exponential send/upload backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Run an adapter call, retrying `Transient` failures up to `max_retries`
/// times with exponential backoff. `InvalidInput` and `Unauthorized` are
/// returned immediately.
pub async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T, SendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SendError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt);
                log::debug!("transient failure (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SendError::Transient("flaky".into()))
                } else {
                    Ok("sent")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("sent"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SendError::Transient("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(SendError::Transient(_))));
        // Initial attempt + 2 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_input_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SendError::InvalidInput("bad chat".into())) }
        })
        .await;
        assert!(matches!(result, Err(SendError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SendError::Unauthorized("bad token".into())) }
        })
        .await;
        assert!(matches!(result, Err(SendError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
