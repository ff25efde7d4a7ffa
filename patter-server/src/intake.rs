//! Webhook intake: authenticate, enqueue, acknowledge.
//!
//! The platform expects an answer well inside its delivery deadline, so the
//! handler never touches the dialog engine: it verifies the source, drops
//! the raw update on the worker queue and returns 200. A saturated queue
//! returns 503 so the platform redelivers later.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};

use patter_core::types::Platform;

use crate::{AppState, WebhookJob};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook/{platform}/{bot_id}", post(receive_webhook))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path((platform, bot_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(platform) = platform.parse::<Platform>() else {
        return StatusCode::NOT_FOUND;
    };
    if platform != Platform::Telegram {
        // WhatsApp/Viber intake lands here once their adapters exist.
        return StatusCode::NOT_FOUND;
    }

    let bot = match state.store.get_bot(&bot_id) {
        Ok(Some(bot)) if bot.active => bot,
        Ok(_) => return StatusCode::NOT_FOUND,
        Err(e) => {
            log::error!("bot lookup failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let credential = match state.store.get_platform_credential(&bot.id, platform) {
        Ok(Some(credential)) => credential,
        Ok(None) => return StatusCode::NOT_FOUND,
        Err(e) => {
            log::error!("credential lookup failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    // Telegram authenticates deliveries with the secret token we supplied
    // at registration.
    if let Some(secret) = credential
        .secrets
        .get("webhook_secret")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != secret {
            log::warn!("webhook for bot {bot_id} rejected: secret token mismatch");
            return StatusCode::FORBIDDEN;
        }
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("undecodable webhook body for bot {bot_id}: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.queue.try_send(WebhookJob { bot_id, raw }) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            log::error!("webhook queue refused delivery: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;
    use axum::body::Body;
    use axum::http::Request;
    use patter_core::config::Config;
    use patter_core::dialog::DialogManager;
    use patter_core::store::{PlatformCredential, Store};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state(queue_size: usize) -> (Arc<AppState>, mpsc::Receiver<WebhookJob>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bot = store.create_bot("acct", "bot").unwrap();
        store
            .upsert_platform_credential(&PlatformCredential {
                bot_id: bot.id.clone(),
                platform: Platform::Telegram,
                secrets: json!({"token": "123:abc", "webhook_secret": "s3cret"}),
                webhook_url: None,
                webhook_last_checked: None,
                auto_refresh: false,
                healthy: true,
            })
            .unwrap();

        let config = Config::default();
        let manager = Arc::new(DialogManager::new(store.clone(), config.engine.clone()));
        let (tx, rx) = mpsc::channel(queue_size);
        let state = Arc::new(AppState {
            store,
            manager,
            adapters: ArcSwap::from_pointee(HashMap::new()),
            queue: tx,
            config,
        });
        (state, rx, bot.id)
    }

    fn update_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "update_id": 1,
            "message": {"chat": {"id": 5}, "text": "hi"}
        }))
        .unwrap()
    }

    async fn post(app: Router, uri: &str, secret: Option<&str>, body: Vec<u8>) -> StatusCode {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header("x-telegram-bot-api-secret-token", secret);
        }
        let response = app
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn valid_webhook_is_enqueued_and_acked() {
        let (state, mut rx, bot_id) = test_state(8);
        let app = router(state);
        let status = post(
            app,
            &format!("/webhook/telegram/{bot_id}"),
            Some("s3cret"),
            update_body(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let job = rx.try_recv().expect("job should be queued");
        assert_eq!(job.bot_id, bot_id);
        assert_eq!(job.raw["update_id"], 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden() {
        let (state, mut rx, bot_id) = test_state(8);
        let app = router(state);
        let status = post(
            app.clone(),
            &format!("/webhook/telegram/{bot_id}"),
            Some("wrong"),
            update_body(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Missing header is rejected the same way.
        let status = post(app, &format!("/webhook/telegram/{bot_id}"), None, update_body()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_bot_and_platform_are_not_found() {
        let (state, _rx, bot_id) = test_state(8);
        let app = router(state);

        let status = post(
            app.clone(),
            "/webhook/telegram/no-such-bot",
            Some("s3cret"),
            update_body(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let status = post(
            app.clone(),
            &format!("/webhook/smoke-signals/{bot_id}"),
            Some("s3cret"),
            update_body(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Planned platform, no adapter yet.
        let status = post(
            app,
            &format!("/webhook/whatsapp/{bot_id}"),
            Some("s3cret"),
            update_body(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn undecodable_body_is_bad_request() {
        let (state, _rx, bot_id) = test_state(8);
        let app = router(state);
        let status = post(
            app,
            &format!("/webhook/telegram/{bot_id}"),
            Some("s3cret"),
            b"not json".to_vec(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn saturated_queue_returns_503() {
        let (state, _rx, bot_id) = test_state(1);
        let app = router(state);

        let uri = format!("/webhook/telegram/{bot_id}");
        let status = post(app.clone(), &uri, Some("s3cret"), update_body()).await;
        assert_eq!(status, StatusCode::OK);
        // Queue capacity 1 and nothing draining it.
        let status = post(app, &uri, Some("s3cret"), update_body()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let (state, _rx, _) = test_state(1);
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
