//! Background upkeep: adapter registry rebuilds and webhook registration
//! health checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use patter_core::adapter::PlatformAdapter;
use patter_core::config::WebhookConfig;
use patter_core::types::{Platform, SendError};
use patter_telegram::TelegramAdapter;

use crate::AppState;

/// Periodically refresh the adapter registry and verify that every
/// auto-refresh credential still has its webhook registered at the
/// expected URL.
pub async fn run(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.webhook.refresh_interval_secs.max(5));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        refresh_once(&state).await;
    }
}

pub async fn refresh_once(state: &AppState) {
    rebuild_adapters(state);

    let Some(domain) = resolve_public_domain(&state.config.webhook).await else {
        log::debug!("no webhook domain configured; skipping webhook verification");
        return;
    };

    let credentials = match state.store.list_auto_refresh_credentials() {
        Ok(credentials) => credentials,
        Err(e) => {
            log::error!("failed to list credentials for webhook refresh: {e}");
            return;
        }
    };

    let stale_after =
        chrono::Duration::seconds(state.config.webhook.refresh_interval_secs.max(5) as i64);
    let now = Utc::now();

    for credential in credentials {
        if credential.platform != Platform::Telegram {
            continue;
        }
        if let Some(checked) = credential.webhook_last_checked {
            if now - checked < stale_after {
                continue;
            }
        }
        let Some(adapter) = adapter_for(state, &credential.bot_id) else {
            continue;
        };
        let expected = webhook_url(&domain, credential.platform, &credential.bot_id);
        let secret = credential
            .secrets
            .get("webhook_secret")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());

        match adapter.get_webhook_info().await {
            Ok(info) if info.url == expected => {
                let _ = state
                    .store
                    .set_webhook_checked(&credential.bot_id, credential.platform, &expected);
            }
            Ok(info) => {
                log::info!(
                    "webhook for bot {} points at '{}', re-registering as '{expected}'",
                    credential.bot_id,
                    info.url
                );
                match adapter.set_webhook(&expected, secret).await {
                    Ok(()) => {
                        let _ = state.store.set_webhook_checked(
                            &credential.bot_id,
                            credential.platform,
                            &expected,
                        );
                    }
                    Err(SendError::Unauthorized(e)) => {
                        log::error!("bot {} credentials rejected: {e}", credential.bot_id);
                        let _ = state
                            .store
                            .set_credential_healthy(&credential.bot_id, credential.platform, false);
                    }
                    Err(e) => log::warn!("webhook registration for bot {} failed: {e}", credential.bot_id),
                }
            }
            Err(SendError::Unauthorized(e)) => {
                log::error!("bot {} credentials rejected: {e}", credential.bot_id);
                let _ = state
                    .store
                    .set_credential_healthy(&credential.bot_id, credential.platform, false);
            }
            Err(e) => log::warn!("webhook info for bot {} failed: {e}", credential.bot_id),
        }
    }
}

/// Rebuild the per-bot adapter map from stored credentials. Bots whose
/// credentials disappeared or turned unhealthy drop out.
pub fn rebuild_adapters(state: &AppState) {
    let credentials = match state.store.list_platform_credentials(Platform::Telegram) {
        Ok(credentials) => credentials,
        Err(e) => {
            log::error!("failed to list credentials for adapter rebuild: {e}");
            return;
        }
    };

    let mut adapters: HashMap<String, Arc<TelegramAdapter>> = HashMap::new();
    let previous = state.adapters.load();
    for credential in credentials {
        if !credential.healthy {
            continue;
        }
        if let Some(existing) = previous.get(&credential.bot_id) {
            adapters.insert(credential.bot_id.clone(), existing.clone());
            continue;
        }
        match TelegramAdapter::from_secrets(&credential.secrets) {
            Ok(adapter) => {
                adapters.insert(credential.bot_id.clone(), Arc::new(adapter));
            }
            Err(e) => log::error!("bot {} has unusable telegram secrets: {e}", credential.bot_id),
        }
    }
    state.adapters.store(Arc::new(adapters));
}

/// Look up a bot's adapter, building one on demand for credentials that
/// appeared since the last rebuild.
pub fn adapter_for(state: &AppState, bot_id: &str) -> Option<Arc<TelegramAdapter>> {
    if let Some(adapter) = state.adapters.load().get(bot_id) {
        return Some(adapter.clone());
    }
    let credential = state
        .store
        .get_platform_credential(bot_id, Platform::Telegram)
        .ok()
        .flatten()?;
    if !credential.healthy {
        return None;
    }
    let adapter = Arc::new(TelegramAdapter::from_secrets(&credential.secrets).ok()?);
    let inserted = adapter.clone();
    state.adapters.rcu(|current| {
        let mut next = HashMap::clone(current);
        next.insert(bot_id.to_string(), inserted.clone());
        next
    });
    Some(adapter)
}

/// The URL the platform should deliver this bot's webhooks to.
pub fn webhook_url(domain: &str, platform: Platform, bot_id: &str) -> String {
    format!("{}/webhook/{platform}/{bot_id}", domain.trim_end_matches('/'))
}

/// Where the public internet reaches this server: a configured domain, or
/// the HTTPS tunnel of a local ngrok agent.
pub async fn resolve_public_domain(config: &WebhookConfig) -> Option<String> {
    if !config.use_ngrok {
        return config.domain.clone();
    }
    let api = format!("http://127.0.0.1:{}/api/tunnels", config.ngrok_port);
    let response = match reqwest::get(&api).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("ngrok agent unreachable at {api}: {e}");
            return None;
        }
    };
    let tunnels: Value = match response.json().await {
        Ok(tunnels) => tunnels,
        Err(e) => {
            log::warn!("undecodable ngrok tunnel list: {e}");
            return None;
        }
    };
    let domain = https_tunnel_url(&tunnels);
    if domain.is_none() {
        log::warn!("ngrok reports no https tunnel");
    }
    domain
}

fn https_tunnel_url(tunnels: &Value) -> Option<String> {
    tunnels
        .get("tunnels")?
        .as_array()?
        .iter()
        .filter_map(|t| t.get("public_url").and_then(|u| u.as_str()))
        .find(|u| u.starts_with("https://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webhook_url_shape() {
        assert_eq!(
            webhook_url("https://bots.example.com", Platform::Telegram, "bot-1"),
            "https://bots.example.com/webhook/telegram/bot-1"
        );
        // A trailing slash does not double up.
        assert_eq!(
            webhook_url("https://bots.example.com/", Platform::Telegram, "bot-1"),
            "https://bots.example.com/webhook/telegram/bot-1"
        );
    }

    #[test]
    fn https_tunnel_is_picked_from_ngrok_listing() {
        let listing = json!({
            "tunnels": [
                {"public_url": "tcp://0.tcp.ngrok.io:1234", "proto": "tcp"},
                {"public_url": "http://abc.ngrok.io", "proto": "http"},
                {"public_url": "https://abc.ngrok.io", "proto": "https"}
            ]
        });
        assert_eq!(
            https_tunnel_url(&listing),
            Some("https://abc.ngrok.io".to_string())
        );
        assert_eq!(https_tunnel_url(&json!({"tunnels": []})), None);
        assert_eq!(https_tunnel_url(&json!({})), None);
    }

    #[tokio::test]
    async fn configured_domain_wins_without_ngrok() {
        let config = WebhookConfig {
            domain: Some("https://bots.example.com".into()),
            use_ngrok: false,
            ..WebhookConfig::default()
        };
        assert_eq!(
            resolve_public_domain(&config).await,
            Some("https://bots.example.com".into())
        );
    }
}
