use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATABASE: &str = "patter.db";

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Config {
    /// Parse a TOML string into a `Config`.
    pub fn parse(contents: &str) -> Result<Self, String> {
        toml::de::from_str(contents).map_err(|e| format!("invalid config: {e}"))
    }

    /// Load a config file from disk, falling back to defaults if it does not
    /// exist, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn to_toml_string(&self) -> String {
        toml::ser::to_string_pretty(self).unwrap_or_default()
    }

    /// Apply the documented environment knobs on top of the file config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(domain) = std::env::var("WEBHOOK_DOMAIN") {
            if !domain.is_empty() {
                self.webhook.domain = Some(domain);
            }
        }
        if let Some(v) = env_parse::<bool>("USE_NGROK") {
            self.webhook.use_ngrok = v;
        }
        if let Some(v) = env_parse::<u16>("NGROK_PORT") {
            self.webhook.ngrok_port = v;
        }
        if let Some(v) = env_parse::<u64>("DIALOG_EVENT_TIMEOUT") {
            self.engine.event_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("CONVERSATION_LOCK_TIMEOUT") {
            self.engine.lock_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("STATE_CACHE_SIZE") {
            self.engine.state_cache_size = v;
        }
        if let Some(v) = env_parse::<usize>("SEEN_SET_SIZE") {
            self.engine.seen_set_size = v;
        }
        if let Some(v) = env_parse::<u64>("DUPLICATE_WINDOW_MS") {
            self.engine.duplicate_window_ms = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_TOKENS") {
            self.engine.rate_tokens = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_REFILL_PER_SEC") {
            self.engine.rate_refill_per_sec = v;
        }
        if let Some(v) = env_parse::<u32>("MAX_SEND_RETRIES") {
            self.engine.max_send_retries = v;
        }
        if let Some(v) = env_parse::<usize>("AUTO_TRANSITION_MAX_STEPS") {
            self.engine.auto_transition_max_steps = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

/// Tunables of the dialog engine. Defaults match the documented knobs.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct EngineConfig {
    /// Overall budget for handling one webhook event, seconds.
    #[serde(default = "default_event_timeout")]
    pub event_timeout_secs: u64,
    /// Bound on acquiring the per-conversation lock, seconds.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    /// Capacity of the dialog-state cache (entries).
    #[serde(default = "default_state_cache_size")]
    pub state_cache_size: u64,
    /// TTL of dialog-state cache entries, seconds.
    #[serde(default = "default_state_cache_ttl")]
    pub state_cache_ttl_secs: u64,
    /// Capacity of the compiled-scenario cache (entries).
    #[serde(default = "default_scenario_cache_size")]
    pub scenario_cache_size: u64,
    /// Per-bot capacity of the webhook "seen" set.
    #[serde(default = "default_seen_set_size")]
    pub seen_set_size: usize,
    /// TTL of "seen" update ids, seconds.
    #[serde(default = "default_seen_ttl")]
    pub seen_ttl_secs: u64,
    /// Debounce window for duplicate-click fingerprints, milliseconds.
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
    /// Token-bucket burst capacity per chat.
    #[serde(default = "default_rate_tokens")]
    pub rate_tokens: u32,
    /// Token-bucket refill rate per chat, tokens per second.
    #[serde(default = "default_rate_refill")]
    pub rate_refill_per_sec: u32,
    /// Retries (beyond the first attempt) for transient adapter failures.
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
    /// Maximum number of steps one event may auto-transition through.
    #[serde(default = "default_auto_transition_max_steps")]
    pub auto_transition_max_steps: usize,
    /// Retries on optimistic-concurrency conflicts before giving up.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Buffered history entries per conversation before a forced flush.
    #[serde(default = "default_history_buffer_cap")]
    pub history_buffer_cap: usize,
    /// Number of mutexes in the conversation lock stripe.
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
    /// Capacity of the webhook intake queue.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Number of worker tasks draining the intake queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_timeout_secs: default_event_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            state_cache_size: default_state_cache_size(),
            state_cache_ttl_secs: default_state_cache_ttl(),
            scenario_cache_size: default_scenario_cache_size(),
            seen_set_size: default_seen_set_size(),
            seen_ttl_secs: default_seen_ttl(),
            duplicate_window_ms: default_duplicate_window_ms(),
            rate_tokens: default_rate_tokens(),
            rate_refill_per_sec: default_rate_refill(),
            max_send_retries: default_max_send_retries(),
            auto_transition_max_steps: default_auto_transition_max_steps(),
            conflict_retries: default_conflict_retries(),
            history_buffer_cap: default_history_buffer_cap(),
            lock_stripes: default_lock_stripes(),
            queue_size: default_queue_size(),
            workers: default_workers(),
        }
    }
}

fn default_event_timeout() -> u64 {
    20
}

fn default_lock_timeout() -> u64 {
    5
}

fn default_state_cache_size() -> u64 {
    1024
}

fn default_state_cache_ttl() -> u64 {
    600
}

fn default_scenario_cache_size() -> u64 {
    64
}

fn default_seen_set_size() -> usize {
    1024
}

fn default_seen_ttl() -> u64 {
    300
}

fn default_duplicate_window_ms() -> u64 {
    1500
}

fn default_rate_tokens() -> u32 {
    5
}

fn default_rate_refill() -> u32 {
    1
}

fn default_max_send_retries() -> u32 {
    2
}

fn default_auto_transition_max_steps() -> usize {
    16
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_history_buffer_cap() -> usize {
    32
}

fn default_lock_stripes() -> usize {
    64
}

fn default_queue_size() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

/// How the public webhook URL is constructed and verified.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct WebhookConfig {
    /// Public domain the platform delivers webhooks to, e.g.
    /// `https://bots.example.com`. Required unless ngrok is used.
    #[serde(default)]
    pub domain: Option<String>,
    /// Resolve the public URL from a local ngrok agent instead.
    #[serde(default)]
    pub use_ngrok: bool,
    /// Port of the local ngrok agent API.
    #[serde(default = "default_ngrok_port")]
    pub ngrok_port: u16,
    /// How often the scheduler verifies webhook registrations, seconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            domain: None,
            use_ngrok: false,
            ngrok_port: default_ngrok_port(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

fn default_ngrok_port() -> u16 {
    4040
}

fn default_refresh_interval() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.database, "patter.db");
        assert_eq!(config.engine.event_timeout_secs, 20);
        assert_eq!(config.engine.lock_timeout_secs, 5);
        assert_eq!(config.engine.rate_tokens, 5);
        assert_eq!(config.engine.duplicate_window_ms, 1500);
        assert_eq!(config.engine.auto_transition_max_steps, 16);
        assert!(!config.webhook.use_ngrok);
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config = Config::parse(
            r#"
[storage]
database = ":memory:"

[engine]
rate_tokens = 10
max_send_retries = 1

[webhook]
domain = "https://bots.example.com"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.database, ":memory:");
        assert_eq!(config.engine.rate_tokens, 10);
        assert_eq!(config.engine.max_send_retries, 1);
        // Untouched fields keep defaults.
        assert_eq!(config.engine.rate_refill_per_sec, 1);
        assert_eq!(config.webhook.domain.as_deref(), Some("https://bots.example.com"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml_string();
        let back = Config::parse(&rendered).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::parse("[engine\nrate_tokens = ").is_err());
    }
}
