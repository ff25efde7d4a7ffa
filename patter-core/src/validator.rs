//! Pre-mutation event screening: duplicate-click debouncing, per-chat rate
//! limiting, and typed input validation against a step's `InputSpec`.
//!
//! Debounce and rate state live in process-local sharded maps. The
//! documented degradation policy for a shared side store (fail open for
//! rate limiting, fail closed for duplicates) degenerates here to the
//! always-available local path.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::scenario::model::{InputKind, InputSpec};
use crate::types::{Button, ConversationKey, EventKind};

const FINGERPRINT_SHARDS: usize = 16;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid email regex")
});

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+?[0-9][0-9 ()\-]{5,18}[0-9]$").expect("valid phone regex")
});

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

/// Why an event was rejected before any state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Same fingerprint seen inside the debounce window. Dropped silently.
    DuplicateClick,
    /// The chat's token bucket is empty.
    RateLimited,
}

/// Typed-input failure against a step's `InputSpec`.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    /// Re-prompt the user with this message and stay on the step.
    Invalid(String),
    /// Button value outside the declared set; re-render the buttons.
    InvalidButton,
}

pub struct InputValidator {
    window: Duration,
    fingerprints: Vec<Mutex<HashMap<String, Instant>>>,
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl InputValidator {
    pub fn new(config: &EngineConfig) -> Self {
        let refill = NonZeroU32::new(config.rate_refill_per_sec).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.rate_tokens).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(refill).allow_burst(burst);
        Self {
            window: Duration::from_millis(config.duplicate_window_ms),
            fingerprints: (0..FINGERPRINT_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Screen an event before it may mutate state.
    pub fn check(
        &self,
        key: &ConversationKey,
        current_step: &str,
        event: &EventKind,
    ) -> Result<(), Rejection> {
        if self.is_duplicate(key, current_step, event) {
            return Err(Rejection::DuplicateClick);
        }
        if self.limiter.check_key(&key.to_string()).is_err() {
            return Err(Rejection::RateLimited);
        }
        Ok(())
    }

    /// SHA-256 fingerprint of (chat, step, event kind, payload); the same
    /// fingerprint inside the debounce window is a duplicate click.
    fn is_duplicate(&self, key: &ConversationKey, current_step: &str, event: &EventKind) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(current_step.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::to_string(event).unwrap_or_default().as_bytes());
        let fingerprint = hex::encode(hasher.finalize());

        let shard = {
            let mut h = DefaultHasher::new();
            key.hash(&mut h);
            (h.finish() as usize) % self.fingerprints.len()
        };

        let mut seen = self.fingerprints[shard].lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, ts| now.duration_since(*ts) < self.window);
        if seen.contains_key(&fingerprint) {
            true
        } else {
            seen.insert(fingerprint, now);
            false
        }
    }
}

/// Validate a typed input event against a step's `InputSpec`.
///
/// `pattern` is the step's compiled `pattern` regex (compiled at scenario
/// load), `buttons` the step's declared buttons. Returns the JSON value to
/// store under `spec.variable`.
pub fn validate_input(
    spec: &InputSpec,
    pattern: Option<&Regex>,
    buttons: &[Button],
    event: &EventKind,
) -> Result<Value, InputError> {
    let Some(text) = event.input_text() else {
        return Err(invalid(spec, "Please answer with a message."));
    };

    match spec.kind {
        InputKind::Button => {
            if buttons.iter().any(|b| b.value == text) {
                Ok(Value::String(text.to_string()))
            } else {
                Err(InputError::InvalidButton)
            }
        }
        InputKind::Text => {
            let len = text.chars().count();
            if let Some(min) = spec.min_length {
                if len < min {
                    return Err(invalid(
                        spec,
                        &format!("Please enter at least {min} characters."),
                    ));
                }
            }
            if let Some(max) = spec.max_length {
                if len > max {
                    return Err(invalid(
                        spec,
                        &format!("Please enter at most {max} characters."),
                    ));
                }
            }
            if let Some(re) = pattern {
                if !re.is_match(text) {
                    return Err(invalid(spec, "That doesn't look right, please try again."));
                }
            }
            Ok(Value::String(text.to_string()))
        }
        InputKind::Number => {
            let n: f64 = text
                .trim()
                .parse()
                .map_err(|_| invalid(spec, "Please enter a number."))?;
            if let Some(min) = spec.min_value {
                if n < min {
                    return Err(invalid(spec, &format!("Please enter a number ≥ {min}.")));
                }
            }
            if let Some(max) = spec.max_value {
                if n > max {
                    return Err(invalid(spec, &format!("Please enter a number ≤ {max}.")));
                }
            }
            // Whole numbers are stored as integers so they render cleanly.
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Ok(Value::from(n as i64))
            } else {
                Ok(Value::from(n))
            }
        }
        InputKind::Date => {
            let trimmed = text.trim();
            let parsed = DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .ok_or_else(|| invalid(spec, "Please enter a date like 2025-01-31."))?;
            Ok(Value::String(parsed.format("%Y-%m-%d").to_string()))
        }
        InputKind::Email => {
            let trimmed = text.trim();
            if EMAIL_RE.is_match(trimmed) {
                Ok(Value::String(trimmed.to_lowercase()))
            } else {
                Err(invalid(spec, "Please enter a valid email address."))
            }
        }
        InputKind::Phone => {
            let trimmed = text.trim();
            let digits = trimmed.chars().filter(char::is_ascii_digit).count();
            if PHONE_RE.is_match(trimmed) && (7..=15).contains(&digits) {
                Ok(Value::String(trimmed.to_string()))
            } else {
                Err(invalid(spec, "Please enter a valid phone number."))
            }
        }
    }
}

fn invalid(spec: &InputSpec, default_message: &str) -> InputError {
    InputError::Invalid(
        spec.error_message
            .clone()
            .unwrap_or_else(|| default_message.to_string()),
    )
}
