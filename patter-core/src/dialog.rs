//! Dialog manager: the orchestrator that turns inbound platform events into
//! scenario progress and outbound messages.
//!
//! One public entry point, safe to call from many workers. Events for the
//! same conversation are serialized through a striped lock; events for
//! distinct conversations proceed in parallel. Replayed webhook update ids
//! are dropped by a per-bot seen-set before the lock is taken.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::time::timeout;

use crate::adapter::{PlatformAdapter, with_retries};
use crate::config::EngineConfig;
use crate::media::MediaManager;
use crate::repo::StateRepository;
use crate::scenario::model::FAULT_STEP;
use crate::scenario::{ActionContext, ActionRegistry, Scenario, processor};
use crate::store::{DialogState, Store, StoreError};
use crate::types::{
    ConversationKey, Event, EventKind, HistoryEntry, OutboundMedia, OutgoingMessage, SendError,
};
use crate::validator::{InputError, InputValidator, Rejection, validate_input};

/// Standardized message for conversations parked in the fault sub-state.
const FAULT_NOTICE: &str =
    "Something went wrong with this conversation. Please send /reset to start over, \
     or contact support.";

const RATE_LIMIT_NOTICE: &str = "You're sending messages too quickly. Please wait a moment.";

const NO_SCENARIO_NOTICE: &str = "This bot is not set up yet. Please try again later.";

const DEFAULT_HELP: &str = "Send /start to begin and /reset to start over.";

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// The event was processed; `sent` outbound sends were made.
    Processed { sent: usize },
    /// The update id was already seen; nothing was done.
    Replayed,
    /// Duplicate click inside the debounce window; silently dropped.
    Duplicate,
    /// The chat's token bucket is empty.
    RateLimited,
    /// The conversation lock could not be acquired in time.
    Busy,
    /// Unclassifiable or out-of-place event; nothing to do.
    Ignored,
    /// Input failed validation; the user was re-prompted, state unchanged.
    Reprompted,
    /// The conversation is (now) in the fault sub-state.
    Faulted,
    /// Transient failure; the event was dropped and the platform will
    /// redeliver it.
    Dropped { reason: String },
    /// Bot credentials were rejected; the credential was marked unhealthy.
    Unauthorized,
    /// The event exceeded its processing budget.
    TimedOut,
}

/// Internal failure classification for the send/persist phase.
enum EngineError {
    Transient(String),
    Unauthorized(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Transient(e.to_string())
    }
}

pub struct DialogManager {
    store: Arc<Store>,
    repo: StateRepository,
    validator: InputValidator,
    media: MediaManager,
    actions: ActionRegistry,
    seen: SeenSet,
    locks: Vec<tokio::sync::Mutex<()>>,
    scenarios: moka::sync::Cache<String, Arc<Scenario>>,
    /// Chats already notified about the current rate-limiting episode.
    rate_noticed: Mutex<HashSet<String>>,
    config: EngineConfig,
}

impl DialogManager {
    pub fn new(store: Arc<Store>, config: EngineConfig) -> Self {
        Self::with_actions(store, config, ActionRegistry::builtin())
    }

    /// Build with a custom action registry (embedding applications register
    /// their domain handlers here).
    pub fn with_actions(store: Arc<Store>, config: EngineConfig, actions: ActionRegistry) -> Self {
        let repo = StateRepository::new(store.clone(), &config);
        let media = MediaManager::new(store.clone(), config.max_send_retries);
        let validator = InputValidator::new(&config);
        let seen = SeenSet::new(
            Duration::from_secs(config.seen_ttl_secs),
            config.seen_set_size,
        );
        let locks = (0..config.lock_stripes.max(1))
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        let scenarios = moka::sync::Cache::builder()
            .max_capacity(config.scenario_cache_size)
            .build();
        Self {
            store,
            repo,
            validator,
            media,
            actions,
            seen,
            locks,
            scenarios,
            rate_noticed: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn repository(&self) -> &StateRepository {
        &self.repo
    }

    /// Parse a raw platform update and handle it.
    pub async fn handle_update<A: PlatformAdapter>(
        &self,
        adapter: &A,
        bot_id: &str,
        raw: &Value,
    ) -> HandleOutcome {
        let event = adapter.parse_event(raw);
        self.handle_event(adapter, bot_id, event).await
    }

    /// Handle one neutral event end to end. The single public entry point.
    pub async fn handle_event<A: PlatformAdapter>(
        &self,
        adapter: &A,
        bot_id: &str,
        event: Event,
    ) -> HandleOutcome {
        if matches!(event.kind, EventKind::Unknown) || event.chat_id.is_empty() {
            log::debug!("ignoring unclassifiable event from bot {bot_id}");
            return HandleOutcome::Ignored;
        }

        // Replay filter, consulted before the lock so redelivered updates
        // never even contend for it.
        if !event.id.is_empty() && !self.seen.check_and_insert(bot_id, &event.id) {
            log::debug!("dropping replayed update {} for bot {bot_id}", event.id);
            return HandleOutcome::Replayed;
        }

        let key = ConversationKey::new(bot_id, adapter.platform(), &event.chat_id);
        let lock = &self.locks[self.stripe_index(&key)];
        let guard = match timeout(
            Duration::from_secs(self.config.lock_timeout_secs),
            lock.lock(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!("conversation {key} is busy; rejecting update {}", event.id);
                self.forget_update(bot_id, &event.id);
                return HandleOutcome::Busy;
            }
        };

        let budget = Duration::from_secs(self.config.event_timeout_secs);
        let outcome = match timeout(budget, self.process(adapter, &key, &event)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::error!("event {} for {key} exceeded its {budget:?} budget", event.id);
                if let Ok(Some(state)) = self.repo.get(&key) {
                    let _ = self.repo.append_history(
                        &state.id,
                        HistoryEntry::system("timeout", json!({ "update_id": event.id })),
                    );
                    let _ = self.repo.flush_history(&state.id);
                }
                HandleOutcome::TimedOut
            }
        };
        drop(guard);

        // Transient drops are retried by platform redelivery, so the update
        // id must not stay in the seen-set.
        if matches!(outcome, HandleOutcome::Dropped { .. }) {
            self.forget_update(bot_id, &event.id);
        }
        outcome
    }

    fn forget_update(&self, bot_id: &str, update_id: &str) {
        if !update_id.is_empty() {
            self.seen.remove(bot_id, update_id);
        }
    }

    fn stripe_index(&self, key: &ConversationKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.locks.len()
    }

    async fn process<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        event: &Event,
    ) -> HandleOutcome {
        let state = match self.repo.get(key) {
            Ok(state) => state,
            Err(e) => return HandleOutcome::Dropped { reason: e.to_string() },
        };

        let fingerprint_step = state
            .as_ref()
            .map(|s| s.current_step.clone())
            .unwrap_or_default();
        match self.validator.check(key, &fingerprint_step, &event.kind) {
            Err(Rejection::DuplicateClick) => {
                // Silent: no reply, no history.
                log::debug!("duplicate click on {key}, dropping");
                return HandleOutcome::Duplicate;
            }
            Err(Rejection::RateLimited) => {
                let first = self.rate_noticed.lock().unwrap().insert(key.to_string());
                if first {
                    let _ = adapter.send_text(&key.chat_id, RATE_LIMIT_NOTICE, &[]).await;
                    if let Some(state) = &state {
                        let _ = self.repo.append_history(
                            &state.id,
                            HistoryEntry::system("rate_limited", json!({ "update_id": event.id })),
                        );
                        let _ = self.repo.flush_history(&state.id);
                    }
                }
                return HandleOutcome::RateLimited;
            }
            Ok(()) => {
                self.rate_noticed.lock().unwrap().remove(&key.to_string());
            }
        }

        match &event.kind {
            EventKind::Command { name } => {
                self.handle_command(adapter, key, event, state, name).await
            }
            _ => self.advance(adapter, key, event, state).await,
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn handle_command<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        event: &Event,
        state: Option<DialogState>,
        name: &str,
    ) -> HandleOutcome {
        // A faulted conversation accepts nothing but /reset.
        if let Some(state) = &state {
            if state.current_step == FAULT_STEP && name != "reset" {
                let _ = adapter.send_text(&key.chat_id, FAULT_NOTICE, &[]).await;
                return HandleOutcome::Faulted;
            }
        }

        match name {
            "start" => self.restart(adapter, key, event, state, false).await,
            "reset" => self.restart(adapter, key, event, state, true).await,
            "help" => self.send_help(adapter, key, state).await,
            other => {
                log::debug!("ignoring unknown command '/{other}' on {key}");
                HandleOutcome::Ignored
            }
        }
    }

    /// `/start` re-pins the active scenario and enters its start step,
    /// preserving collected data; `/reset` (`wipe`) also clears it. History
    /// is preserved by both.
    async fn restart<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        event: &Event,
        state: Option<DialogState>,
        wipe: bool,
    ) -> HandleOutcome {
        // Prefer the bot's active scenario; fall back to the dialog's
        // pinned version if nothing is active.
        let scenario_id = match self.store.get_active_scenario(&key.bot_id) {
            Ok(Some(record)) => record.id,
            Ok(None) => match state.as_ref().and_then(|s| s.scenario_id.clone()) {
                Some(id) => id,
                None => {
                    let _ = adapter.send_text(&key.chat_id, NO_SCENARIO_NOTICE, &[]).await;
                    return HandleOutcome::Processed { sent: 1 };
                }
            },
            Err(e) => return HandleOutcome::Dropped { reason: e.to_string() },
        };

        let scenario = match self.load_scenario(&scenario_id) {
            Ok(scenario) => scenario,
            Err(ScenarioLoadError::Backend(reason)) => {
                return HandleOutcome::Dropped { reason };
            }
            Err(e) => match state {
                Some(state) => {
                    return self
                        .fault_conversation(adapter, key, &state, &e.to_string(), Vec::new())
                        .await;
                }
                None => {
                    log::error!("cannot start dialog on {key}: {e}");
                    let _ = adapter.send_text(&key.chat_id, NO_SCENARIO_NOTICE, &[]).await;
                    return HandleOutcome::Ignored;
                }
            },
        };

        let history = vec![HistoryEntry::user(json!({
            "update_id": event.id,
            "command": if wipe { "reset" } else { "start" },
        }))];
        let start_step = scenario.graph.start_step.clone();

        match state {
            Some(existing) => {
                let data = if wipe {
                    Map::new()
                } else {
                    retain_declared(existing.collected.clone(), &scenario)
                };
                self.run_from(adapter, key, existing, &scenario, start_step, data, history)
                    .await
            }
            None => {
                let created = match self.repo.create(key, Some(scenario.id.as_str()), &start_step, &Map::new())
                {
                    Ok(state) => state,
                    Err(e) => return HandleOutcome::Dropped { reason: e.to_string() },
                };
                self.run_from(adapter, key, created, &scenario, start_step, Map::new(), history)
                    .await
            }
        }
    }

    async fn send_help<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        state: Option<DialogState>,
    ) -> HandleOutcome {
        let scenario_id = state
            .as_ref()
            .and_then(|s| s.scenario_id.clone())
            .or_else(|| {
                self.store
                    .get_active_scenario(&key.bot_id)
                    .ok()
                    .flatten()
                    .map(|r| r.id)
            });
        let text = scenario_id
            .and_then(|id| self.load_scenario(&id).ok())
            .and_then(|s| s.help_text().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_HELP.to_string());

        match with_retries(self.config.max_send_retries, || {
            adapter.send_text(&key.chat_id, &text, &[])
        })
        .await
        {
            Ok(_) => {
                if let Some(state) = &state {
                    let _ = self
                        .repo
                        .append_history(&state.id, HistoryEntry::bot(json!({ "text": text })));
                    let _ = self.repo.flush_history(&state.id);
                }
                HandleOutcome::Processed { sent: 1 }
            }
            Err(e) => self.send_failure(key, e).await,
        }
    }

    // ── Input events ────────────────────────────────────────────────────

    async fn advance<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        event: &Event,
        state: Option<DialogState>,
    ) -> HandleOutcome {
        let Some(state) = state else {
            return self.try_auto_start(adapter, key, event).await;
        };

        if state.current_step == FAULT_STEP {
            let _ = adapter.send_text(&key.chat_id, FAULT_NOTICE, &[]).await;
            return HandleOutcome::Faulted;
        }

        let Some(scenario_id) = state.scenario_id.clone() else {
            // Quiescent: no scenario pinned, only /start does anything.
            log::debug!("{key} has no pinned scenario; ignoring input");
            return HandleOutcome::Ignored;
        };
        let scenario = match self.load_scenario(&scenario_id) {
            Ok(scenario) => scenario,
            Err(ScenarioLoadError::Backend(reason)) => {
                return HandleOutcome::Dropped { reason };
            }
            Err(e) => {
                return self
                    .fault_conversation(adapter, key, &state, &e.to_string(), Vec::new())
                    .await;
            }
        };

        let Some(step) = scenario.step(&state.current_step) else {
            let reason = format!("state points at unknown step '{}'", state.current_step);
            return self
                .fault_conversation(adapter, key, &state, &reason, Vec::new())
                .await;
        };
        let Some(spec) = step.expected_input() else {
            log::debug!(
                "{key} received input at step '{}' which expects none; ignoring",
                state.current_step
            );
            return HandleOutcome::Ignored;
        };

        let pattern = scenario.input_pattern(&state.current_step);
        match validate_input(spec, pattern, step.buttons(), &event.kind) {
            Err(InputError::InvalidButton) => {
                // Re-render the prompt with the same buttons; state unchanged.
                let mut history = vec![HistoryEntry::system(
                    "invalid_button",
                    json!({ "value": event.kind.input_text(), "step": state.current_step }),
                )];
                let rendered =
                    match processor::render_step(&scenario, &state.current_step, &state.collected) {
                        Ok(result) => result.message,
                        Err(e) => {
                            return self
                                .fault_conversation(adapter, key, &state, &e.to_string(), history)
                                .await;
                        }
                    };
                if let Some(message) = rendered {
                    history.push(HistoryEntry::bot(json!({ "text": message.text })));
                    if let Err(e) = self.deliver(adapter, key, &message, &mut history).await {
                        return self.engine_failure(key, e).await;
                    }
                }
                if let Err(e) = self.append_all(&state.id, history) {
                    return HandleOutcome::Dropped { reason: e.to_string() };
                }
                HandleOutcome::Reprompted
            }
            Err(InputError::Invalid(message)) => {
                let mut history = vec![HistoryEntry::system(
                    "invalid_input",
                    json!({ "value": event.kind.input_text(), "step": state.current_step }),
                )];
                history.push(HistoryEntry::bot(json!({ "text": message })));
                match with_retries(self.config.max_send_retries, || {
                    adapter.send_text(&key.chat_id, &message, &[])
                })
                .await
                {
                    Ok(_) => {}
                    Err(e) => return self.send_failure(key, e).await,
                }
                if let Err(e) = self.append_all(&state.id, history) {
                    return HandleOutcome::Dropped { reason: e.to_string() };
                }
                HandleOutcome::Reprompted
            }
            Ok(value) => {
                let history = vec![HistoryEntry::user(json!({
                    "update_id": event.id,
                    "event": serde_json::to_value(&event.kind).unwrap_or(Value::Null),
                }))];
                let mut data = state.collected.clone();
                data.insert(spec.variable.clone(), value);

                match processor::resolve_next(&scenario, &state.current_step, &data) {
                    Err(e) => {
                        self.fault_conversation(adapter, key, &state, &e.to_string(), history)
                            .await
                    }
                    Ok(None) => {
                        // Terminal input: store the data, conversation ends here.
                        let step = state.current_step.clone();
                        match self.persist(key, &state, Some(scenario.id.as_str()), &step, &data, history) {
                            Ok(()) => HandleOutcome::Processed { sent: 0 },
                            Err(e) => self.engine_failure(key, e).await,
                        }
                    }
                    Ok(Some(next)) => {
                        self.run_from(adapter, key, state, &scenario, next, data, history)
                            .await
                    }
                }
            }
        }
    }

    /// Inbound message with no dialog state: materialize one if the active
    /// scenario opts into auto-start, else stay quiescent.
    async fn try_auto_start<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        event: &Event,
    ) -> HandleOutcome {
        let record = match self.store.get_active_scenario(&key.bot_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("{key} is quiescent (no active scenario); ignoring input");
                return HandleOutcome::Ignored;
            }
            Err(e) => return HandleOutcome::Dropped { reason: e.to_string() },
        };
        let scenario = match self.load_scenario(&record.id) {
            Ok(s) => s,
            Err(e) => {
                log::error!("active scenario for {key} failed to load: {e}");
                return HandleOutcome::Ignored;
            }
        };
        if !scenario.graph.auto_start {
            log::debug!("{key} has no dialog and auto-start is off; ignoring input");
            return HandleOutcome::Ignored;
        }

        let start_step = scenario.graph.start_step.clone();
        let created = match self.repo.create(key, Some(scenario.id.as_str()), &start_step, &Map::new()) {
            Ok(state) => state,
            Err(e) => return HandleOutcome::Dropped { reason: e.to_string() },
        };
        let history = vec![HistoryEntry::user(json!({
            "update_id": event.id,
            "event": serde_json::to_value(&event.kind).unwrap_or(Value::Null),
            "auto_start": true,
        }))];
        self.run_from(adapter, key, created, &scenario, start_step, Map::new(), history)
            .await
    }

    // ── Step driver ─────────────────────────────────────────────────────

    /// Enter `entry_step` and keep auto-transitioning until a step expects
    /// input, the graph ends, or the loop guard trips. Sends happen after
    /// the walk, state persistence after the sends.
    async fn run_from<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        state: DialogState,
        scenario: &Scenario,
        entry_step: String,
        mut data: Map<String, Value>,
        mut history: Vec<HistoryEntry>,
    ) -> HandleOutcome {
        let mut rendered: Vec<OutgoingMessage> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = entry_step;
        let mut last_unique = current.clone();

        loop {
            if !scenario.has_step(&current) {
                let reason = format!("transition to unknown step '{current}'");
                return self.fault_conversation(adapter, key, &state, &reason, history).await;
            }
            if visited.contains(&current) {
                log::warn!("auto-transition loop at step '{current}' on {key}");
                history.push(HistoryEntry::system(
                    "auto_transition_loop",
                    json!({ "revisited": current, "resting_at": last_unique }),
                ));
                current = last_unique.clone();
                break;
            }
            if visited.len() >= self.config.auto_transition_max_steps {
                log::warn!("auto-transition depth limit hit at step '{current}' on {key}");
                history.push(HistoryEntry::system(
                    "auto_transition_loop",
                    json!({ "reason": "max_steps", "resting_at": last_unique }),
                ));
                current = last_unique.clone();
                break;
            }
            visited.insert(current.clone());
            last_unique = current.clone();

            let result = match processor::render_step(scenario, &current, &data) {
                Ok(result) => result,
                Err(e) => {
                    return self
                        .fault_conversation(adapter, key, &state, &e.to_string(), history)
                        .await;
                }
            };

            if let Some(invocation) = result.action {
                let Some(handler) = self.actions.get(&invocation.name) else {
                    let reason = format!("unknown action handler '{}'", invocation.name);
                    return self.fault_conversation(adapter, key, &state, &reason, history).await;
                };
                let ctx = ActionContext {
                    bot_id: &key.bot_id,
                    chat_id: &key.chat_id,
                    params: &invocation.params,
                    data: &data,
                };
                match handler.call(&ctx) {
                    Ok(updates) => {
                        history.push(HistoryEntry::system(
                            "action",
                            json!({ "name": invocation.name }),
                        ));
                        merge_declared(&mut data, updates, scenario);
                    }
                    Err(e) => {
                        let reason = format!("action '{}' failed: {e}", invocation.name);
                        return self
                            .fault_conversation(adapter, key, &state, &reason, history)
                            .await;
                    }
                }
            }

            if let Some(message) = result.message {
                history.push(HistoryEntry::bot(json!({ "text": message.text })));
                rendered.push(message);
            }

            if result.expects.is_some() {
                break;
            }
            match processor::resolve_next(scenario, &current, &data) {
                Err(e) => {
                    return self
                        .fault_conversation(adapter, key, &state, &e.to_string(), history)
                        .await;
                }
                Ok(None) => break,
                Ok(Some(next)) => current = next,
            }
        }

        // Send phase: outbound order is the order the walk produced.
        let mut sent = 0;
        for message in &rendered {
            match self.deliver(adapter, key, message, &mut history).await {
                Ok(n) => sent += n,
                Err(e) => return self.engine_failure(key, e).await,
            }
        }

        // State write deferred until every send succeeded (or fell back).
        match self.persist(key, &state, Some(scenario.id.as_str()), &current, &data, history) {
            Ok(()) => HandleOutcome::Processed { sent },
            Err(e) => self.engine_failure(key, e).await,
        }
    }

    // ── Delivery ────────────────────────────────────────────────────────

    /// Send one rendered message: resolve media, fall back to text on media
    /// failure, retry transient send failures, downgrade failed groups to
    /// individual sends. Returns the number of successful adapter sends.
    async fn deliver<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        message: &OutgoingMessage,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<usize, EngineError> {
        let retries = self.config.max_send_retries;

        if message.media.is_empty() {
            return match with_retries(retries, || {
                adapter.send_text(&key.chat_id, &message.text, &message.buttons)
            })
            .await
            {
                Ok(_) => Ok(1),
                Err(e) => self.swallow_rejection(e, history),
            };
        }

        let outcomes = self
            .media
            .resolve(adapter, &key.bot_id, key.platform, &message.media)
            .await;
        let failures: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();

        if !failures.is_empty() {
            // Text-only fallback, prefixed with the failed items' descriptions.
            for failure in &failures {
                history.push(HistoryEntry::system(
                    "media_upload_failed",
                    json!({ "file_id": failure.logical_id, "detail": failure.detail }),
                ));
            }
            let mut parts: Vec<String> = failures
                .iter()
                .filter(|f| !f.description.is_empty())
                .map(|f| f.description.clone())
                .collect();
            if !message.text.is_empty() {
                parts.push(message.text.clone());
            }
            let fallback = parts.join("\n");
            return match with_retries(retries, || {
                adapter.send_text(&key.chat_id, &fallback, &message.buttons)
            })
            .await
            {
                Ok(_) => Ok(1),
                Err(e) => self.swallow_rejection(e, history),
            };
        }

        let items: Vec<OutboundMedia> = outcomes.into_iter().map(|o| o.unwrap()).collect();

        // Buttons cannot ride on a media group, so the caption only goes
        // with the group when there are none.
        let caption_in_group = message.buttons.is_empty() && !message.text.is_empty();
        let caption = caption_in_group.then_some(message.text.as_str());

        let mut attempt: u32 = 0;
        let group_result = loop {
            match adapter.send_media(&key.chat_id, &items, caption).await {
                Ok(ids) => break Ok(ids),
                Err(g) if g.error.is_transient() && attempt < retries => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(g) => break Err(g),
            }
        };

        let mut sent = 0;
        match group_result {
            Ok(_) => {
                sent += 1;
                if !caption_in_group && !message.text.is_empty() {
                    match with_retries(retries, || {
                        adapter.send_text(&key.chat_id, &message.text, &message.buttons)
                    })
                    .await
                    {
                        Ok(_) => sent += 1,
                        Err(e) => {
                            sent += self.swallow_rejection(e, history)?;
                        }
                    }
                }
            }
            Err(group_error) => {
                if let SendError::Unauthorized(m) = &group_error.error {
                    return Err(EngineError::Unauthorized(m.clone()));
                }
                log::warn!(
                    "media group for {key} failed at item {}; downgrading to individual sends",
                    group_error.index
                );
                history.push(HistoryEntry::system(
                    "media_group_downgraded",
                    json!({ "first_failed_index": group_error.index }),
                ));
                for (index, item) in items.iter().enumerate() {
                    let mut attempt: u32 = 0;
                    let result = loop {
                        match adapter
                            .send_media(&key.chat_id, std::slice::from_ref(item), None)
                            .await
                        {
                            Ok(_) => break Ok(()),
                            Err(g) if g.error.is_transient() && attempt < retries => {
                                tokio::time::sleep(backoff_delay(attempt)).await;
                                attempt += 1;
                            }
                            Err(g) => break Err(g.error),
                        }
                    };
                    match result {
                        Ok(()) => sent += 1,
                        Err(SendError::Unauthorized(m)) => {
                            return Err(EngineError::Unauthorized(m));
                        }
                        Err(e) => {
                            // Reported per item; the rest of the group still goes out.
                            history.push(HistoryEntry::system(
                                "media_send_failed",
                                json!({ "index": index, "detail": e.to_string() }),
                            ));
                        }
                    }
                }
                if !message.text.is_empty() {
                    match with_retries(retries, || {
                        adapter.send_text(&key.chat_id, &message.text, &message.buttons)
                    })
                    .await
                    {
                        Ok(_) => sent += 1,
                        Err(e) => {
                            sent += self.swallow_rejection(e, history)?;
                        }
                    }
                }
            }
        }
        Ok(sent)
    }

    /// `InvalidInput` from the platform is not retryable and not fatal for
    /// the event: record it and move on. Everything else propagates.
    fn swallow_rejection(
        &self,
        error: SendError,
        history: &mut Vec<HistoryEntry>,
    ) -> Result<usize, EngineError> {
        match error {
            SendError::Transient(m) => Err(EngineError::Transient(m)),
            SendError::Unauthorized(m) => Err(EngineError::Unauthorized(m)),
            SendError::InvalidInput(m) => {
                log::error!("platform rejected outbound message: {m}");
                history.push(HistoryEntry::system("send_rejected", json!({ "detail": m })));
                Ok(0)
            }
        }
    }

    // ── Persistence and failure paths ───────────────────────────────────

    /// Write the new state (optimistic, with bounded conflict retries),
    /// then append and flush the event's history entries.
    fn persist(
        &self,
        key: &ConversationKey,
        state: &DialogState,
        scenario_id: Option<&str>,
        step: &str,
        data: &Map<String, Value>,
        history: Vec<HistoryEntry>,
    ) -> Result<(), EngineError> {
        let mut version = state.version;
        let mut attempts: u32 = 0;
        loop {
            match self
                .repo
                .update(key, &state.id, version, scenario_id, step, data)
            {
                Ok(_) => break,
                Err(StoreError::Conflict(_)) if attempts < self.config.conflict_retries => {
                    attempts += 1;
                    log::warn!("state conflict on {key}, refreshing (attempt {attempts})");
                    match self.store.get_dialog_state_by_id(&state.id) {
                        Ok(Some(fresh)) => version = fresh.version,
                        Ok(None) => {
                            return Err(EngineError::Transient("dialog state disappeared".into()));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.append_all(&state.id, history)?;
        Ok(())
    }

    fn append_all(&self, dialog_id: &str, history: Vec<HistoryEntry>) -> Result<(), StoreError> {
        for entry in history {
            self.repo.append_history(dialog_id, entry)?;
        }
        self.repo.flush_history(dialog_id)
    }

    /// Park the conversation at the fault sentinel and tell the user how to
    /// get out.
    async fn fault_conversation<A: PlatformAdapter>(
        &self,
        adapter: &A,
        key: &ConversationKey,
        state: &DialogState,
        reason: &str,
        mut history: Vec<HistoryEntry>,
    ) -> HandleOutcome {
        log::error!("conversation {key} faulted: {reason}");
        history.push(HistoryEntry::system("fatal", json!({ "reason": reason })));
        let _ = adapter.send_text(&key.chat_id, FAULT_NOTICE, &[]).await;

        let scenario_id = state.scenario_id.clone();
        if let Err(e) = self.persist(
            key,
            state,
            scenario_id.as_deref(),
            FAULT_STEP,
            &state.collected,
            history,
        ) {
            if let EngineError::Transient(reason) = e {
                return HandleOutcome::Dropped { reason };
            }
        }
        HandleOutcome::Faulted
    }

    async fn engine_failure(&self, key: &ConversationKey, error: EngineError) -> HandleOutcome {
        match error {
            EngineError::Transient(reason) => {
                log::warn!("dropping event for {key}: {reason}");
                HandleOutcome::Dropped { reason }
            }
            EngineError::Unauthorized(reason) => {
                log::error!("credentials for {key} rejected: {reason}");
                if let Err(e) = self
                    .store
                    .set_credential_healthy(&key.bot_id, key.platform, false)
                {
                    log::error!("failed to mark credential unhealthy: {e}");
                }
                HandleOutcome::Unauthorized
            }
        }
    }

    async fn send_failure(&self, key: &ConversationKey, error: SendError) -> HandleOutcome {
        let engine_error = match error {
            SendError::Transient(m) => EngineError::Transient(m),
            SendError::Unauthorized(m) => EngineError::Unauthorized(m),
            SendError::InvalidInput(m) => {
                log::error!("platform rejected outbound message for {key}: {m}");
                return HandleOutcome::Processed { sent: 0 };
            }
        };
        self.engine_failure(key, engine_error).await
    }

    fn load_scenario(&self, scenario_id: &str) -> Result<Arc<Scenario>, ScenarioLoadError> {
        if let Some(scenario) = self.scenarios.get(scenario_id) {
            return Ok(scenario);
        }
        let record = self
            .store
            .get_scenario(scenario_id)
            .map_err(|e| ScenarioLoadError::Backend(e.to_string()))?
            .ok_or(ScenarioLoadError::Missing)?;
        let scenario =
            Scenario::from_json(&record.id, &record.bot_id, record.version, &record.graph_json)
                .map_err(|e| ScenarioLoadError::Invalid(e.to_string()))?;
        let scenario = Arc::new(scenario);
        self.scenarios.insert(scenario_id.to_string(), scenario.clone());
        Ok(scenario)
    }
}

#[derive(Debug)]
enum ScenarioLoadError {
    Missing,
    Invalid(String),
    Backend(String),
}

impl std::fmt::Display for ScenarioLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "scenario no longer exists"),
            Self::Invalid(msg) => write!(f, "scenario failed to compile: {msg}"),
            Self::Backend(msg) => write!(f, "scenario load failed: {msg}"),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100) * 2u32.saturating_pow(attempt)
}

/// Keep only variables the scenario declares (collected data is always a
/// subset of the scenario's variable set).
fn retain_declared(data: Map<String, Value>, scenario: &Scenario) -> Map<String, Value> {
    data.into_iter()
        .filter(|(name, _)| scenario.graph.variables.contains_key(name))
        .collect()
}

fn merge_declared(data: &mut Map<String, Value>, updates: Map<String, Value>, scenario: &Scenario) {
    for (name, value) in updates {
        if scenario.graph.variables.contains_key(&name) {
            data.insert(name, value);
        } else {
            log::warn!("action update for undeclared variable '{name}' discarded");
        }
    }
}

/// Per-bot filter of recently seen webhook update ids. Bounded and TTL'd;
/// `check_and_insert` returns `true` when the id is new.
struct SeenSet {
    ttl: Duration,
    cap: usize,
    inner: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl SeenSet {
    fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            ttl,
            cap: cap.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn check_and_insert(&self, bot_id: &str, update_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let seen = inner.entry(bot_id.to_string()).or_default();
        let now = Instant::now();
        seen.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        if seen.contains_key(update_id) {
            return false;
        }
        // At capacity, evict oldest first.
        while seen.len() >= self.cap {
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(id, _)| id.clone())
            {
                seen.remove(&oldest);
            } else {
                break;
            }
        }
        seen.insert(update_id.to_string(), now);
        true
    }

    fn remove(&self, bot_id: &str, update_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(seen) = inner.get_mut(bot_id) {
            seen.remove(update_id);
        }
    }
}
