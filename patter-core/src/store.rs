use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};

use crate::types::{HistoryEntry, HistoryKind, Platform};

/// A bot owned by an account.
#[derive(Debug, Clone, PartialEq)]
pub struct BotInstance {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub active: bool,
}

/// Per-platform credentials and webhook registration state for a bot.
/// `secrets` is opaque to the engine; adapters interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformCredential {
    pub bot_id: String,
    pub platform: Platform,
    pub secrets: Value,
    pub webhook_url: Option<String>,
    pub webhook_last_checked: Option<DateTime<Utc>>,
    pub auto_refresh: bool,
    pub healthy: bool,
}

/// A stored scenario version. `graph_json` is the wire-format graph; it is
/// immutable once written — a new version is a new row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioRecord {
    pub id: String,
    pub bot_id: String,
    pub version: i64,
    pub active: bool,
    pub graph_json: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent state of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogState {
    pub id: String,
    pub bot_id: String,
    pub platform: Platform,
    pub chat_id: String,
    /// Scenario version this dialog is pinned to. Pinned at creation so a
    /// deactivated scenario keeps serving dialogs that began under it.
    pub scenario_id: Option<String>,
    pub current_step: String,
    pub collected: Map<String, Value>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

/// A stored media asset with its per-platform native file ids.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAsset {
    pub id: String,
    pub bot_id: String,
    pub logical_file_id: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub platform_ids: HashMap<Platform, String>,
    pub created_at: DateTime<Utc>,
}

/// Persistence failures.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound,
    /// Optimistic-concurrency version mismatch, or an operation refused
    /// because it would violate an invariant (e.g. deleting an active
    /// scenario).
    Conflict(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Backend(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

fn backend(context: &str) -> impl Fn(rusqlite::Error) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{context}: {e}"))
}

/// SQLite-backed persistence for the engine.
///
/// Wraps a `Connection` in a `Mutex` so it is `Send + Sync`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("failed to open '{}': {e}", path.display())))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests and offline simulation).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Backend(format!("failed to open in-memory database: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run schema migrations idempotently.
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS platform_credentials (
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                platform TEXT NOT NULL,
                secrets_json TEXT NOT NULL,
                webhook_url TEXT,
                webhook_last_checked TEXT,
                auto_refresh INTEGER NOT NULL DEFAULT 0,
                healthy INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (bot_id, platform)
            );

            CREATE TABLE IF NOT EXISTS scenarios (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                graph_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scenarios_bot_active
                ON scenarios(bot_id, active);

            CREATE TABLE IF NOT EXISTS dialog_states (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                platform TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                scenario_id TEXT REFERENCES scenarios(id) ON DELETE CASCADE,
                current_step TEXT NOT NULL,
                collected_json TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_interaction_at TEXT NOT NULL,
                UNIQUE (bot_id, platform, chat_id)
            );

            CREATE TABLE IF NOT EXISTS dialog_history (
                dialog_id TEXT NOT NULL REFERENCES dialog_states(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                ts TEXT NOT NULL,
                PRIMARY KEY (dialog_id, seq)
            );

            CREATE TABLE IF NOT EXISTS media_assets (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                logical_file_id TEXT NOT NULL,
                mime TEXT NOT NULL,
                bytes BLOB NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (bot_id, logical_file_id)
            );

            CREATE TABLE IF NOT EXISTS media_platform_ids (
                asset_id TEXT NOT NULL REFERENCES media_assets(id) ON DELETE CASCADE,
                platform TEXT NOT NULL,
                file_id TEXT NOT NULL,
                PRIMARY KEY (asset_id, platform)
            );
            ",
        )
        .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        Ok(())
    }

    // ── Bots ────────────────────────────────────────────────────────────

    pub fn create_bot(&self, account_id: &str, name: &str) -> Result<BotInstance, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bots (id, account_id, name, active) VALUES (?1, ?2, ?3, 1)",
            params![id, account_id, name],
        )
        .map_err(backend("failed to create bot"))?;
        Ok(BotInstance {
            id,
            account_id: account_id.to_string(),
            name: name.to_string(),
            active: true,
        })
    }

    pub fn get_bot(&self, id: &str) -> Result<Option<BotInstance>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, account_id, name, active FROM bots WHERE id = ?1",
            params![id],
            |row| {
                Ok(BotInstance {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    name: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()
        .map_err(backend("failed to get bot"))
    }

    // ── Platform credentials ────────────────────────────────────────────

    pub fn upsert_platform_credential(&self, cred: &PlatformCredential) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO platform_credentials
                 (bot_id, platform, secrets_json, webhook_url, webhook_last_checked, auto_refresh, healthy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (bot_id, platform) DO UPDATE SET
                 secrets_json = excluded.secrets_json,
                 webhook_url = excluded.webhook_url,
                 webhook_last_checked = excluded.webhook_last_checked,
                 auto_refresh = excluded.auto_refresh,
                 healthy = excluded.healthy",
            params![
                cred.bot_id,
                cred.platform.as_str(),
                cred.secrets.to_string(),
                cred.webhook_url,
                cred.webhook_last_checked.map(|t| t.to_rfc3339()),
                cred.auto_refresh as i64,
                cred.healthy as i64,
            ],
        )
        .map_err(backend("failed to upsert credential"))?;
        Ok(())
    }

    pub fn get_platform_credential(
        &self,
        bot_id: &str,
        platform: Platform,
    ) -> Result<Option<PlatformCredential>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT bot_id, platform, secrets_json, webhook_url, webhook_last_checked,
                    auto_refresh, healthy
             FROM platform_credentials WHERE bot_id = ?1 AND platform = ?2",
            params![bot_id, platform.as_str()],
            credential_from_row,
        )
        .optional()
        .map_err(backend("failed to get credential"))
    }

    /// Credentials of active bots that opted into webhook auto-refresh.
    pub fn list_auto_refresh_credentials(&self) -> Result<Vec<PlatformCredential>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.bot_id, c.platform, c.secrets_json, c.webhook_url,
                        c.webhook_last_checked, c.auto_refresh, c.healthy
                 FROM platform_credentials c
                 JOIN bots b ON b.id = c.bot_id
                 WHERE c.auto_refresh = 1 AND c.healthy = 1 AND b.active = 1",
            )
            .map_err(backend("failed to prepare credential list"))?;
        let rows = stmt
            .query_map([], credential_from_row)
            .map_err(backend("failed to list credentials"))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(backend("failed to read credential row"))?);
        }
        Ok(result)
    }

    /// Active, healthy credentials for a platform — the set the server
    /// builds adapters for.
    pub fn list_platform_credentials(
        &self,
        platform: Platform,
    ) -> Result<Vec<PlatformCredential>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.bot_id, c.platform, c.secrets_json, c.webhook_url,
                        c.webhook_last_checked, c.auto_refresh, c.healthy
                 FROM platform_credentials c
                 JOIN bots b ON b.id = c.bot_id
                 WHERE c.platform = ?1 AND b.active = 1",
            )
            .map_err(backend("failed to prepare credential list"))?;
        let rows = stmt
            .query_map(params![platform.as_str()], credential_from_row)
            .map_err(backend("failed to list credentials"))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(backend("failed to read credential row"))?);
        }
        Ok(result)
    }

    pub fn set_credential_healthy(
        &self,
        bot_id: &str,
        platform: Platform,
        healthy: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE platform_credentials SET healthy = ?1 WHERE bot_id = ?2 AND platform = ?3",
            params![healthy as i64, bot_id, platform.as_str()],
        )
        .map_err(backend("failed to update credential health"))?;
        Ok(())
    }

    pub fn set_webhook_checked(
        &self,
        bot_id: &str,
        platform: Platform,
        url: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE platform_credentials
             SET webhook_url = ?1, webhook_last_checked = ?2
             WHERE bot_id = ?3 AND platform = ?4",
            params![url, Utc::now().to_rfc3339(), bot_id, platform.as_str()],
        )
        .map_err(backend("failed to stamp webhook check"))?;
        Ok(())
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    /// Insert a new scenario version for a bot (inactive until activated).
    pub fn insert_scenario(
        &self,
        bot_id: &str,
        graph_json: &str,
    ) -> Result<ScenarioRecord, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM scenarios WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get(0),
            )
            .map_err(backend("failed to get next scenario version"))?;
        conn.execute(
            "INSERT INTO scenarios (id, bot_id, version, active, graph_json, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![id, bot_id, version, graph_json, now.to_rfc3339()],
        )
        .map_err(backend("failed to insert scenario"))?;
        Ok(ScenarioRecord {
            id,
            bot_id: bot_id.to_string(),
            version,
            active: false,
            graph_json: graph_json.to_string(),
            created_at: now,
        })
    }

    /// Atomically make `id` the bot's single active scenario.
    pub fn activate_scenario(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(backend("failed to start transaction"))?;
        let bot_id: Option<String> = tx
            .query_row(
                "SELECT bot_id FROM scenarios WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend("failed to look up scenario"))?;
        let Some(bot_id) = bot_id else {
            return Err(StoreError::NotFound);
        };
        tx.execute(
            "UPDATE scenarios SET active = 0 WHERE bot_id = ?1",
            params![bot_id],
        )
        .map_err(backend("failed to deactivate scenarios"))?;
        tx.execute(
            "UPDATE scenarios SET active = 1 WHERE id = ?1",
            params![id],
        )
        .map_err(backend("failed to activate scenario"))?;
        tx.commit().map_err(backend("failed to commit activation"))?;
        Ok(())
    }

    /// Deactivating is always allowed; dialogs pinned to the version keep
    /// progressing under it.
    pub fn deactivate_scenario(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute("UPDATE scenarios SET active = 0 WHERE id = ?1", params![id])
            .map_err(backend("failed to deactivate scenario"))?;
        if rows == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete a scenario version. Refused for the active version; cascades
    /// the dialogs pinned to it.
    pub fn delete_scenario(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let active: Option<i64> = conn
            .query_row(
                "SELECT active FROM scenarios WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend("failed to look up scenario"))?;
        match active {
            None => Err(StoreError::NotFound),
            Some(a) if a != 0 => Err(StoreError::Conflict(
                "cannot delete the active scenario".into(),
            )),
            Some(_) => {
                conn.execute("DELETE FROM scenarios WHERE id = ?1", params![id])
                    .map_err(backend("failed to delete scenario"))?;
                Ok(())
            }
        }
    }

    pub fn get_active_scenario(&self, bot_id: &str) -> Result<Option<ScenarioRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, bot_id, version, active, graph_json, created_at
             FROM scenarios WHERE bot_id = ?1 AND active = 1",
            params![bot_id],
            scenario_from_row,
        )
        .optional()
        .map_err(backend("failed to get active scenario"))
    }

    pub fn get_scenario(&self, id: &str) -> Result<Option<ScenarioRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, bot_id, version, active, graph_json, created_at
             FROM scenarios WHERE id = ?1",
            params![id],
            scenario_from_row,
        )
        .optional()
        .map_err(backend("failed to get scenario"))
    }

    // ── Dialog states ───────────────────────────────────────────────────

    /// Create the dialog state for a conversation. Fails with `Conflict` if
    /// one already exists.
    pub fn create_dialog_state(
        &self,
        bot_id: &str,
        platform: Platform,
        chat_id: &str,
        scenario_id: Option<&str>,
        current_step: &str,
        collected: &Map<String, Value>,
    ) -> Result<DialogState, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let collected_json = Value::Object(collected.clone()).to_string();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO dialog_states
                 (id, bot_id, platform, chat_id, scenario_id, current_step,
                  collected_json, version, created_at, last_interaction_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                id,
                bot_id,
                platform.as_str(),
                chat_id,
                scenario_id,
                current_step,
                collected_json,
                now.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(DialogState {
                id,
                bot_id: bot_id.to_string(),
                platform,
                chat_id: chat_id.to_string(),
                scenario_id: scenario_id.map(str::to_string),
                current_step: current_step.to_string(),
                collected: collected.clone(),
                version: 1,
                created_at: now,
                last_interaction_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(
                    msg.unwrap_or_else(|| "dialog state already exists".into()),
                ))
            }
            Err(e) => Err(StoreError::Backend(format!(
                "failed to create dialog state: {e}"
            ))),
        }
    }

    pub fn get_dialog_state(
        &self,
        bot_id: &str,
        platform: Platform,
        chat_id: &str,
    ) -> Result<Option<DialogState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, bot_id, platform, chat_id, scenario_id, current_step,
                    collected_json, version, created_at, last_interaction_at
             FROM dialog_states WHERE bot_id = ?1 AND platform = ?2 AND chat_id = ?3",
            params![bot_id, platform.as_str(), chat_id],
            dialog_state_from_row,
        )
        .optional()
        .map_err(backend("failed to get dialog state"))
    }

    pub fn get_dialog_state_by_id(&self, id: &str) -> Result<Option<DialogState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, bot_id, platform, chat_id, scenario_id, current_step,
                    collected_json, version, created_at, last_interaction_at
             FROM dialog_states WHERE id = ?1",
            params![id],
            dialog_state_from_row,
        )
        .optional()
        .map_err(backend("failed to get dialog state"))
    }

    /// Optimistic-concurrency update. `expected_version` must match the
    /// stored row or `Conflict` is returned and nothing changes.
    pub fn update_dialog_state(
        &self,
        id: &str,
        expected_version: i64,
        scenario_id: Option<&str>,
        current_step: &str,
        collected: &Map<String, Value>,
    ) -> Result<DialogState, StoreError> {
        let now = Utc::now();
        let collected_json = Value::Object(collected.clone()).to_string();
        let conn = self.conn.lock().unwrap();
        let rows = conn
            .execute(
                "UPDATE dialog_states
                 SET scenario_id = ?1, current_step = ?2, collected_json = ?3,
                     version = version + 1, last_interaction_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    scenario_id,
                    current_step,
                    collected_json,
                    now.to_rfc3339(),
                    id,
                    expected_version,
                ],
            )
            .map_err(backend("failed to update dialog state"))?;
        if rows == 0 {
            // Distinguish a stale version from a missing row.
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM dialog_states WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend("failed to re-check dialog state"))?;
            return match exists {
                None => Err(StoreError::NotFound),
                Some(actual) => Err(StoreError::Conflict(format!(
                    "expected version {expected_version}, found {actual}"
                ))),
            };
        }
        drop(conn);
        self.get_dialog_state_by_id(id)?.ok_or(StoreError::NotFound)
    }

    /// Remove a dialog state; history rows cascade.
    pub fn delete_dialog_state(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(backend("failed to enable foreign keys"))?;
        let rows = conn
            .execute("DELETE FROM dialog_states WHERE id = ?1", params![id])
            .map_err(backend("failed to delete dialog state"))?;
        Ok(rows > 0)
    }

    // ── Dialog history ──────────────────────────────────────────────────

    /// Append one history entry, assigning the next monotonic seq.
    pub fn append_history(&self, dialog_id: &str, entry: &HistoryEntry) -> Result<i64, StoreError> {
        self.append_history_batch(dialog_id, std::slice::from_ref(entry))
    }

    /// Append a batch of entries in order within one transaction. Returns
    /// the seq assigned to the last entry.
    pub fn append_history_batch(
        &self,
        dialog_id: &str,
        entries: &[HistoryEntry],
    ) -> Result<i64, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(backend("failed to start transaction"))?;
        let mut seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM dialog_history WHERE dialog_id = ?1",
                params![dialog_id],
                |row| row.get(0),
            )
            .map_err(backend("failed to get next history seq"))?;
        for entry in entries {
            seq += 1;
            tx.execute(
                "INSERT INTO dialog_history (dialog_id, seq, message_type, payload_json, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dialog_id,
                    seq,
                    entry.kind.as_str(),
                    entry.payload.to_string(),
                    entry.ts.to_rfc3339(),
                ],
            )
            .map_err(backend("failed to insert history entry"))?;
        }
        tx.commit().map_err(backend("failed to commit history"))?;
        Ok(seq)
    }

    /// All history entries for a dialog in seq order.
    pub fn get_history(&self, dialog_id: &str) -> Result<Vec<(i64, HistoryEntry)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT seq, message_type, payload_json, ts
                 FROM dialog_history WHERE dialog_id = ?1 ORDER BY seq ASC",
            )
            .map_err(backend("failed to prepare history query"))?;
        let rows = stmt
            .query_map(params![dialog_id], |row| {
                let seq: i64 = row.get(0)?;
                let kind_str: String = row.get(1)?;
                let payload_json: String = row.get(2)?;
                let ts_str: String = row.get(3)?;
                Ok((seq, kind_str, payload_json, ts_str))
            })
            .map_err(backend("failed to query history"))?;

        let mut result = Vec::new();
        for row in rows {
            let (seq, kind_str, payload_json, ts_str) =
                row.map_err(backend("failed to read history row"))?;
            let kind = match kind_str.as_str() {
                "user" => HistoryKind::User,
                "bot" => HistoryKind::Bot,
                _ => HistoryKind::System,
            };
            let payload = serde_json::from_str(&payload_json)
                .map_err(|e| StoreError::Backend(format!("invalid history payload: {e}")))?;
            result.push((
                seq,
                HistoryEntry {
                    kind,
                    payload,
                    ts: parse_datetime(&ts_str),
                },
            ));
        }
        Ok(result)
    }

    // ── Media assets ────────────────────────────────────────────────────

    pub fn create_media_asset(
        &self,
        bot_id: &str,
        logical_file_id: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<MediaAsset, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO media_assets (id, bot_id, logical_file_id, mime, bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, bot_id, logical_file_id, mime, bytes, now.to_rfc3339()],
        );
        match result {
            Ok(_) => Ok(MediaAsset {
                id,
                bot_id: bot_id.to_string(),
                logical_file_id: logical_file_id.to_string(),
                mime: mime.to_string(),
                bytes: bytes.to_vec(),
                platform_ids: HashMap::new(),
                created_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(msg.unwrap_or_else(|| {
                    format!("logical file id '{logical_file_id}' already exists")
                })))
            }
            Err(e) => Err(StoreError::Backend(format!(
                "failed to create media asset: {e}"
            ))),
        }
    }

    pub fn get_media_asset(
        &self,
        bot_id: &str,
        logical_file_id: &str,
    ) -> Result<Option<MediaAsset>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let asset = conn
            .query_row(
                "SELECT id, bot_id, logical_file_id, mime, bytes, created_at
                 FROM media_assets WHERE bot_id = ?1 AND logical_file_id = ?2",
                params![bot_id, logical_file_id],
                |row| {
                    let created_str: String = row.get(5)?;
                    Ok(MediaAsset {
                        id: row.get(0)?,
                        bot_id: row.get(1)?,
                        logical_file_id: row.get(2)?,
                        mime: row.get(3)?,
                        bytes: row.get(4)?,
                        platform_ids: HashMap::new(),
                        created_at: parse_datetime(&created_str),
                    })
                },
            )
            .optional()
            .map_err(backend("failed to get media asset"))?;

        let Some(mut asset) = asset else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT platform, file_id FROM media_platform_ids WHERE asset_id = ?1")
            .map_err(backend("failed to prepare platform id query"))?;
        let rows = stmt
            .query_map(params![asset.id], |row| {
                let platform: String = row.get(0)?;
                let file_id: String = row.get(1)?;
                Ok((platform, file_id))
            })
            .map_err(backend("failed to query platform ids"))?;
        for row in rows {
            let (platform, file_id) = row.map_err(backend("failed to read platform id row"))?;
            if let Ok(platform) = platform.parse::<Platform>() {
                asset.platform_ids.insert(platform, file_id);
            }
        }

        Ok(Some(asset))
    }

    /// Record a platform file id for an asset. Write-once: if an id already
    /// exists for `(asset, platform)` it wins and is returned unchanged.
    pub fn set_media_platform_id(
        &self,
        asset_id: &str,
        platform: Platform,
        file_id: &str,
    ) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO media_platform_ids (asset_id, platform, file_id)
             VALUES (?1, ?2, ?3)",
            params![asset_id, platform.as_str(), file_id],
        )
        .map_err(backend("failed to record platform file id"))?;
        conn.query_row(
            "SELECT file_id FROM media_platform_ids WHERE asset_id = ?1 AND platform = ?2",
            params![asset_id, platform.as_str()],
            |row| row.get(0),
        )
        .map_err(backend("failed to read back platform file id"))
    }
}

// ── Row mappers / helpers ───────────────────────────────────────────────

fn credential_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformCredential> {
    let platform_str: String = row.get(1)?;
    let secrets_json: String = row.get(2)?;
    let checked_str: Option<String> = row.get(4)?;
    Ok(PlatformCredential {
        bot_id: row.get(0)?,
        platform: platform_str.parse().unwrap_or(Platform::Telegram),
        secrets: serde_json::from_str(&secrets_json).unwrap_or(Value::Null),
        webhook_url: row.get(3)?,
        webhook_last_checked: checked_str.as_deref().map(parse_datetime),
        auto_refresh: row.get::<_, i64>(5)? != 0,
        healthy: row.get::<_, i64>(6)? != 0,
    })
}

fn scenario_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScenarioRecord> {
    let created_str: String = row.get(5)?;
    Ok(ScenarioRecord {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        version: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        graph_json: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

fn dialog_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DialogState> {
    let platform_str: String = row.get(2)?;
    let collected_json: String = row.get(6)?;
    let created_str: String = row.get(8)?;
    let interacted_str: String = row.get(9)?;
    let collected = serde_json::from_str::<Value>(&collected_json)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    Ok(DialogState {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        platform: platform_str.parse().unwrap_or(Platform::Telegram),
        chat_id: row.get(3)?,
        scenario_id: row.get(4)?,
        current_step: row.get(5)?,
        collected,
        version: row.get(7)?,
        created_at: parse_datetime(&created_str),
        last_interaction_at: parse_datetime(&interacted_str),
    })
}

/// Parse an RFC 3339 datetime string, falling back to epoch on failure.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("patter-test-{name}-{}.db", uuid::Uuid::new_v4()))
    }

    fn seed_bot(store: &Store) -> BotInstance {
        store.create_bot("acct1", "demo-bot").unwrap()
    }

    // ── Test: dialog state survives reopen ───────────────────────────────

    #[test]
    fn dialog_state_survives_store_reopen() {
        let path = temp_db_path("reopen");
        let bot_id;
        {
            let store = Store::open(&path).unwrap();
            let bot = seed_bot(&store);
            bot_id = bot.id.clone();
            let mut collected = Map::new();
            collected.insert("user_name".into(), json!("Ada"));
            store
                .create_dialog_state(&bot.id, Platform::Telegram, "chat-1", None, "greet", &collected)
                .unwrap();
        }
        // Store dropped — simulating restart.
        {
            let store = Store::open(&path).unwrap();
            let state = store
                .get_dialog_state(&bot_id, Platform::Telegram, "chat-1")
                .unwrap()
                .unwrap();
            assert_eq!(state.current_step, "greet");
            assert_eq!(state.collected.get("user_name"), Some(&json!("Ada")));
            assert_eq!(state.version, 1);
        }
        std::fs::remove_file(&path).ok();
    }

    // ── Test: one state per conversation ─────────────────────────────────

    #[test]
    fn duplicate_dialog_state_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let collected = Map::new();
        store
            .create_dialog_state(&bot.id, Platform::Telegram, "c1", None, "a", &collected)
            .unwrap();
        let err = store
            .create_dialog_state(&bot.id, Platform::Telegram, "c1", None, "a", &collected)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same chat id on another platform is a different conversation.
        store
            .create_dialog_state(&bot.id, Platform::Whatsapp, "c1", None, "a", &collected)
            .unwrap();
    }

    // ── Test: optimistic concurrency ─────────────────────────────────────

    #[test]
    fn update_with_stale_version_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let collected = Map::new();
        let state = store
            .create_dialog_state(&bot.id, Platform::Telegram, "c1", None, "a", &collected)
            .unwrap();

        let updated = store
            .update_dialog_state(&state.id, state.version, None, "b", &collected)
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.current_step, "b");
        assert!(updated.last_interaction_at >= state.last_interaction_at);

        // Reusing the old version must conflict.
        let err = store
            .update_dialog_state(&state.id, state.version, None, "c", &collected)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Unknown id is NotFound, not Conflict.
        let err = store
            .update_dialog_state("ghost", 1, None, "c", &collected)
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    // ── Test: history seq is monotonic and batch-ordered ─────────────────

    #[test]
    fn history_seq_is_strictly_increasing() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let state = store
            .create_dialog_state(&bot.id, Platform::Telegram, "c1", None, "a", &Map::new())
            .unwrap();

        let seq1 = store
            .append_history(&state.id, &HistoryEntry::user(json!({"text": "hi"})))
            .unwrap();
        let seq2 = store
            .append_history_batch(
                &state.id,
                &[
                    HistoryEntry::bot(json!({"text": "hello"})),
                    HistoryEntry::system("note", json!({})),
                ],
            )
            .unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 3);

        let history = store.get_history(&state.id).unwrap();
        let seqs: Vec<i64> = history.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(history[0].1.kind, HistoryKind::User);
        assert_eq!(history[1].1.kind, HistoryKind::Bot);
        assert_eq!(history[2].1.kind, HistoryKind::System);
    }

    // ── Test: deleting a dialog cascades its history ─────────────────────

    #[test]
    fn delete_dialog_state_cascades_history() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let state = store
            .create_dialog_state(&bot.id, Platform::Telegram, "c1", None, "a", &Map::new())
            .unwrap();
        store
            .append_history(&state.id, &HistoryEntry::user(json!({"text": "hi"})))
            .unwrap();

        assert!(store.delete_dialog_state(&state.id).unwrap());
        assert!(store.get_dialog_state_by_id(&state.id).unwrap().is_none());
        assert!(store.get_history(&state.id).unwrap().is_empty());
    }

    // ── Test: scenario activation is atomic and exclusive ────────────────

    #[test]
    fn at_most_one_active_scenario_per_bot() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let v1 = store.insert_scenario(&bot.id, "{\"a\":1}").unwrap();
        let v2 = store.insert_scenario(&bot.id, "{\"a\":2}").unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        store.activate_scenario(&v1.id).unwrap();
        assert_eq!(store.get_active_scenario(&bot.id).unwrap().unwrap().id, v1.id);

        store.activate_scenario(&v2.id).unwrap();
        let active = store.get_active_scenario(&bot.id).unwrap().unwrap();
        assert_eq!(active.id, v2.id);
        // v1 is no longer active.
        assert!(!store.get_scenario(&v1.id).unwrap().unwrap().active);
    }

    #[test]
    fn active_scenario_cannot_be_deleted() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let rec = store.insert_scenario(&bot.id, "{}").unwrap();
        store.activate_scenario(&rec.id).unwrap();

        let err = store.delete_scenario(&rec.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.deactivate_scenario(&rec.id).unwrap();
        store.delete_scenario(&rec.id).unwrap();
        assert!(store.get_scenario(&rec.id).unwrap().is_none());
    }

    // ── Test: media platform ids are write-once ──────────────────────────

    #[test]
    fn media_platform_id_is_write_once() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let asset = store
            .create_media_asset(&bot.id, "menu_main", "image/jpeg", b"fakebytes")
            .unwrap();

        let first = store
            .set_media_platform_id(&asset.id, Platform::Telegram, "tg-file-1")
            .unwrap();
        assert_eq!(first, "tg-file-1");

        // A second write is ignored; the first id wins.
        let second = store
            .set_media_platform_id(&asset.id, Platform::Telegram, "tg-file-2")
            .unwrap();
        assert_eq!(second, "tg-file-1");

        let loaded = store.get_media_asset(&bot.id, "menu_main").unwrap().unwrap();
        assert_eq!(
            loaded.platform_ids.get(&Platform::Telegram),
            Some(&"tg-file-1".to_string())
        );
        // Other platforms remain unset.
        assert!(!loaded.platform_ids.contains_key(&Platform::Whatsapp));
    }

    #[test]
    fn logical_file_id_is_unique_per_bot() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        store
            .create_media_asset(&bot.id, "menu", "image/png", b"a")
            .unwrap();
        let err = store
            .create_media_asset(&bot.id, "menu", "image/png", b"b")
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Another bot may reuse the logical id.
        let other = store.create_bot("acct1", "other-bot").unwrap();
        store
            .create_media_asset(&other.id, "menu", "image/png", b"c")
            .unwrap();
    }

    // ── Test: credentials round-trip and health flag ─────────────────────

    #[test]
    fn credential_round_trip_and_health() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        let cred = PlatformCredential {
            bot_id: bot.id.clone(),
            platform: Platform::Telegram,
            secrets: json!({"token": "123:abc", "webhook_secret": "s3cret"}),
            webhook_url: None,
            webhook_last_checked: None,
            auto_refresh: true,
            healthy: true,
        };
        store.upsert_platform_credential(&cred).unwrap();

        let loaded = store
            .get_platform_credential(&bot.id, Platform::Telegram)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.secrets["token"], json!("123:abc"));
        assert!(loaded.auto_refresh);

        assert_eq!(store.list_auto_refresh_credentials().unwrap().len(), 1);

        store
            .set_credential_healthy(&bot.id, Platform::Telegram, false)
            .unwrap();
        // Unhealthy credentials drop out of the refresh list.
        assert!(store.list_auto_refresh_credentials().unwrap().is_empty());
    }

    #[test]
    fn webhook_check_is_stamped() {
        let store = Store::open_in_memory().unwrap();
        let bot = seed_bot(&store);
        store
            .upsert_platform_credential(&PlatformCredential {
                bot_id: bot.id.clone(),
                platform: Platform::Telegram,
                secrets: json!({"token": "t"}),
                webhook_url: None,
                webhook_last_checked: None,
                auto_refresh: false,
                healthy: true,
            })
            .unwrap();

        store
            .set_webhook_checked(&bot.id, Platform::Telegram, "https://x.example/webhook")
            .unwrap();
        let loaded = store
            .get_platform_credential(&bot.id, Platform::Telegram)
            .unwrap()
            .unwrap();
        assert_eq!(
            loaded.webhook_url.as_deref(),
            Some("https://x.example/webhook")
        );
        assert!(loaded.webhook_last_checked.is_some());
    }

    // ── Test: idempotent migrations ──────────────────────────────────────

    #[test]
    fn idempotent_migrations() {
        let path = temp_db_path("idempotent");
        {
            let _store = Store::open(&path).unwrap();
        }
        {
            let store = Store::open(&path).unwrap();
            assert!(store.get_bot("nope").unwrap().is_none());
        }
        std::fs::remove_file(&path).ok();
    }
}
