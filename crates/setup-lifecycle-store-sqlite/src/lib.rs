#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use setup_lifecycle_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, unix_millis, workspace_list_limit,
    DecisionEntry, DecisionLedger, Direction, EventKind, LedgerError, RecordReceipt, SetupKey,
    SetupState, StateMachineRecord, TransitionQuery, TransitionRecord, WriteGuard,
};
use ulid::Ulid;

const SETUP_MIGRATION_VERSION: i64 = 1;
const DRIFT_SAMPLE_LIMIT: usize = 25;

const SCHEMA_SETUP_V1: &str = r"
CREATE TABLE IF NOT EXISTS setup_state (
  workspace_id TEXT NOT NULL CHECK (length(workspace_id) > 0),
  symbol TEXT NOT NULL CHECK (length(symbol) > 0),
  playbook TEXT NOT NULL CHECK (length(playbook) > 0),
  direction TEXT NOT NULL CHECK (direction IN ('long', 'short')),
  state TEXT NOT NULL CHECK (
    state IN ('SCAN', 'WATCH', 'STALK', 'ARMED', 'EXECUTE', 'MANAGE', 'COOLDOWN', 'BLOCKED')
  ),
  previous_state TEXT CHECK (
    previous_state IN ('SCAN', 'WATCH', 'STALK', 'ARMED', 'EXECUTE', 'MANAGE', 'COOLDOWN', 'BLOCKED')
    OR previous_state IS NULL
  ),
  state_since TEXT NOT NULL,
  brain_score REAL NOT NULL CHECK (brain_score BETWEEN 0.0 AND 100.0),
  state_confidence REAL NOT NULL CHECK (state_confidence BETWEEN 0.0 AND 1.0),
  last_transition_reason TEXT NOT NULL,
  last_event TEXT NOT NULL,
  gates_json TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  revision INTEGER NOT NULL CHECK (revision >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (workspace_id, symbol, playbook, direction)
);

CREATE INDEX IF NOT EXISTS idx_setup_state_workspace_updated
  ON setup_state(workspace_id, updated_at_ms DESC);

CREATE TABLE IF NOT EXISTS setup_transitions (
  transition_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  transition_id TEXT NOT NULL UNIQUE,
  workspace_id TEXT NOT NULL,
  symbol TEXT NOT NULL,
  playbook TEXT NOT NULL,
  direction TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'scan_tick',
      'data_refresh',
      'regime_change',
      'flow_update',
      'setup_formed',
      'setup_invalidated',
      'trigger_hit',
      'trigger_missed',
      'alert_fired',
      'order_prepared',
      'order_submitted',
      'entry_filled',
      'partial_fill',
      'position_closed',
      'stop_hit',
      'target_hit',
      'manual_override'
    )
  ),
  old_state TEXT NOT NULL,
  new_state TEXT NOT NULL,
  transition_reason TEXT NOT NULL,
  decision_confidence REAL NOT NULL CHECK (decision_confidence BETWEEN 0.0 AND 1.0),
  changed INTEGER NOT NULL CHECK (changed IN (0, 1)),
  emitted_at TEXT NOT NULL,
  emitted_at_ms INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  FOREIGN KEY (workspace_id, symbol, playbook, direction)
    REFERENCES setup_state(workspace_id, symbol, playbook, direction)
);

CREATE TRIGGER IF NOT EXISTS trg_setup_transitions_no_update
BEFORE UPDATE ON setup_transitions
BEGIN
  SELECT RAISE(FAIL, 'setup_transitions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_setup_transitions_no_delete
BEFORE DELETE ON setup_transitions
BEGIN
  SELECT RAISE(FAIL, 'setup_transitions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_setup_transitions_key_emitted
  ON setup_transitions(workspace_id, symbol, playbook, direction, emitted_at_ms DESC, transition_seq DESC);
CREATE INDEX IF NOT EXISTS idx_setup_transitions_symbol_emitted
  ON setup_transitions(workspace_id, symbol, emitted_at_ms DESC, transition_seq DESC);
";

const STATE_COLUMNS: &str = "workspace_id, symbol, playbook, direction, state, previous_state,
    state_since, brain_score, state_confidence, last_transition_reason, last_event,
    gates_json, snapshot_json, metadata_json, revision, created_at, updated_at";

const TRANSITION_COLUMNS: &str = "transition_seq, transition_id, workspace_id, symbol, playbook,
    direction, event_type, old_state, new_state, transition_reason, decision_confidence,
    changed, emitted_at, recorded_at, snapshot_json";

pub struct SqliteDecisionStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub contract_version: String,
    pub state_rows: usize,
    pub transition_rows: usize,
    pub latest_transition_seq: i64,
    pub states_without_transitions: usize,
    pub state_drift_keys: usize,
    pub revision_gap_keys: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerIssue {
    pub code: String,
    pub severity: LedgerIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: LedgerStatus,
    pub issues: Vec<LedgerIssue>,
    pub drift_sample: Vec<LedgerDriftKey>,
}

/// A key whose current row and transition history disagree.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerDriftKey {
    pub key: SetupKey,
    pub state: SetupState,
    pub revision: i64,
    pub latest_transition_state: Option<SetupState>,
    pub transition_count: i64,
}

impl LedgerDriftKey {
    #[must_use]
    pub fn missing_transitions(&self) -> bool {
        self.transition_count == 0
    }

    #[must_use]
    pub fn state_drift(&self) -> bool {
        self.latest_transition_state
            .is_some_and(|latest| latest != self.state)
    }

    #[must_use]
    pub fn revision_gap(&self) -> bool {
        self.revision != self.transition_count
    }
}

impl SqliteDecisionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        ensure_existing_schema_compatible(&self.conn)?;

        self.conn
            .execute_batch(SCHEMA_SETUP_V1)
            .context("failed to apply setup lifecycle schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SETUP_MIGRATION_VERSION, now],
            )
            .context("failed to register setup lifecycle schema migration")?;
        if applied > 0 {
            tracing::info!(
                version = SETUP_MIGRATION_VERSION,
                "applied setup lifecycle schema"
            );
        }

        Ok(())
    }

    pub fn load_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>> {
        let query = format!(
            "SELECT {STATE_COLUMNS}
             FROM setup_state
             WHERE workspace_id = ?1 AND symbol = ?2 AND playbook = ?3 AND direction = ?4"
        );

        self.conn
            .query_row(
                &query,
                params![
                    key.workspace_id,
                    key.symbol,
                    key.playbook,
                    key.direction.as_str()
                ],
                parse_state_row,
            )
            .optional()
            .with_context(|| format!("failed to load setup state for {key}"))
    }

    pub fn list_workspace_states(
        &self,
        workspace_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StateMachineRecord>> {
        let limit = workspace_list_limit(limit)?;
        let query = format!(
            "SELECT {STATE_COLUMNS}
             FROM setup_state
             WHERE workspace_id = ?1
             ORDER BY updated_at_ms DESC, symbol ASC, playbook ASC, direction ASC
             LIMIT ?2"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![workspace_id, sql_limit(limit)?], parse_state_row)?;
        collect_rows(rows)
    }

    pub fn query_transitions(&self, query: &TransitionQuery) -> Result<Vec<TransitionRecord>> {
        let limit = query.effective_limit()?;
        let sql = format!(
            "SELECT {TRANSITION_COLUMNS}
             FROM setup_transitions
             WHERE workspace_id = ?1
               AND symbol = ?2
               AND (?3 IS NULL OR playbook = ?3)
               AND (?4 IS NULL OR direction = ?4)
             ORDER BY emitted_at_ms DESC, transition_seq DESC
             LIMIT ?5"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                query.workspace_id,
                query.symbol,
                query.playbook,
                query.direction.map(Direction::as_str),
                sql_limit(limit)?
            ],
            parse_transition_row,
        )?;
        collect_rows(rows)
    }

    /// Upserts the current row and appends the transition in one
    /// `IMMEDIATE` transaction. The guard is checked inside the transaction.
    ///
    /// The first write for a key always appends, so every row has history.
    pub fn record_entry(
        &mut self,
        entry: &DecisionEntry,
        guard: WriteGuard,
    ) -> Result<RecordReceipt> {
        entry
            .key
            .validate()
            .map_err(|err| LedgerError::InvalidQuery(err.to_string()))?;

        let now = now_utc();
        let now_raw = format_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;
        let key = &entry.key;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start setup write transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT revision FROM setup_state
                 WHERE workspace_id = ?1 AND symbol = ?2 AND playbook = ?3 AND direction = ?4",
                params![
                    key.workspace_id,
                    key.symbol,
                    key.playbook,
                    key.direction.as_str()
                ],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read current setup revision")?;

        if let Err(conflict) = guard.check(key, existing) {
            tracing::debug!(key = %key, error = %conflict, "rejected guarded setup write");
            return Err(conflict.into());
        }

        let revision = existing.map_or(1, |value| value + 1);
        let record = entry.to_record(revision, now);
        let updated_at = format_rfc3339(record.updated_at).map_err(|err| anyhow!(err.to_string()))?;

        tx.execute(
            "INSERT INTO setup_state(
                workspace_id, symbol, playbook, direction, state, previous_state,
                state_since, brain_score, state_confidence, last_transition_reason, last_event,
                gates_json, snapshot_json, metadata_json, revision,
                created_at, updated_at, updated_at_ms
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15,
                ?16, ?17, ?18
             )
             ON CONFLICT(workspace_id, symbol, playbook, direction) DO UPDATE SET
               state = excluded.state,
               previous_state = excluded.previous_state,
               state_since = excluded.state_since,
               brain_score = excluded.brain_score,
               state_confidence = excluded.state_confidence,
               last_transition_reason = excluded.last_transition_reason,
               last_event = excluded.last_event,
               gates_json = excluded.gates_json,
               snapshot_json = excluded.snapshot_json,
               metadata_json = excluded.metadata_json,
               revision = excluded.revision,
               updated_at = excluded.updated_at,
               updated_at_ms = excluded.updated_at_ms",
            params![
                key.workspace_id,
                key.symbol,
                key.playbook,
                key.direction.as_str(),
                record.state.as_str(),
                record.previous_state.map(SetupState::as_str),
                record.state_since,
                record.brain_score,
                record.state_confidence,
                record.last_transition_reason,
                record.last_event.as_str(),
                serde_json::to_string(&record.gates).context("failed to serialize gates")?,
                serde_json::to_string(&record.state_machine_snapshot)
                    .context("failed to serialize state machine snapshot")?,
                serde_json::to_string(&record.metadata).context("failed to serialize metadata")?,
                revision,
                now_raw,
                updated_at,
                unix_millis(record.updated_at),
            ],
        )
        .context("failed to upsert setup state")?;

        let transition_seq = if entry.append_transition || existing.is_none() {
            let transition = entry.to_transition(0, now);
            tx.execute(
                "INSERT INTO setup_transitions(
                    transition_id, workspace_id, symbol, playbook, direction,
                    event_type, old_state, new_state, transition_reason, decision_confidence,
                    changed, emitted_at, emitted_at_ms, recorded_at, snapshot_json
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15
                 )",
                params![
                    transition.transition_id.to_string(),
                    key.workspace_id,
                    key.symbol,
                    key.playbook,
                    key.direction.as_str(),
                    transition.event_type.as_str(),
                    transition.old_state.as_str(),
                    transition.new_state.as_str(),
                    transition.transition_reason,
                    transition.decision_confidence,
                    bool_to_sql(transition.changed),
                    format_rfc3339(transition.emitted_at).map_err(|err| anyhow!(err.to_string()))?,
                    unix_millis(transition.emitted_at),
                    now_raw,
                    serde_json::to_string(&transition.snapshot)
                        .context("failed to serialize transition snapshot")?,
                ],
            )
            .context("failed to append setup transition")?;
            Some(tx.last_insert_rowid())
        } else {
            None
        };

        tx.commit()
            .context("failed to commit setup write transaction")?;

        Ok(RecordReceipt {
            revision,
            transition_seq,
            created: existing.is_none(),
        })
    }

    pub fn ledger_status(&self) -> Result<LedgerStatus> {
        let state_rows = self.count_rows("setup_state")?;
        let transition_rows = self.count_rows("setup_transitions")?;
        let latest_transition_seq: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(transition_seq), 0) FROM setup_transitions",
                [],
                |row| row.get(0),
            )
            .context("failed to read latest transition_seq")?;

        let drift = self.ledger_drift_keys(None)?;

        Ok(LedgerStatus {
            contract_version: "ledger_status.v1".to_string(),
            state_rows,
            transition_rows,
            latest_transition_seq,
            states_without_transitions: drift
                .iter()
                .filter(|item| item.missing_transitions())
                .count(),
            state_drift_keys: drift.iter().filter(|item| item.state_drift()).count(),
            revision_gap_keys: drift
                .iter()
                .filter(|item| !item.missing_transitions() && item.revision_gap())
                .count(),
        })
    }

    pub fn ledger_check(&self) -> Result<LedgerCheck> {
        let status = self.ledger_status()?;
        let mut issues = Vec::new();

        if status.states_without_transitions > 0 {
            issues.push(LedgerIssue {
                code: "state_without_transitions".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "torn write detected: {} current rows have no transition history",
                    status.states_without_transitions
                ),
            });
        }

        if status.state_drift_keys > 0 {
            issues.push(LedgerIssue {
                code: "state_drift".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "current state disagrees with latest transition for {} keys",
                    status.state_drift_keys
                ),
            });
        }

        if status.revision_gap_keys > 0 {
            issues.push(LedgerIssue {
                code: "revision_gap".to_string(),
                severity: LedgerIssueSeverity::Warning,
                message: format!(
                    "revision differs from transition count for {} keys (expected when unchanged evaluations are not appended)",
                    status.revision_gap_keys
                ),
            });
        }

        let drift_sample = self.ledger_drift_keys(Some(DRIFT_SAMPLE_LIMIT))?;
        let healthy = !issues
            .iter()
            .any(|item| item.severity == LedgerIssueSeverity::Error);

        Ok(LedgerCheck {
            contract_version: "ledger_check.v1".to_string(),
            healthy,
            status,
            issues,
            drift_sample,
        })
    }

    pub fn ledger_drift_keys(&self, limit: Option<usize>) -> Result<Vec<LedgerDriftKey>> {
        let mut query = "SELECT
                live.workspace_id,
                live.symbol,
                live.playbook,
                live.direction,
                live.state,
                live.revision,
                latest.new_state,
                COALESCE(history.transition_count, 0)
             FROM setup_state live
             LEFT JOIN (
                SELECT workspace_id, symbol, playbook, direction,
                       COUNT(*) AS transition_count,
                       MAX(transition_seq) AS max_seq
                FROM setup_transitions
                GROUP BY workspace_id, symbol, playbook, direction
             ) history
               ON history.workspace_id = live.workspace_id
              AND history.symbol = live.symbol
              AND history.playbook = live.playbook
              AND history.direction = live.direction
             LEFT JOIN setup_transitions latest
               ON latest.transition_seq = history.max_seq
             WHERE history.max_seq IS NULL
                OR latest.new_state != live.state
                OR live.revision != history.transition_count
             ORDER BY live.workspace_id ASC, live.symbol ASC, live.playbook ASC, live.direction ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            let latest_raw: Option<String> = row.get(6)?;
            Ok(LedgerDriftKey {
                key: parse_key_columns(row, 0)?,
                state: parse_state_column(row, 4)?,
                revision: row.get(5)?,
                latest_transition_state: latest_raw
                    .as_deref()
                    .map(|raw| parse_state_value(6, raw))
                    .transpose()?,
                transition_count: row.get(7)?,
            })
        })?;

        collect_rows(rows)
    }

    fn count_rows(&self, table_name: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table_name}"))?;
        usize::try_from(count).with_context(|| format!("invalid row count for {table_name}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DecisionLedger for SqliteDecisionStore {
    fn get_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError> {
        self.load_latest(key).map_err(to_ledger_error)
    }

    fn list_latest_across_workspace(
        &self,
        workspace_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StateMachineRecord>, LedgerError> {
        self.list_workspace_states(workspace_id, limit)
            .map_err(to_ledger_error)
    }

    fn list_transitions(
        &self,
        query: &TransitionQuery,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        self.query_transitions(query).map_err(to_ledger_error)
    }

    fn record(
        &mut self,
        entry: &DecisionEntry,
        guard: WriteGuard,
    ) -> Result<RecordReceipt, LedgerError> {
        self.record_entry(entry, guard).map_err(to_ledger_error)
    }
}

/// Maps store errors onto the ledger contract: typed ledger errors pass
/// through, undecodable rows are corruption, everything else is an outage.
#[allow(clippy::needless_pass_by_value)]
fn to_ledger_error(err: anyhow::Error) -> LedgerError {
    if let Some(ledger_err) = err.downcast_ref::<LedgerError>() {
        return ledger_err.clone();
    }

    let corrupt = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..))
        )
    });

    if corrupt {
        LedgerError::Corrupt(format!("{err:#}"))
    } else {
        LedgerError::Unavailable(format!("{err:#}"))
    }
}

fn parse_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateMachineRecord> {
    let previous_raw: Option<String> = row.get(5)?;
    let last_event_raw: String = row.get(10)?;

    Ok(StateMachineRecord {
        key: parse_key_columns(row, 0)?,
        state: parse_state_column(row, 4)?,
        previous_state: previous_raw
            .as_deref()
            .map(|raw| parse_state_value(5, raw))
            .transpose()?,
        state_since: row.get(6)?,
        brain_score: row.get(7)?,
        state_confidence: row.get(8)?,
        last_transition_reason: row.get(9)?,
        last_event: EventKind::parse(&last_event_raw).ok_or_else(|| {
            invalid_data(10, Type::Text, format!("invalid last_event: {last_event_raw}"))
        })?,
        gates: parse_json_column(row, 11)?,
        state_machine_snapshot: parse_json_column(row, 12)?,
        metadata: parse_json_column(row, 13)?,
        revision: row.get(14)?,
        created_at: parse_time_column(row, 15)?,
        updated_at: parse_time_column(row, 16)?,
    })
}

fn parse_transition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransitionRecord> {
    let transition_id_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(6)?;
    let changed: i64 = row.get(11)?;

    Ok(TransitionRecord {
        transition_seq: row.get(0)?,
        transition_id: Ulid::from_string(&transition_id_raw).map_err(|_| {
            invalid_data(1, Type::Text, format!("invalid ULID: {transition_id_raw}"))
        })?,
        key: parse_key_columns(row, 2)?,
        event_type: EventKind::parse(&event_type_raw).ok_or_else(|| {
            invalid_data(6, Type::Text, format!("invalid event_type: {event_type_raw}"))
        })?,
        old_state: parse_state_column(row, 7)?,
        new_state: parse_state_column(row, 8)?,
        transition_reason: row.get(9)?,
        decision_confidence: row.get(10)?,
        changed: changed != 0,
        emitted_at: parse_time_column(row, 12)?,
        recorded_at: parse_time_column(row, 13)?,
        snapshot: parse_json_column(row, 14)?,
    })
}

/// Reads `workspace_id, symbol, playbook, direction` starting at `first`.
fn parse_key_columns(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<SetupKey> {
    let direction_raw: String = row.get(first + 3)?;
    let direction = Direction::parse(&direction_raw).ok_or_else(|| {
        invalid_data(
            first + 3,
            Type::Text,
            format!("invalid direction: {direction_raw}"),
        )
    })?;

    Ok(SetupKey {
        workspace_id: row.get(first)?,
        symbol: row.get(first + 1)?,
        playbook: row.get(first + 2)?,
        direction,
    })
}

fn parse_state_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<SetupState> {
    let raw: String = row.get(index)?;
    parse_state_value(index, &raw)
}

fn parse_state_value(index: usize, raw: &str) -> rusqlite::Result<SetupState> {
    SetupState::parse(raw)
        .ok_or_else(|| invalid_data(index, Type::Text, format!("invalid state: {raw}")))
}

fn parse_time_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_data(index, Type::Text, err.to_string()))
}

fn parse_json_column<T: DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| {
        invalid_data(
            index,
            Type::Text,
            format!("invalid JSON in column {index}: {err}"),
        )
    })
}

fn invalid_data(index: usize, value_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        value_type,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_limit(limit: usize) -> Result<i64> {
    i64::try_from(limit).with_context(|| format!("limit out of range: {limit}"))
}

/// A database created by an older build must still carry the key columns
/// this schema indexes and joins on.
fn ensure_existing_schema_compatible(conn: &Connection) -> Result<()> {
    const KEY_COLUMNS: [&str; 4] = ["workspace_id", "symbol", "playbook", "direction"];

    if table_exists(conn, "setup_state")? {
        ensure_table_has_columns(conn, "setup_state", &KEY_COLUMNS)?;
        ensure_table_has_columns(conn, "setup_state", &["state", "revision", "updated_at_ms"])?;
    }

    if table_exists(conn, "setup_transitions")? {
        ensure_table_has_columns(conn, "setup_transitions", &KEY_COLUMNS)?;
        ensure_table_has_columns(
            conn,
            "setup_transitions",
            &["transition_seq", "new_state", "emitted_at_ms"],
        )?;
    }

    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "setup lifecycle schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use setup_lifecycle_core::{
        evaluate, evaluate_and_record, EngineSettings, EvaluationRequest, PersistenceStatus,
        MAX_TRANSITION_LIST_LIMIT,
    };

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteDecisionStore {
        let store = must(SqliteDecisionStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_key(symbol: &str) -> SetupKey {
        must_ok(SetupKey::new("ws-1", symbol, "breakout", Direction::Long))
    }

    fn fixture_request_json() -> Value {
        json!({
            "nowIso": "2026-02-07T12:00:00Z",
            "currentState": "SCAN",
            "stateSinceIso": "2026-02-07T11:00:00Z",
            "playbook": "breakout",
            "direction": "long",
            "event": "scan_tick",
            "positionOpen": false,
            "trigger": {
                "definition": "close above 101.50",
                "pass": false,
                "current": 100.75
            },
            "context": {
                "brainScore": 82.0,
                "dataHealthScore": 0.97,
                "dataHealthPass": true,
                "regimeValue": "trend_up",
                "regimePass": true,
                "institutionalFilterPass": true,
                "institutionalFilterScore": 0.81,
                "capitalFlowPass": true,
                "flowBias": "bullish",
                "flowStrength": 0.72,
                "flowStatePass": true,
                "flowState": "accumulation",
                "timingQuality": 0.66,
                "setupQualityPass": true,
                "invalidateLevel": 98.2,
                "riskGovernorPass": true,
                "permission": "ALLOW",
                "sizeMultiplier": 1.0,
                "decisionConfidence": 0.74
            }
        })
    }

    fn fixture_request(now_iso: &str) -> EvaluationRequest {
        let mut request = must_ok(EvaluationRequest::from_json(&fixture_request_json()));
        request.now_iso = now_iso.to_string();
        request
    }

    fn fixture_entry(symbol: &str, now_iso: &str) -> DecisionEntry {
        let request = fixture_request(now_iso);
        let output = must_ok(evaluate(&request, &EngineSettings::v1()));
        must_ok(DecisionEntry::from_evaluation(
            fixture_key(symbol),
            &request,
            output,
        ))
    }

    fn minute_timestamp(minute: u32) -> String {
        format!("2026-02-07T{:02}:{:02}:00Z", 12 + minute / 60, minute % 60)
    }

    #[test]
    fn migrate_is_idempotent_and_registers_version() {
        let store = fixture_store();
        must(store.migrate());

        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![SETUP_MIGRATION_VERSION],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn migrate_rejects_incompatible_existing_table() {
        let store = must(SqliteDecisionStore::open(Path::new(":memory:")));
        if let Err(err) = store
            .connection()
            .execute_batch("CREATE TABLE setup_state (workspace_id TEXT, symbol TEXT);")
        {
            panic!("test failure: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected incompatible schema to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("missing column setup_state.playbook"));
    }

    #[test]
    fn upsert_then_get_latest_round_trips_state() {
        let mut store = fixture_store();
        let entry = fixture_entry("AAPL", "2026-02-07T12:00:00Z");

        let receipt = must_ok(store.upsert(&entry));
        assert!(receipt.created);
        assert_eq!(receipt.revision, 1);

        let row = match must_ok(store.get_latest(&entry.key)) {
            Some(row) => row,
            None => panic!("expected current-state row"),
        };
        let snapshot = &entry.output.state_machine;
        assert_eq!(row.state, snapshot.state);
        assert_eq!(row.previous_state, snapshot.previous_state);
        assert_eq!(row.state_since, snapshot.state_since);
        assert_eq!(row.state_machine_snapshot, entry.output);
        assert_eq!(row.gates, snapshot.gates);
        assert_eq!(row.last_event, EventKind::ScanTick);
        assert_eq!(row.brain_score, 82.0);
        assert_eq!(row.metadata["regime"], "trend_up");
    }

    #[test]
    fn get_latest_for_unknown_key_is_none() {
        let store = fixture_store();
        assert!(must_ok(store.get_latest(&fixture_key("NVDA"))).is_none());
    }

    #[test]
    fn identical_replay_converges_on_same_row_and_keeps_both_transitions() {
        let mut store = fixture_store();
        let entry = fixture_entry("AAPL", "2026-02-07T12:00:00Z");

        let _ = must_ok(store.upsert(&entry));
        let first = must_ok(store.get_latest(&entry.key));
        let second_receipt = must_ok(store.upsert(&entry));
        let second = must_ok(store.get_latest(&entry.key));

        let (first, second) = match (first, second) {
            (Some(first), Some(second)) => (first, second),
            _ => panic!("expected current-state rows"),
        };
        assert_eq!(second_receipt.revision, 2);
        assert_eq!(first.state, second.state);
        assert_eq!(first.state_since, second.state_since);
        assert_eq!(first.state_machine_snapshot, second.state_machine_snapshot);
        assert_eq!(first.created_at, second.created_at);

        let transitions =
            must_ok(store.list_transitions(&TransitionQuery::for_key(&entry.key, None)));
        assert_eq!(transitions.len(), 2);
    }

    #[test]
    fn transitions_are_listed_descending_and_capped() {
        let mut store = fixture_store();
        for minute in 0..205_u32 {
            let entry = fixture_entry("AAPL", &minute_timestamp(minute));
            let _ = must_ok(store.upsert(&entry));
        }

        let query = TransitionQuery::for_key(&fixture_key("AAPL"), Some(1_000));
        let rows = must_ok(store.list_transitions(&query));
        assert_eq!(rows.len(), MAX_TRANSITION_LIST_LIMIT);
        assert!(rows
            .windows(2)
            .all(|pair| pair[0].emitted_at >= pair[1].emitted_at));
        assert_eq!(rows[0].emitted_at, fixture_entry("AAPL", &minute_timestamp(204)).evaluated_at);

        let limited = must_ok(store.list_transitions(&TransitionQuery::for_key(
            &fixture_key("AAPL"),
            Some(3),
        )));
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn transition_filters_narrow_by_playbook_and_direction() {
        let mut store = fixture_store();
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:00:00Z")));

        let mut other = fixture_entry("AAPL", "2026-02-07T12:01:00Z");
        other.key = must_ok(SetupKey::new("ws-1", "AAPL", "pullback", Direction::Long));
        let _ = must_ok(store.upsert(&other));

        let mut query = TransitionQuery {
            workspace_id: "ws-1".to_string(),
            symbol: "AAPL".to_string(),
            playbook: None,
            direction: None,
            limit: None,
        };
        assert_eq!(must_ok(store.list_transitions(&query)).len(), 2);

        query.playbook = Some("pullback".to_string());
        let rows = must_ok(store.list_transitions(&query));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.playbook, "pullback");

        query.playbook = None;
        query.direction = Some(Direction::Short);
        assert!(must_ok(store.list_transitions(&query)).is_empty());
    }

    #[test]
    fn workspace_listing_is_most_recent_first() {
        let mut store = fixture_store();
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:00:00Z")));
        let _ = must_ok(store.upsert(&fixture_entry("MSFT", "2026-02-07T12:10:00Z")));
        let _ = must_ok(store.upsert(&fixture_entry("TSLA", "2026-02-07T12:05:00Z")));

        let rows = must_ok(store.list_latest_across_workspace("ws-1", Some(2)));
        assert_eq!(
            rows.iter()
                .map(|row| row.key.symbol.as_str())
                .collect::<Vec<_>>(),
            vec!["MSFT", "TSLA"]
        );
        assert!(matches!(
            store.list_latest_across_workspace("ws-1", Some(0)),
            Err(LedgerError::InvalidQuery(_))
        ));
    }

    #[test]
    fn transitions_table_rejects_update_and_delete() {
        let mut store = fixture_store();
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:00:00Z")));

        let update = store.connection().execute(
            "UPDATE setup_transitions SET transition_reason = 'rewritten'",
            [],
        );
        assert!(matches!(update, Err(err) if err.to_string().contains("append-only")));

        let delete = store
            .connection()
            .execute("DELETE FROM setup_transitions", []);
        assert!(matches!(delete, Err(err) if err.to_string().contains("append-only")));
    }

    #[test]
    fn stale_revision_guard_is_a_conflict_and_writes_nothing() {
        let mut store = fixture_store();
        let entry = fixture_entry("AAPL", "2026-02-07T12:00:00Z");
        let _ = must_ok(store.upsert(&entry));

        let result = store.record(&entry, WriteGuard::Revision(7));
        assert_eq!(
            result,
            Err(LedgerError::Conflict {
                key: "ws-1:AAPL:breakout:long".to_string(),
                expected: Some(7),
                found: Some(1),
            })
        );
        assert!(matches!(
            store.record(&entry, WriteGuard::Absent),
            Err(LedgerError::Conflict { .. })
        ));

        let status = must(store.ledger_status());
        assert_eq!(status.transition_rows, 1);
        let row = match must_ok(store.get_latest(&entry.key)) {
            Some(row) => row,
            None => panic!("expected current-state row"),
        };
        assert_eq!(row.revision, 1);
    }

    #[test]
    fn unchanged_evaluations_skip_append_only_after_first_write() {
        let mut store = fixture_store();
        let settings = EngineSettings {
            append_unchanged_transitions: false,
            ..EngineSettings::v1()
        };
        let mut entry = fixture_entry("AAPL", "2026-02-07T12:00:00Z");
        entry.output.transition.changed = false;
        let entry = entry.with_append_policy(&settings);
        assert!(!entry.append_transition);

        let first = must_ok(store.upsert(&entry));
        assert!(first.transition_seq.is_some());
        let second = must_ok(store.upsert(&entry));
        assert_eq!(second.transition_seq, None);

        let check = must(store.ledger_check());
        assert!(check.healthy);
        assert_eq!(check.status.revision_gap_keys, 1);
        assert_eq!(check.issues.len(), 1);
        assert_eq!(check.issues[0].severity, LedgerIssueSeverity::Warning);
    }

    #[test]
    fn ledger_check_is_healthy_after_normal_writes() {
        let mut store = fixture_store();
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:00:00Z")));
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:01:00Z")));

        let check = must(store.ledger_check());
        assert!(check.healthy);
        assert!(check.issues.is_empty());
        assert_eq!(check.contract_version, "ledger_check.v1");
        assert_eq!(check.status.state_rows, 1);
        assert_eq!(check.status.transition_rows, 2);
        assert_eq!(check.status.latest_transition_seq, 2);
    }

    #[test]
    fn ledger_check_detects_torn_writes() {
        let mut store = fixture_store();
        let _ = must_ok(store.upsert(&fixture_entry("AAPL", "2026-02-07T12:00:00Z")));

        if let Err(err) = store.connection().execute(
            "UPDATE setup_state SET state = 'ARMED' WHERE symbol = 'AAPL'",
            [],
        ) {
            panic!("test failure: {err}");
        }
        if let Err(err) = store.connection().execute(
            "INSERT INTO setup_state(
                workspace_id, symbol, playbook, direction, state, previous_state,
                state_since, brain_score, state_confidence, last_transition_reason, last_event,
                gates_json, snapshot_json, metadata_json, revision,
                created_at, updated_at, updated_at_ms
             )
             SELECT workspace_id, 'MSFT', playbook, direction, state, previous_state,
                state_since, brain_score, state_confidence, last_transition_reason, last_event,
                gates_json, snapshot_json, metadata_json, revision,
                created_at, updated_at, updated_at_ms
             FROM setup_state WHERE symbol = 'AAPL'",
            [],
        ) {
            panic!("test failure: {err}");
        }

        let check = must(store.ledger_check());
        assert!(!check.healthy);
        assert_eq!(check.status.state_drift_keys, 1);
        assert_eq!(check.status.states_without_transitions, 1);
        let codes = check
            .issues
            .iter()
            .map(|issue| issue.code.as_str())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["state_without_transitions", "state_drift"]);
        assert_eq!(check.drift_sample.len(), 2);
        assert_eq!(
            check.drift_sample[0].latest_transition_state,
            Some(SetupState::Watch)
        );
    }

    #[test]
    fn corrupt_snapshot_surfaces_as_corrupt_ledger_error() {
        let mut store = fixture_store();
        let entry = fixture_entry("AAPL", "2026-02-07T12:00:00Z");
        let _ = must_ok(store.upsert(&entry));
        if let Err(err) = store
            .connection()
            .execute("UPDATE setup_state SET snapshot_json = '{'", [])
        {
            panic!("test failure: {err}");
        }

        assert!(matches!(
            store.get_latest(&entry.key),
            Err(LedgerError::Corrupt(_))
        ));
    }

    #[test]
    fn evaluate_and_record_walks_lifecycle_through_sqlite() {
        let mut store = fixture_store();
        let key = fixture_key("AAPL");
        let settings = EngineSettings::v1();

        let mut states = Vec::new();
        for minute in [0, 5, 10] {
            let recorded = must_ok(evaluate_and_record(
                &mut store,
                &key,
                &fixture_request(&minute_timestamp(minute)),
                &settings,
            ));
            assert!(matches!(
                recorded.persistence,
                PersistenceStatus::Persisted { .. }
            ));
            states.push(recorded.output.state_machine.state);
        }
        assert_eq!(
            states,
            vec![SetupState::Watch, SetupState::Stalk, SetupState::Armed]
        );

        let transitions = must_ok(store.list_transitions(&TransitionQuery::for_key(&key, None)));
        assert_eq!(
            transitions
                .iter()
                .map(|row| row.new_state)
                .collect::<Vec<_>>(),
            vec![SetupState::Armed, SetupState::Stalk, SetupState::Watch]
        );
        assert!(must(store.ledger_check()).healthy);
    }

    /// Serves one snapshot read before the competing writer committed, then
    /// reads through to the store.
    struct StaleReadStore<'a> {
        inner: &'a mut SqliteDecisionStore,
        stale: std::cell::RefCell<Option<StateMachineRecord>>,
    }

    impl DecisionLedger for StaleReadStore<'_> {
        fn get_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError> {
            match self.stale.borrow_mut().take() {
                Some(record) => Ok(Some(record)),
                None => self.inner.get_latest(key),
            }
        }

        fn list_latest_across_workspace(
            &self,
            workspace_id: &str,
            limit: Option<usize>,
        ) -> Result<Vec<StateMachineRecord>, LedgerError> {
            self.inner.list_latest_across_workspace(workspace_id, limit)
        }

        fn list_transitions(
            &self,
            query: &TransitionQuery,
        ) -> Result<Vec<TransitionRecord>, LedgerError> {
            self.inner.list_transitions(query)
        }

        fn record(
            &mut self,
            entry: &DecisionEntry,
            guard: WriteGuard,
        ) -> Result<RecordReceipt, LedgerError> {
            self.inner.record(entry, guard)
        }
    }

    #[test]
    fn concurrent_handles_resolve_last_writer_wins_and_keep_both_transitions() {
        let db_path = std::env::temp_dir().join(format!("setup-race-{}.sqlite3", Ulid::new()));
        let mut first = must(SqliteDecisionStore::open(&db_path));
        must(first.migrate());
        let mut second = must(SqliteDecisionStore::open(&db_path));
        let key = fixture_key("AAPL");
        let settings = EngineSettings::v1();

        must_ok(evaluate_and_record(
            &mut first,
            &key,
            &fixture_request(&minute_timestamp(0)),
            &settings,
        ));

        let first_view = match must_ok(first.get_latest(&key)) {
            Some(row) => row,
            None => panic!("expected seeded row"),
        };
        let second_view = match must_ok(second.get_latest(&key)) {
            Some(row) => row,
            None => panic!("expected seeded row on second handle"),
        };
        assert_eq!(first_view.revision, 1);
        assert_eq!(second_view.revision, 1);

        let first_write = must_ok(evaluate_and_record(
            &mut first,
            &key,
            &fixture_request(&minute_timestamp(5)),
            &settings,
        ));
        match first_write.persistence {
            PersistenceStatus::Persisted {
                revision, attempts, ..
            } => {
                assert_eq!(revision, 2);
                assert_eq!(attempts, 1);
            }
            PersistenceStatus::Failed { warning } => panic!("first writer failed: {warning}"),
        }

        let mut racing = StaleReadStore {
            inner: &mut second,
            stale: std::cell::RefCell::new(Some(second_view)),
        };
        let second_write = must_ok(evaluate_and_record(
            &mut racing,
            &key,
            &fixture_request(&minute_timestamp(6)),
            &settings,
        ));
        let second_revision = match second_write.persistence {
            PersistenceStatus::Persisted {
                revision, attempts, ..
            } => {
                assert!(attempts >= 2, "expected a conflict retry, got {attempts}");
                revision
            }
            PersistenceStatus::Failed { warning } => panic!("second writer failed: {warning}"),
        };
        assert_eq!(second_revision, 3);

        let row = match must_ok(first.get_latest(&key)) {
            Some(row) => row,
            None => panic!("expected current row"),
        };
        assert_eq!(row.revision, second_revision);
        assert_eq!(row.state, second_write.output.state_machine.state);
        assert_eq!(row.state, SetupState::Armed);
        assert_eq!(row.previous_state, Some(SetupState::Stalk));
        assert_eq!(row.updated_at, must_ok(parse_rfc3339_utc(&minute_timestamp(6))));

        let transitions = must_ok(first.list_transitions(&TransitionQuery::for_key(&key, None)));
        let emitted = transitions
            .iter()
            .map(|row| must_ok(format_rfc3339(row.emitted_at)))
            .collect::<Vec<_>>();
        assert_eq!(
            emitted,
            vec![minute_timestamp(6), minute_timestamp(5), minute_timestamp(0)]
        );
        assert_eq!(
            transitions
                .iter()
                .map(|row| row.new_state)
                .collect::<Vec<_>>(),
            vec![SetupState::Armed, SetupState::Stalk, SetupState::Watch]
        );
        assert!(must(first.ledger_check()).healthy);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_store_round_trip_tracks_last_evaluation(
            steps in prop::collection::vec((0.0f64..=100.0, any::<bool>(), any::<bool>()), 1..30),
            limit in 1usize..40,
        ) {
            let mut store = fixture_store();
            let key = fixture_key("AAPL");
            let settings = EngineSettings::v1();

            let mut last_output = None;
            for (index, (brain_score, data_health_pass, trigger_pass)) in steps.iter().copied().enumerate() {
                let mut request = fixture_request(&minute_timestamp(u32::try_from(index).unwrap_or(0)));
                request.context.brain_score = brain_score;
                request.context.data_health_pass = data_health_pass;
                request.trigger.pass = trigger_pass;

                let recorded = must_ok(evaluate_and_record(&mut store, &key, &request, &settings));
                last_output = Some(recorded.output);
            }

            let row = match must_ok(store.get_latest(&key)) {
                Some(row) => row,
                None => panic!("expected current-state row"),
            };
            let last_output = match last_output {
                Some(output) => output,
                None => panic!("expected at least one evaluation"),
            };
            prop_assert_eq!(row.state, last_output.state_machine.state);
            prop_assert_eq!(row.previous_state, last_output.state_machine.previous_state);
            prop_assert_eq!(&row.state_since, &last_output.state_machine.state_since);

            let transitions = must_ok(store.list_transitions(&TransitionQuery::for_key(&key, Some(limit))));
            prop_assert_eq!(transitions.len(), steps.len().min(limit));
            prop_assert!(transitions.windows(2).all(|pair| pair[0].transition_seq > pair[1].transition_seq));
            prop_assert_eq!(transitions[0].new_state, row.state);
        }
    }
}
