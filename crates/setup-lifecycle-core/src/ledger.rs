use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::gates::GateSet;
use crate::model::{Direction, EventKind, SetupKey, SetupState};
use crate::request::EvaluationRequest;
use crate::settings::EngineSettings;
use crate::transition::EvaluationOutput;
use crate::{now_utc, parse_rfc3339_utc, EngineError};

pub const DEFAULT_WORKSPACE_LIST_LIMIT: usize = 25;
pub const MAX_WORKSPACE_LIST_LIMIT: usize = 100;
pub const DEFAULT_TRANSITION_LIST_LIMIT: usize = 50;
pub const MAX_TRANSITION_LIST_LIMIT: usize = 200;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict on {key}: expected revision {expected:?}, found {found:?}")]
    Conflict {
        key: String,
        expected: Option<i64>,
        found: Option<i64>,
    },
    #[error("ledger data corrupt: {0}")]
    Corrupt(String),
    #[error("invalid ledger query: {0}")]
    InvalidQuery(String),
}

/// The single mutable row per [`SetupKey`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateMachineRecord {
    pub key: SetupKey,
    pub state: SetupState,
    pub previous_state: Option<SetupState>,
    pub state_since: String,
    pub brain_score: f64,
    pub state_confidence: f64,
    pub last_transition_reason: String,
    pub last_event: EventKind,
    pub gates: GateSet,
    pub state_machine_snapshot: EvaluationOutput,
    pub metadata: Map<String, Value>,
    pub revision: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One immutable row of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub transition_seq: i64,
    pub transition_id: Ulid,
    pub key: SetupKey,
    pub event_type: EventKind,
    pub old_state: SetupState,
    pub new_state: SetupState,
    pub transition_reason: String,
    pub decision_confidence: f64,
    pub changed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub snapshot: EvaluationOutput,
}

/// Everything a ledger needs to persist one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEntry {
    pub key: SetupKey,
    pub event: EventKind,
    pub brain_score: f64,
    pub output: EvaluationOutput,
    pub evaluated_at: OffsetDateTime,
    pub metadata: Map<String, Value>,
    pub append_transition: bool,
}

impl DecisionEntry {
    /// # Errors
    /// Returns [`EngineError::InvalidSignalBundle`] when `nowIso` does not
    /// parse.
    pub fn from_evaluation(
        key: SetupKey,
        request: &EvaluationRequest,
        output: EvaluationOutput,
    ) -> Result<Self, EngineError> {
        let evaluated_at = parse_rfc3339_utc(&request.now_iso)
            .map_err(|err| EngineError::InvalidSignalBundle(format!("nowIso: {err}")))?;

        let ctx = &request.context;
        let mut metadata = Map::new();
        metadata.insert("position_open".to_string(), Value::Bool(request.position_open));
        metadata.insert(
            "permission".to_string(),
            Value::String(ctx.permission.as_str().to_string()),
        );
        metadata.insert(
            "size_multiplier".to_string(),
            serde_json::Number::from_f64(ctx.size_multiplier).map_or(Value::Null, Value::Number),
        );
        metadata.insert(
            "regime".to_string(),
            Value::String(ctx.regime_value.as_str().to_string()),
        );

        Ok(Self {
            key,
            event: request.event,
            brain_score: ctx.brain_score,
            output,
            evaluated_at,
            metadata,
            append_transition: true,
        })
    }

    #[must_use]
    pub fn with_append_policy(mut self, settings: &EngineSettings) -> Self {
        self.append_transition =
            settings.append_unchanged_transitions || self.output.transition.changed;
        self
    }

    /// Builds the current-state row this entry writes.
    #[must_use]
    pub fn to_record(&self, revision: i64, created_at: OffsetDateTime) -> StateMachineRecord {
        let snapshot = &self.output.state_machine;
        StateMachineRecord {
            key: self.key.clone(),
            state: snapshot.state,
            previous_state: snapshot.previous_state,
            state_since: snapshot.state_since.clone(),
            brain_score: self.brain_score,
            state_confidence: snapshot.audit.decision_confidence,
            last_transition_reason: snapshot.audit.transition_reason.clone(),
            last_event: self.event,
            gates: snapshot.gates.clone(),
            state_machine_snapshot: self.output.clone(),
            metadata: self.metadata.clone(),
            revision,
            created_at,
            updated_at: self.evaluated_at,
        }
    }

    /// Builds the audit row this entry appends.
    #[must_use]
    pub fn to_transition(&self, transition_seq: i64, recorded_at: OffsetDateTime) -> TransitionRecord {
        let transition = &self.output.transition;
        TransitionRecord {
            transition_seq,
            transition_id: Ulid::new(),
            key: self.key.clone(),
            event_type: self.event,
            old_state: transition.old_state,
            new_state: transition.new_state,
            transition_reason: transition.reason.clone(),
            decision_confidence: self.output.state_machine.audit.decision_confidence,
            changed: transition.changed,
            emitted_at: self.evaluated_at,
            recorded_at,
            snapshot: self.output.clone(),
        }
    }
}

/// Optimistic check against the current row's revision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteGuard {
    Any,
    Absent,
    Revision(i64),
}

impl WriteGuard {
    /// # Errors
    /// Returns [`LedgerError::Conflict`] when `found` does not satisfy the
    /// guard.
    pub fn check(self, key: &SetupKey, found: Option<i64>) -> Result<(), LedgerError> {
        let expected = match self {
            Self::Any => return Ok(()),
            Self::Absent => None,
            Self::Revision(revision) => Some(revision),
        };

        if expected == found {
            Ok(())
        } else {
            Err(LedgerError::Conflict {
                key: key.to_string(),
                expected,
                found,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordReceipt {
    pub revision: i64,
    pub transition_seq: Option<i64>,
    pub created: bool,
}

/// Filter for transition history reads.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionQuery {
    pub workspace_id: String,
    pub symbol: String,
    pub playbook: Option<String>,
    pub direction: Option<Direction>,
    pub limit: Option<usize>,
}

impl TransitionQuery {
    #[must_use]
    pub fn for_key(key: &SetupKey, limit: Option<usize>) -> Self {
        Self {
            workspace_id: key.workspace_id.clone(),
            symbol: key.symbol.clone(),
            playbook: Some(key.playbook.clone()),
            direction: Some(key.direction),
            limit,
        }
    }

    /// Requested limit clamped to [`MAX_TRANSITION_LIST_LIMIT`].
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidQuery`] for a zero limit.
    pub fn effective_limit(&self) -> Result<usize, LedgerError> {
        clamp_limit(
            self.limit,
            DEFAULT_TRANSITION_LIST_LIMIT,
            MAX_TRANSITION_LIST_LIMIT,
        )
    }

    #[must_use]
    pub fn matches(&self, key: &SetupKey) -> bool {
        key.workspace_id == self.workspace_id
            && key.symbol == self.symbol
            && self.playbook.as_ref().map_or(true, |value| *value == key.playbook)
            && self.direction.map_or(true, |value| value == key.direction)
    }
}

/// Requested workspace listing limit clamped to [`MAX_WORKSPACE_LIST_LIMIT`].
///
/// # Errors
/// Returns [`LedgerError::InvalidQuery`] for a zero limit.
pub fn workspace_list_limit(limit: Option<usize>) -> Result<usize, LedgerError> {
    clamp_limit(limit, DEFAULT_WORKSPACE_LIST_LIMIT, MAX_WORKSPACE_LIST_LIMIT)
}

fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> Result<usize, LedgerError> {
    match limit {
        None => Ok(default),
        Some(0) => Err(LedgerError::InvalidQuery(
            "limit MUST be greater than zero".to_string(),
        )),
        Some(value) => Ok(value.min(max)),
    }
}

/// Storage contract for current-state rows and the transition audit trail.
///
/// `record` writes the current row and, when requested, appends the
/// transition as one unit: either both are visible or neither is. The first
/// write for a key always appends.
pub trait DecisionLedger {
    #[allow(clippy::missing_errors_doc)]
    fn get_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_latest_across_workspace(
        &self,
        workspace_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StateMachineRecord>, LedgerError>;

    /// Most recent first, by `emitted_at` then sequence.
    #[allow(clippy::missing_errors_doc)]
    fn list_transitions(&self, query: &TransitionQuery)
        -> Result<Vec<TransitionRecord>, LedgerError>;

    #[allow(clippy::missing_errors_doc)]
    fn record(
        &mut self,
        entry: &DecisionEntry,
        guard: WriteGuard,
    ) -> Result<RecordReceipt, LedgerError>;

    /// Last-writer-wins write.
    #[allow(clippy::missing_errors_doc)]
    fn upsert(&mut self, entry: &DecisionEntry) -> Result<RecordReceipt, LedgerError> {
        self.record(entry, WriteGuard::Any)
    }
}

/// In-process ledger with the same semantics as the sqlite store.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: BTreeMap<SetupKey, StateMachineRecord>,
    transitions: Vec<TransitionRecord>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }
}

impl DecisionLedger for MemoryLedger {
    fn get_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError> {
        Ok(self.rows.get(key).cloned())
    }

    fn list_latest_across_workspace(
        &self,
        workspace_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StateMachineRecord>, LedgerError> {
        let limit = workspace_list_limit(limit)?;
        let mut rows = self
            .rows
            .values()
            .filter(|row| row.key.workspace_id == workspace_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|lhs, rhs| {
            rhs.updated_at
                .cmp(&lhs.updated_at)
                .then_with(|| lhs.key.cmp(&rhs.key))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    fn list_transitions(
        &self,
        query: &TransitionQuery,
    ) -> Result<Vec<TransitionRecord>, LedgerError> {
        let limit = query.effective_limit()?;
        let mut rows = self
            .transitions
            .iter()
            .filter(|row| query.matches(&row.key))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|lhs, rhs| {
            rhs.emitted_at
                .cmp(&lhs.emitted_at)
                .then_with(|| rhs.transition_seq.cmp(&lhs.transition_seq))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    fn record(
        &mut self,
        entry: &DecisionEntry,
        guard: WriteGuard,
    ) -> Result<RecordReceipt, LedgerError> {
        entry
            .key
            .validate()
            .map_err(|err| LedgerError::InvalidQuery(err.to_string()))?;

        let existing = self.rows.get(&entry.key);
        guard.check(&entry.key, existing.map(|row| row.revision))?;

        let now = now_utc();
        let created = existing.is_none();
        let revision = existing.map_or(1, |row| row.revision + 1);
        let created_at = existing.map_or(now, |row| row.created_at);

        let transition_seq = if entry.append_transition || created {
            let seq = self
                .transitions
                .last()
                .map_or(1, |row| row.transition_seq + 1);
            self.transitions.push(entry.to_transition(seq, now));
            Some(seq)
        } else {
            None
        };
        self.rows
            .insert(entry.key.clone(), entry.to_record(revision, created_at));

        Ok(RecordReceipt {
            revision,
            transition_seq,
            created,
        })
    }
}
