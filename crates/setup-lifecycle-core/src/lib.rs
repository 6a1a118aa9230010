//! Deterministic per-instrument setup lifecycle engine.
//!
//! An evaluation flows through four stages:
//! - [`evaluate_gates`] turns a validated [`EvaluationRequest`] into eight
//!   gate results plus composite readiness flags.
//! - [`decide_transition`] applies the ordered, first-match-wins rule list.
//! - [`classify_momentum`] and [`next_best_action`] decorate the result.
//! - [`evaluate_and_record`] persists the outcome through a [`DecisionLedger`].
//!
//! Everything up to persistence is pure: identical requests produce identical
//! [`EvaluationOutput`] values.

use time::{Duration, OffsetDateTime, UtcOffset};

mod advisor;
mod gates;
mod ledger;
mod model;
mod momentum;
mod record;
mod request;
mod settings;
mod transition;

pub use advisor::{next_best_action, ActionKind, NextBestAction};
pub use gates::{
    evaluate_gates, GateEvaluation, GateResult, GateSet, Readiness, ARMED_MIN_BRAIN_SCORE,
    EDGE_DECAY_MINUTES, STALK_MIN_BRAIN_SCORE, WATCH_MIN_BRAIN_SCORE,
};
pub use ledger::{
    workspace_list_limit, DecisionEntry, DecisionLedger, LedgerError, MemoryLedger, RecordReceipt,
    StateMachineRecord, TransitionQuery, TransitionRecord, WriteGuard,
    DEFAULT_TRANSITION_LIST_LIMIT, DEFAULT_WORKSPACE_LIST_LIMIT, MAX_TRANSITION_LIST_LIMIT,
    MAX_WORKSPACE_LIST_LIMIT,
};
pub use model::{
    parse_setup_key, Direction, EventKind, FlowBias, Permission, Regime, SetupKey, SetupState,
};
pub use momentum::{classify_momentum, DecayLevel, StateMomentum, Velocity};
pub use record::{evaluate_and_record, PersistenceStatus, RecordedDecision};
pub use request::{EvaluationRequest, ResolvedRequest, SignalContext, TriggerInput};
pub use settings::{EngineSettings, MAX_CONFLICT_RETRIES, MAX_COOLDOWN_MINUTES};
pub use transition::{
    decide_transition, evaluate, AuditTrail, CooldownStatus, EvaluationOutput,
    StateMachineSnapshot, TransitionDecision, TransitionRule, TransitionSummary,
    STALK_TIMEOUT_MINUTES, WATCH_TIMEOUT_MINUTES,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid signal bundle: {0}")]
    InvalidSignalBundle(String),
    #[error("invalid setup key: {0}")]
    InvalidKey(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`EngineError::Timestamp`] when parsing fails or the timestamp
/// carries a non-UTC offset.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Timestamp(format!("{value}: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Timestamp(format!(
            "{value}: timestamp MUST use UTC offset Z"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::Timestamp(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Elapsed minutes between two instants, floored at zero.
#[must_use]
pub fn minutes_between(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }

    (later - earlier).as_seconds_f64() / Duration::MINUTE.as_seconds_f64()
}

/// Milliseconds since the Unix epoch, used as a sortable column value.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}
