use serde::{Deserialize, Serialize};

use crate::ledger::{DecisionEntry, DecisionLedger, LedgerError, WriteGuard};
use crate::model::SetupKey;
use crate::request::EvaluationRequest;
use crate::settings::EngineSettings;
use crate::transition::{evaluate, EvaluationOutput};
use crate::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistenceStatus {
    Persisted {
        revision: i64,
        transition_seq: Option<i64>,
        attempts: u32,
    },
    Failed {
        warning: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedDecision {
    pub key: SetupKey,
    pub output: EvaluationOutput,
    pub persistence: PersistenceStatus,
}

/// Evaluates a request against the persisted state for `key` and records it.
///
/// The stored row, when present, supplies the current state and
/// `state_since`. Writes are guarded by the row revision; on conflict the
/// evaluation is recomputed against the newer row, and once
/// `max_conflict_retries` is exhausted the write falls back to
/// last-writer-wins. Storage failures never discard the decision: they are
/// logged and reported through [`PersistenceStatus::Failed`].
///
/// # Errors
/// Returns [`EngineError`] only for invalid settings, keys or requests, in
/// which case nothing is written.
pub fn evaluate_and_record<L: DecisionLedger + ?Sized>(
    ledger: &mut L,
    key: &SetupKey,
    request: &EvaluationRequest,
    settings: &EngineSettings,
) -> Result<RecordedDecision, EngineError> {
    settings.validate()?;
    key.validate()?;
    request.validate()?;

    if request.playbook.trim() != key.playbook || request.direction != key.direction {
        return Err(EngineError::InvalidSignalBundle(format!(
            "request playbook/direction {}:{} does not match key {key}",
            request.playbook.trim(),
            request.direction.as_str()
        )));
    }

    let mut attempts = 0_u32;
    loop {
        attempts += 1;

        let latest = match ledger.get_latest(key) {
            Ok(value) => value,
            Err(err) => {
                let output = evaluate(request, settings)?;
                return Ok(degraded(key, output, &err));
            }
        };

        let effective = latest
            .as_ref()
            .map_or_else(|| request.clone(), |record| request.resume_from(record));
        let output = evaluate(&effective, settings)?;
        let entry = DecisionEntry::from_evaluation(key.clone(), &effective, output)?
            .with_append_policy(settings);

        let exhausted = attempts > settings.max_conflict_retries;
        let guard = match (&latest, exhausted) {
            (_, true) => WriteGuard::Any,
            (Some(record), false) => WriteGuard::Revision(record.revision),
            (None, false) => WriteGuard::Absent,
        };

        match ledger.record(&entry, guard) {
            Ok(receipt) => {
                tracing::debug!(
                    key = %key,
                    state = %entry.output.state_machine.state,
                    revision = receipt.revision,
                    attempts,
                    "recorded setup evaluation"
                );
                return Ok(RecordedDecision {
                    key: key.clone(),
                    output: entry.output,
                    persistence: PersistenceStatus::Persisted {
                        revision: receipt.revision,
                        transition_seq: receipt.transition_seq,
                        attempts,
                    },
                });
            }
            Err(LedgerError::Conflict { expected, found, .. }) if !exhausted => {
                tracing::info!(
                    key = %key,
                    ?expected,
                    ?found,
                    attempts,
                    "write conflict; re-evaluating against newer state"
                );
            }
            Err(err) => return Ok(degraded(key, entry.output, &err)),
        }
    }
}

fn degraded(key: &SetupKey, output: EvaluationOutput, err: &LedgerError) -> RecordedDecision {
    tracing::warn!(key = %key, error = %err, "setup decision not persisted");
    RecordedDecision {
        key: key.clone(),
        output,
        persistence: PersistenceStatus::Failed {
            warning: format!("decision not persisted: {err}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        MemoryLedger, RecordReceipt, StateMachineRecord, TransitionQuery, TransitionRecord,
    };
    use crate::model::{Direction, SetupState};
    use crate::request::fixtures::passing_request;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_key() -> SetupKey {
        must_ok(SetupKey::new("ws-1", "AAPL", "breakout", Direction::Long))
    }

    fn request_at(now_iso: &str) -> EvaluationRequest {
        let mut request = passing_request();
        request.now_iso = now_iso.to_string();
        request
    }

    struct UnavailableLedger;

    impl DecisionLedger for UnavailableLedger {
        fn get_latest(&self, _key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError> {
            Err(LedgerError::Unavailable("disk offline".to_string()))
        }

        fn list_latest_across_workspace(
            &self,
            _workspace_id: &str,
            _limit: Option<usize>,
        ) -> Result<Vec<StateMachineRecord>, LedgerError> {
            Err(LedgerError::Unavailable("disk offline".to_string()))
        }

        fn list_transitions(
            &self,
            _query: &TransitionQuery,
        ) -> Result<Vec<TransitionRecord>, LedgerError> {
            Err(LedgerError::Unavailable("disk offline".to_string()))
        }

        fn record(
            &mut self,
            _entry: &DecisionEntry,
            _guard: WriteGuard,
        ) -> Result<RecordReceipt, LedgerError> {
            Err(LedgerError::Unavailable("disk offline".to_string()))
        }
    }

    /// Reports a conflict for the first `remaining` guarded writes.
    struct ContendedLedger {
        inner: MemoryLedger,
        remaining: u32,
        guards: Vec<WriteGuard>,
    }

    impl DecisionLedger for ContendedLedger {
        fn get_latest(&self, key: &SetupKey) -> Result<Option<StateMachineRecord>, LedgerError> {
            self.inner.get_latest(key)
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
            self.guards.push(guard);
            if guard != WriteGuard::Any && self.remaining > 0 {
                self.remaining -= 1;
                return Err(LedgerError::Conflict {
                    key: entry.key.to_string(),
                    expected: None,
                    found: Some(99),
                });
            }
            self.inner.record(entry, guard)
        }
    }

    #[test]
    fn first_evaluation_creates_state_and_transition() {
        let mut ledger = MemoryLedger::new();
        let recorded = must_ok(evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request_at("2026-02-07T12:00:00Z"),
            &EngineSettings::v1(),
        ));

        assert_eq!(recorded.output.state_machine.state, SetupState::Watch);
        assert_eq!(
            recorded.persistence,
            PersistenceStatus::Persisted {
                revision: 1,
                transition_seq: Some(1),
                attempts: 1,
            }
        );
        assert_eq!(ledger.transition_count(), 1);
    }

    #[test]
    fn later_evaluations_resume_from_stored_state() {
        let mut ledger = MemoryLedger::new();
        let key = fixture_key();
        let settings = EngineSettings::v1();
        let _ = must_ok(evaluate_and_record(
            &mut ledger,
            &key,
            &request_at("2026-02-07T12:00:00Z"),
            &settings,
        ));

        // The caller still reports SCAN; the stored WATCH row wins.
        let recorded = must_ok(evaluate_and_record(
            &mut ledger,
            &key,
            &request_at("2026-02-07T12:05:00Z"),
            &settings,
        ));
        assert_eq!(recorded.output.transition.old_state, SetupState::Watch);
        assert_eq!(recorded.output.state_machine.state, SetupState::Stalk);
        assert_eq!(
            recorded.output.state_machine.previous_state,
            Some(SetupState::Watch)
        );
    }

    #[test]
    fn unchanged_state_keeps_stored_state_since() {
        let mut ledger = MemoryLedger::new();
        let key = fixture_key();
        let settings = EngineSettings::v1();
        let mut request = request_at("2026-02-07T12:00:00Z");
        request.context.capital_flow_pass = false;

        let _ = must_ok(evaluate_and_record(&mut ledger, &key, &request, &settings));
        request.now_iso = "2026-02-07T12:20:00Z".to_string();
        let recorded = must_ok(evaluate_and_record(&mut ledger, &key, &request, &settings));

        assert!(!recorded.output.transition.changed);
        let row = match must_ok(ledger.get_latest(&key)) {
            Some(row) => row,
            None => panic!("expected stored row"),
        };
        assert_eq!(row.state_since, "2026-02-07T12:00:00Z");
        assert_eq!(row.revision, 2);
        assert_eq!(ledger.transition_count(), 2);
    }

    #[test]
    fn storage_failure_still_returns_the_decision() {
        let mut ledger = UnavailableLedger;
        let recorded = must_ok(evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request_at("2026-02-07T12:00:00Z"),
            &EngineSettings::v1(),
        ));

        assert_eq!(recorded.output.state_machine.state, SetupState::Watch);
        match recorded.persistence {
            PersistenceStatus::Failed { warning } => assert!(warning.contains("disk offline")),
            PersistenceStatus::Persisted { .. } => panic!("expected persistence failure"),
        }
    }

    #[test]
    fn conflicts_are_retried_then_resolved_last_writer_wins() {
        let mut ledger = ContendedLedger {
            inner: MemoryLedger::new(),
            remaining: u32::MAX,
            guards: Vec::new(),
        };
        let settings = EngineSettings {
            max_conflict_retries: 2,
            ..EngineSettings::v1()
        };

        let recorded = must_ok(evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request_at("2026-02-07T12:00:00Z"),
            &settings,
        ));

        assert_eq!(
            ledger.guards,
            vec![WriteGuard::Absent, WriteGuard::Absent, WriteGuard::Any]
        );
        assert!(matches!(
            recorded.persistence,
            PersistenceStatus::Persisted { attempts: 3, .. }
        ));
    }

    #[test]
    fn a_single_conflict_is_absorbed_by_retry() {
        let mut ledger = ContendedLedger {
            inner: MemoryLedger::new(),
            remaining: 1,
            guards: Vec::new(),
        };
        let recorded = must_ok(evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request_at("2026-02-07T12:00:00Z"),
            &EngineSettings::v1(),
        ));
        assert!(matches!(
            recorded.persistence,
            PersistenceStatus::Persisted { attempts: 2, .. }
        ));
        assert_eq!(ledger.inner.transition_count(), 1);
    }

    #[test]
    fn invalid_request_writes_nothing() {
        let mut ledger = MemoryLedger::new();
        let mut request = request_at("2026-02-07T12:00:00Z");
        request.context.decision_confidence = 1.5;

        let result = evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request,
            &EngineSettings::v1(),
        );
        assert!(matches!(result, Err(EngineError::InvalidSignalBundle(_))));
        assert_eq!(ledger.transition_count(), 0);
    }

    #[test]
    fn request_must_match_key_playbook_and_direction() {
        let mut ledger = MemoryLedger::new();
        let mut request = request_at("2026-02-07T12:00:00Z");
        request.direction = Direction::Short;

        let result = evaluate_and_record(
            &mut ledger,
            &fixture_key(),
            &request,
            &EngineSettings::v1(),
        );
        assert!(matches!(result, Err(EngineError::InvalidSignalBundle(_))));
    }

    #[test]
    fn persistence_status_serializes_with_status_tag() {
        let value = must_ok(serde_json::to_value(PersistenceStatus::Failed {
            warning: "decision not persisted: ledger unavailable: x".to_string(),
        }));
        assert_eq!(value["status"], "failed");
    }
}
