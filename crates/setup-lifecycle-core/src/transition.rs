use serde::{Deserialize, Serialize};
use time::Duration;

use crate::advisor::{next_best_action, NextBestAction};
use crate::gates::{evaluate_gates, GateEvaluation, GateSet};
use crate::model::{Direction, EventKind, SetupState};
use crate::momentum::{classify_momentum, StateMomentum};
use crate::request::{EvaluationRequest, ResolvedRequest};
use crate::settings::EngineSettings;
use crate::{format_rfc3339, EngineError};

/// Minutes a `STALK` setup may wait for maturation before falling back.
pub const STALK_TIMEOUT_MINUTES: f64 = 120.0;
/// Minutes a `WATCH` setup may wait for readiness before falling back.
pub const WATCH_TIMEOUT_MINUTES: f64 = 1_440.0;

/// The rule in the priority list that produced a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionRule {
    HardBlock,
    ExitEvent,
    PositionOpen,
    TriggerExecute,
    EntryFilled,
    Upgrade,
    Decay,
    CooldownRelease,
    CooldownHold,
    BlockRecovery,
    Hold,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransitionDecision {
    pub new_state: SetupState,
    pub reason: String,
    pub rule: TransitionRule,
}

impl TransitionDecision {
    fn new(new_state: SetupState, reason: impl Into<String>, rule: TransitionRule) -> Self {
        Self {
            new_state,
            reason: reason.into(),
            rule,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CooldownStatus {
    pub active: bool,
    pub until: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditTrail {
    pub transition_reason: String,
    pub decision_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateMachineSnapshot {
    pub state: SetupState,
    pub previous_state: Option<SetupState>,
    pub state_since: String,
    pub playbook: String,
    pub direction: Direction,
    pub gates: GateSet,
    pub next_best_action: NextBestAction,
    pub block_reasons: Vec<String>,
    pub cooldown: CooldownStatus,
    pub audit: AuditTrail,
    pub state_momentum: StateMomentum,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionSummary {
    pub old_state: SetupState,
    pub new_state: SetupState,
    pub reason: String,
    pub timestamp: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationOutput {
    pub state_machine: StateMachineSnapshot,
    pub transition: TransitionSummary,
}

/// Applies the ordered, first-match-wins transition rules.
#[must_use]
pub fn decide_transition(
    resolved: &ResolvedRequest<'_>,
    evaluation: &GateEvaluation,
) -> TransitionDecision {
    let request = resolved.request;
    let ctx = &request.context;
    let gates = &evaluation.gates;
    let readiness = evaluation.readiness;
    let current = request.current_state;

    if !gates.hard_block_clear() {
        let reason = if !ctx.risk_block_reasons.is_empty() {
            let prefix = if gates.risk_governor.pass {
                "Blocked"
            } else {
                "Risk governor blocked"
            };
            format!("{prefix}: {}", ctx.risk_block_reasons.join("; "))
        } else if !gates.data_health.pass {
            "Data health gate failed".to_string()
        } else {
            "Risk governor blocked".to_string()
        };
        return TransitionDecision::new(SetupState::Blocked, reason, TransitionRule::HardBlock);
    }

    if request.event.is_exit() {
        return TransitionDecision::new(
            SetupState::Cooldown,
            "Position closed; cooldown started",
            TransitionRule::ExitEvent,
        );
    }

    if request.position_open {
        return TransitionDecision::new(
            SetupState::Manage,
            "Position open; managing",
            TransitionRule::PositionOpen,
        );
    }

    if current == SetupState::Armed && gates.trigger.pass && gates.risk_governor.pass {
        return TransitionDecision::new(
            SetupState::Execute,
            "Trigger confirmed; executing",
            TransitionRule::TriggerExecute,
        );
    }

    if request.event == EventKind::EntryFilled {
        return TransitionDecision::new(
            SetupState::Manage,
            "Entry filled; managing position",
            TransitionRule::EntryFilled,
        );
    }

    let upgrade = match current {
        SetupState::Scan if readiness.watch_ready => {
            Some((SetupState::Watch, "Eligible + data healthy + edge present"))
        }
        SetupState::Watch if readiness.stalk_ready => {
            Some((SetupState::Stalk, "Capital flow confirmed; stalking"))
        }
        SetupState::Stalk if readiness.armed_ready => {
            Some((SetupState::Armed, "Setup mature; armed for trigger"))
        }
        _ => None,
    };
    if let Some((next, reason)) = upgrade {
        return TransitionDecision::new(next, reason, TransitionRule::Upgrade);
    }

    let age = resolved.state_age_minutes;
    let decay = match current {
        SetupState::Armed if readiness.edge_decay => Some((
            SetupState::Watch,
            "Edge decay detected; de-escalating from ARMED",
        )),
        SetupState::Stalk if age > STALK_TIMEOUT_MINUTES && !readiness.armed_ready => {
            Some((SetupState::Watch, "Stalk timeout without maturation"))
        }
        SetupState::Watch if age > WATCH_TIMEOUT_MINUTES && !readiness.watch_ready => {
            Some((SetupState::Scan, "Watch expired without readiness"))
        }
        _ => None,
    };
    if let Some((next, reason)) = decay {
        return TransitionDecision::new(next, reason, TransitionRule::Decay);
    }

    if current == SetupState::Cooldown {
        if resolved.cooldown_elapsed() && readiness.watch_ready {
            return TransitionDecision::new(
                SetupState::Watch,
                "Cooldown elapsed; re-entering WATCH",
                TransitionRule::CooldownRelease,
            );
        }
        return TransitionDecision::new(
            SetupState::Cooldown,
            "Cooldown in effect",
            TransitionRule::CooldownHold,
        );
    }

    if current == SetupState::Blocked {
        let band = SetupState::band_for_brain_score(ctx.brain_score);
        return TransitionDecision::new(
            band,
            format!("Blocking gates cleared; re-entering at {band}"),
            TransitionRule::BlockRecovery,
        );
    }

    TransitionDecision::new(current, "No transition", TransitionRule::Hold)
}

/// Runs the full pure pipeline for one request.
///
/// # Errors
/// Returns [`EngineError::InvalidSignalBundle`] for an invalid request and
/// [`EngineError::Timestamp`] if a derived timestamp cannot be formatted.
pub fn evaluate(
    request: &EvaluationRequest,
    settings: &EngineSettings,
) -> Result<EvaluationOutput, EngineError> {
    let resolved = request.resolve()?;
    let evaluation = evaluate_gates(&resolved);
    let decision = decide_transition(&resolved, &evaluation);

    let old_state = request.current_state;
    let new_state = decision.new_state;
    let changed = new_state != old_state;

    let (state_since, previous_state, state_age_minutes) = if changed {
        (request.now_iso.clone(), Some(old_state), 0.0)
    } else {
        (
            request.state_since_iso.clone(),
            request.previous_state,
            resolved.state_age_minutes,
        )
    };

    let cooldown = cooldown_status(&resolved, new_state, settings)?;
    let block_reasons = if new_state == SetupState::Blocked {
        block_reasons(&resolved, &evaluation.gates)
    } else {
        Vec::new()
    };

    Ok(EvaluationOutput {
        state_machine: StateMachineSnapshot {
            state: new_state,
            previous_state,
            state_since,
            playbook: request.playbook.clone(),
            direction: request.direction,
            gates: evaluation.gates,
            next_best_action: next_best_action(new_state),
            block_reasons,
            cooldown,
            audit: AuditTrail {
                transition_reason: decision.reason.clone(),
                decision_confidence: request.context.decision_confidence,
            },
            state_momentum: classify_momentum(state_age_minutes),
        },
        transition: TransitionSummary {
            old_state,
            new_state,
            reason: decision.reason,
            timestamp: request.now_iso.clone(),
            changed,
        },
    })
}

fn cooldown_status(
    resolved: &ResolvedRequest<'_>,
    new_state: SetupState,
    settings: &EngineSettings,
) -> Result<CooldownStatus, EngineError> {
    if new_state != SetupState::Cooldown {
        return Ok(CooldownStatus {
            active: false,
            until: None,
        });
    }

    let request = resolved.request;
    if request.current_state == SetupState::Cooldown {
        return Ok(CooldownStatus {
            active: true,
            until: request.cooldown_until_iso.clone(),
        });
    }

    let until = match (&request.cooldown_until_iso, resolved.cooldown_until) {
        (Some(raw), Some(parsed)) if parsed > resolved.now => raw.clone(),
        _ => format_rfc3339(
            resolved.now + Duration::minutes(i64::from(settings.cooldown_minutes)),
        )?,
    };

    Ok(CooldownStatus {
        active: true,
        until: Some(until),
    })
}

fn block_reasons(resolved: &ResolvedRequest<'_>, gates: &GateSet) -> Vec<String> {
    let ctx = resolved.context();
    let mut reasons = Vec::new();

    if !gates.data_health.pass {
        reasons.push("data_health_failed".to_string());
    }

    if ctx.risk_block_reasons.is_empty() {
        reasons.push("risk_governor_failed".to_string());
    } else {
        reasons.extend(ctx.risk_block_reasons.iter().cloned());
    }

    if !gates.regime.pass {
        reasons.push("regime_hostile".to_string());
    }

    reasons
}
