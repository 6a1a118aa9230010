use serde::{Deserialize, Serialize};

use crate::model::{Permission, SetupState};
use crate::request::ResolvedRequest;

pub const WATCH_MIN_BRAIN_SCORE: f64 = 40.0;
pub const STALK_MIN_BRAIN_SCORE: f64 = 55.0;
pub const ARMED_MIN_BRAIN_SCORE: f64 = 70.0;

/// Minutes an `ARMED` setup may wait for its trigger before the edge decays.
pub const EDGE_DECAY_MINUTES: f64 = 45.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateResult {
    pub pass: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GateResult {
    fn new(pass: bool) -> Self {
        Self {
            pass,
            score: None,
            value: None,
            reason: None,
        }
    }

    fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    fn score_opt(mut self, score: Option<f64>) -> Self {
        self.score = score;
        self
    }

    fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Attaches a reason only when the gate failed.
    fn reason_on_fail(mut self, reason: impl FnOnce() -> String) -> Self {
        if !self.pass {
            self.reason = Some(reason());
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateSet {
    pub data_health: GateResult,
    pub regime: GateResult,
    pub institutional_filter: GateResult,
    pub capital_flow: GateResult,
    pub flow_state: GateResult,
    pub setup_quality: GateResult,
    pub trigger: GateResult,
    pub risk_governor: GateResult,
}

impl GateSet {
    /// Both hard-block gates pass.
    #[must_use]
    pub fn hard_block_clear(&self) -> bool {
        self.data_health.pass && self.risk_governor.pass
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Readiness {
    pub watch_ready: bool,
    pub stalk_ready: bool,
    pub armed_ready: bool,
    pub edge_decay: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub gates: GateSet,
    pub readiness: Readiness,
}

/// Computes the eight gate results and the composite readiness flags.
#[must_use]
pub fn evaluate_gates(resolved: &ResolvedRequest<'_>) -> GateEvaluation {
    let request = resolved.request;
    let ctx = &request.context;

    let data_health = GateResult::new(ctx.data_health_pass)
        .score(ctx.data_health_score)
        .reason_on_fail(|| "Data health below threshold".to_string());

    let regime = GateResult::new(ctx.regime_pass)
        .value(ctx.regime_value.as_str())
        .reason_on_fail(|| format!("Regime {} hostile to playbook", ctx.regime_value.as_str()));

    let institutional_filter = GateResult::new(ctx.institutional_filter_pass)
        .score(ctx.institutional_filter_score)
        .reason_on_fail(|| {
            if ctx.filter_reject_reasons.is_empty() {
                "Institutional filter rejected".to_string()
            } else {
                ctx.filter_reject_reasons.join("; ")
            }
        });

    let capital_flow = GateResult::new(ctx.capital_flow_pass)
        .score(ctx.flow_strength)
        .value(ctx.flow_bias.as_str())
        .reason_on_fail(|| "Capital flow not confirming".to_string());

    let flow_state = GateResult::new(ctx.flow_state_pass)
        .score(ctx.timing_quality)
        .value(ctx.flow_state.clone())
        .reason_on_fail(|| format!("Flow state {} not aligned", ctx.flow_state));

    let setup_quality = GateResult::new(ctx.setup_quality_pass)
        .score_opt(ctx.invalidate_level)
        .reason_on_fail(|| {
            if ctx.setup_missing.is_empty() {
                "Setup incomplete".to_string()
            } else {
                format!("Missing: {}", ctx.setup_missing.join(", "))
            }
        });

    let trigger = GateResult::new(request.trigger.pass)
        .score_opt(request.trigger.current)
        .value(request.trigger.definition.clone())
        .reason_on_fail(|| match request.trigger.eta.as_deref() {
            Some(eta) => format!("Trigger pending (eta {eta})"),
            None => "Trigger pending".to_string(),
        });

    let risk_governor = GateResult::new(ctx.risk_governor_pass && ctx.permission != Permission::Block)
        .score(ctx.size_multiplier)
        .value(ctx.permission.as_str())
        .reason_on_fail(|| {
            ctx.risk_block_reasons
                .first()
                .cloned()
                .unwrap_or_else(|| "Risk governor blocked".to_string())
        });

    let watch_ready = data_health.pass
        && regime.pass
        && institutional_filter.pass
        && ctx.brain_score >= WATCH_MIN_BRAIN_SCORE;
    let stalk_ready = watch_ready && capital_flow.pass && ctx.brain_score >= STALK_MIN_BRAIN_SCORE;
    let armed_ready = stalk_ready
        && flow_state.pass
        && setup_quality.pass
        && ctx.brain_score >= ARMED_MIN_BRAIN_SCORE;

    let edge_decay = resolved.edge_decay_flagged
        || (request.current_state == SetupState::Armed
            && resolved.state_age_minutes > EDGE_DECAY_MINUTES
            && !trigger.pass);

    GateEvaluation {
        gates: GateSet {
            data_health,
            regime,
            institutional_filter,
            capital_flow,
            flow_state,
            setup_quality,
            trigger,
            risk_governor,
        },
        readiness: Readiness {
            watch_ready,
            stalk_ready,
            armed_ready,
            edge_decay,
        },
    }
}
