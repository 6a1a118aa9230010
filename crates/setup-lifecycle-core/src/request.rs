use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::ledger::StateMachineRecord;
use crate::model::{Direction, EventKind, FlowBias, Permission, Regime, SetupState};
use crate::{minutes_between, parse_rfc3339_utc, EngineError};

/// One evaluation call as delivered by the scoring pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub now_iso: String,
    pub current_state: SetupState,
    #[serde(default)]
    pub previous_state: Option<SetupState>,
    pub state_since_iso: String,
    pub playbook: String,
    pub direction: Direction,
    pub event: EventKind,
    pub position_open: bool,
    #[serde(default)]
    pub cooldown_until_iso: Option<String>,
    pub trigger: TriggerInput,
    pub context: SignalContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInput {
    pub definition: String,
    pub pass: bool,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub eta: Option<String>,
}

/// Upstream signal bundle. Treated as an immutable value for one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalContext {
    pub brain_score: f64,
    pub data_health_score: f64,
    pub data_health_pass: bool,
    pub regime_value: Regime,
    pub regime_pass: bool,
    pub institutional_filter_pass: bool,
    pub institutional_filter_score: f64,
    #[serde(default)]
    pub filter_reject_reasons: Vec<String>,
    pub capital_flow_pass: bool,
    pub flow_bias: FlowBias,
    pub flow_strength: f64,
    pub flow_state_pass: bool,
    pub flow_state: String,
    pub timing_quality: f64,
    pub setup_quality_pass: bool,
    #[serde(default)]
    pub setup_missing: Vec<String>,
    #[serde(default)]
    pub invalidate_level: Option<f64>,
    pub risk_governor_pass: bool,
    pub permission: Permission,
    pub size_multiplier: f64,
    #[serde(default)]
    pub risk_block_reasons: Vec<String>,
    #[serde(default)]
    pub edge_decay: Option<bool>,
    pub decision_confidence: f64,
}

impl SignalContext {
    #[must_use]
    pub fn risk_blocked(&self) -> bool {
        !self.risk_governor_pass || self.permission == Permission::Block
    }

    fn validate(&self) -> Result<(), EngineError> {
        if !self.brain_score.is_finite() || !(0.0..=100.0).contains(&self.brain_score) {
            return Err(invalid("context.brainScore MUST be in [0, 100]"));
        }

        for (name, value) in [
            ("context.flowStrength", self.flow_strength),
            ("context.timingQuality", self.timing_quality),
            ("context.decisionConfidence", self.decision_confidence),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("{name} MUST be in [0.0, 1.0]")));
            }
        }

        for (name, value) in [
            ("context.dataHealthScore", self.data_health_score),
            (
                "context.institutionalFilterScore",
                self.institutional_filter_score,
            ),
        ] {
            if !value.is_finite() {
                return Err(invalid(&format!("{name} MUST be a finite number")));
            }
        }

        if !self.size_multiplier.is_finite() || self.size_multiplier < 0.0 {
            return Err(invalid("context.sizeMultiplier MUST be a finite number >= 0"));
        }

        if self.invalidate_level.is_some_and(|level| !level.is_finite()) {
            return Err(invalid("context.invalidateLevel MUST be finite or null"));
        }

        if self.flow_state.trim().is_empty() {
            return Err(invalid("context.flowState MUST be provided"));
        }

        Ok(())
    }
}

/// A request whose timestamps and optional fields have been resolved once.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest<'a> {
    pub request: &'a EvaluationRequest,
    pub now: OffsetDateTime,
    pub state_since: OffsetDateTime,
    pub cooldown_until: Option<OffsetDateTime>,
    pub state_age_minutes: f64,
    pub edge_decay_flagged: bool,
}

impl ResolvedRequest<'_> {
    #[must_use]
    pub fn context(&self) -> &SignalContext {
        &self.request.context
    }

    /// A missing cooldown deadline counts as elapsed.
    #[must_use]
    pub fn cooldown_elapsed(&self) -> bool {
        self.cooldown_until.map_or(true, |until| self.now >= until)
    }
}

impl EvaluationRequest {
    /// Decodes and validates a request from JSON.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidSignalBundle`] when a field is missing,
    /// malformed or out of range.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let request: Self = serde_json::from_value(value.clone())
            .map_err(|err| EngineError::InvalidSignalBundle(err.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidSignalBundle`] when the payload is not
    /// valid JSON or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|err| EngineError::InvalidSignalBundle(err.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidSignalBundle`] when any field violates
    /// the request contract.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.resolve().map(|_| ())
    }

    /// Parses timestamps and checks numeric ranges.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidSignalBundle`] when any field violates
    /// the request contract.
    pub fn resolve(&self) -> Result<ResolvedRequest<'_>, EngineError> {
        if self.playbook.trim().is_empty() {
            return Err(invalid("playbook MUST be provided"));
        }
        if self.trigger.current.is_some_and(|current| !current.is_finite()) {
            return Err(invalid("trigger.current MUST be finite or null"));
        }
        self.context.validate()?;

        let now = parse_field("nowIso", &self.now_iso)?;
        let state_since = parse_field("stateSinceIso", &self.state_since_iso)?;
        let cooldown_until = self
            .cooldown_until_iso
            .as_deref()
            .map(|raw| parse_field("cooldownUntilIso", raw))
            .transpose()?;

        Ok(ResolvedRequest {
            request: self,
            now,
            state_since,
            cooldown_until,
            state_age_minutes: minutes_between(state_since, now),
            edge_decay_flagged: self.context.edge_decay.unwrap_or(false),
        })
    }

    /// Overlays the persisted lifecycle position onto an incoming request.
    ///
    /// A caller-supplied `cooldownUntilIso` wins over the stored deadline.
    #[must_use]
    pub fn resume_from(&self, record: &StateMachineRecord) -> Self {
        let mut resumed = self.clone();
        resumed.current_state = record.state;
        resumed.previous_state = record.previous_state;
        resumed.state_since_iso.clone_from(&record.state_since);
        if resumed.cooldown_until_iso.is_none() {
            resumed
                .cooldown_until_iso
                .clone_from(&record.state_machine_snapshot.state_machine.cooldown.until);
        }
        resumed
    }
}

fn parse_field(name: &str, raw: &str) -> Result<OffsetDateTime, EngineError> {
    parse_rfc3339_utc(raw).map_err(|err| invalid(&format!("{name}: {err}")))
}

fn invalid(message: &str) -> EngineError {
    EngineError::InvalidSignalBundle(message.to_string())
}


#[cfg(test)]
mod tests {
    use super::fixtures::{passing_request, passing_request_json};
    use super::*;

    #[test]
    fn missing_gate_field_is_an_invalid_signal_bundle() {
        let mut payload = passing_request_json();
        if let Some(context) = payload["context"].as_object_mut() {
            context.remove("riskGovernorPass");
        }

        let err = match EvaluationRequest::from_json(&payload) {
            Ok(_) => panic!("expected missing field to be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, EngineError::InvalidSignalBundle(_)));
        assert!(err.to_string().contains("riskGovernorPass"));
    }

    #[test]
    fn out_of_range_brain_score_is_rejected() {
        let mut request = passing_request();
        request.context.brain_score = 140.0;
        assert!(matches!(
            request.validate(),
            Err(EngineError::InvalidSignalBundle(_))
        ));
    }

    #[test]
    fn unknown_permission_is_rejected() {
        let mut payload = passing_request_json();
        payload["context"]["permission"] = Value::String("MAYBE".to_string());
        assert!(EvaluationRequest::from_json(&payload).is_err());
    }

    #[test]
    fn malformed_timestamp_names_the_field() {
        let mut request = passing_request();
        request.state_since_iso = "yesterday".to_string();
        let err = match request.validate() {
            Ok(()) => panic!("expected malformed timestamp to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("stateSinceIso"));
    }

    #[test]
    fn resolve_computes_state_age_and_cooldown() {
        let mut request = passing_request();
        request.cooldown_until_iso = Some("2026-02-07T11:30:00Z".to_string());
        let resolved = match request.resolve() {
            Ok(value) => value,
            Err(err) => panic!("expected resolve to succeed: {err}"),
        };
        assert!((resolved.state_age_minutes - 60.0).abs() < 1e-9);
        assert!(resolved.cooldown_elapsed());
        assert!(!resolved.edge_decay_flagged);
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let mut payload = passing_request_json();
        if let Some(root) = payload.as_object_mut() {
            root.remove("previousState");
            root.remove("cooldownUntilIso");
        }
        if let Some(context) = payload["context"].as_object_mut() {
            context.remove("edgeDecay");
            context.remove("setupMissing");
        }

        let request = match EvaluationRequest::from_json(&payload) {
            Ok(value) => value,
            Err(err) => panic!("expected optional fields to default: {err}"),
        };
        assert_eq!(request.previous_state, None);
        assert_eq!(request.cooldown_until_iso, None);
        assert_eq!(request.context.edge_decay, None);
        assert!(request.context.setup_missing.is_empty());
    }
}
