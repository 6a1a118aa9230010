use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::gates::{ARMED_MIN_BRAIN_SCORE, STALK_MIN_BRAIN_SCORE, WATCH_MIN_BRAIN_SCORE};
use crate::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupState {
    Scan,
    Watch,
    Stalk,
    Armed,
    Execute,
    Manage,
    Cooldown,
    Blocked,
}

impl SetupState {
    pub const ALL: [Self; 8] = [
        Self::Scan,
        Self::Watch,
        Self::Stalk,
        Self::Armed,
        Self::Execute,
        Self::Manage,
        Self::Cooldown,
        Self::Blocked,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::Watch => "WATCH",
            Self::Stalk => "STALK",
            Self::Armed => "ARMED",
            Self::Execute => "EXECUTE",
            Self::Manage => "MANAGE",
            Self::Cooldown => "COOLDOWN",
            Self::Blocked => "BLOCKED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCAN" => Some(Self::Scan),
            "WATCH" => Some(Self::Watch),
            "STALK" => Some(Self::Stalk),
            "ARMED" => Some(Self::Armed),
            "EXECUTE" => Some(Self::Execute),
            "MANAGE" => Some(Self::Manage),
            "COOLDOWN" => Some(Self::Cooldown),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Readiness band for a brain score, used when a block clears.
    #[must_use]
    pub fn band_for_brain_score(brain_score: f64) -> Self {
        if brain_score >= ARMED_MIN_BRAIN_SCORE {
            Self::Armed
        } else if brain_score >= STALK_MIN_BRAIN_SCORE {
            Self::Stalk
        } else if brain_score >= WATCH_MIN_BRAIN_SCORE {
            Self::Watch
        } else {
            Self::Scan
        }
    }
}

impl Display for SetupState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Allow,
    AllowSmall,
    Block,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::AllowSmall => "ALLOW_SMALL",
            Self::Block => "BLOCK",
        }
    }
}

/// Market regime label supplied by the upstream regime classifier.
///
/// Labels outside the named set are carried through verbatim as [`Regime::Other`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendUp,
    TrendDown,
    Range,
    Expansion,
    Compression,
    RiskOff,
    #[serde(untagged)]
    Other(String),
}

impl Regime {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::TrendUp => "trend_up",
            Self::TrendDown => "trend_down",
            Self::Range => "range",
            Self::Expansion => "expansion",
            Self::Compression => "compression",
            Self::RiskOff => "risk_off",
            Self::Other(label) => label,
        }
    }
}

/// Capital flow direction from the upstream flow model; unknown labels are kept as
/// [`FlowBias::Other`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlowBias {
    Bullish,
    Bearish,
    Neutral,
    #[serde(untagged)]
    Other(String),
}

impl FlowBias {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
            Self::Other(label) => label,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ScanTick,
    DataRefresh,
    RegimeChange,
    FlowUpdate,
    SetupFormed,
    SetupInvalidated,
    TriggerHit,
    TriggerMissed,
    AlertFired,
    OrderPrepared,
    OrderSubmitted,
    EntryFilled,
    PartialFill,
    PositionClosed,
    StopHit,
    TargetHit,
    ManualOverride,
}

impl EventKind {
    pub const ALL: [Self; 17] = [
        Self::ScanTick,
        Self::DataRefresh,
        Self::RegimeChange,
        Self::FlowUpdate,
        Self::SetupFormed,
        Self::SetupInvalidated,
        Self::TriggerHit,
        Self::TriggerMissed,
        Self::AlertFired,
        Self::OrderPrepared,
        Self::OrderSubmitted,
        Self::EntryFilled,
        Self::PartialFill,
        Self::PositionClosed,
        Self::StopHit,
        Self::TargetHit,
        Self::ManualOverride,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScanTick => "scan_tick",
            Self::DataRefresh => "data_refresh",
            Self::RegimeChange => "regime_change",
            Self::FlowUpdate => "flow_update",
            Self::SetupFormed => "setup_formed",
            Self::SetupInvalidated => "setup_invalidated",
            Self::TriggerHit => "trigger_hit",
            Self::TriggerMissed => "trigger_missed",
            Self::AlertFired => "alert_fired",
            Self::OrderPrepared => "order_prepared",
            Self::OrderSubmitted => "order_submitted",
            Self::EntryFilled => "entry_filled",
            Self::PartialFill => "partial_fill",
            Self::PositionClosed => "position_closed",
            Self::StopHit => "stop_hit",
            Self::TargetHit => "target_hit",
            Self::ManualOverride => "manual_override",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Events that close a position and start a cooldown.
    #[must_use]
    pub fn is_exit(self) -> bool {
        matches!(self, Self::PositionClosed | Self::StopHit | Self::TargetHit)
    }
}

/// Identity of one live decision: `(workspace_id, symbol, playbook, direction)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SetupKey {
    pub workspace_id: String,
    pub symbol: String,
    pub playbook: String,
    pub direction: Direction,
}

impl SetupKey {
    /// Builds a key after trimming and validating each component.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidKey`] when a component is empty or
    /// contains the `:` separator.
    pub fn new(
        workspace_id: &str,
        symbol: &str,
        playbook: &str,
        direction: Direction,
    ) -> Result<Self, EngineError> {
        let key = Self {
            workspace_id: workspace_id.trim().to_string(),
            symbol: symbol.trim().to_string(),
            playbook: playbook.trim().to_string(),
            direction,
        };
        key.validate()?;
        Ok(key)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidKey`] when a component is empty or
    /// contains the `:` separator.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("workspace_id", &self.workspace_id),
            ("symbol", &self.symbol),
            ("playbook", &self.playbook),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidKey(format!("{name} MUST be provided")));
            }
            if value.contains(':') {
                return Err(EngineError::InvalidKey(format!(
                    "{name} MUST NOT contain ':'"
                )));
            }
        }
        Ok(())
    }
}

impl Display for SetupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.workspace_id,
            self.symbol,
            self.playbook,
            self.direction.as_str()
        )
    }
}

/// Parses `<workspace_id>:<symbol>:<playbook>:<direction>`.
///
/// # Errors
/// Returns [`EngineError::InvalidKey`] when the value does not have four
/// components or the direction is unknown.
pub fn parse_setup_key(raw: &str) -> Result<SetupKey, EngineError> {
    let parts = raw.split(':').collect::<Vec<_>>();
    let [workspace_id, symbol, playbook, direction_raw] = parts.as_slice() else {
        return Err(EngineError::InvalidKey(
            "key must be in <workspace_id>:<symbol>:<playbook>:<direction> format".to_string(),
        ));
    };

    let direction = Direction::parse(direction_raw).ok_or_else(|| {
        EngineError::InvalidKey(format!("unknown direction: {direction_raw}"))
    })?;

    SetupKey::new(workspace_id, symbol, playbook, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in SetupState::ALL {
            assert_eq!(SetupState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SetupState::parse("scan"), None);
    }

    #[test]
    fn there_are_seventeen_distinct_event_kinds() {
        let mut names = EventKind::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 17);
        assert_eq!(EventKind::parse("stop_hit"), Some(EventKind::StopHit));
    }

    #[test]
    fn brain_score_bands_follow_readiness_thresholds() {
        assert_eq!(SetupState::band_for_brain_score(39.9), SetupState::Scan);
        assert_eq!(SetupState::band_for_brain_score(40.0), SetupState::Watch);
        assert_eq!(SetupState::band_for_brain_score(54.0), SetupState::Watch);
        assert_eq!(SetupState::band_for_brain_score(55.0), SetupState::Stalk);
        assert_eq!(SetupState::band_for_brain_score(69.5), SetupState::Stalk);
        assert_eq!(SetupState::band_for_brain_score(70.0), SetupState::Armed);
    }

    #[test]
    fn setup_key_parses_and_displays_symmetrically() {
        let key = match parse_setup_key("ws-1:AAPL:breakout:long") {
            Ok(value) => value,
            Err(err) => panic!("expected key to parse: {err}"),
        };
        assert_eq!(key.symbol, "AAPL");
        assert_eq!(key.direction, Direction::Long);
        assert_eq!(key.to_string(), "ws-1:AAPL:breakout:long");
    }

    #[test]
    fn setup_key_rejects_malformed_input() {
        assert!(parse_setup_key("ws-1:AAPL:breakout").is_err());
        assert!(parse_setup_key("ws-1:AAPL:breakout:sideways").is_err());
        assert!(parse_setup_key(" :AAPL:breakout:long").is_err());
    }

    #[test]
    fn unknown_upstream_labels_are_carried_verbatim() {
        let regime: Regime = match serde_json::from_str("\"choppy_bull\"") {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(regime, Regime::Other("choppy_bull".to_string()));
        assert_eq!(regime.as_str(), "choppy_bull");

        let known: Regime = match serde_json::from_str("\"trend_up\"") {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(known, Regime::TrendUp);

        let bias: FlowBias = match serde_json::from_str("\"distribution_lean\"") {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(bias.as_str(), "distribution_lean");
        match serde_json::to_string(&bias) {
            Ok(raw) => assert_eq!(raw, "\"distribution_lean\""),
            Err(err) => panic!("test failure: {err}"),
        }
    }
}
