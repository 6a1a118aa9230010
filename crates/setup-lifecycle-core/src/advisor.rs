use serde::{Deserialize, Serialize};

use crate::model::SetupState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Standby,
    SetAlert,
    PrepOrder,
    Execute,
    Manage,
    Review,
    Wait,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standby => "STANDBY",
            Self::SetAlert => "SET_ALERT",
            Self::PrepOrder => "PREP_ORDER",
            Self::Execute => "EXECUTE",
            Self::Manage => "MANAGE",
            Self::Review => "REVIEW",
            Self::Wait => "WAIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextBestAction {
    pub action: ActionKind,
    pub when: String,
    pub notes: String,
}

/// Fixed state to operator-action table.
#[must_use]
pub fn next_best_action(state: SetupState) -> NextBestAction {
    let (action, when, notes) = match state {
        SetupState::Scan => (
            ActionKind::Standby,
            "Readiness reaches WATCH",
            "No actionable edge; keep scanning.",
        ),
        SetupState::Watch => (
            ActionKind::SetAlert,
            "Capital flow confirms",
            "Set alerts at key levels and wait for flow confirmation.",
        ),
        SetupState::Stalk => (
            ActionKind::SetAlert,
            "Setup matures and flow state aligns",
            "Tighten alerts near the trigger; define invalidation.",
        ),
        SetupState::Armed => (
            ActionKind::PrepOrder,
            "Trigger condition prints",
            "Stage the order with size and stop; do not front-run the trigger.",
        ),
        SetupState::Execute => (
            ActionKind::Execute,
            "Now",
            "Trigger confirmed; enter per plan with governed size.",
        ),
        SetupState::Manage => (
            ActionKind::Manage,
            "While position is open",
            "Manage stop and targets; respect invalidation.",
        ),
        SetupState::Cooldown => (
            ActionKind::Review,
            "Cooldown window elapses",
            "Review the trade before re-engaging this setup.",
        ),
        SetupState::Blocked => (
            ActionKind::Wait,
            "Blocking gates clear",
            "Hard block in effect; no new risk.",
        ),
    };

    NextBestAction {
        action,
        when: when.to_string(),
        notes: notes.to_string(),
    }
}
