use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Velocity {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DecayLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StateMomentum {
    pub velocity: Velocity,
    pub decay: DecayLevel,
    pub state_age_minutes: f64,
}

const FAST_MAX_MINUTES: f64 = 10.0;
const MEDIUM_MAX_MINUTES: f64 = 45.0;

/// Classifies how long a setup has held its current state.
#[must_use]
pub fn classify_momentum(state_age_minutes: f64) -> StateMomentum {
    let (velocity, decay) = if state_age_minutes <= FAST_MAX_MINUTES {
        (Velocity::Fast, DecayLevel::Low)
    } else if state_age_minutes <= MEDIUM_MAX_MINUTES {
        (Velocity::Medium, DecayLevel::Medium)
    } else {
        (Velocity::Slow, DecayLevel::High)
    };

    StateMomentum {
        velocity,
        decay,
        state_age_minutes,
    }
}
