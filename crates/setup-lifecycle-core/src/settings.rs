use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EngineError;

pub const MAX_COOLDOWN_MINUTES: u32 = 10_080;
pub const MAX_CONFLICT_RETRIES: u32 = 10;

/// Tunable engine behaviour. Readiness thresholds and decay windows are
/// fixed constants, not settings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineSettings {
    pub settings_version: u32,
    /// Append a transition row even when the state did not change.
    pub append_unchanged_transitions: bool,
    pub cooldown_minutes: u32,
    pub max_conflict_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::v1()
    }
}

impl EngineSettings {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            settings_version: 1,
            append_unchanged_transitions: true,
            cooldown_minutes: 30,
            max_conflict_retries: 3,
        }
    }

    /// # Errors
    /// Returns [`EngineError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.settings_version == 0 {
            return Err(EngineError::Configuration(
                "settings_version MUST be >= 1".to_string(),
            ));
        }

        if !(1..=MAX_COOLDOWN_MINUTES).contains(&self.cooldown_minutes) {
            return Err(EngineError::Configuration(format!(
                "cooldown_minutes MUST be in [1, {MAX_COOLDOWN_MINUTES}]"
            )));
        }

        if self.max_conflict_retries > MAX_CONFLICT_RETRIES {
            return Err(EngineError::Configuration(format!(
                "max_conflict_retries MUST be <= {MAX_CONFLICT_RETRIES}"
            )));
        }

        Ok(())
    }

    /// Reads settings from JSON; absent fields fall back to [`Self::v1`].
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when the payload is not an
    /// object, a field has the wrong type, or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let object = value.as_object().ok_or_else(|| {
            EngineError::Configuration("settings payload MUST be a JSON object".to_string())
        })?;

        let defaults = Self::v1();
        let settings = Self {
            settings_version: read_u32(object, "settings_version", defaults.settings_version)?,
            append_unchanged_transitions: read_bool(
                object,
                "append_unchanged_transitions",
                defaults.append_unchanged_transitions,
            )?,
            cooldown_minutes: read_u32(object, "cooldown_minutes", defaults.cooldown_minutes)?,
            max_conflict_retries: read_u32(
                object,
                "max_conflict_retries",
                defaults.max_conflict_retries,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn read_u32(
    object: &serde_json::Map<String, Value>,
    field: &str,
    default: u32,
) -> Result<u32, EngineError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .ok_or_else(|| {
                EngineError::Configuration(format!("{field} MUST be a non-negative integer"))
            }),
    }
}

fn read_bool(
    object: &serde_json::Map<String, Value>,
    field: &str,
    default: bool,
) -> Result<bool, EngineError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(EngineError::Configuration(format!(
            "{field} MUST be a boolean"
        ))),
    }
}
