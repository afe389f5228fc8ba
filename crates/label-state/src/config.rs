//! Entry configuration
//!
//! Entry options are parsed once into a [`LabelStateConfig`] whose
//! [`RuleConfig`] selects the predicate. The wire keys are the option keys
//! written by the config flow.

use std::fmt;
use std::str::FromStr;

use ha_core::{slugify, EntityId, EntityIdError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::{
    CONF_LABEL, CONF_NAME, CONF_STATE_LOWER_LIMIT, CONF_STATE_TYPE, CONF_STATE_UPPER_LIMIT,
};

/// Why a set of options cannot configure an entry
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("an upper or lower limit must be set")]
    UpperOrLowerRequired,

    #[error("a state must be specified")]
    StateRequired,

    #[error("missing required option: {0}")]
    MissingField(&'static str),

    #[error("invalid option {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("extremum tracking requires the numeric_state rule")]
    ExtremumRequiresNumeric,
}

impl ConfigValidationError {
    /// Form error as `(field, error key)`; `base` for form-wide errors
    pub fn form_error(&self) -> (String, String) {
        match self {
            Self::UpperOrLowerRequired => ("base".into(), "upper_or_lower_required".into()),
            Self::StateRequired => ("base".into(), "state_required".into()),
            Self::MissingField(field) => ((*field).into(), "required".into()),
            Self::InvalidField { field, .. } => (field.clone(), "invalid".into()),
            Self::ExtremumRequiresNumeric => ("base".into(), "extremum_requires_numeric".into()),
        }
    }
}

/// The `state_type` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    #[serde(rename = "numeric_state")]
    NumericState,
    #[serde(rename = "state")]
    State,
    #[serde(rename = "state_not")]
    StateNot,
}

impl StateType {
    /// Menu order of the config flow
    pub const ALL: [StateType; 3] = [StateType::NumericState, StateType::State, StateType::StateNot];

    pub fn as_str(self) -> &'static str {
        match self {
            StateType::NumericState => "numeric_state",
            StateType::State => "state",
            StateType::StateNot => "state_not",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigValidationError::InvalidField {
                field: CONF_STATE_TYPE.into(),
                reason: format!("unknown state type {s:?}"),
            })
    }
}

/// Aggregation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state_type")]
pub enum RuleConfig {
    /// On when any member is in `target_state`
    #[serde(rename = "state")]
    StateMatch {
        #[serde(rename = "state_to", default)]
        target_state: String,
    },

    /// On when any member is not in `excluded_state`
    #[serde(rename = "state_not")]
    StateNotMatch {
        #[serde(rename = "state_not", default)]
        excluded_state: String,
    },

    /// On when any numeric member is below `lower_limit` or above `upper_limit`
    #[serde(rename = "numeric_state")]
    NumericRange {
        #[serde(
            rename = "state_lower_limit",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        lower_limit: Option<f64>,
        #[serde(
            rename = "state_upper_limit",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        upper_limit: Option<f64>,
    },
}

impl RuleConfig {
    pub fn state_type(&self) -> StateType {
        match self {
            RuleConfig::StateMatch { .. } => StateType::State,
            RuleConfig::StateNotMatch { .. } => StateType::StateNot,
            RuleConfig::NumericRange { .. } => StateType::NumericState,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        match self {
            RuleConfig::StateMatch { target_state: s }
            | RuleConfig::StateNotMatch { excluded_state: s } => {
                if s.is_empty() {
                    return Err(ConfigValidationError::StateRequired);
                }
            }
            RuleConfig::NumericRange {
                lower_limit,
                upper_limit,
            } => match (lower_limit, upper_limit) {
                (None, None) => return Err(ConfigValidationError::UpperOrLowerRequired),
                (Some(lower), Some(upper)) if lower > upper => {
                    return Err(ConfigValidationError::InvalidField {
                        field: CONF_STATE_LOWER_LIMIT.into(),
                        reason: format!("lower limit {lower} exceeds upper limit {upper}"),
                    })
                }
                _ => {}
            },
        }
        Ok(())
    }
}

/// Which extremum the value sensor follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extremum {
    Min,
    Max,
}

impl Extremum {
    pub fn as_str(self) -> &'static str {
        match self {
            Extremum::Min => "min",
            Extremum::Max => "max",
        }
    }

    /// Whether `value` replaces `current`
    pub fn beats(self, current: Option<f64>, value: f64) -> bool {
        match (self, current) {
            (_, None) => true,
            (Extremum::Min, Some(c)) => value < c,
            (Extremum::Max, Some(c)) => value > c,
        }
    }
}

/// Validated options of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelStateConfig {
    pub name: String,
    /// Label ID
    pub label: String,
    #[serde(flatten)]
    pub rule: RuleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extremum: Option<Extremum>,
}

impl LabelStateConfig {
    /// Parse and validate entry options
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, ConfigValidationError> {
        for key in [CONF_NAME, CONF_LABEL, CONF_STATE_TYPE] {
            match options.get(key) {
                None | Some(Value::Null) => return Err(ConfigValidationError::MissingField(key)),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(ConfigValidationError::MissingField(key))
                }
                _ => {}
            }
        }
        if let Some(state_type) = options.get(CONF_STATE_TYPE).and_then(Value::as_str) {
            state_type.parse::<StateType>()?;
        }

        let config: LabelStateConfig = serde_json::from_value(Value::Object(options.clone()))
            .map_err(|e| ConfigValidationError::InvalidField {
                field: invalid_field_hint(options),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if slugify(&self.name).is_empty() {
            return Err(ConfigValidationError::InvalidField {
                field: CONF_NAME.into(),
                reason: "name must contain letters or digits".into(),
            });
        }
        self.rule.validate()?;
        if self.extremum.is_some() && self.rule.state_type() != StateType::NumericState {
            return Err(ConfigValidationError::ExtremumRequiresNumeric);
        }
        Ok(())
    }

    /// Options as written to a config entry
    pub fn to_options(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn state_type(&self) -> StateType {
        self.rule.state_type()
    }

    /// `binary_sensor.<slug(name)>`
    pub fn binary_sensor_entity_id(&self) -> Result<EntityId, EntityIdError> {
        EntityId::new("binary_sensor", slugify(&self.name))
    }

    /// `sensor.<slug(name)>_<min|max>` when extremum tracking is on
    pub fn extremum_entity_id(&self) -> Result<Option<EntityId>, EntityIdError> {
        self.extremum
            .map(|e| EntityId::new("sensor", format!("{}_{}", slugify(&self.name), e.as_str())))
            .transpose()
    }
}

/// Best guess at which numeric option failed to parse
fn invalid_field_hint(options: &Map<String, Value>) -> String {
    [CONF_STATE_LOWER_LIMIT, CONF_STATE_UPPER_LIMIT]
        .into_iter()
        .find(|key| matches!(options.get(*key), Some(v) if !v.is_number() && !v.is_null()))
        .unwrap_or("options")
        .to_string()
}
