//! Config flow and options flow
//!
//! The config flow opens with a menu of rule types; each menu option leads
//! to a form. A valid submission creates a config entry whose options are
//! the submitted fields plus `state_type`. The options flow edits an
//! existing entry through the same form, keeping its name.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use ha_config_entries::{ConfigEntries, ConfigEntriesError, ConfigEntry};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LabelStateConfig, StateType};
use crate::constants::{
    CONFIG_VERSION, CONF_EXTREMUM, CONF_LABEL, CONF_NAME, CONF_STATE_LOWER_LIMIT, CONF_STATE_NOT,
    CONF_STATE_TO, CONF_STATE_TYPE, CONF_STATE_UPPER_LIMIT, DOMAIN,
};

/// Menu input key selecting the next step
pub const NEXT_STEP_ID: &str = "next_step_id";

const STEP_USER: &str = "user";
const STEP_INIT: &str = "init";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("config entry not found: {0}")]
    EntryNotFound(String),

    #[error(transparent)]
    ConfigEntries(#[from] ConfigEntriesError),
}

/// How a form field is edited
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    Text,
    Label,
    Number { mode: &'static str },
    Select { options: Vec<&'static str> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub selector: Selector,
}

impl FieldSpec {
    fn required(name: &'static str, selector: Selector) -> Self {
        Self {
            name,
            required: true,
            default: None,
            selector,
        }
    }

    fn optional(name: &'static str, selector: Selector) -> Self {
        Self {
            required: false,
            ..Self::required(name, selector)
        }
    }
}

/// Fields of the form for one rule type
///
/// `defaults` pre-fills fields; the options flow passes the entry's options.
pub fn form_schema(state_type: StateType, with_name: bool, defaults: &Map<String, Value>) -> Vec<FieldSpec> {
    let mut fields = Vec::new();
    if with_name {
        fields.push(FieldSpec::required(CONF_NAME, Selector::Text));
    }
    fields.push(FieldSpec::required(CONF_LABEL, Selector::Label));

    match state_type {
        StateType::State => fields.push(FieldSpec::required(CONF_STATE_TO, Selector::Text)),
        StateType::StateNot => fields.push(FieldSpec::required(CONF_STATE_NOT, Selector::Text)),
        StateType::NumericState => {
            let number = || Selector::Number { mode: "box" };
            fields.push(FieldSpec::optional(CONF_STATE_LOWER_LIMIT, number()));
            fields.push(FieldSpec::optional(CONF_STATE_UPPER_LIMIT, number()));
            fields.push(FieldSpec::optional(
                CONF_EXTREMUM,
                Selector::Select {
                    options: vec!["min", "max"],
                },
            ));
        }
    }

    for field in &mut fields {
        field.default = defaults.get(field.name).filter(|v| !v.is_null()).cloned();
    }
    fields
}

/// Outcome of a flow step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    Menu {
        flow_id: String,
        step_id: String,
        menu_options: Vec<String>,
    },
    Form {
        flow_id: String,
        step_id: String,
        data_schema: Vec<FieldSpec>,
        /// field (or `base`) -> error key
        errors: BTreeMap<String, String>,
    },
    CreateEntry {
        flow_id: String,
        entry_id: String,
        title: String,
        version: u32,
        options: Map<String, Value>,
    },
    Abort {
        flow_id: String,
        reason: String,
    },
}

impl FlowResult {
    pub fn flow_id(&self) -> &str {
        match self {
            FlowResult::Menu { flow_id, .. }
            | FlowResult::Form { flow_id, .. }
            | FlowResult::CreateEntry { flow_id, .. }
            | FlowResult::Abort { flow_id, .. } => flow_id,
        }
    }
}

#[derive(Debug, Clone)]
enum FlowHandler {
    Config,
    Options { entry_id: String },
}

#[derive(Debug, Clone)]
struct FlowState {
    handler: FlowHandler,
    step_id: String,
}

/// Flows in progress
pub struct FlowManager {
    config_entries: Arc<ConfigEntries>,
    flows: DashMap<String, FlowState>,
}

impl FlowManager {
    pub fn new(config_entries: Arc<ConfigEntries>) -> Self {
        Self {
            config_entries,
            flows: DashMap::new(),
        }
    }

    pub fn in_progress(&self) -> usize {
        self.flows.len()
    }

    /// Start a config flow at the rule type menu
    pub fn start_config_flow(&self) -> FlowResult {
        let flow_id = ulid::Ulid::new().to_string();
        self.flows.insert(
            flow_id.clone(),
            FlowState {
                handler: FlowHandler::Config,
                step_id: STEP_USER.into(),
            },
        );
        debug!(flow_id = %flow_id, "Config flow started");
        FlowResult::Menu {
            flow_id,
            step_id: STEP_USER.into(),
            menu_options: StateType::ALL.iter().map(|t| t.as_str().to_string()).collect(),
        }
    }

    /// Start an options flow for an entry, routed to its rule type form
    pub fn start_options_flow(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self.entry(entry_id)?;
        let state_type = entry_state_type(&entry)?;

        let flow_id = ulid::Ulid::new().to_string();
        self.flows.insert(
            flow_id.clone(),
            FlowState {
                handler: FlowHandler::Options {
                    entry_id: entry_id.to_string(),
                },
                step_id: state_type.as_str().into(),
            },
        );
        debug!(flow_id = %flow_id, entry_id, step = STEP_INIT, "Options flow started");
        Ok(FlowResult::Form {
            flow_id,
            step_id: state_type.as_str().into(),
            data_schema: form_schema(state_type, false, &entry.options),
            errors: BTreeMap::new(),
        })
    }

    /// Submit user input to the current step of a flow
    pub async fn configure(
        &self,
        flow_id: &str,
        input: Map<String, Value>,
    ) -> Result<FlowResult, FlowError> {
        let state = self
            .flows
            .get(flow_id)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        match state.handler {
            FlowHandler::Config if state.step_id == STEP_USER => {
                self.select_menu_option(flow_id, input).await
            }
            FlowHandler::Config => {
                let state_type = parse_step(&state.step_id)?;
                self.submit_config(flow_id, state_type, input).await
            }
            FlowHandler::Options { entry_id } => {
                let state_type = parse_step(&state.step_id)?;
                self.submit_options(flow_id, &entry_id, state_type, input)
                    .await
            }
        }
    }

    /// Abort a flow in progress
    pub fn abort(&self, flow_id: &str, reason: &str) -> Result<FlowResult, FlowError> {
        self.flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        Ok(FlowResult::Abort {
            flow_id: flow_id.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Menu step; extra fields in the input are submitted to the chosen form
    async fn select_menu_option(
        &self,
        flow_id: &str,
        mut input: Map<String, Value>,
    ) -> Result<FlowResult, FlowError> {
        let choice = input
            .remove(NEXT_STEP_ID)
            .or_else(|| input.get(CONF_STATE_TYPE).cloned())
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| FlowError::UnknownStep(NEXT_STEP_ID.into()))?;
        let state_type = parse_step(&choice)?;

        if let Some(mut flow) = self.flows.get_mut(flow_id) {
            flow.step_id = state_type.as_str().into();
        }

        input.remove(CONF_STATE_TYPE);
        if input.is_empty() {
            return Ok(FlowResult::Form {
                flow_id: flow_id.to_string(),
                step_id: state_type.as_str().into(),
                data_schema: form_schema(state_type, true, &Map::new()),
                errors: BTreeMap::new(),
            });
        }
        self.submit_config(flow_id, state_type, input).await
    }

    async fn submit_config(
        &self,
        flow_id: &str,
        state_type: StateType,
        input: Map<String, Value>,
    ) -> Result<FlowResult, FlowError> {
        let options = build_options(state_type, input);
        let config = match LabelStateConfig::from_options(&options) {
            Ok(config) => config,
            Err(e) => {
                debug!(flow_id, error = %e, "Config flow input rejected");
                return Ok(error_form(flow_id, state_type, true, &options, e.form_error()));
            }
        };

        let entry = ConfigEntry::new(DOMAIN, config.name.clone())
            .with_options(options)
            .with_version(CONFIG_VERSION, 1);
        let entry = self.config_entries.add(entry)?;
        self.flows.remove(flow_id);
        info!(entry_id = %entry.entry_id, title = %entry.title, "Config flow created entry");

        if let Err(e) = self.config_entries.setup(&entry.entry_id).await {
            warn!(entry_id = %entry.entry_id, error = %e, "Setup of new entry failed");
        }

        Ok(FlowResult::CreateEntry {
            flow_id: flow_id.to_string(),
            entry_id: entry.entry_id,
            title: entry.title,
            version: entry.version,
            options: entry.options,
        })
    }

    async fn submit_options(
        &self,
        flow_id: &str,
        entry_id: &str,
        state_type: StateType,
        input: Map<String, Value>,
    ) -> Result<FlowResult, FlowError> {
        let entry = self.entry(entry_id)?;
        let mut options = build_options(state_type, input);
        if let Some(name) = entry.options.get(CONF_NAME) {
            options.insert(CONF_NAME.into(), name.clone());
        }

        if let Err(e) = LabelStateConfig::from_options(&options) {
            debug!(flow_id, error = %e, "Options flow input rejected");
            return Ok(error_form(flow_id, state_type, false, &options, e.form_error()));
        }

        self.flows.remove(flow_id);
        let entry = match self.config_entries.update_options(entry_id, options).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::SetupRetry(reason) | ConfigEntriesError::SetupFailed(reason)) => {
                warn!(entry_id, reason = %reason, "Reload after options change failed");
                self.entry(entry_id)?
            }
            Err(e) => return Err(e.into()),
        };
        info!(entry_id, "Options updated");

        Ok(FlowResult::CreateEntry {
            flow_id: flow_id.to_string(),
            entry_id: entry.entry_id,
            title: entry.title,
            version: entry.version,
            options: entry.options,
        })
    }

    fn entry(&self, entry_id: &str) -> Result<ConfigEntry, FlowError> {
        self.config_entries
            .get(entry_id)
            .filter(|entry| entry.domain == DOMAIN)
            .ok_or_else(|| FlowError::EntryNotFound(entry_id.to_string()))
    }
}

fn parse_step(step_id: &str) -> Result<StateType, FlowError> {
    step_id
        .parse()
        .map_err(|_| FlowError::UnknownStep(step_id.to_string()))
}

fn entry_state_type(entry: &ConfigEntry) -> Result<StateType, FlowError> {
    let step = entry
        .options
        .get(CONF_STATE_TYPE)
        .and_then(Value::as_str)
        .unwrap_or_default();
    parse_step(step)
}

/// `state_type` plus every non-null submitted field
fn build_options(state_type: StateType, input: Map<String, Value>) -> Map<String, Value> {
    let mut options = Map::new();
    options.insert(CONF_STATE_TYPE.into(), Value::from(state_type.as_str()));
    for (key, value) in input {
        if value.is_null() || key == CONF_STATE_TYPE || key == NEXT_STEP_ID {
            continue;
        }
        options.insert(key, value);
    }
    options
}

fn error_form(
    flow_id: &str,
    state_type: StateType,
    with_name: bool,
    submitted: &Map<String, Value>,
    (field, error): (String, String),
) -> FlowResult {
    FlowResult::Form {
        flow_id: flow_id.to_string(),
        step_id: state_type.as_str().into(),
        data_schema: form_schema(state_type, with_name, submitted),
        errors: BTreeMap::from([(field, error)]),
    }
}
