//! Option keys, attribute names and integration metadata

/// Integration domain
pub const DOMAIN: &str = "label_state";

/// Version written on entries created by the config flow
pub const CONFIG_VERSION: u32 = 1;

/// Oldest host release the integration supports
pub const MIN_HA_VERSION: &str = "2025.11";

pub const CONF_NAME: &str = "name";
pub const CONF_LABEL: &str = "label";
pub const CONF_STATE_TYPE: &str = "state_type";
pub const CONF_STATE_TO: &str = "state_to";
pub const CONF_STATE_NOT: &str = "state_not";
pub const CONF_STATE_LOWER_LIMIT: &str = "state_lower_limit";
pub const CONF_STATE_UPPER_LIMIT: &str = "state_upper_limit";
pub const CONF_EXTREMUM: &str = "extremum";

pub const ATTR_ENTITIES: &str = "entities";
pub const ATTR_ENTITY_NAMES: &str = "entity_names";
pub const ATTR_LABEL_NAME: &str = "label_name";
pub const ATTR_STATE_TYPE: &str = "state_type";
pub const ATTR_EXTREMUM_ENTITY: &str = "extremum_entity_id";

pub const SERVICE_RESET: &str = "reset";

/// Platforms an entry publishes entities on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    BinarySensor,
    Sensor,
}

impl Platform {
    pub fn domain(self) -> &'static str {
        match self {
            Platform::BinarySensor => "binary_sensor",
            Platform::Sensor => "sensor",
        }
    }
}

/// Static description of the integration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub domain: String,
    pub name: String,
    pub config_version: u32,
    pub min_ha_version: String,
    pub platforms: Vec<Platform>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            domain: DOMAIN.to_string(),
            name: "Label State".to_string(),
            config_version: CONFIG_VERSION,
            min_ha_version: MIN_HA_VERSION.to_string(),
            platforms: vec![Platform::BinarySensor, Platform::Sensor],
        }
    }
}
