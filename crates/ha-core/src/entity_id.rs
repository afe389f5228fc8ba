//! Entity ID type representing a domain.object_id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("object_id cannot be empty")]
    EmptyObjectId,

    #[error("domain must be lowercase alphanumeric with inner underscores, no '__'")]
    InvalidDomainChars,

    #[error("object_id must be lowercase alphanumeric with inner underscores")]
    InvalidObjectIdChars,
}

/// An entity ID such as `binary_sensor.doors_open`
///
/// Ordered by domain, then object ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Create a new EntityId from domain and object_id parts
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if domain.is_empty() {
            return Err(EntityIdError::EmptyDomain);
        }
        if object_id.is_empty() {
            return Err(EntityIdError::EmptyObjectId);
        }
        if domain.contains("__") || !is_slug_part(&domain) {
            return Err(EntityIdError::InvalidDomainChars);
        }
        if !is_slug_part(&object_id) {
            return Err(EntityIdError::InvalidObjectIdChars);
        }

        Ok(Self { domain, object_id })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

/// `(?!_)[\da-z_]+(?<!_)`
fn is_slug_part(s: &str) -> bool {
    !s.starts_with('_')
        && !s.ends_with('_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, object_id)) if !object_id.contains('.') => Self::new(domain, object_id),
            _ => Err(EntityIdError::InvalidFormat),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sensor_id() {
        let id: EntityId = "sensor.test_1".parse().unwrap();
        assert_eq!(id.domain(), "sensor");
        assert_eq!(id.object_id(), "test_1");
        assert_eq!(id.to_string(), "sensor.test_1");
    }

    #[test]
    fn test_rejects_bad_separators() {
        assert_eq!(
            "binary_sensor".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            "a.b.c".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            ".doors".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyDomain
        );
        assert_eq!(
            "sensor.".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyObjectId
        );
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert_eq!(
            "Sensor.x".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidDomainChars
        );
        assert_eq!(
            "binary__sensor.x".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidDomainChars
        );
        assert_eq!(
            "sensor._x".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidObjectIdChars
        );
        // Double underscore is allowed in the object_id
        assert!("sensor.a__b".parse::<EntityId>().is_ok());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut ids: Vec<EntityId> = ["sensor.b", "binary_sensor.z", "sensor.a"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["binary_sensor.z", "sensor.a", "sensor.b"]);
    }

    #[test]
    fn test_serde_as_string() {
        let id = EntityId::new("sensor", "test_2").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sensor.test_2\"");
        assert_eq!(serde_json::from_str::<EntityId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<EntityId>("\"nope\"").is_err());
    }
}
