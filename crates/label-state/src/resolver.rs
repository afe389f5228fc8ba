//! Label to entity set resolution

use std::collections::BTreeSet;
use std::sync::Arc;

use ha_core::EntityId;

use crate::host::{LabelHost, Membership};

/// Read-only view of one label's membership
///
/// Nothing is cached: every call reflects the registries at call time.
#[derive(Clone)]
pub struct EntitySetResolver {
    host: Arc<dyn LabelHost>,
    label_id: String,
}

/// Difference between two resolutions
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: BTreeSet<EntityId>,
    pub removed: BTreeSet<EntityId>,
}

impl MembershipDiff {
    pub fn between(old: &BTreeSet<EntityId>, new: &BTreeSet<EntityId>) -> Self {
        Self {
            added: new.difference(old).cloned().collect(),
            removed: old.difference(new).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl EntitySetResolver {
    pub fn new(host: Arc<dyn LabelHost>, label_id: impl Into<String>) -> Self {
        Self {
            host,
            label_id: label_id.into(),
        }
    }

    pub fn label_id(&self) -> &str {
        &self.label_id
    }

    pub fn resolve(&self) -> Membership {
        self.host.entity_ids_for_label(&self.label_id)
    }

    pub fn label_name(&self) -> Option<String> {
        self.host.label_name(&self.label_id)
    }

    /// Display names in the order given, falling back to the entity ID
    pub fn entity_names<'a>(&self, entity_ids: impl IntoIterator<Item = &'a EntityId>) -> Vec<String> {
        entity_ids
            .into_iter()
            .map(|id| self.host.entity_name(id).unwrap_or_else(|| id.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<EntityId> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_diff() {
        let diff = MembershipDiff::between(
            &ids(&["sensor.a", "sensor.b"]),
            &ids(&["sensor.b", "sensor.c"]),
        );
        assert_eq!(diff.added, ids(&["sensor.c"]));
        assert_eq!(diff.removed, ids(&["sensor.a"]));

        let same = MembershipDiff::between(&ids(&["sensor.a"]), &ids(&["sensor.a"]));
        assert!(same.is_empty());
    }
}
