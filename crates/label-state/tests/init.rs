//! Entry setup, reload, removal and setup retry

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{harness, object};
use ha_config_entries::{ConfigEntriesError, ConfigEntry, ConfigEntryState};
use ha_core::{EntityId, State};
use label_state::host::{MembershipCallback, StateChangeCallback};
use label_state::{
    HassHost, HomeAssistant, LabelHost, LabelStateIntegration, Membership, SubscriptionError,
    SubscriptionHandle, DOMAIN,
};
use serde_json::{json, Value};

fn options(label: &str) -> Value {
    json!({
        "name": "Doors open",
        "label": label,
        "state_type": "state",
        "state_to": "on",
    })
}

#[tokio::test]
async fn test_setup_and_remove_entry() {
    let h = harness();
    let label = h.label("Doors");
    h.entity("binary_sensor.front", &[&label], "on");

    let entry = h.entry(options(&label)).await;
    assert_eq!(entry.state, ConfigEntryState::Loaded);
    assert_eq!(h.integration.controller_count(), 1);
    assert_eq!(h.state("binary_sensor.doors_open").as_deref(), Some("on"));
    assert_eq!(h.hass.host().subscription_count(), 2);

    h.hass.config_entries.remove(&entry.entry_id).await.unwrap();
    assert!(h.hass.config_entries.get(&entry.entry_id).is_none());
    assert_eq!(h.integration.controller_count(), 0);
    assert_eq!(h.hass.host().subscription_count(), 0);
    assert!(h.state("binary_sensor.doors_open").is_none());

    h.set_state("binary_sensor.front", "off");
    assert!(h.state("binary_sensor.doors_open").is_none());
}

#[tokio::test]
async fn test_integration_shutdown() {
    let h = harness();
    let label = h.label("Doors");
    h.entity("binary_sensor.front", &[&label], "on");
    let entry = h.entry(options(&label)).await;
    assert!(h.hass.services.has_service(DOMAIN, "reset"));

    h.integration.shutdown(&h.hass).await;
    assert_eq!(
        h.hass.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::NotLoaded
    );
    assert_eq!(h.integration.controller_count(), 0);
    assert!(!h.hass.services.has_service(DOMAIN, "reset"));
    assert!(h.state("binary_sensor.doors_open").is_none());
}

#[tokio::test]
async fn test_reload_entry() {
    let h = harness();
    let label = h.label("Doors");
    h.entity("binary_sensor.front", &[&label], "off");
    let entry = h.entry(options(&label)).await;
    assert_eq!(h.state("binary_sensor.doors_open").as_deref(), Some("off"));

    h.hass.config_entries.reload(&entry.entry_id).await.unwrap();
    h.block_till_done().await;
    assert_eq!(
        h.hass.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::Loaded
    );
    assert_eq!(h.integration.controller_count(), 1);
    assert_eq!(h.hass.host().subscription_count(), 2);

    h.set_state("binary_sensor.front", "on");
    h.block_till_done().await;
    assert_eq!(h.state("binary_sensor.doors_open").as_deref(), Some("on"));
}

#[tokio::test]
async fn test_invalid_options_fail_setup() {
    let h = harness();
    let entry = ConfigEntry::new(DOMAIN, "Broken").with_options(object(json!({
        "name": "Broken",
        "label": "doors",
        "state_type": "numeric_state",
    })));
    let entry = h.hass.config_entries.add(entry).unwrap();

    let result = h.hass.config_entries.setup(&entry.entry_id).await;
    assert!(matches!(result, Err(ConfigEntriesError::SetupFailed(_))));
    assert_eq!(
        h.hass.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::SetupError
    );
    assert!(!h.hass.config_entries.retry_pending(&entry.entry_id));
    assert_eq!(h.integration.controller_count(), 0);
}

/// Refuses the first `failures` state subscriptions
struct FlakyHost {
    inner: Arc<HassHost>,
    failures: AtomicU32,
}

#[async_trait]
impl LabelHost for FlakyHost {
    fn entity_ids_for_label(&self, label_id: &str) -> Membership {
        self.inner.entity_ids_for_label(label_id)
    }

    async fn subscribe_state_changed(
        &self,
        entity_id: &EntityId,
        callback: StateChangeCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SubscriptionError::Refused("not ready".into()));
        }
        self.inner.subscribe_state_changed(entity_id, callback).await
    }

    async fn subscribe_label_membership_changed(
        &self,
        label_id: &str,
        callback: MembershipCallback,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        self.inner
            .subscribe_label_membership_changed(label_id, callback)
            .await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.unsubscribe(handle).await
    }

    fn current_state(&self, entity_id: &EntityId) -> Option<State> {
        self.inner.current_state(entity_id)
    }

    fn publish_state(&self, entity_id: &EntityId, value: &str, attributes: HashMap<String, Value>) {
        self.inner.publish_state(entity_id, value, attributes)
    }

    fn remove_state(&self, entity_id: &EntityId) {
        self.inner.remove_state(entity_id)
    }

    fn label_name(&self, label_id: &str) -> Option<String> {
        self.inner.label_name(label_id)
    }

    fn entity_name(&self, entity_id: &EntityId) -> Option<String> {
        self.inner.entity_name(entity_id)
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscription_failure_retries_setup() {
    let hass = HomeAssistant::new();
    let host = Arc::new(FlakyHost {
        inner: hass.host(),
        failures: AtomicU32::new(1),
    });
    let integration = LabelStateIntegration::new(host);
    hass.config_entries
        .register_handler(DOMAIN, integration.clone());

    let label = hass.registries.labels.create("Doors").unwrap().id.clone();
    hass.registries
        .entities
        .get_or_create("test", "binary_sensor.front", Some("front"), None);
    hass.registries
        .entities
        .set_labels("binary_sensor.front", [label.as_str()])
        .unwrap();

    let entry = ConfigEntry::new(DOMAIN, "Doors open").with_options(object(options(&label)));
    let entry = hass.config_entries.add(entry).unwrap();

    let result = hass.config_entries.setup(&entry.entry_id).await;
    assert!(matches!(result, Err(ConfigEntriesError::SetupRetry(_))));
    let retrying = hass.config_entries.get(&entry.entry_id).unwrap();
    assert_eq!(retrying.state, ConfigEntryState::SetupRetry);
    assert_eq!(retrying.tries, 1);
    assert!(hass.config_entries.retry_pending(&entry.entry_id));
    assert_eq!(hass.host().subscription_count(), 0);
    assert_eq!(integration.controller_count(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(
        hass.config_entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::Loaded
    );
    assert_eq!(integration.controller_count(), 1);
    assert_eq!(hass.states.get_state("binary_sensor.doors_open").as_deref(), Some("off"));
}
