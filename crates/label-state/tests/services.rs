//! The `label_state.reset` service

mod common;

use common::harness;
use ha_core::Context;
use ha_service_registry::ServiceError;
use label_state::DOMAIN;
use serde_json::json;

const MAX_SENSOR: &str = "sensor.temperatures_max";

async fn setup_max(h: &common::Harness) {
    let label = h.label("Temperatures");
    h.entity("sensor.a", &[&label], "5");
    h.entity("sensor.b", &[&label], "10");
    h.entry(json!({
        "name": "Temperatures",
        "label": label,
        "state_type": "numeric_state",
        "state_upper_limit": 30,
        "extremum": "max",
    }))
    .await;
}

#[tokio::test]
async fn test_reset_reseeds_extremum() {
    let h = harness();
    setup_max(&h).await;
    assert!(h.hass.services.has_service(DOMAIN, "reset"));
    assert_eq!(h.state(MAX_SENSOR).as_deref(), Some("10.0"));
    assert_eq!(h.attribute(MAX_SENSOR, "extremum_entity_id"), Some(json!("sensor.b")));

    h.set_state("sensor.b", "6");
    h.block_till_done().await;
    assert_eq!(h.state(MAX_SENSOR).as_deref(), Some("10.0"));

    let response = h
        .hass
        .services
        .call(
            DOMAIN,
            "reset",
            json!({"entity_id": MAX_SENSOR}),
            Context::new(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(response, None);
    assert_eq!(h.state(MAX_SENSOR).as_deref(), Some("6.0"));
}

#[tokio::test]
async fn test_reset_accepts_entity_list() {
    let h = harness();
    setup_max(&h).await;
    h.set_state("sensor.b", "2");
    h.block_till_done().await;

    h.hass
        .services
        .call(
            DOMAIN,
            "reset",
            json!({"entity_id": [MAX_SENSOR, "binary_sensor.temperatures"]}),
            Context::new(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(h.state(MAX_SENSOR).as_deref(), Some("5.0"));
    assert_eq!(h.attribute(MAX_SENSOR, "extremum_entity_id"), Some(json!("sensor.a")));
}

#[tokio::test]
async fn test_reset_requires_target() {
    let h = harness();
    setup_max(&h).await;

    let result = h
        .hass
        .services
        .call(DOMAIN, "reset", json!({}), Context::new(), false)
        .await;
    assert!(matches!(result, Err(ServiceError::InvalidData(_))));
}

#[tokio::test]
async fn test_extremum_sensor_removed_on_unload() {
    let h = harness();
    setup_max(&h).await;
    let entry_id = h.hass.config_entries.entry_ids().remove(0);

    h.hass.config_entries.unload(&entry_id).await.unwrap();
    assert!(h.state(MAX_SENSOR).is_none());
    assert!(h.state("binary_sensor.temperatures").is_none());
}
