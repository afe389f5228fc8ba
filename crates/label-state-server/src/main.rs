//! label_state server
//!
//! Loads labels, entities and `label_state` entries from a YAML file, sets
//! the entries up and runs until interrupted.

mod config;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use ha_core::events::StateChangedData;
use label_state::{HomeAssistant, LabelStateIntegration, Manifest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

const DEFAULT_CONFIG: &str = "configuration.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let manifest = Manifest::default();
    info!(
        domain = %manifest.domain,
        min_ha_version = %manifest.min_ha_version,
        "Starting label_state"
    );

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = ServerConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let hass = HomeAssistant::new();
    let integration = LabelStateIntegration::setup(&hass);
    config.apply(&hass)?;

    let mut changes = hass.bus.subscribe_typed::<StateChangedData>();
    tokio::spawn(async move {
        while let Ok(event) = changes.recv().await {
            let data = event.data;
            match data.new_state {
                Some(state) => info!(entity_id = %data.entity_id, state = %state.state, "State changed"),
                None => info!(entity_id = %data.entity_id, "State removed"),
            }
        }
    });

    for (entry_id, result) in hass.config_entries.setup_all().await {
        if let Err(e) = result {
            warn!(entry_id = %entry_id, error = %e, "Entry not set up");
        }
    }
    info!(controllers = integration.controller_count(), "label_state is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    integration.shutdown(&hass).await;

    Ok(())
}
