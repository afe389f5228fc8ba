//! Config Entries Manager
//!
//! Manages the lifecycle of configuration entries: creation, setup through a
//! per-domain [`EntryHandler`], scheduled retries, unload, reload and removal.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Setup not ready, retrying: {0}")]
    SetupRetry(String),

    #[error("Unload failed: {0}")]
    UnloadFailed(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Why an integration could not set an entry up
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupFailure {
    /// Transient; the manager schedules another attempt
    #[error("not ready: {0}")]
    NotReady(String),

    /// Permanent until the entry is reloaded
    #[error("{0}")]
    Failed(String),
}

/// Integration hooks for entries of one domain
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupFailure>;

    async fn unload_entry(&self, entry: &ConfigEntry) -> Result<(), String>;
}

/// Config Entries Manager
pub struct ConfigEntries {
    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serialises setup and unload
    setup_lock: Mutex<()>,

    handlers: DashMap<String, Arc<dyn EntryHandler>>,

    /// Pending scheduled setup retries by entry_id
    retry_tasks: DashMap<String, JoinHandle<()>>,

    this: Weak<ConfigEntries>,
}

impl ConfigEntries {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            handlers: DashMap::new(),
            retry_tasks: DashMap::new(),
            this: this.clone(),
        })
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();
        self.entries.insert(entry_id.clone(), entry.clone());
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// Add a new config entry
    pub fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Add an entry and set it up right away
    pub async fn add_and_setup(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self.add(entry)?;
        self.setup(&entry.entry_id).await?;
        self.get(&entry.entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry.entry_id.clone()))
    }

    /// Update an existing entry without reloading it
    pub fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if let Some(title) = update.title {
            entry.title = title;
        }
        if let Some(data) = update.data {
            entry.data = data;
        }
        if let Some(options) = update.options {
            entry.options = options;
        }
        entry.modified_at = Utc::now();

        debug!("Updated config entry: {}", entry_id);
        Ok(entry.clone())
    }

    /// Replace the options of an entry and reload it if it was set up
    pub async fn update_options(
        &self,
        entry_id: &str,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self.update(entry_id, ConfigEntryUpdate::new().options(options))?;
        if entry.state != ConfigEntryState::NotLoaded {
            self.reload(entry_id).await?;
        }
        self.get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }

    /// Unload (if needed) and remove an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        self.unload(entry_id).await?;
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    /// Validated state change
    fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(())
    }

    /// Register the integration hooks for a domain
    pub fn register_handler(&self, domain: &str, handler: Arc<dyn EntryHandler>) {
        self.handlers.insert(domain.to_string(), handler);
        debug!("Registered entry handler for domain: {}", domain);
    }

    fn handler_for(&self, domain: &str) -> Option<Arc<dyn EntryHandler>> {
        self.handlers.get(domain).map(|h| Arc::clone(h.value()))
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.retry_tasks.remove(entry_id) {
            task.abort();
            debug!("Cancelled scheduled setup retry for {}", entry_id);
        }
    }

    fn schedule_retry(&self, entry_id: &str, tries: u32) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let delay = calculate_retry_delay(tries.saturating_sub(1));
        info!(entry_id, ?delay, tries, "Scheduling setup retry");

        let id = entry_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_tasks.remove(&id);
            if let Err(e) = this.setup(&id).await {
                debug!(entry_id = %id, error = %e, "Setup retry did not succeed");
            }
        });
        self.retry_tasks.insert(entry_id.to_string(), task);
    }

    /// Set up an entry through its domain handler
    ///
    /// `SetupFailure::NotReady` leaves the entry in SetupRetry with a retry
    /// scheduled; `SetupFailure::Failed` leaves it in SetupError.
    #[instrument(skip(self))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(());
        }

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;

        let Some(handler) = self.handler_for(&entry.domain) else {
            self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
            debug!(
                "No entry handler for domain {}, marking as loaded",
                entry.domain
            );
            return Ok(());
        };

        match handler.setup_entry(&entry).await {
            Ok(()) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(SetupFailure::NotReady(reason)) => {
                warn!("Setup of entry {} not ready: {}", entry_id, reason);
                self.set_state(entry_id, ConfigEntryState::SetupRetry, Some(reason.clone()))?;
                let tries = self
                    .entries
                    .get_mut(entry_id)
                    .map(|mut e| e.increment_tries())
                    .unwrap_or(1);
                self.schedule_retry(entry_id, tries);
                Err(ConfigEntriesError::SetupRetry(reason))
            }
            Err(SetupFailure::Failed(reason)) => {
                warn!("Setup failed for entry {}: {}", entry_id, reason);
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason.clone()))?;
                Err(ConfigEntriesError::SetupFailed(reason))
            }
        }
    }

    /// Unload an entry
    ///
    /// Entries that never finished setup skip the handler.
    #[instrument(skip(self))]
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }
        if entry.state == ConfigEntryState::NotLoaded {
            return Ok(());
        }

        self.cancel_retry(entry_id);
        self.set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        if entry.is_loaded() {
            if let Some(handler) = self.handler_for(&entry.domain) {
                if let Err(reason) = handler.unload_entry(&entry).await {
                    warn!("Unload failed for entry {}: {}", entry_id, reason);
                    self.set_state(entry_id, ConfigEntryState::FailedUnload, Some(reason.clone()))?;
                    return Err(ConfigEntriesError::UnloadFailed(reason));
                }
            }
        }

        self.set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(())
    }

    /// Reload an entry (unload + setup)
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    /// Whether a setup retry is pending for the entry
    pub fn retry_pending(&self, entry_id: &str) -> bool {
        self.retry_tasks.contains_key(entry_id)
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set up every entry, returning one result per entry
    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<()>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }
        results
    }

    /// Unload every loaded or retrying entry
    pub async fn unload_all(&self) {
        for entry_id in self.entry_ids() {
            if let Err(e) = self.unload(&entry_id).await {
                warn!(entry_id = %entry_id, error = %e, "Failed to unload entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with NotReady until `ready_after` attempts have been made
    struct CountingHandler {
        attempts: AtomicU32,
        unloads: AtomicU32,
        ready_after: u32,
    }

    impl CountingHandler {
        fn new(ready_after: u32) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                unloads: AtomicU32::new(0),
                ready_after,
            })
        }
    }

    #[async_trait]
    impl EntryHandler for CountingHandler {
        async fn setup_entry(&self, _entry: &ConfigEntry) -> Result<(), SetupFailure> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.ready_after {
                Ok(())
            } else {
                Err(SetupFailure::NotReady("subscription refused".into()))
            }
        }

        async fn unload_entry(&self, _entry: &ConfigEntry) -> Result<(), String> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenHandler;

    #[async_trait]
    impl EntryHandler for BrokenHandler {
        async fn setup_entry(&self, _entry: &ConfigEntry) -> Result<(), SetupFailure> {
            Err(SetupFailure::Failed("bad options".into()))
        }

        async fn unload_entry(&self, _entry: &ConfigEntry) -> Result<(), String> {
            Err("should not be called".into())
        }
    }

    fn state(manager: &ConfigEntries, entry_id: &str) -> ConfigEntryState {
        manager.get(entry_id).unwrap().state
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let manager = ConfigEntries::new();
        manager
            .add(ConfigEntry::new("label_state", "A").with_unique_id("same"))
            .unwrap();
        let result = manager.add(ConfigEntry::new("label_state", "B").with_unique_id("same"));
        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.get_by_domain("label_state").len(), 1);
    }

    #[tokio::test]
    async fn test_setup_unload_remove() {
        let manager = ConfigEntries::new();
        let handler = CountingHandler::new(0);
        manager.register_handler("label_state", handler.clone());

        let entry = manager
            .add_and_setup(ConfigEntry::new("label_state", "Doors open"))
            .await
            .unwrap();
        assert!(entry.is_loaded());

        manager.reload(&entry.entry_id).await.unwrap();
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handler.unloads.load(Ordering::SeqCst), 1);

        manager.remove(&entry.entry_id).await.unwrap();
        assert_eq!(handler.unloads.load(Ordering::SeqCst), 2);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_setup_twice_rejected() {
        let manager = ConfigEntries::new();
        let entry = manager
            .add_and_setup(ConfigEntry::new("label_state", "Doors open"))
            .await
            .unwrap();
        let result = manager.setup(&entry.entry_id).await;
        assert!(matches!(
            result,
            Err(ConfigEntriesError::InvalidTransition(_))
        ));
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::Loaded);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_unload_handler() {
        let manager = ConfigEntries::new();
        manager.register_handler("label_state", Arc::new(BrokenHandler));

        let entry = manager.add(ConfigEntry::new("label_state", "Broken")).unwrap();
        let result = manager.setup(&entry.entry_id).await;
        assert!(matches!(result, Err(ConfigEntriesError::SetupFailed(_))));
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::SetupError);
        assert_eq!(
            manager.get(&entry.entry_id).unwrap().reason.as_deref(),
            Some("bad options")
        );

        manager.unload(&entry.entry_id).await.unwrap();
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::NotLoaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_is_retried() {
        let manager = ConfigEntries::new();
        let handler = CountingHandler::new(1);
        manager.register_handler("label_state", handler.clone());

        let entry = manager.add(ConfigEntry::new("label_state", "Doors open")).unwrap();
        let result = manager.setup(&entry.entry_id).await;
        assert!(matches!(result, Err(ConfigEntriesError::SetupRetry(_))));
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::SetupRetry);
        assert!(manager.retry_pending(&entry.entry_id));

        // First retry fires after ~5s
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::Loaded);
        assert!(!manager.retry_pending(&entry.entry_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_cancels_retry() {
        let manager = ConfigEntries::new();
        let handler = CountingHandler::new(u32::MAX);
        manager.register_handler("label_state", handler.clone());

        let entry = manager.add(ConfigEntry::new("label_state", "Doors open")).unwrap();
        let _ = manager.setup(&entry.entry_id).await;
        manager.unload(&entry.entry_id).await.unwrap();
        assert!(!manager.retry_pending(&entry.entry_id));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(state(&manager, &entry.entry_id), ConfigEntryState::NotLoaded);
        // Never loaded, so the unload hook did not run
        assert_eq!(handler.unloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_options_reloads() {
        let manager = ConfigEntries::new();
        let handler = CountingHandler::new(0);
        manager.register_handler("label_state", handler.clone());

        let entry = manager
            .add_and_setup(ConfigEntry::new("label_state", "Doors open"))
            .await
            .unwrap();

        let mut options = serde_json::Map::new();
        options.insert("state_to".into(), serde_json::json!("open"));
        let updated = manager
            .update_options(&entry.entry_id, options)
            .await
            .unwrap();

        assert_eq!(updated.options["state_to"], "open");
        assert!(updated.is_loaded());
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    }
}
