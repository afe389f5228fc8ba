//! Aggregation controller
//!
//! One controller per config entry. Host callbacks only enqueue onto an
//! unbounded channel; a single task drains it, so each notification is
//! fully processed (snapshot update, re-subscription, evaluation, publish)
//! before the next one is looked at.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use ha_core::{EntityId, EntityIdError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::binary_sensor::{self, AggregationState};
use crate::config::LabelStateConfig;
use crate::evaluator::evaluate;
use crate::host::{LabelHost, StateChange, StateChangeCallback, SubscriptionError, SubscriptionHandle};
use crate::resolver::{EntitySetResolver, MembershipDiff};
use crate::sensor::ExtremumTracker;
use crate::snapshot::SnapshotCache;

/// Controller lifecycle
///
/// ```text
/// Uninitialized → Subscribed → Active → TornDown
///                           ↘ TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Uninitialized,
    Subscribed,
    Active,
    TornDown,
}

impl ControllerPhase {
    pub fn try_transition(self, to: ControllerPhase) -> Result<ControllerPhase, ControllerError> {
        use ControllerPhase::*;

        match (self, to) {
            (Uninitialized, Subscribed)
            | (Subscribed, Active)
            | (Subscribed, TornDown)
            | (Active, TornDown) => Ok(to),
            _ => Err(ControllerError::InvalidTransition { from: self, to }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid controller transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ControllerPhase,
        to: ControllerPhase,
    },

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("cannot derive published entity id: {0}")]
    EntityId(#[from] EntityIdError),

    #[error("controller has stopped")]
    Stopped,
}

enum ControllerEvent {
    StateChanged(StateChange),
    MembershipChanged,
    Reset,
    Sync(oneshot::Sender<()>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// State owned by the controller task
struct Aggregator {
    config: LabelStateConfig,
    host: Arc<dyn LabelHost>,
    resolver: EntitySetResolver,
    phase: ControllerPhase,
    tx: mpsc::UnboundedSender<ControllerEvent>,
    snapshots: SnapshotCache,
    subscriptions: BTreeMap<EntityId, SubscriptionHandle>,
    membership: Option<SubscriptionHandle>,
    label_missing: bool,
    extremum: Option<ExtremumTracker>,
    binary_sensor_id: EntityId,
    extremum_sensor_id: Option<EntityId>,
    state_tx: watch::Sender<AggregationState>,
}

impl Aggregator {
    fn transition(&mut self, to: ControllerPhase) -> Result<(), ControllerError> {
        self.phase = self.phase.try_transition(to)?;
        trace!(entity_id = %self.binary_sensor_id, phase = ?self.phase, "Controller phase");
        Ok(())
    }

    fn state_callback(&self) -> StateChangeCallback {
        let tx = self.tx.clone();
        Box::new(move |change| {
            if tx.send(ControllerEvent::StateChanged(change)).is_err() {
                trace!("State change after controller stopped");
            }
        })
    }

    /// Register the membership listener, then resolve the label and track
    /// every member
    ///
    /// Membership changes racing the resolve are queued and re-resolved
    /// once the controller is active.
    async fn subscribe(&mut self) -> Result<(), ControllerError> {
        self.phase.try_transition(ControllerPhase::Subscribed)?;

        let tx = self.tx.clone();
        let handle = self
            .host
            .subscribe_label_membership_changed(
                self.resolver.label_id(),
                Box::new(move || {
                    if tx.send(ControllerEvent::MembershipChanged).is_err() {
                        trace!("Membership change after controller stopped");
                    }
                }),
            )
            .await?;
        self.membership = Some(handle);

        let membership = self.resolver.resolve();
        self.label_missing = membership.is_missing();
        for entity_id in membership.into_entity_ids() {
            let handle = self
                .host
                .subscribe_state_changed(&entity_id, self.state_callback())
                .await?;
            self.subscriptions.insert(entity_id.clone(), handle);
            self.snapshots.track(entity_id, None);
        }

        self.transition(ControllerPhase::Subscribed)
    }

    /// Seed snapshots from current host state and publish the first result
    fn activate(&mut self) -> Result<(), ControllerError> {
        self.transition(ControllerPhase::Active)?;

        let ids: Vec<EntityId> = self.snapshots.entity_ids().cloned().collect();
        for entity_id in &ids {
            let current = self.host.current_state(entity_id);
            self.snapshots.update(entity_id, current.as_ref());
        }
        if let Some(tracker) = &mut self.extremum {
            tracker.reset(self.snapshots.iter());
        }

        info!(
            entity_id = %self.binary_sensor_id,
            label = %self.resolver.label_id(),
            members = self.snapshots.len(),
            "Label aggregation active"
        );
        self.evaluate_and_publish();
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ControllerEvent::StateChanged(change) => self.handle_state_change(change),
                ControllerEvent::MembershipChanged => self.handle_membership_change().await,
                ControllerEvent::Reset => self.handle_reset(),
                ControllerEvent::Sync(reply) => {
                    let _ = reply.send(());
                }
                ControllerEvent::Shutdown(reply) => {
                    self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
    }

    fn handle_state_change(&mut self, change: StateChange) {
        if self.phase != ControllerPhase::Active {
            return;
        }
        if !self
            .snapshots
            .update(&change.entity_id, change.new_state.as_ref())
        {
            trace!(entity_id = %change.entity_id, "Ignoring state change of untracked entity");
            return;
        }
        if let (Some(tracker), Some(tracked)) =
            (&mut self.extremum, self.snapshots.get(&change.entity_id))
        {
            tracker.observe(tracked);
        }
        self.evaluate_and_publish();
    }

    /// Re-resolve, subscribe added members, then drop removed ones
    async fn handle_membership_change(&mut self) {
        if self.phase != ControllerPhase::Active {
            return;
        }
        let membership = self.resolver.resolve();
        self.label_missing = membership.is_missing();

        let current: BTreeSet<EntityId> = self.snapshots.entity_ids().cloned().collect();
        let diff = MembershipDiff::between(&current, &membership.into_entity_ids());
        debug!(
            entity_id = %self.binary_sensor_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            label_missing = self.label_missing,
            "Label membership changed"
        );

        for entity_id in diff.added {
            match self
                .host
                .subscribe_state_changed(&entity_id, self.state_callback())
                .await
            {
                Ok(handle) => {
                    self.subscriptions.insert(entity_id.clone(), handle);
                    let current = self.host.current_state(&entity_id);
                    self.snapshots.track(entity_id.clone(), current.as_ref());
                    if let (Some(tracker), Some(tracked)) =
                        (&mut self.extremum, self.snapshots.get(&entity_id))
                    {
                        tracker.observe(tracked);
                    }
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Cannot track new label member");
                }
            }
        }

        for entity_id in diff.removed {
            if let Some(handle) = self.subscriptions.remove(&entity_id) {
                self.host.unsubscribe(handle).await;
            }
            self.snapshots.untrack(&entity_id);
        }

        self.evaluate_and_publish();
    }

    fn handle_reset(&mut self) {
        if self.phase != ControllerPhase::Active {
            return;
        }
        match &mut self.extremum {
            Some(tracker) => {
                tracker.reset(self.snapshots.iter());
                info!(entity_id = ?self.extremum_sensor_id, value = ?tracker.value(), "Extremum reset");
                self.evaluate_and_publish();
            }
            None => debug!(entity_id = %self.binary_sensor_id, "Reset ignored without extremum"),
        }
    }

    fn evaluate_and_publish(&mut self) {
        let state = AggregationState::new(
            evaluate(&self.config.rule, self.snapshots.iter()),
            self.label_missing,
        );

        let entities = self.snapshots.entity_ids().map(ToString::to_string).collect();
        let entity_names = self.resolver.entity_names(self.snapshots.entity_ids());
        let attributes = binary_sensor::attributes(
            &self.config,
            entities,
            entity_names,
            self.resolver.label_name(),
        );
        self.host
            .publish_state(&self.binary_sensor_id, state.state_value(), attributes);

        if let (Some(entity_id), Some(tracker)) = (&self.extremum_sensor_id, &self.extremum) {
            self.host.publish_state(
                entity_id,
                &tracker.state_value(),
                tracker.attributes(&self.config.name),
            );
        }

        debug!(
            entity_id = %self.binary_sensor_id,
            state = state.state_value(),
            members = self.snapshots.len(),
            "Published aggregation"
        );
        self.state_tx.send_replace(state);
    }

    /// Drop every listener registered so far
    async fn release_subscriptions(&mut self) {
        if let Some(handle) = self.membership.take() {
            self.host.unsubscribe(handle).await;
        }
        for (_, handle) in std::mem::take(&mut self.subscriptions) {
            self.host.unsubscribe(handle).await;
        }
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.transition(ControllerPhase::TornDown) {
            warn!(error = %e, "Unexpected teardown");
            return;
        }
        self.release_subscriptions().await;
        self.snapshots.clear();

        self.host.remove_state(&self.binary_sensor_id);
        if let Some(entity_id) = &self.extremum_sensor_id {
            self.host.remove_state(entity_id);
        }
        info!(entity_id = %self.binary_sensor_id, "Label aggregation torn down");
    }
}

/// Handle to a running controller
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<AggregationState>,
    binary_sensor_id: EntityId,
    extremum_sensor_id: Option<EntityId>,
}

impl ControllerHandle {
    /// Subscribe, publish the initial state and start processing events
    ///
    /// On a subscription failure every listener registered so far is
    /// released before the error is returned.
    pub async fn start(
        host: Arc<dyn LabelHost>,
        config: LabelStateConfig,
    ) -> Result<Self, ControllerError> {
        let binary_sensor_id = config.binary_sensor_entity_id()?;
        let extremum_sensor_id = config.extremum_entity_id()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(AggregationState::new(false, false));

        let mut aggregator = Aggregator {
            resolver: EntitySetResolver::new(Arc::clone(&host), config.label.clone()),
            extremum: config.extremum.map(ExtremumTracker::new),
            config,
            host,
            phase: ControllerPhase::Uninitialized,
            tx: tx.clone(),
            snapshots: SnapshotCache::new(),
            subscriptions: BTreeMap::new(),
            membership: None,
            label_missing: false,
            binary_sensor_id: binary_sensor_id.clone(),
            extremum_sensor_id: extremum_sensor_id.clone(),
            state_tx,
        };

        if let Err(e) = aggregator.subscribe().await {
            aggregator.release_subscriptions().await;
            return Err(e);
        }
        if let Err(e) = aggregator.activate() {
            aggregator.release_subscriptions().await;
            return Err(e);
        }

        let task = tokio::spawn(aggregator.run(rx));
        Ok(Self {
            tx,
            task: Mutex::new(Some(task)),
            state,
            binary_sensor_id,
            extremum_sensor_id,
        })
    }

    pub fn binary_sensor_id(&self) -> &EntityId {
        &self.binary_sensor_id
    }

    pub fn extremum_sensor_id(&self) -> Option<&EntityId> {
        self.extremum_sensor_id.as_ref()
    }

    /// Whether `entity_id` is one of the entities this controller publishes
    pub fn publishes(&self, entity_id: &str) -> bool {
        self.binary_sensor_id.to_string() == entity_id
            || self
                .extremum_sensor_id
                .as_ref()
                .is_some_and(|id| id.to_string() == entity_id)
    }

    /// Latest published aggregation
    pub fn state(&self) -> AggregationState {
        self.state.borrow().clone()
    }

    /// Wait until everything queued before this call has been processed
    pub async fn block_till_done(&self) -> Result<(), ControllerError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(ControllerEvent::Sync(reply))
            .map_err(|_| ControllerError::Stopped)?;
        done.await.map_err(|_| ControllerError::Stopped)
    }

    /// Queue an extremum reset
    pub fn reset(&self) -> Result<(), ControllerError> {
        self.tx
            .send(ControllerEvent::Reset)
            .map_err(|_| ControllerError::Stopped)
    }

    /// Unsubscribe everything, remove published states and stop the task
    ///
    /// Calling it again after the controller stopped is a no-op.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        let Some(task) = task else {
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        self.tx
            .send(ControllerEvent::Shutdown(Some(reply)))
            .map_err(|_| ControllerError::Stopped)?;
        done.await.map_err(|_| ControllerError::Stopped)?;
        let _ = task.await;
        Ok(())
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        let running = self
            .task
            .get_mut()
            .map(|task| task.take().is_some())
            .unwrap_or(false);
        if running {
            let _ = self.tx.send(ControllerEvent::Shutdown(None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::hass::HomeAssistant;
    use crate::host::{HassHost, Membership, MembershipCallback};
    use async_trait::async_trait;
    use ha_core::State;
    use ha_registries::EntityRegistry;
    use serde_json::Value;
    use std::collections::HashMap;

    #[test]
    fn test_phase_transitions() {
        use ControllerPhase::*;

        assert_eq!(Uninitialized.try_transition(Subscribed).unwrap(), Subscribed);
        assert_eq!(Subscribed.try_transition(Active).unwrap(), Active);
        assert_eq!(Active.try_transition(TornDown).unwrap(), TornDown);
        assert_eq!(Subscribed.try_transition(TornDown).unwrap(), TornDown);

        assert!(Uninitialized.try_transition(Active).is_err());
        assert!(Active.try_transition(Subscribed).is_err());
        assert!(TornDown.try_transition(Active).is_err());
        assert!(matches!(
            TornDown.try_transition(TornDown),
            Err(ControllerError::InvalidTransition { .. })
        ));
    }

    fn config(label: &str) -> LabelStateConfig {
        LabelStateConfig {
            name: "Doors open".into(),
            label: label.into(),
            rule: RuleConfig::StateMatch {
                target_state: "on".into(),
            },
            extremum: None,
        }
    }

    #[tokio::test]
    async fn test_missing_label_is_unavailable() {
        let hass = HomeAssistant::new();
        let handle = ControllerHandle::start(hass.host(), config("doors"))
            .await
            .unwrap();

        assert!(handle.state().label_missing);
        assert_eq!(
            hass.states.get_state("binary_sensor.doors_open").as_deref(),
            Some("unavailable")
        );

        hass.registries.labels.create("Doors").unwrap();
        handle.block_till_done().await.unwrap();
        assert_eq!(
            hass.states.get_state("binary_sensor.doors_open").as_deref(),
            Some("off")
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_listeners_and_state() {
        let hass = HomeAssistant::new();
        let host = hass.host();
        hass.registries.labels.create("Doors").unwrap();
        hass.registries
            .entities
            .get_or_create("demo", "binary_sensor.front", None, None);
        hass.registries
            .entities
            .set_labels("binary_sensor.front", ["doors"])
            .unwrap();

        let handle = ControllerHandle::start(host.clone(), config("doors"))
            .await
            .unwrap();
        assert_eq!(host.subscription_count(), 2);

        handle.shutdown().await.unwrap();
        assert_eq!(host.subscription_count(), 0);
        assert!(hass.states.get("binary_sensor.doors_open").is_none());
    }

    /// Labels an entity while the membership subscription is in flight
    struct RelabelingHost {
        inner: Arc<HassHost>,
        entities: Arc<EntityRegistry>,
        entity_id: &'static str,
        label_id: &'static str,
        after_subscribe: bool,
    }

    impl RelabelingHost {
        fn relabel(&self) {
            self.entities
                .set_labels(self.entity_id, [self.label_id])
                .unwrap();
        }
    }

    #[async_trait]
    impl LabelHost for RelabelingHost {
        fn entity_ids_for_label(&self, label_id: &str) -> Membership {
            self.inner.entity_ids_for_label(label_id)
        }

        async fn subscribe_state_changed(
            &self,
            entity_id: &EntityId,
            callback: StateChangeCallback,
        ) -> Result<SubscriptionHandle, SubscriptionError> {
            self.inner.subscribe_state_changed(entity_id, callback).await
        }

        async fn subscribe_label_membership_changed(
            &self,
            label_id: &str,
            callback: MembershipCallback,
        ) -> Result<SubscriptionHandle, SubscriptionError> {
            if !self.after_subscribe {
                self.relabel();
            }
            tokio::task::yield_now().await;
            let handle = self
                .inner
                .subscribe_label_membership_changed(label_id, callback)
                .await?;
            if self.after_subscribe {
                self.relabel();
            }
            Ok(handle)
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

    #[tokio::test]
    async fn test_member_labelled_during_startup_is_tracked() {
        for after_subscribe in [false, true] {
            let hass = HomeAssistant::new();
            hass.registries.labels.create("Doors").unwrap();
            hass.registries
                .entities
                .get_or_create("demo", "binary_sensor.front", None, None);
            hass.states.set(
                "binary_sensor.front".parse().unwrap(),
                "on",
                HashMap::new(),
                ha_core::Context::new(),
            );

            let host = Arc::new(RelabelingHost {
                inner: hass.host(),
                entities: hass.registries.entities.clone(),
                entity_id: "binary_sensor.front",
                label_id: "doors",
                after_subscribe,
            });
            let handle = ControllerHandle::start(host, config("doors")).await.unwrap();
            handle.block_till_done().await.unwrap();

            assert_eq!(
                hass.states.get_state("binary_sensor.doors_open").as_deref(),
                Some("on"),
                "after_subscribe = {after_subscribe}"
            );
            assert_eq!(hass.host().subscription_count(), 2);
            handle.shutdown().await.unwrap();
        }
    }
}
