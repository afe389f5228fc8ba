//! Event bus with typed pub/sub
//!
//! Two delivery styles share one bus:
//! - broadcast receivers (`subscribe*`), consumed asynchronously
//! - callback listeners (`listen*`), invoked synchronously inside `fire`
//!   in registration order and removable by [`ListenerId`]
//!
//! Callback listeners are what entity trackers build on: once
//! `remove_listener` returns, the callback is never invoked again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, EventType};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A unique identifier for a callback listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Callback invoked for every matching event
pub type EventCallback = Arc<dyn Fn(&Event<serde_json::Value>) + Send + Sync>;

struct CallbackListener {
    event_type: EventType,
    callback: EventCallback,
}

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    /// Map of event types to their broadcast senders
    channels: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    /// Sender for MATCH_ALL subscribers
    match_all_sender: broadcast::Sender<Event<serde_json::Value>>,
    /// Callback listeners, ordered by registration
    callbacks: RwLock<BTreeMap<ListenerId, CallbackListener>>,
    next_listener_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            match_all_sender,
            callbacks: RwLock::new(BTreeMap::new()),
            next_listener_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event, receiving parsed payloads
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<serde_json::Value>> {
        self.match_all_sender.subscribe()
    }

    /// Register a callback for an event type (or `*` for all events)
    pub fn listen(
        &self,
        event_type: impl Into<EventType>,
        callback: impl Fn(&Event<serde_json::Value>) + Send + Sync + 'static,
    ) -> ListenerId {
        let event_type = event_type.into();
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        debug!(event_type = %event_type, listener = id.0, "Adding callback listener");

        match self.callbacks.write() {
            Ok(mut callbacks) => {
                callbacks.insert(
                    id,
                    CallbackListener {
                        event_type,
                        callback: Arc::new(callback),
                    },
                );
            }
            Err(_) => warn!(listener = id.0, "Callback table poisoned, listener dropped"),
        }
        id
    }

    /// Register a callback receiving parsed payloads of a typed event
    ///
    /// Events whose data does not parse as `T` are skipped.
    pub fn listen_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
        callback: impl Fn(Event<T>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listen(T::event_type(), move |event| {
            match serde_json::from_value::<T>(event.data.clone()) {
                Ok(data) => callback(event.clone().map(|_| data)),
                Err(e) => trace!(error = %e, "Skipping event with unexpected payload"),
            }
        })
    }

    /// Remove a callback listener; returns false if it was already gone
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self
            .callbacks
            .write()
            .map(|mut callbacks| callbacks.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(listener = id.0, "Removed callback listener");
        }
        removed
    }

    /// Fire an event
    ///
    /// Delivered to callback listeners of the type (and `*`) first, then to
    /// broadcast subscribers of the type and to MATCH_ALL subscribers.
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        // Snapshot so callbacks may add or remove listeners without deadlocking
        let matching: Vec<EventCallback> = self
            .callbacks
            .read()
            .map(|callbacks| {
                callbacks
                    .values()
                    .filter(|l| l.event_type == event.event_type || l.event_type.is_match_all())
                    .map(|l| Arc::clone(&l.callback))
                    .collect()
            })
            .unwrap_or_default();

        for callback in matching {
            callback(&event);
        }

        if let Some(sender) = self.channels.get(&event.event_type) {
            // Send errors only mean there are no active receivers
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all_sender.send(event);
    }

    /// Fire a typed event
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context).map(|d| serde_json::to_value(&d).unwrap_or_default());
        self.fire(event);
    }

    /// Number of registered callback listeners
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for typed events
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose payload parses as `T`
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map(|_| data));
            }
        }
    }
}
