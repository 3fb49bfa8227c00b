//! Filter state and status events.
//!
//! Every state transition of the manager is published to subscribers as a
//! `StatusEvent`. Callbacks run synchronously on the publishing task and must
//! not block.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterState {
    Uninitialized,
    Loading,
    Active,
    Error,
    Disabled,
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterState::Uninitialized => "uninitialized",
            FilterState::Loading => "loading",
            FilterState::Active => "active",
            FilterState::Error => "error",
            FilterState::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub state: FilterState,
    pub message: String,
    pub version: String,
}

impl StatusEvent {
    pub fn new(state: FilterState, message: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            version: version.into(),
        }
    }
}

impl Default for StatusEvent {
    fn default() -> Self {
        StatusEvent::new(FilterState::Uninitialized, "Not initialized", "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<SubscriptionId, Callback>,
}

/// Current status plus the set of subscribers.
#[derive(Default)]
pub struct StatusBus {
    current: RwLock<StatusEvent>,
    subscribers: Mutex<Subscribers>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> StatusEvent {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        let mut subs = self.lock_subscribers();
        subs.next_id += 1;
        let id = SubscriptionId(subs.next_id);
        subs.callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Subscribe with a channel instead of a callback.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock_subscribers().callbacks.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().callbacks.len()
    }

    /// Record `event` as current and deliver it to every subscriber.
    pub fn publish(&self, event: StatusEvent) {
        log::info!(
            "Filter status: {} ({}) version={:?}",
            event.state,
            event.message,
            event.version
        );

        match self.current.write() {
            Ok(mut guard) => *guard = event.clone(),
            Err(poisoned) => *poisoned.into_inner() = event.clone(),
        }

        // Callbacks may unsubscribe, so call them outside the lock
        let callbacks: Vec<Callback> = self.lock_subscribers().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
