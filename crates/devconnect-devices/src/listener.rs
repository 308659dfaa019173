/*!
 * Event/listener manager.
 *
 * Keeps every subscription per device and capability and fans events out to
 * all of them. The first subscription for a capability starts the device's
 * polling or streaming activity through [`StreamControl`]; removing the last
 * one stops it. Later subscriptions share the running stream, so
 * [`ListenerManager::join`] refuses ones asking for other parameters.
 *
 * Listeners run outside the manager's lock. A listener that returns an error
 * or panics is logged and skipped; delivery to the others continues.
 */
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use devconnect_core::{
    event::{Capability, Event, EventPayload},
    types::{Params, ServiceId, Value},
};

use crate::device::{DeviceError, Result};
use crate::registry::RemovalHook;

/// Receives events for the capabilities it subscribed to
pub trait EventListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// A listener forwarding events into an unbounded queue
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("listener queue closed"))
    }
}

/// Identifier of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// The raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Starts and stops per-capability device activity
pub trait StreamControl: Send + Sync {
    /// Begin polling or streaming a capability
    fn start(&self, service_id: &ServiceId, capability: &Capability, params: &Params);

    /// Stop polling or streaming a capability
    fn stop(&self, service_id: &ServiceId, capability: &Capability);
}

struct Subscription {
    id: SubscriptionId,
    listener: Arc<dyn EventListener>,
    params: Params,
}

#[derive(Default)]
struct Subscriptions {
    streams: HashMap<ServiceId, HashMap<Capability, Vec<Subscription>>>,
    index: HashMap<SubscriptionId, (ServiceId, Capability)>,
}

/// Listener manager
pub struct ListenerManager {
    subscriptions: Mutex<Subscriptions>,
    next_id: AtomicU64,
    control: Option<Arc<dyn StreamControl>>,
}

impl fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerManager")
            .field("subscriptions", &self.total())
            .finish()
    }
}

impl ListenerManager {
    /// Create a manager that does not drive any device activity
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Subscriptions::default()),
            next_id: AtomicU64::new(1),
            control: None,
        }
    }

    /// Create a manager driving device activity through `control`
    pub fn with_control(control: Arc<dyn StreamControl>) -> Self {
        Self {
            control: Some(control),
            ..Self::new()
        }
    }

    /// Add a listener for a device capability
    ///
    /// The first listener for the capability starts its stream; further
    /// listeners join the running stream.
    pub fn subscribe(
        &self,
        service_id: &ServiceId,
        capability: &Capability,
        listener: Arc<dyn EventListener>,
        params: Params,
    ) -> SubscriptionId {
        let mut subs = self.lock();
        self.insert(&mut subs, service_id, capability, listener, params)
    }

    /// Add a listener, refusing to join a running stream started with other
    /// parameters
    ///
    /// Every parameter given must match the one the stream runs with. A
    /// listener giving none joins whatever runs.
    pub fn join(
        &self,
        service_id: &ServiceId,
        capability: &Capability,
        listener: Arc<dyn EventListener>,
        params: Params,
    ) -> Result<SubscriptionId> {
        let mut subs = self.lock();
        let running = subs
            .streams
            .get(service_id)
            .and_then(|device| device.get(capability))
            .and_then(|listeners| listeners.first());
        if let Some(running) = running {
            if let Some(key) = conflicting_param(&running.params, &params) {
                return Err(DeviceError::invalid_parameter(format!(
                    "{} differs from the running {} stream",
                    key, capability
                )));
            }
        }
        Ok(self.insert(&mut subs, service_id, capability, listener, params))
    }

    fn insert(
        &self,
        subs: &mut Subscriptions,
        service_id: &ServiceId,
        capability: &Capability,
        listener: Arc<dyn EventListener>,
        params: Params,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listeners = subs
            .streams
            .entry(service_id.clone())
            .or_default()
            .entry(capability.clone())
            .or_default();
        let first = listeners.is_empty();
        listeners.push(Subscription {
            id,
            listener,
            params: params.clone(),
        });
        subs.index.insert(id, (service_id.clone(), capability.clone()));

        if first {
            debug!(service_id = %service_id, capability = %capability, "Starting stream");
            if let Some(control) = &self.control {
                control.start(service_id, capability, &params);
            }
        }
        debug!(service_id = %service_id, capability = %capability, subscription = %id, "Subscribed");
        id
    }

    /// Remove one listener; returns false if it was not subscribed there
    ///
    /// Removing the last listener of a capability stops its stream.
    pub fn unsubscribe(&self, service_id: &ServiceId, capability: &Capability, id: SubscriptionId) -> bool {
        let mut subs = self.lock();

        match subs.index.get(&id) {
            Some((s, c)) if s == service_id && c == capability => {}
            _ => return false,
        }
        subs.index.remove(&id);

        let Some(device) = subs.streams.get_mut(service_id) else {
            return false;
        };
        let Some(listeners) = device.get_mut(capability) else {
            return false;
        };
        listeners.retain(|s| s.id != id);

        if listeners.is_empty() {
            device.remove(capability);
            if device.is_empty() {
                subs.streams.remove(service_id);
            }
            debug!(service_id = %service_id, capability = %capability, "Stopping stream");
            if let Some(control) = &self.control {
                control.stop(service_id, capability);
            }
        }
        true
    }

    /// Remove every listener of a device; safe when there are none
    pub fn unsubscribe_all(&self, service_id: &ServiceId) -> usize {
        let mut subs = self.lock();
        let Some(device) = subs.streams.remove(service_id) else {
            return 0;
        };

        let mut removed = 0;
        for (capability, listeners) in device {
            for s in &listeners {
                subs.index.remove(&s.id);
            }
            removed += listeners.len();
            if let Some(control) = &self.control {
                control.stop(service_id, &capability);
            }
        }
        debug!(service_id = %service_id, removed, "Removed all listeners");
        removed
    }

    /// Remove every listener of every device
    pub fn clear(&self) -> usize {
        let devices: Vec<ServiceId> = self.lock().streams.keys().cloned().collect();
        devices.iter().map(|id| self.unsubscribe_all(id)).sum()
    }

    /// Deliver a payload to every listener of a device capability
    pub fn dispatch(&self, service_id: &ServiceId, capability: &Capability, payload: EventPayload) -> usize {
        self.deliver(&Event::new(service_id.clone(), capability, payload))
    }

    /// Deliver an event to every listener of its capability, returning how
    /// many listeners accepted it
    pub fn deliver(&self, event: &Event) -> usize {
        let capability = event.capability();
        let listeners: Vec<(SubscriptionId, Arc<dyn EventListener>)> = {
            let subs = self.lock();
            match subs
                .streams
                .get(&event.service_id)
                .and_then(|device| device.get(&capability))
            {
                Some(listeners) => listeners.iter().map(|s| (s.id, s.listener.clone())).collect(),
                None => Vec::new(),
            }
        };

        if listeners.is_empty() {
            trace!(service_id = %event.service_id, capability = %capability, "No listeners for event");
            return 0;
        }

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscription = %id, capability = %capability, "Listener failed: {}", e);
                }
                Err(_) => {
                    warn!(subscription = %id, capability = %capability, "Listener panicked");
                }
            }
        }
        delivered
    }

    /// Number of listeners on a device capability
    pub fn listener_count(&self, service_id: &ServiceId, capability: &Capability) -> usize {
        self.lock()
            .streams
            .get(service_id)
            .and_then(|device| device.get(capability))
            .map_or(0, Vec::len)
    }

    /// Capabilities of a device with at least one listener, and the
    /// parameters of their first subscription
    pub fn active_streams(&self, service_id: &ServiceId) -> Vec<(Capability, Params)> {
        self.lock()
            .streams
            .get(service_id)
            .map(|device| {
                device
                    .iter()
                    .filter_map(|(cap, subs)| subs.first().map(|s| (cap.clone(), s.params.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The device and capability a subscription belongs to
    pub fn lookup(&self, id: SubscriptionId) -> Option<(ServiceId, Capability)> {
        self.lock().index.get(&id).cloned()
    }

    /// Total number of subscriptions
    pub fn total(&self) -> usize {
        self.lock().index.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The first requested parameter the running stream does not share
fn conflicting_param<'a>(running: &Params, requested: &'a Params) -> Option<&'a str> {
    requested
        .iter()
        .find(|(key, value)| match running.get(key.as_str()) {
            Some(current) => !same_value(current, value),
            None => true,
        })
        .map(|(key, _)| key.as_str())
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RemovalHook for ListenerManager {
    fn on_device_removed(&self, id: &ServiceId) {
        self.unsubscribe_all(id);
    }
}
