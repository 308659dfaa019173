/*!
 * Client event sessions.
 *
 * A session binds one client to one plugin subscription. Events reaching
 * the session's listener are rewritten with the composite service id and
 * published as [`Delivery`] items on the manager's delivery bus.
 */
use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use devconnect_core::{
    event::{Capability, Event, SharedEventBus},
    types::ServiceId,
};
use devconnect_devices::{EventListener, SubscriptionId};

use crate::address::ServiceAddress;

/// Identifier of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One client registration for an event
#[derive(Debug, Clone, PartialEq)]
pub struct EventSession {
    /// Session id
    pub id: SessionId,
    /// Client that registered
    pub client_id: String,
    /// Plugin serving the event
    pub plugin_id: String,
    /// Device id local to the plugin
    pub service_id: ServiceId,
    /// Event capability
    pub capability: Capability,
    /// Subscription held with the plugin
    pub subscription: SubscriptionId,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

impl EventSession {
    fn is_for(&self, client_id: &str, plugin_id: &str, service_id: &ServiceId, capability: &Capability) -> bool {
        self.client_id == client_id
            && self.plugin_id == plugin_id
            && self.service_id == *service_id
            && self.capability == *capability
    }
}

/// An event on its way to a client
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Receiving client
    pub client_id: String,
    /// Session the event belongs to
    pub session_id: SessionId,
    /// The event, carrying the composite service id
    pub event: Event,
}

/// All sessions of a manager
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<Vec<EventSession>>,
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session
    pub fn add(&self, session: EventSession) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }

    /// Find the session of a client for an event
    pub fn find(
        &self,
        client_id: &str,
        plugin_id: &str,
        service_id: &ServiceId,
        capability: &Capability,
    ) -> Option<EventSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.is_for(client_id, plugin_id, service_id, capability))
            .cloned()
    }

    /// Remove the session of a client for an event
    pub fn remove_matching(
        &self,
        client_id: &str,
        plugin_id: &str,
        service_id: &ServiceId,
        capability: &Capability,
    ) -> Option<EventSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let index = sessions
            .iter()
            .position(|s| s.is_for(client_id, plugin_id, service_id, capability))?;
        Some(sessions.remove(index))
    }

    /// Remove every session of a client
    pub fn remove_client(&self, client_id: &str) -> Vec<EventSession> {
        self.drain_where(|s| s.client_id == client_id)
    }

    /// Remove every session served by a plugin
    pub fn remove_plugin(&self, plugin_id: &str) -> Vec<EventSession> {
        self.drain_where(|s| s.plugin_id == plugin_id)
    }

    /// Remove every session
    pub fn clear(&self) -> Vec<EventSession> {
        self.drain_where(|_| true)
    }

    /// Sessions of a client
    pub fn for_client(&self, client_id: &str) -> Vec<EventSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain_where<F: Fn(&EventSession) -> bool>(&self, pred: F) -> Vec<EventSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let (removed, kept): (Vec<_>, Vec<_>) = sessions.drain(..).partition(|s| pred(s));
        *sessions = kept;
        removed
    }
}

/// Plugin listener forwarding events to one client session
pub(crate) struct SessionListener {
    pub(crate) client_id: String,
    pub(crate) session_id: SessionId,
    pub(crate) address: ServiceAddress,
    pub(crate) domain: String,
    pub(crate) deliveries: SharedEventBus<Delivery>,
}

impl EventListener for SessionListener {
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        let mut event = event.clone();
        event.service_id = self.address.compose(&self.domain);
        let receivers = self.deliveries.publish(Delivery {
            client_id: self.client_id.clone(),
            session_id: self.session_id,
            event,
        });
        trace!(client = %self.client_id, session = %self.session_id, receivers, "Event delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use devconnect_core::event::{EventBus, EventPayload};

    fn session(client: &str, plugin: &str, device: &str, attribute: &str, n: u64) -> EventSession {
        EventSession {
            id: SessionId::new(),
            client_id: client.to_string(),
            plugin_id: plugin.to_string(),
            service_id: ServiceId::new(device),
            capability: Capability::new("sphero", Some("quaternion"), attribute),
            subscription: serde_json::from_value(serde_json::json!(n)).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_table_matching() {
        let table = SessionTable::new();
        table.add(session("app-1", "sphero", "bb8", "onQuaternion", 1));
        table.add(session("app-2", "sphero", "bb8", "onQuaternion", 2));
        table.add(session("app-1", "hvc", "hvc-1", "onBodyDetection", 3));

        let cap = Capability::new("Sphero", Some("QUATERNION"), "onquaternion");
        let found = table.find("app-1", "sphero", &ServiceId::new("bb8"), &cap).unwrap();
        assert_eq!(found.subscription.value(), 1);

        let removed = table
            .remove_matching("app-2", "sphero", &ServiceId::new("bb8"), &cap)
            .unwrap();
        assert_eq!(removed.client_id, "app-2");
        assert!(table.remove_matching("app-2", "sphero", &ServiceId::new("bb8"), &cap).is_none());

        assert_eq!(table.for_client("app-1").len(), 2);
        assert_eq!(table.remove_plugin("hvc").len(), 1);
        assert_eq!(table.remove_client("app-1").len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_listener_rewrites_service_id() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let session_id = SessionId::new();
        let listener = SessionListener {
            client_id: "app-1".into(),
            session_id,
            address: ServiceAddress::device("bb8", "sphero"),
            domain: "localhost.deviceconnect.org".into(),
            deliveries: bus.clone(),
        };

        let event = Event::new(
            ServiceId::new("bb8"),
            &Capability::new("sphero", Some("collision"), "onCollision"),
            EventPayload::Collision {
                impact_x: 1.0,
                impact_y: 0.0,
                impact_z: 0.0,
                impact_speed: 0.4,
            },
        );
        listener.on_event(&event).unwrap();

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.client_id, "app-1");
        assert_eq!(delivery.session_id, session_id);
        assert_eq!(delivery.event.service_id.as_str(), "bb8.sphero.localhost.deviceconnect.org");
        assert_eq!(delivery.event.payload, event.payload);
    }
}
