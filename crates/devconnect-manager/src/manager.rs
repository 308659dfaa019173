/*!
 * The manager façade.
 *
 * The [`Manager`] hosts plugins under one domain. It resolves composite
 * service ids to a plugin and a local device id, answers the manager-level
 * `serviceDiscovery` and `system` requests itself, turns event
 * registrations into client sessions and hands everything else to the
 * addressed plugin.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use devconnect_core::{
    config::SharedConfig,
    event::{EventBus, SharedEventBus},
    logging::operation_span,
    message::{Action, Request, Response},
    types::{Params, Value},
};
use devconnect_devices::{ConnectionState, DeviceError, OperationKind, Plugin, PluginInfo};

use crate::address::{is_valid_plugin_id, ServiceAddress};
use crate::error::{Error, Result};
use crate::session::{Delivery, EventSession, SessionId, SessionListener, SessionTable};

/// Manager-level listing of every device
pub const SERVICE_DISCOVERY_PROFILE: &str = "serviceDiscovery";
/// Manager and plugin information
pub const SYSTEM_PROFILE: &str = "system";

/// Hosts plugins and routes client requests to them
#[derive(Debug)]
pub struct Manager {
    config: SharedConfig,
    plugins: RwLock<BTreeMap<String, Plugin>>,
    sessions: SessionTable,
    deliveries: SharedEventBus<Delivery>,
}

impl Manager {
    /// Create a manager without plugins
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(BTreeMap::new()),
            sessions: SessionTable::new(),
            deliveries: Arc::new(EventBus::new()),
        }
    }

    /// Domain appended to every composite service id
    pub fn domain(&self) -> &str {
        &self.config.get().general.domain
    }

    /// Configuration
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Client sessions
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Receive the events delivered to client sessions
    pub fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.deliveries.subscribe()
    }

    /// Host a plugin
    pub fn register_plugin(&self, plugin: Plugin) -> Result<()> {
        let id = plugin.id().to_string();
        if !is_valid_plugin_id(&id) {
            return Err(Error::other(format!("invalid plugin id '{}'", id)));
        }

        let mut plugins = self
            .plugins
            .write()
            .map_err(|_| Error::other("Failed to acquire write lock on plugin table"))?;
        if plugins.contains_key(&id) {
            return Err(Error::PluginExists(id));
        }
        plugins.insert(id.clone(), plugin);
        info!(plugin = %id, domain = %self.domain(), "Plugin registered");
        Ok(())
    }

    /// Stop hosting a plugin, dropping its sessions and shutting it down
    pub async fn unregister_plugin(&self, id: &str) -> Result<Plugin> {
        let plugin = self
            .plugins
            .write()
            .map_err(|_| Error::other("Failed to acquire write lock on plugin table"))?
            .remove(id)
            .ok_or_else(|| Error::plugin_not_found(id))?;

        let dropped = self.sessions.remove_plugin(id).len();
        plugin.shutdown().await;
        info!(plugin = %id, sessions = dropped, "Plugin unregistered");
        Ok(plugin)
    }

    /// A hosted plugin
    pub fn plugin(&self, id: &str) -> Result<Plugin> {
        let plugins = self
            .plugins
            .read()
            .map_err(|_| Error::other("Failed to acquire read lock on plugin table"))?;
        plugins.get(id).cloned().ok_or_else(|| Error::plugin_not_found(id))
    }

    /// Identity of every hosted plugin
    pub fn plugins(&self) -> Result<Vec<PluginInfo>> {
        Ok(self.hosted()?.iter().map(|p| p.info().clone()).collect())
    }

    fn hosted(&self) -> Result<Vec<Plugin>> {
        let plugins = self
            .plugins
            .read()
            .map_err(|_| Error::other("Failed to acquire read lock on plugin table"))?;
        Ok(plugins.values().cloned().collect())
    }

    /// Handle a client request, turning every outcome into a response
    pub async fn handle(&self, client_id: &str, request: &Request) -> Response {
        let span = operation_span(&request.to_string(), "manager");
        match self.execute(client_id, request).instrument(span).await {
            Ok(payload) => Response::ok_with(payload),
            Err(e) => {
                debug!(client = %client_id, "{} failed: {}", request, e);
                e.to_response()
            }
        }
    }

    /// Carry out a client request and return its payload
    pub async fn execute(&self, client_id: &str, request: &Request) -> Result<Params> {
        if request.action == Action::Get && request.profile.eq_ignore_ascii_case(SERVICE_DISCOVERY_PROFILE) {
            return self.service_discovery();
        }
        if request.service_id.is_empty() {
            if request.action == Action::Get && request.profile.eq_ignore_ascii_case(SYSTEM_PROFILE) {
                return self.system_info();
            }
            return Err(Error::EmptyServiceId);
        }

        let address = ServiceAddress::parse(request.service_id.as_str(), self.domain())?;
        let plugin = self.plugin(&address.plugin_id)?;
        let Some(device) = address.device.clone() else {
            return plugin_request(&plugin, request);
        };

        let local = request.clone().with_service_id(device);
        match plugin.route_kind(&local) {
            Ok(OperationKind::Subscribe) => self.open_session(client_id, &plugin, address, &local).await,
            Ok(OperationKind::Unsubscribe) => self.close_session(client_id, &plugin, &local).await,
            _ => Ok(plugin.execute(&local).await?),
        }
    }

    /// Drop every session of a client
    pub fn remove_client(&self, client_id: &str) -> usize {
        let sessions = self.sessions.remove_client(client_id);
        for session in &sessions {
            match self.plugin(&session.plugin_id) {
                Ok(plugin) => {
                    plugin
                        .listeners()
                        .unsubscribe(&session.service_id, &session.capability, session.subscription);
                }
                Err(e) => warn!(client = %client_id, session = %session.id, "Orphaned session: {}", e),
            }
        }
        if !sessions.is_empty() {
            info!(client = %client_id, sessions = sessions.len(), "Client removed");
        }
        sessions.len()
    }

    /// Shut down every plugin
    pub async fn shutdown(&self) {
        let plugins: Vec<Plugin> = match self.plugins.write() {
            Ok(mut plugins) => std::mem::take(&mut *plugins).into_values().collect(),
            Err(_) => {
                warn!("Plugin table poisoned, nothing to shut down");
                return;
            }
        };
        for session in self.sessions.clear() {
            debug!(client = %session.client_id, session = %session.id, "Session closed by shutdown");
        }
        join_all(plugins.iter().map(|p| p.shutdown())).await;
        info!(plugins = plugins.len(), "Manager shut down");
    }

    async fn open_session(
        &self,
        client_id: &str,
        plugin: &Plugin,
        address: ServiceAddress,
        local: &Request,
    ) -> Result<Params> {
        let capability = plugin.profiles().resolve(local)?.capability();
        if let Some(existing) = self
            .sessions
            .find(client_id, plugin.id(), &local.service_id, &capability)
        {
            if is_live(plugin, &existing) {
                debug!(client = %client_id, session = %existing.id, "Already registered for {}", capability);
                return Ok(session_payload(&existing));
            }
            // the plugin dropped the subscription, e.g. the device was removed
            debug!(client = %client_id, session = %existing.id, "Replacing stale session");
            self.sessions
                .remove_matching(client_id, plugin.id(), &local.service_id, &capability);
        }

        let session_id = SessionId::new();
        let listener = SessionListener {
            client_id: client_id.to_string(),
            session_id,
            address,
            domain: self.domain().to_string(),
            deliveries: self.deliveries.clone(),
        };
        let subscription = plugin.register_event(local, Arc::new(listener)).await?;

        let session = EventSession {
            id: session_id,
            client_id: client_id.to_string(),
            plugin_id: plugin.id().to_string(),
            service_id: local.service_id.clone(),
            capability,
            subscription,
            created_at: chrono::Utc::now(),
        };
        info!(client = %client_id, session = %session.id, "Session opened for {}", session.capability);
        self.sessions.add(session.clone());
        Ok(session_payload(&session))
    }

    async fn close_session(&self, client_id: &str, plugin: &Plugin, local: &Request) -> Result<Params> {
        let capability = plugin.profiles().resolve(local)?.capability();
        let session = self
            .sessions
            .remove_matching(client_id, plugin.id(), &local.service_id, &capability)
            .ok_or_else(|| {
                Error::SessionNotFound(format!("{} is not registered for {}", client_id, capability))
            })?;
        if is_live(plugin, &session) {
            plugin.unregister_event(local, session.subscription).await?;
        }
        info!(client = %client_id, session = %session.id, "Session closed for {}", capability);
        Ok(session_payload(&session))
    }

    fn service_discovery(&self) -> Result<Params> {
        let mut services = Vec::new();
        for plugin in self.hosted()? {
            let mut devices = plugin.registry().list()?;
            devices.sort_by(|a, b| a.info.id.as_str().cmp(b.info.id.as_str()));
            for status in devices {
                let address = ServiceAddress::device(status.info.id.clone(), plugin.id());
                let mut entry = HashMap::new();
                entry.insert("id".to_string(), Value::String(address.compose(self.domain()).to_string()));
                entry.insert("name".to_string(), Value::String(status.info.name.clone()));
                entry.insert("type".to_string(), Value::String(status.info.device_type.clone()));
                entry.insert("online".to_string(), Value::Bool(status.state == ConnectionState::Online));
                entry.insert(
                    "scopes".to_string(),
                    Value::Array(status.info.profiles.iter().map(|p| Value::from(p.as_str())).collect()),
                );
                services.push(Value::Object(entry));
            }
        }

        let mut payload = Params::new();
        payload.insert("services".into(), Value::Array(services));
        Ok(payload)
    }

    fn system_info(&self) -> Result<Params> {
        let plugins = self
            .plugins()?
            .into_iter()
            .map(|info| {
                let mut entry = HashMap::new();
                entry.insert("id".to_string(), Value::String(info.id));
                entry.insert("name".to_string(), Value::String(info.name));
                entry.insert("version".to_string(), Value::String(info.version));
                Value::Object(entry)
            })
            .collect();

        let mut payload = Params::new();
        payload.insert("version".into(), Value::from(crate::VERSION));
        payload.insert("domain".into(), Value::from(self.domain()));
        payload.insert("plugins".into(), Value::Array(plugins));
        Ok(payload)
    }
}

/// Requests addressed to a plugin rather than one of its devices
fn plugin_request(plugin: &Plugin, request: &Request) -> Result<Params> {
    if request.action != Action::Get || !request.profile.eq_ignore_ascii_case(SYSTEM_PROFILE) {
        return Err(DeviceError::NotSupportProfile(format!(
            "{} is not served by plugin {}",
            request.profile,
            plugin.id()
        ))
        .into());
    }

    let info = plugin.info();
    let mut payload = Params::new();
    payload.insert("id".into(), Value::from(info.id.as_str()));
    payload.insert("name".into(), Value::from(info.name.as_str()));
    payload.insert("version".into(), Value::from(info.version.as_str()));
    payload.insert(
        "supports".into(),
        Value::Array(plugin.profiles().names().into_iter().map(Value::from).collect()),
    );
    payload.insert("devices".into(), Value::Integer(plugin.registry().len() as i64));
    Ok(payload)
}

/// Whether the plugin still holds the subscription behind a session
fn is_live(plugin: &Plugin, session: &EventSession) -> bool {
    plugin
        .listeners()
        .lookup(session.subscription)
        .map_or(false, |(service_id, capability)| {
            service_id == session.service_id && capability == session.capability
        })
}

fn session_payload(session: &EventSession) -> Params {
    let mut payload = Params::new();
    payload.insert("sessionId".into(), Value::String(session.id.to_string()));
    payload
}
