/*!
 * Plugin runtime.
 *
 * A [`Plugin`] owns one hardware family's registry, listener manager,
 * correlator and dispatcher, plus the inbound pump that routes device
 * traffic back into them. Plugins are explicitly built inside a Tokio
 * runtime and explicitly shut down.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use devconnect_core::{
    config::SharedConfig,
    event::{Capability, Event, EventBus, EventPayload},
    logging::{component_span, operation_span},
    message::{Request, Response},
    types::{Params, ServiceId},
    utils::{spawn_and_log, with_retry, with_timeout},
};

use crate::correlator::{Correlator, NackOutcome, RequestId};
use crate::device::{ConnectionState, DeviceDriver, DeviceError, DeviceInfo, Result};
use crate::discovery::{DeviceDiscoverer, DiscoveryOptions};
use crate::dispatcher::{Dispatcher, Issued};
use crate::listener::{EventListener, ListenerManager, StreamControl, SubscriptionId};
use crate::profile::{OperationKind, ProfileSet};
use crate::registry::{DeviceRegistry, DeviceSlot, RemovalHook, UpsertOutcome};
use crate::store::DeviceStore;
use crate::stream::StreamRunner;
use crate::transport::{Frame, FramePayload, Inbound, Transport};

/// Identity of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Plugin id, unique within a manager
    pub id: String,
    /// Display name
    pub name: String,
    /// Plugin version
    pub version: String,
}

impl PluginInfo {
    /// Create plugin info carrying this crate's version
    pub fn new<I: AsRef<str>, N: AsRef<str>>(id: I, name: N) -> Self {
        Self {
            id: id.as_ref().to_string(),
            name: name.as_ref().to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Builder for [`Plugin`]
#[derive(Debug)]
pub struct PluginBuilder {
    info: PluginInfo,
    profiles: ProfileSet,
    config: SharedConfig,
    store: Option<Arc<dyn DeviceStore>>,
}

impl PluginBuilder {
    /// Add profiles served by the plugin
    pub fn profiles(mut self, profiles: ProfileSet) -> Self {
        self.profiles = self.profiles.merge(profiles);
        self
    }

    /// Use a configuration
    pub fn config(mut self, config: SharedConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist devices in a store
    pub fn store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the plugin and start its inbound pump
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Plugin {
        let settings = self.config.get().clone();

        let registry = Arc::new(DeviceRegistry::new());
        let streams = Arc::new(StreamRunner::new(
            registry.clone(),
            settings.polling.default_interval(),
        ));
        let listeners = Arc::new(ListenerManager::with_control(streams.clone()));
        let correlator = Arc::new(Correlator::new(settings.correlator.response_timeout()));

        // listeners first so streams stop before pending requests are failed
        let listener_hook: Arc<dyn RemovalHook> = listeners.clone();
        let stream_hook: Arc<dyn RemovalHook> = streams.clone();
        let correlator_hook: Arc<dyn RemovalHook> = correlator.clone();
        registry.add_removal_hook(Arc::downgrade(&listener_hook));
        registry.add_removal_hook(Arc::downgrade(&stream_hook));
        registry.add_removal_hook(Arc::downgrade(&correlator_hook));

        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(self.profiles),
            Correlator::clone(&correlator),
            settings.correlator.clone(),
        );

        let (inbound, rx) = mpsc::channel(settings.polling.inbound_capacity.max(1));
        let inner = Arc::new(PluginInner {
            info: self.info,
            config: self.config,
            registry,
            listeners,
            streams,
            correlator,
            dispatcher,
            store: self.store,
            inbound,
            monitor: EventBus::new(),
            pump: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let span = component_span("plugin", Some(&inner.info.id));
        let pump = tokio::spawn(run_pump(Arc::downgrade(&inner), rx).instrument(span));
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);

        info!(plugin = %inner.info.id, "Plugin {} started", inner.info.name);
        Plugin { inner }
    }
}

#[derive(Debug)]
struct PluginInner {
    info: PluginInfo,
    config: SharedConfig,
    registry: Arc<DeviceRegistry>,
    listeners: Arc<ListenerManager>,
    streams: Arc<StreamRunner>,
    correlator: Arc<Correlator>,
    dispatcher: Dispatcher,
    store: Option<Arc<dyn DeviceStore>>,
    inbound: mpsc::Sender<Inbound>,
    monitor: EventBus<Event>,
    pump: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// A device plugin
#[derive(Debug, Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

impl Plugin {
    /// Start building a plugin
    pub fn builder(info: PluginInfo) -> PluginBuilder {
        PluginBuilder {
            info,
            profiles: ProfileSet::new(),
            config: SharedConfig::default(),
            store: None,
        }
    }

    /// Plugin identity
    pub fn info(&self) -> &PluginInfo {
        &self.inner.info
    }

    /// Plugin id
    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    /// Device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Listener manager
    pub fn listeners(&self) -> &Arc<ListenerManager> {
        &self.inner.listeners
    }

    /// Response correlator
    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    /// Stream runner
    pub fn streams(&self) -> &StreamRunner {
        &self.inner.streams
    }

    /// Profiles served
    pub fn profiles(&self) -> &ProfileSet {
        self.inner.dispatcher.profiles()
    }

    /// Configuration in use
    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    /// Queue for traffic arriving from devices
    ///
    /// Transports push acknowledgements, replies, events and connection
    /// changes here.
    pub fn inbound(&self) -> mpsc::Sender<Inbound> {
        self.inner.inbound.clone()
    }

    /// Tap on every event produced by this plugin's devices
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.monitor.subscribe()
    }

    /// Register a device together with its vendor handle and transport
    ///
    /// A device re-registered while online is taken offline first, since
    /// the new driver has not been connected yet.
    pub async fn add_device(
        &self,
        info: DeviceInfo,
        driver: Box<dyn DeviceDriver>,
        transport: Arc<dyn Transport>,
    ) -> Result<UpsertOutcome> {
        let id = info.id.clone();
        let outcome = self.upsert_device(info).await?;
        if self.inner.registry.find(&id)?.is_online() {
            self.inner.mark_offline(&id, "driver replaced");
        }
        self.inner.registry.attach(&id, driver, transport).await?;
        Ok(outcome)
    }

    /// Insert or update a device's info, persisting changes
    pub async fn upsert_device(&self, info: DeviceInfo) -> Result<UpsertOutcome> {
        let outcome = self.inner.registry.upsert(info.clone())?;
        if outcome != UpsertOutcome::Unchanged {
            if let Some(store) = &self.inner.store {
                store.save_device(&info).await?;
            }
        }
        Ok(outcome)
    }

    /// Remove a device
    ///
    /// Its subscriptions are torn down and its pending requests fail with
    /// a device-removed error.
    pub async fn remove_device(&self, id: &ServiceId) -> Result<DeviceInfo> {
        let slot = self.inner.registry.find(id)?;
        disconnect_driver(&slot).await;

        let info = self.inner.registry.remove(id)?;
        if let Some(store) = &self.inner.store {
            store.delete_device(id).await?;
        }
        Ok(info)
    }

    /// Connect a device
    ///
    /// Runs the driver's connect with a bounded number of attempts. On
    /// success the device goes online, paused streams resume and an
    /// `onConnectionChange` event is emitted.
    pub async fn connect(&self, id: &ServiceId) -> Result<()> {
        let slot = self.inner.registry.find(id)?;
        if slot.is_online() {
            return Ok(());
        }
        self.inner.registry.set_state(id, ConnectionState::Connecting)?;

        let settings = &self.inner.config.get().connection;
        let result = with_retry(
            settings.connect_timeout(),
            settings.connect_attempts.saturating_sub(1),
            || {
                let slot = slot.clone();
                async move {
                    let mut guard = slot.lock_driver().await;
                    let driver = guard
                        .as_mut()
                        .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", slot.id())))?;
                    driver.connect().await
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.inner.mark_online(id);
                info!(plugin = %self.id(), service_id = %id, "Device connected");
                Ok(())
            }
            Err(e) => {
                self.inner.registry.set_state(id, ConnectionState::Offline)?;
                warn!(plugin = %self.id(), service_id = %id, "Failed to connect: {}", e);
                Err(e)
            }
        }
    }

    /// Disconnect a device
    ///
    /// Pending requests fail with a connection error and streams pause
    /// until the device connects again; subscriptions are kept.
    pub async fn disconnect(&self, id: &ServiceId) -> Result<()> {
        let slot = self.inner.registry.find(id)?;
        disconnect_driver(&slot).await;
        self.inner.mark_offline(id, "disconnected");
        Ok(())
    }

    /// Handle a request, turning every outcome into a response
    pub async fn handle(&self, request: &Request) -> Response {
        let span = operation_span(&request.to_string(), &self.inner.info.id);
        match self.execute(request).instrument(span).await {
            Ok(payload) => Response::ok_with(payload),
            Err(e) => {
                debug!(plugin = %self.id(), "{} failed: {}", request, e);
                e.to_response()
            }
        }
    }

    /// Carry out a request and return its payload
    ///
    /// One-shot commands are awaited until their reply is correlated or the
    /// response window closes. Event registrations need a listener and go
    /// through [`Plugin::register_event`].
    pub async fn execute(&self, request: &Request) -> Result<Params> {
        self.ensure_running()?;
        match self.inner.dispatcher.issue(request).await? {
            Issued::Immediate(payload) => Ok(payload),
            Issued::Pending { handle, operation } => {
                let service_id = handle.service_id().clone();
                let body = handle.wait().await?;
                self.inner.dispatcher.decode(&service_id, operation, &body).await
            }
            Issued::Subscribe { .. } | Issued::Unsubscribe { .. } => Err(DeviceError::NotSupportAction(
                format!("{} is an event registration", request.path()),
            )),
        }
    }

    /// How a request would be carried out, without touching any device
    pub fn route_kind(&self, request: &Request) -> Result<OperationKind> {
        Ok(self.profiles().resolve(request)?.operation.kind)
    }

    /// Register a listener for the event addressed by a PUT request
    ///
    /// A stream already running for another listener is shared, so the
    /// request's stream parameters must match the ones it runs with.
    pub async fn register_event(
        &self,
        request: &Request,
        listener: Arc<dyn EventListener>,
    ) -> Result<SubscriptionId> {
        self.ensure_running()?;
        if self.route_kind(request)? != OperationKind::Subscribe {
            return Err(DeviceError::NotSupportAction(format!(
                "{} {} is not an event registration",
                request.action,
                request.path()
            )));
        }
        match self.inner.dispatcher.issue(request).await? {
            Issued::Subscribe { capability, params } => {
                self.inner
                    .listeners
                    .join(&request.service_id, &capability, listener, params)
            }
            other => Err(DeviceError::unknown(format!("unexpected dispatch result {:?}", other))),
        }
    }

    /// Remove a listener registered through the matching PUT request
    pub async fn unregister_event(&self, request: &Request, subscription: SubscriptionId) -> Result<()> {
        if self.route_kind(request)? != OperationKind::Unsubscribe {
            return Err(DeviceError::NotSupportAction(format!(
                "{} {} is not an event unregistration",
                request.action,
                request.path()
            )));
        }
        let capability = match self.inner.dispatcher.issue(request).await? {
            Issued::Unsubscribe { capability } => capability,
            other => return Err(DeviceError::unknown(format!("unexpected dispatch result {:?}", other))),
        };
        if self
            .inner
            .listeners
            .unsubscribe(&request.service_id, &capability, subscription)
        {
            Ok(())
        } else {
            Err(DeviceError::invalid_parameter(format!(
                "{} is not subscribed to {}",
                subscription, capability
            )))
        }
    }

    /// Scan with a discoverer and register every device found before the
    /// scan window closes
    pub async fn discover_and_register(
        &self,
        discoverer: &DeviceDiscoverer,
        options: DiscoveryOptions,
    ) -> Result<usize> {
        let window = options.timeout;
        let mut found = discoverer.discover(options).await?;
        let mut registered = 0;

        let scan = async {
            while let Some(device) = found.recv().await {
                let id = device.info.id.clone();
                match self.add_device(device.info, device.driver, device.transport).await {
                    Ok(_) => registered += 1,
                    Err(e) => warn!(plugin = %self.id(), service_id = %id, "Failed to register: {}", e),
                }
            }
        };
        if tokio::time::timeout(window, scan).await.is_err() {
            debug!(plugin = %self.id(), "Discovery window of {:?} closed", window);
        }

        info!(plugin = %self.id(), "Discovered {} devices", registered);
        Ok(registered)
    }

    /// Register every device held by a store; they stay offline until
    /// found and connected
    pub async fn load_devices<S: DeviceStore + ?Sized>(&self, store: &S) -> Result<usize> {
        let devices = store.load_devices().await?;
        let count = devices.len();
        for info in devices {
            self.inner.registry.upsert(info)?;
        }
        debug!(plugin = %self.id(), "Loaded {} devices", count);
        Ok(count)
    }

    /// Stop the plugin
    ///
    /// Fails every pending request, drops every subscription, stops the
    /// pump and disconnects every device. Further requests are refused.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let pump = self.inner.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
        }

        let cancelled = self
            .inner
            .correlator
            .cancel_all(DeviceError::connection("plugin shut down"));
        let dropped = self.inner.listeners.clear();
        self.inner.streams.stop_all();

        let slots: Vec<Arc<DeviceSlot>> = self
            .inner
            .registry
            .ids()
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.inner.registry.find(id).ok())
            .collect();
        join_all(slots.iter().map(|slot| disconnect_driver(slot))).await;
        for slot in &slots {
            let _ = self.inner.registry.set_state(slot.id(), ConnectionState::Offline);
        }

        info!(
            plugin = %self.id(),
            cancelled, dropped,
            "Plugin shut down"
        );
    }

    /// Whether [`Plugin::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(DeviceError::illegal_state(format!("plugin {} is shut down", self.id())));
        }
        Ok(())
    }
}

impl PluginInner {
    async fn route(&self, message: Inbound) {
        match message {
            Inbound::Ack { request_id } => {
                if !self.correlator.ack(request_id) {
                    debug!(request_id = %request_id, "Ack for unknown request");
                }
            }
            Inbound::Nack { request_id } => self.on_nack(request_id),
            Inbound::Reply { request_id, body } => {
                if !self.correlator.complete(request_id, body) {
                    debug!(request_id = %request_id, "Late reply dropped");
                }
            }
            Inbound::Rejected { request_id, reason } => {
                self.correlator.fail(request_id, DeviceError::connection(reason));
            }
            Inbound::Event {
                service_id,
                capability,
                payload,
            } => self.publish(Event::new(service_id, &capability, payload)),
            Inbound::Sample {
                service_id,
                capability,
                body,
            } => self.on_sample(service_id, capability, body).await,
            Inbound::Connection { service_id, connected } => {
                if !self.registry.contains(&service_id) {
                    debug!(service_id = %service_id, "Connection change for unknown device");
                } else if connected {
                    self.mark_online(&service_id);
                } else {
                    self.mark_offline(&service_id, "link lost");
                }
            }
        }
    }

    fn on_nack(&self, id: RequestId) {
        match self.correlator.nack(id) {
            NackOutcome::Retry { frame, attempt } => {
                debug!(request_id = %id, attempt, "Recovering before resend");
                spawn_and_log(
                    "nack-recovery",
                    recover_and_resend(
                        self.registry.clone(),
                        self.correlator.clone(),
                        id,
                        frame,
                        self.config.get().correlator.recovery_delay(),
                    ),
                );
            }
            NackOutcome::Exhausted => warn!(request_id = %id, "Retry budget exhausted"),
            NackOutcome::Unknown => debug!(request_id = %id, "Nack for unknown request"),
        }
    }

    async fn on_sample(&self, service_id: ServiceId, capability: Capability, body: FramePayload) {
        let decoded = match self.registry.find(&service_id) {
            Ok(slot) => {
                let mut guard = slot.lock_driver().await;
                match guard.as_mut() {
                    Some(driver) => driver.decode_event(&capability, &body),
                    None => Ok(None),
                }
            }
            Err(e) => Err(e),
        };
        match decoded {
            Ok(Some(payload)) => self.publish(Event::new(service_id, &capability, payload)),
            Ok(None) => {}
            Err(e) => warn!(service_id = %service_id, "Undecodable sample for {}: {}", capability, e),
        }
    }

    fn publish(&self, event: Event) {
        let delivered = self.listeners.deliver(&event);
        debug!(
            service_id = %event.service_id,
            capability = %event.capability(),
            delivered,
            "Event {}",
            event.payload.kind()
        );
        self.monitor.publish(event);
    }

    fn mark_online(&self, id: &ServiceId) {
        match self.registry.set_state(id, ConnectionState::Online) {
            Ok(ConnectionState::Online) => {}
            Ok(_) => {
                for (capability, params) in self.listeners.active_streams(id) {
                    self.streams.start(id, &capability, &params);
                }
                self.emit_connection(id, true);
            }
            Err(e) => warn!(service_id = %id, "Failed to mark online: {}", e),
        }
    }

    fn mark_offline(&self, id: &ServiceId, reason: &str) {
        match self.registry.set_state(id, ConnectionState::Offline) {
            Ok(ConnectionState::Offline) => {}
            Ok(_) => {
                let cancelled = self
                    .correlator
                    .cancel_device(id, DeviceError::connection(format!("{} {}", id, reason)));
                for (capability, _) in self.listeners.active_streams(id) {
                    self.streams.stop(id, &capability);
                }
                info!(service_id = %id, cancelled, "Device offline: {}", reason);
                self.emit_connection(id, false);
            }
            Err(e) => warn!(service_id = %id, "Failed to mark offline: {}", e),
        }
    }

    fn emit_connection(&self, id: &ServiceId, connected: bool) {
        self.publish(Event::new(
            id.clone(),
            &Capability::connection(),
            EventPayload::ConnectionChanged { connected },
        ));
    }
}

async fn run_pump(inner: Weak<PluginInner>, mut rx: mpsc::Receiver<Inbound>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.route(message).await;
    }
    debug!("Inbound pump stopped");
}

async fn recover_and_resend(
    registry: Arc<DeviceRegistry>,
    correlator: Arc<Correlator>,
    id: RequestId,
    frame: Frame,
    settle: Duration,
) -> Result<()> {
    if !correlator.begin_recovery(id) {
        return Ok(());
    }

    let transport = match registry.find(&frame.service_id).map(|slot| slot.transport()) {
        Ok(Some(transport)) => transport,
        Ok(None) | Err(_) => {
            let err = DeviceError::NotConnected(format!("{} has no transport", frame.service_id));
            correlator.fail(id, err.clone());
            return Err(err);
        }
    };

    let recovery = async {
        transport.recover().await?;
        tokio::time::sleep(settle).await;
        Ok::<(), DeviceError>(())
    };
    if let Err(e) = with_timeout(correlator.timeout(), recovery).await {
        warn!(request_id = %id, "Recovery failed: {}", e);
        correlator.fail(id, e.clone());
        return Err(e);
    }

    // completed or cancelled while recovering
    let Some(frame) = correlator.resume(id) else {
        return Ok(());
    };
    if let Err(e) = transport.send(&frame).await {
        correlator.fail(id, e.clone());
        return Err(e);
    }
    debug!(request_id = %id, "Resent {}", frame);
    Ok(())
}

async fn disconnect_driver(slot: &DeviceSlot) {
    let mut guard = slot.lock_driver().await;
    if let Some(driver) = guard.as_mut() {
        if let Err(e) = driver.disconnect().await {
            warn!(service_id = %slot.id(), "Failed to disconnect: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use devconnect_core::config::Config;
    use devconnect_core::message::{Action, ErrorCode};
    use devconnect_core::types::Value;
    use test_log::test;

    use crate::correlator::PendingState;
    use crate::listener::ChannelListener;
    use crate::profile::{Operation, ParamRule, ProfileSpec, RetryBudget};
    use crate::store::MemoryStore;
    use crate::transport::ChannelTransport;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug, Default)]
    struct ScriptedDriver {
        log: Log,
        failing_connects: Arc<AtomicUsize>,
    }

    impl ScriptedDriver {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl DeviceDriver for ScriptedDriver {
        fn driver_name(&self) -> &'static str {
            "scripted"
        }

        async fn connect(&mut self) -> Result<()> {
            let left = self.failing_connects.load(Ordering::SeqCst);
            if left > 0 {
                self.failing_connects.store(left - 1, Ordering::SeqCst);
                return Err(DeviceError::connection("pairing refused"));
            }
            self.record("connect".into());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.record("disconnect".into());
            Ok(())
        }

        async fn apply(&mut self, operation: &str, _params: &Params) -> Result<()> {
            self.record(operation.to_string());
            Ok(())
        }

        async fn query(&mut self, _operation: &str, _params: &Params) -> Result<Params> {
            let mut payload = Params::new();
            payload.insert("entries".into(), Value::Integer(self.log.lock().unwrap().len() as i64));
            Ok(payload)
        }

        fn encode(&mut self, operation: &str, params: &Params) -> Result<FramePayload> {
            let mut body = serde_json::Map::new();
            body.insert("op".into(), operation.into());
            for (key, value) in params {
                body.insert(key.clone(), value.to_json());
            }
            Ok(FramePayload::Json(serde_json::Value::Object(body)))
        }

        async fn start_stream(&mut self, capability: &Capability, _params: &Params) -> Result<()> {
            self.record(format!("start {}", capability));
            Ok(())
        }

        async fn stop_stream(&mut self, capability: &Capability) -> Result<()> {
            self.record(format!("stop {}", capability));
            Ok(())
        }
    }

    fn sensor_profiles() -> ProfileSet {
        let mut spec = ProfileSpec::new("sensor")
            .route(Operation::new(Action::Get, "sensor.status", OperationKind::Query))
            .route(
                Operation::new(Action::Post, "sensor.reset", OperationKind::Apply)
                    .attribute("reset")
                    .rule(ParamRule::range("level", 0.0, 10.0)),
            )
            .route(
                Operation::new(Action::Get, "sensor.read", OperationKind::OneShot(RetryBudget::Default))
                    .attribute("value"),
            )
            .route(
                Operation::new(
                    Action::Put,
                    "sensor.calibrate",
                    OperationKind::OneShot(RetryBudget::Parameter),
                )
                .attribute("calibration"),
            );
        for attribute in ["onMotion", "onTemperature", "onHumidity"] {
            spec = spec
                .route(Operation::new(Action::Put, "sensor.subscribe", OperationKind::Subscribe).attribute(attribute))
                .route(
                    Operation::new(Action::Delete, "sensor.unsubscribe", OperationKind::Unsubscribe)
                        .attribute(attribute),
                );
        }
        ProfileSet::new().with(spec)
    }

    struct Fixture {
        plugin: Plugin,
        transport: Arc<ChannelTransport>,
        frames: mpsc::UnboundedReceiver<Frame>,
        log: Log,
        id: ServiceId,
    }

    async fn fixture(acknowledges: bool) -> Fixture {
        let plugin = Plugin::builder(PluginInfo::new("sensors", "Sensor plugin"))
            .profiles(sensor_profiles())
            .build();
        let (transport, frames) = ChannelTransport::new("sim", acknowledges);
        let log = Log::default();
        let driver = ScriptedDriver {
            log: log.clone(),
            ..ScriptedDriver::default()
        };
        let info = DeviceInfo::new("sensor-1", "Hall sensor", "sensor").with_profile("sensor");
        plugin.add_device(info, Box::new(driver), transport.clone()).await.unwrap();

        let id = ServiceId::new("sensor-1");
        plugin.connect(&id).await.unwrap();
        Fixture {
            plugin,
            transport,
            frames,
            log,
            id,
        }
    }

    fn get(attribute: &str) -> Request {
        Request::new(Action::Get, "sensor-1", "sensor").with_attribute(attribute)
    }

    fn put(attribute: &str) -> Request {
        Request::new(Action::Put, "sensor-1", "sensor").with_attribute(attribute)
    }

    fn delete(attribute: &str) -> Request {
        Request::new(Action::Delete, "sensor-1", "sensor").with_attribute(attribute)
    }

    fn request_id(frame: &Frame) -> RequestId {
        frame.request_id.expect("correlated frame")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test(tokio::test)]
    async fn test_unknown_device_never_touches_transport() {
        let f = fixture(false).await;
        let response = f
            .plugin
            .handle(&Request::new(Action::Get, "ghost", "sensor").with_attribute("value"))
            .await;
        assert!(!response.is_ok());
        assert_eq!(response.code(), Some(ErrorCode::NotFoundService));
        assert_eq!(f.transport.sent_count(), 0);

        let response = f.plugin.handle(&Request::new(Action::Get, "", "sensor")).await;
        assert_eq!(response.code(), Some(ErrorCode::EmptyServiceId));
    }

    #[test(tokio::test)]
    async fn test_routing_and_parameter_errors() {
        let f = fixture(false).await;

        let response = f.plugin.handle(&Request::new(Action::Get, "sensor-1", "light")).await;
        assert_eq!(response.code(), Some(ErrorCode::NotSupportProfile));

        let response = f.plugin.handle(&get("pressure")).await;
        assert_eq!(response.code(), Some(ErrorCode::NotSupportAttribute));

        let response = f.plugin.handle(&delete("value")).await;
        assert_eq!(response.code(), Some(ErrorCode::NotSupportAction));

        let request = Request::new(Action::Post, "sensor-1", "sensor")
            .with_attribute("reset")
            .with_param("level", 42);
        let response = f.plugin.handle(&request).await;
        assert_eq!(response.code(), Some(ErrorCode::InvalidRequestParameter));
        assert!(!f.log.lock().unwrap().contains(&"sensor.reset".to_string()));
    }

    #[test(tokio::test)]
    async fn test_apply_and_query() {
        let f = fixture(false).await;
        let request = Request::new(Action::Post, "sensor-1", "sensor")
            .with_attribute("reset")
            .with_param("level", 3);
        assert!(f.plugin.handle(&request).await.is_ok());
        assert!(f.log.lock().unwrap().contains(&"sensor.reset".to_string()));

        let response = f.plugin.handle(&Request::new(Action::Get, "sensor-1", "sensor")).await;
        assert!(response.is_ok());
        assert_eq!(response.get("entries"), Some(&Value::Integer(2)));
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[test(tokio::test)]
    async fn test_offline_device_is_rejected() {
        let f = fixture(false).await;
        f.plugin.disconnect(&f.id).await.unwrap();

        let response = f.plugin.handle(&get("value")).await;
        assert_eq!(response.code(), Some(ErrorCode::IllegalDeviceState));
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[test(tokio::test)]
    async fn test_one_shot_is_correlated() {
        let mut f = fixture(true).await;
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });

        let frame = f.frames.recv().await.unwrap();
        assert_eq!(frame.command, "sensor.read");
        let id = request_id(&frame);
        assert_eq!(f.plugin.correlator().state(id), Some(PendingState::AwaitingAck));

        let inbound = f.plugin.inbound();
        inbound.send(Inbound::Ack { request_id: id }).await.unwrap();
        inbound
            .send(Inbound::Reply {
                request_id: id,
                body: FramePayload::Json(serde_json::json!({"celsius": 21.5})),
            })
            .await
            .unwrap();

        let payload = call.await.unwrap().unwrap();
        assert_eq!(payload.get("celsius"), Some(&Value::Float(21.5)));
        assert_eq!(f.plugin.correlator().pending_count(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_one_shot_times_out_once() {
        let mut f = fixture(false).await;
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.handle(&get("value")).await });

        let frame = f.frames.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(4100)).await;

        let response = call.await.unwrap();
        assert_eq!(response.code(), Some(ErrorCode::Timeout));

        // a reply after the window has nowhere to go
        assert!(!f.plugin.correlator().complete(request_id(&frame), FramePayload::Empty));
        assert_eq!(f.plugin.correlator().pending_count(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_nack_recovers_and_resends() {
        let mut f = fixture(true).await;
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });

        let first = f.frames.recv().await.unwrap();
        let id = request_id(&first);
        f.plugin.inbound().send(Inbound::Nack { request_id: id }).await.unwrap();

        let resent = f.frames.recv().await.unwrap();
        assert_eq!(resent, first);
        assert_eq!(f.transport.recovery_count(), 1);

        f.plugin
            .inbound()
            .send(Inbound::Reply {
                request_id: id,
                body: FramePayload::Json(serde_json::json!({"celsius": 19})),
            })
            .await
            .unwrap();
        let payload = call.await.unwrap().unwrap();
        assert_eq!(payload.get("celsius"), Some(&Value::Integer(19)));
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_nack_budget_exhausted() {
        let mut f = fixture(true).await;
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&put("calibration")).await });

        // three attempts for parameter commands
        for _ in 0..3 {
            let frame = f.frames.recv().await.unwrap();
            f.plugin
                .inbound()
                .send(Inbound::Nack {
                    request_id: request_id(&frame),
                })
                .await
                .unwrap();
        }

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
        assert_eq!(f.transport.sent_count(), 3);
        assert_eq!(f.transport.recovery_count(), 2);
    }

    #[derive(Debug)]
    struct StalledRecovery {
        inner: Arc<ChannelTransport>,
    }

    #[async_trait]
    impl Transport for StalledRecovery {
        fn name(&self) -> &str {
            "stalled"
        }

        fn acknowledges(&self) -> bool {
            true
        }

        async fn send(&self, frame: &Frame) -> Result<()> {
            self.inner.send(frame).await
        }

        async fn recover(&self) -> Result<()> {
            std::future::pending().await
        }
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_stalled_recovery_times_out() {
        let plugin = Plugin::builder(PluginInfo::new("sensors", "Sensor plugin"))
            .profiles(sensor_profiles())
            .build();
        let (inner, mut frames) = ChannelTransport::new("sim", true);
        let info = DeviceInfo::new("sensor-1", "Hall sensor", "sensor").with_profile("sensor");
        plugin
            .add_device(info, Box::new(ScriptedDriver::default()), Arc::new(StalledRecovery { inner }))
            .await
            .unwrap();
        plugin.connect(&ServiceId::new("sensor-1")).await.unwrap();

        let caller = plugin.clone();
        let call = tokio::spawn(async move { caller.execute(&get("value")).await });
        let frame = frames.recv().await.unwrap();
        plugin
            .inbound()
            .send(Inbound::Nack {
                request_id: request_id(&frame),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(call.is_finished());
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert_eq!(plugin.correlator().pending_count(), 0);
        assert!(frames.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn test_send_failure_resolves_once() {
        let f = fixture(false).await;
        f.transport.set_failing(true);

        let err = f.plugin.execute(&get("value")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
        assert_eq!(f.plugin.correlator().pending_count(), 0);
        assert_eq!(f.transport.sent_count(), 0);

        let response = f.plugin.handle(&put("calibration")).await;
        assert_eq!(response.code(), Some(ErrorCode::IllegalDeviceState));
        assert_eq!(f.plugin.correlator().pending_count(), 0);

        // the link comes back, the device is still usable
        f.transport.set_failing(false);
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let mut frames = f.frames;
        let frame = frames.recv().await.unwrap();
        f.plugin
            .inbound()
            .send(Inbound::Reply {
                request_id: request_id(&frame),
                body: FramePayload::Empty,
            })
            .await
            .unwrap();
        assert!(call.await.unwrap().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_newer_one_shot_supersedes() {
        let mut f = fixture(false).await;
        let plugin = f.plugin.clone();
        let first = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let _ = f.frames.recv().await.unwrap();

        let plugin = f.plugin.clone();
        let second = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let frame = f.frames.recv().await.unwrap();

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::IllegalDeviceState(_)));

        f.plugin
            .inbound()
            .send(Inbound::Reply {
                request_id: request_id(&frame),
                body: FramePayload::Empty,
            })
            .await
            .unwrap();
        assert!(second.await.unwrap().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_subscribe_and_unsubscribe_balance() {
        let f = fixture(false).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (listener, _rx) = ChannelListener::new();
            ids.push(f.plugin.register_event(&put("onMotion"), Arc::new(listener)).await.unwrap());
        }
        settle().await;
        assert_eq!(f.plugin.streams().running(), 1);

        for id in ids {
            f.plugin.unregister_event(&delete("onMotion"), id).await.unwrap();
        }
        settle().await;

        let capability = Capability::new("sensor", None, "onMotion");
        assert_eq!(f.plugin.listeners().listener_count(&f.id, &capability), 0);
        assert_eq!(f.plugin.streams().running(), 0);

        let log = f.log.lock().unwrap().clone();
        assert_eq!(log.iter().filter(|e| *e == "start sensor/onMotion").count(), 1);
        assert_eq!(log.iter().filter(|e| *e == "stop sensor/onMotion").count(), 1);
    }

    #[test(tokio::test)]
    async fn test_unregister_unknown_subscription() {
        let f = fixture(false).await;
        let (listener, _rx) = ChannelListener::new();
        let id = f.plugin.register_event(&put("onMotion"), Arc::new(listener)).await.unwrap();

        let err = f
            .plugin
            .unregister_event(&delete("onTemperature"), id)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidRequestParameter(_)));

        let err = f.plugin.register_event(&get("value"), Arc::new(|_: &Event| -> anyhow::Result<()> { Ok(()) })).await.unwrap_err();
        assert!(matches!(err, DeviceError::NotSupportAction(_)));
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[test(tokio::test)]
    async fn test_third_subscription_leaves_others_running() {
        let f = fixture(false).await;
        let (listener, _rx) = ChannelListener::new();
        let listener: Arc<dyn EventListener> = Arc::new(listener);
        f.plugin.register_event(&put("onTemperature"), listener.clone()).await.unwrap();
        f.plugin.register_event(&put("onHumidity"), listener.clone()).await.unwrap();
        settle().await;

        f.plugin.register_event(&put("onMotion"), listener).await.unwrap();
        settle().await;

        let log = f.log.lock().unwrap().clone();
        assert_eq!(log.iter().filter(|e| e.starts_with("start ")).count(), 3);
        assert!(!log.iter().any(|e| e.starts_with("stop ")));
        assert_eq!(f.plugin.streams().running(), 3);
    }

    #[test(tokio::test)]
    async fn test_events_reach_every_listener() {
        let f = fixture(false).await;
        let delivered = Arc::new(AtomicUsize::new(0));

        let failing = Arc::new(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("listener bug") });
        f.plugin.register_event(&put("onMotion"), failing).await.unwrap();
        for _ in 0..2 {
            let delivered = delivered.clone();
            let listener = Arc::new(move |_: &Event| -> anyhow::Result<()> {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            f.plugin.register_event(&put("onMotion"), listener).await.unwrap();
        }

        let mut tap = f.plugin.events();
        f.plugin
            .inbound()
            .send(Inbound::Event {
                service_id: f.id.clone(),
                capability: Capability::new("sensor", None, "onMotion"),
                payload: EventPayload::Custom { data: Params::new() },
            })
            .await
            .unwrap();

        let event = tap.recv().await.unwrap();
        assert_eq!(event.attribute, "onMotion");
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test(tokio::test)]
    async fn test_remove_device_fails_pending_and_drops_listeners() {
        let mut f = fixture(false).await;
        let (listener, _rx) = ChannelListener::new();
        f.plugin.register_event(&put("onMotion"), Arc::new(listener)).await.unwrap();

        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let _ = f.frames.recv().await.unwrap();

        f.plugin.remove_device(&f.id).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, DeviceError::Removed(_)));
        assert!(matches!(
            f.plugin.registry().find(&f.id).unwrap_err(),
            DeviceError::NotFoundService(_)
        ));
        assert_eq!(f.plugin.listeners().total(), 0);
        assert_eq!(f.plugin.correlator().pending_count(), 0);
    }

    #[test(tokio::test)]
    async fn test_upsert_keeps_subscriptions() {
        let f = fixture(false).await;
        let (listener, _rx) = ChannelListener::new();
        f.plugin.register_event(&put("onMotion"), Arc::new(listener)).await.unwrap();

        let info = DeviceInfo::new("sensor-1", "Hall sensor", "sensor").with_profile("sensor");
        assert_eq!(f.plugin.upsert_device(info.clone()).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(f.plugin.upsert_device(info).await.unwrap(), UpsertOutcome::Unchanged);

        assert_eq!(f.plugin.registry().len(), 1);
        assert_eq!(f.plugin.listeners().total(), 1);
        assert!(f.plugin.registry().find(&f.id).unwrap().is_online());
    }

    #[test(tokio::test)]
    async fn test_connection_changes() {
        let mut f = fixture(false).await;
        let (listener, mut events) = ChannelListener::new();
        f.plugin
            .listeners()
            .subscribe(&f.id, &Capability::connection(), Arc::new(listener), Params::new());

        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let _ = f.frames.recv().await.unwrap();

        f.plugin
            .inbound()
            .send(Inbound::Connection {
                service_id: f.id.clone(),
                connected: false,
            })
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.payload, EventPayload::ConnectionChanged { connected: false });
        assert!(matches!(call.await.unwrap().unwrap_err(), DeviceError::Connection(_)));

        f.plugin.connect(&f.id).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.payload, EventPayload::ConnectionChanged { connected: true });
    }

    #[test(tokio::test)]
    async fn test_connect_retries() {
        let plugin = Plugin::builder(PluginInfo::new("sensors", "Sensor plugin"))
            .profiles(sensor_profiles())
            .build();
        let (transport, _frames) = ChannelTransport::new("sim", false);
        let failing_connects = Arc::new(AtomicUsize::new(2));
        let driver = ScriptedDriver {
            failing_connects: failing_connects.clone(),
            ..ScriptedDriver::default()
        };
        let id = ServiceId::new("sensor-1");
        plugin
            .add_device(DeviceInfo::new("sensor-1", "s", "sensor"), Box::new(driver), transport)
            .await
            .unwrap();

        plugin.connect(&id).await.unwrap();
        assert!(plugin.registry().find(&id).unwrap().is_online());

        plugin.disconnect(&id).await.unwrap();
        failing_connects.store(5, Ordering::SeqCst);
        assert!(plugin.connect(&id).await.is_err());
        assert_eq!(plugin.registry().find(&id).unwrap().state(), ConnectionState::Offline);
    }

    #[test(tokio::test)]
    async fn test_store_and_discovery() {
        let store = Arc::new(MemoryStore::new());
        let config = SharedConfig::new(Config::default());
        let plugin = Plugin::builder(PluginInfo::new("sensors", "Sensor plugin"))
            .profiles(sensor_profiles())
            .config(config)
            .store(store.clone())
            .build();

        let mut discoverer = DeviceDiscoverer::new();
        discoverer.register_provider(crate::discovery::StaticDiscovery::new("paired").with_device(|| {
            crate::discovery::Discovered {
                info: DeviceInfo::new("sensor-9", "Porch", "sensor").with_profile("sensor"),
                driver: Box::new(ScriptedDriver::default()),
                transport: ChannelTransport::new("sim", false).0,
            }
        }));
        let count = plugin
            .discover_and_register(&discoverer, DiscoveryOptions::with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.len(), 1);

        let restarted = Plugin::builder(PluginInfo::new("sensors", "Sensor plugin"))
            .profiles(sensor_profiles())
            .build();
        assert_eq!(restarted.load_devices(store.as_ref()).await.unwrap(), 1);
        let slot = restarted.registry().find(&ServiceId::new("sensor-9")).unwrap();
        assert_eq!(slot.state(), ConnectionState::Offline);

        plugin.remove_device(&ServiceId::new("sensor-9")).await.unwrap();
        assert!(store.is_empty());
    }

    #[test(tokio::test)]
    async fn test_shutdown_refuses_requests() {
        let mut f = fixture(false).await;
        let plugin = f.plugin.clone();
        let call = tokio::spawn(async move { plugin.execute(&get("value")).await });
        let _ = f.frames.recv().await.unwrap();

        f.plugin.shutdown().await;
        assert!(call.await.unwrap().is_err());
        assert!(f.plugin.is_shut_down());
        assert!(!f.plugin.handle(&get("value")).await.is_ok());
        assert!(f.log.lock().unwrap().contains(&"disconnect".to_string()));
    }
}
