/*!
 * Per-capability device activity.
 *
 * The listener manager decides when a stream starts and stops; the
 * [`StreamRunner`] carries that out against the driver. Each device
 * capability gets one worker task that applies start and stop commands in
 * the order they were issued. Push-style devices only get
 * `start_stream`/`stop_stream`; devices that must be polled also get their
 * polling command sent on a fixed interval while the stream runs.
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use devconnect_core::{
    event::Capability,
    types::{Params, ServiceId, Value},
};

use crate::device::{DeviceError, Result};
use crate::listener::StreamControl;
use crate::registry::{DeviceRegistry, DeviceSlot, RemovalHook};
use crate::transport::{Frame, FramePayload};

/// Parameter overriding the polling interval, in milliseconds
pub const INTERVAL_PARAM: &str = "interval";

type StreamKey = (ServiceId, Capability);

#[derive(Debug)]
enum StreamCommand {
    Start { params: Params, interval: Duration },
    Stop,
}

#[derive(Debug)]
struct Worker {
    commands: mpsc::UnboundedSender<StreamCommand>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Streams {
    workers: HashMap<StreamKey, Worker>,
    started: HashSet<StreamKey>,
}

/// Runs device streams for a plugin
#[derive(Debug)]
pub struct StreamRunner {
    registry: Arc<DeviceRegistry>,
    default_interval: Duration,
    streams: Mutex<Streams>,
}

impl StreamRunner {
    /// Create a runner polling at `default_interval` unless a subscription
    /// asks for another interval
    pub fn new(registry: Arc<DeviceRegistry>, default_interval: Duration) -> Self {
        Self {
            registry,
            default_interval,
            streams: Mutex::new(Streams::default()),
        }
    }

    /// Number of started streams
    pub fn running(&self) -> usize {
        self.lock().started.len()
    }

    /// Abort every stream worker
    pub fn stop_all(&self) {
        let workers: Vec<Worker> = {
            let mut streams = self.lock();
            streams.started.clear();
            streams.workers.drain().map(|(_, worker)| worker).collect()
        };
        for worker in workers {
            worker.task.abort();
        }
    }

    fn interval_for(&self, params: &Params) -> Duration {
        params
            .get(INTERVAL_PARAM)
            .and_then(Value::as_number)
            .filter(|ms| *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(self.default_interval)
    }

    fn send(&self, service_id: &ServiceId, capability: &Capability, command: StreamCommand) {
        let key = (service_id.clone(), capability.clone());
        let mut streams = self.lock();
        match &command {
            StreamCommand::Start { .. } => streams.started.insert(key.clone()),
            StreamCommand::Stop => streams.started.remove(&key),
        };

        let unsent = match streams.workers.get(&key) {
            Some(worker) => worker
                .commands
                .send(command)
                .err()
                .map(|mpsc::error::SendError(command)| command),
            None => Some(command),
        };
        let Some(command) = unsent else {
            return;
        };

        // no worker, or it is gone; a stop has nothing left to do
        streams.workers.remove(&key);
        if matches!(command, StreamCommand::Start { .. }) {
            self.spawn_worker(&mut streams, key, command);
        }
    }

    fn spawn_worker(&self, streams: &mut Streams, key: StreamKey, first: StreamCommand) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(service_id = %key.0, "No runtime to run stream {}", key.1);
            streams.started.remove(&key);
            return;
        };
        let (commands, rx) = mpsc::unbounded_channel();
        let _ = commands.send(first);
        let task = runtime.spawn(run_worker(self.registry.clone(), key.clone(), rx));
        streams.workers.insert(key, Worker { commands, task });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamControl for StreamRunner {
    fn start(&self, service_id: &ServiceId, capability: &Capability, params: &Params) {
        // connection changes come from the link, not from the device
        if *capability == Capability::connection() {
            return;
        }
        let command = StreamCommand::Start {
            params: params.clone(),
            interval: self.interval_for(params),
        };
        self.send(service_id, capability, command);
        debug!(service_id = %service_id, "Stream {} requested", capability);
    }

    fn stop(&self, service_id: &ServiceId, capability: &Capability) {
        if *capability == Capability::connection() {
            return;
        }
        self.send(service_id, capability, StreamCommand::Stop);
    }
}

impl RemovalHook for StreamRunner {
    // queued commands still run; the worker exits once its queue is closed
    fn on_device_removed(&self, id: &ServiceId) {
        let mut streams = self.lock();
        streams.workers.retain(|(service_id, _), _| service_id != id);
        streams.started.retain(|(service_id, _)| service_id != id);
    }
}

/// A started stream, bound to the slot it was started on
struct ActiveStream {
    slot: Arc<DeviceSlot>,
    poll: Option<(FramePayload, Interval)>,
}

impl ActiveStream {
    async fn start(
        registry: &DeviceRegistry,
        service_id: &ServiceId,
        capability: &Capability,
        params: &Params,
        interval: Duration,
    ) -> Result<Self> {
        let slot = registry.find(service_id)?;
        let poll = {
            let mut guard = slot.lock_driver().await;
            let driver = guard
                .as_mut()
                .ok_or_else(|| DeviceError::NotConnected(format!("{} has no driver", service_id)))?;
            driver.start_stream(capability, params).await?;
            driver.poll_command(capability, params)
        };
        let poll = poll.map(|payload| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            (payload, ticker)
        });
        debug!(service_id = %service_id, "Stream {} started", capability);
        Ok(Self { slot, poll })
    }

    async fn stop(self, capability: &Capability) {
        let mut guard = self.slot.lock_driver().await;
        if let Some(driver) = guard.as_mut() {
            if let Err(e) = driver.stop_stream(capability).await {
                warn!(service_id = %self.slot.id(), "Failed to stop stream {}: {}", capability, e);
            }
        }
        debug!(service_id = %self.slot.id(), "Stream {} stopped", capability);
    }

    async fn poll(&self, capability: &Capability) {
        let Some((payload, _)) = &self.poll else {
            return;
        };
        if !self.slot.is_online() {
            return;
        }
        let Some(transport) = self.slot.transport() else {
            return;
        };
        let frame = Frame {
            request_id: None,
            service_id: self.slot.id().clone(),
            command: capability.to_string(),
            payload: payload.clone(),
        };
        // a lost poll is replaced by the next tick
        if let Err(e) = transport.send(&frame).await {
            warn!(service_id = %self.slot.id(), "Poll for {} failed: {}", capability, e);
        }
    }
}

async fn next_tick(active: &mut Option<ActiveStream>) {
    match active.as_mut().and_then(|stream| stream.poll.as_mut()) {
        Some((_, ticker)) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_worker(
    registry: Arc<DeviceRegistry>,
    (service_id, capability): StreamKey,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let mut active: Option<ActiveStream> = None;
    loop {
        tokio::select! {
            command = commands.recv() => {
                if let Some(stream) = active.take() {
                    stream.stop(&capability).await;
                }
                match command {
                    Some(StreamCommand::Start { params, interval }) => {
                        match ActiveStream::start(&registry, &service_id, &capability, &params, interval).await {
                            Ok(stream) => active = Some(stream),
                            Err(e) => warn!(service_id = %service_id, "Stream {} ended: {}", capability, e),
                        }
                    }
                    Some(StreamCommand::Stop) => {}
                    None => break,
                }
            }
            _ = next_tick(&mut active) => {
                if let Some(stream) = &active {
                    stream.poll(&capability).await;
                }
            }
        }
    }
    debug!(service_id = %service_id, "Stream worker for {} exited", capability);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectionState, DeviceDriver, DeviceInfo};
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Debug, Default)]
    struct PolledDriver;

    #[async_trait]
    impl DeviceDriver for PolledDriver {
        fn driver_name(&self) -> &'static str {
            "polled"
        }

        fn poll_command(&self, _capability: &Capability, _params: &Params) -> Option<FramePayload> {
            Some(FramePayload::Binary(Bytes::from_static(&[0xFE, 0x04])))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_at_requested_interval() {
        let registry = Arc::new(DeviceRegistry::new());
        let id = ServiceId::new("hvc-1");
        let (transport, mut frames) = ChannelTransport::new("sim", false);
        registry.upsert(DeviceInfo::new("hvc-1", "HVC", "hvc")).unwrap();
        registry.attach(&id, Box::new(PolledDriver), transport.clone()).await.unwrap();
        registry.set_state(&id, ConnectionState::Online).unwrap();

        let runner = StreamRunner::new(registry, Duration::from_secs(1));
        let capability = Capability::new("humanDetection", None, "onBodyDetection");
        let mut params = Params::new();
        params.insert(INTERVAL_PARAM.into(), Value::Integer(3000));
        runner.start(&id, &capability, &params);

        let first = frames.recv().await.unwrap();
        assert_eq!(first.request_id, None);
        assert_eq!(first.command, "humanDetection/onBodyDetection");

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(runner.running(), 1);

        runner.stop(&id, &capability);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(runner.running(), 0);
    }

    #[derive(Debug, Default)]
    struct RecordingDriver {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl DeviceDriver for RecordingDriver {
        fn driver_name(&self) -> &'static str {
            "recording"
        }

        async fn start_stream(&mut self, _capability: &Capability, _params: &Params) -> Result<()> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }

        async fn stop_stream(&mut self, _capability: &Capability) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.log.lock().unwrap().push("stop");
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restarts_apply_in_order() {
        let registry = Arc::new(DeviceRegistry::new());
        let id = ServiceId::new("bb8");
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver { log: log.clone() };
        registry.upsert(DeviceInfo::new("bb8", "BB-8", "sphero")).unwrap();
        registry
            .attach(&id, Box::new(driver), ChannelTransport::new("ble", false).0)
            .await
            .unwrap();
        registry.set_state(&id, ConnectionState::Online).unwrap();

        let runner = StreamRunner::new(registry, Duration::from_secs(1));
        let capability = Capability::new("sphero", Some("quaternion"), "onQuaternion");
        for _ in 0..20 {
            runner.start(&id, &capability, &Params::new());
            runner.stop(&id, &capability);
        }
        runner.start(&id, &capability, &Params::new());
        assert_eq!(runner.running(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while log.lock().unwrap().len() < 41 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 41);
        assert!(log.chunks(2).take(20).all(|pair| pair == ["start", "stop"]));
        assert_eq!(log.last(), Some(&"start"));
        assert_eq!(runner.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_device_releases_worker() {
        let registry = Arc::new(DeviceRegistry::new());
        let id = ServiceId::new("hvc-1");
        let (transport, mut frames) = ChannelTransport::new("sim", false);
        registry.upsert(DeviceInfo::new("hvc-1", "HVC", "hvc")).unwrap();
        registry.attach(&id, Box::new(PolledDriver), transport.clone()).await.unwrap();
        registry.set_state(&id, ConnectionState::Online).unwrap();

        let runner = StreamRunner::new(registry, Duration::from_secs(1));
        let capability = Capability::new("humanDetection", None, "onBodyDetection");
        runner.start(&id, &capability, &Params::new());
        assert!(frames.recv().await.is_some());

        runner.on_device_removed(&id);
        assert_eq!(runner.running(), 0);
        assert!(runner.lock().workers.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_interval_falls_back_to_default() {
        let runner = StreamRunner::new(Arc::new(DeviceRegistry::new()), Duration::from_millis(1500));
        let mut params = Params::new();
        assert_eq!(runner.interval_for(&params), Duration::from_millis(1500));
        params.insert(INTERVAL_PARAM.into(), Value::String("5000".into()));
        assert_eq!(runner.interval_for(&params), Duration::from_millis(5000));
        params.insert(INTERVAL_PARAM.into(), Value::Integer(-1));
        assert_eq!(runner.interval_for(&params), Duration::from_millis(1500));
    }
}
