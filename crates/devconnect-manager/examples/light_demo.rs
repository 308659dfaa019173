use std::time::Duration;

use anyhow::Context;

use devconnect_core::{
    config::{ConfigBuilder, SharedConfig},
    event::{Capability, EventPayload},
    logging,
    message::{Action, Request},
    types::ServiceId,
};
use devconnect_devices::devices::{drive, light, DriveDriver, LightDriver};
use devconnect_devices::{ChannelTransport, Inbound, Plugin, PluginInfo};
use devconnect_manager::Manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration from defaults and DEVCONNECT__* environment variables
    let config = ConfigBuilder::new()
        .with_environment_prefix("DEVCONNECT")
        .build()
        .context("loading configuration")?;
    logging::init_from_config(&config.logging)?;
    let config = SharedConfig::new(config);
    let manager = Manager::new(config.clone());

    // A light bridge with one lamp
    let hue = Plugin::builder(PluginInfo::new("hue", "Hue lights"))
        .config(config.clone())
        .profiles(light::profiles())
        .build();
    let (bridge, _frames) = ChannelTransport::new("bridge", false);
    hue.add_device(light::device_info("lamp-1", "Desk lamp"), Box::new(LightDriver::new()), bridge)
        .await?;
    hue.connect(&ServiceId::new("lamp-1")).await?;
    manager.register_plugin(hue)?;

    // A robot pushing sensor samples once subscribed
    let sphero = Plugin::builder(PluginInfo::new("sphero", "Sphero"))
        .config(config.clone())
        .profiles(drive::profiles())
        .build();
    let (ble, _frames) = ChannelTransport::new("ble", false);
    sphero
        .add_device(drive::device_info("bb8", "BB-8"), Box::new(DriveDriver::new()), ble)
        .await?;
    sphero.connect(&ServiceId::new("bb8")).await?;
    manager.register_plugin(sphero.clone())?;

    let domain = manager.domain().to_string();
    let lamp = format!("lamp-1.hue.{}", domain);
    let bb8 = format!("bb8.sphero.{}", domain);

    let services = manager
        .handle("demo", &Request::new(Action::Get, "", "serviceDiscovery"))
        .await;
    println!("services: {:?}", services.get("services"));

    let on = Request::new(Action::Put, lamp.as_str(), "light")
        .with_attribute("on")
        .with_param("color", "red")
        .with_param("brightness", 0.6);
    println!("{} -> {:?}", on, manager.handle("demo", &on).await.result);

    let status = manager
        .handle("demo", &Request::new(Action::Get, lamp.as_str(), "light"))
        .await;
    println!("lamp: on={:?} color={:?}", status.get("on"), status.get("color"));

    // Register for quaternion samples and feed one in from the robot side
    let mut deliveries = manager.deliveries();
    let subscribe = Request::new(Action::Put, bb8.as_str(), "sphero")
        .with_interface("quaternion")
        .with_attribute("onQuaternion");
    let session = manager.handle("demo", &subscribe).await;
    println!("session: {:?}", session.get("sessionId"));

    sphero
        .inbound()
        .send(Inbound::Event {
            service_id: ServiceId::new("bb8"),
            capability: Capability::new("sphero", Some("quaternion"), "onQuaternion"),
            payload: EventPayload::Quaternion {
                q0: 0.92,
                q1: 0.0,
                q2: 0.38,
                q3: 0.0,
                interval_ms: 100,
            },
        })
        .await?;

    let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.recv())
        .await
        .context("no event delivered")??;
    println!(
        "event for {} from {}: {}",
        delivery.client_id,
        delivery.event.service_id,
        serde_json::to_string(&delivery.event.payload)?
    );

    println!("removed {} sessions", manager.remove_client("demo"));
    manager.shutdown().await;
    Ok(())
}
