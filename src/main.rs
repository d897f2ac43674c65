//! OpenPods D-Bus daemon.
//!
//! Headless service that pairs with, monitors, and controls AirPods-class
//! accessories over their proprietary protocol and exposes the device state
//! over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use audio::NullAudioRouting;
use bluetooth::manager::BluetoothManager;
use dbus::PodsService;
use event::{AirPodsEvent, EventBus};

mod airpods;
mod audio;
mod ble;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;

use crate::{airpods::device::AirPods, dbus::PodsServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting openpodsd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   if let Some(paired) = &config.device {
      info!("Loaded configuration with paired device '{}'", paired.name);
   } else {
      info!("Loaded configuration, no paired device yet");
   }

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create Bluetooth manager with event sender and config
   let bluetooth_manager =
      BluetoothManager::new(event_bus.clone(), config, Arc::new(NullAudioRouting)).await?;

   // Create D-Bus service
   let service = PodsService::new(bluetooth_manager.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.openpods")?
      .serve_at("/org/openpods/manager", service)?
      .build()
      .await?;

   info!("openpodsd D-Bus service started at org.openpods");

   // Start event processor
   event_bus
      .spawn_dispatcher(connection, bluetooth_manager)
      .await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down openpodsd service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(AirPods, AirPodsEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(AirPods, AirPodsEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<PodsService>,
      manager: &BluetoothManager,
      (device, event): (AirPods, AirPodsEvent),
   ) -> Result<()> {
      let addr_str = device.address_str();
      match event {
         AirPodsEvent::DeviceConnected => {
            iface.device_connected(addr_str).await?;
         },
         AirPodsEvent::DeviceDisconnected => {
            iface.device_disconnected(addr_str).await?;
         },
         AirPodsEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr_str, &battery.to_json().to_string())
               .await?;
         },
         AirPodsEvent::NoiseControlChanged(mode) => {
            iface.noise_control_changed(addr_str, mode.to_str()).await?;
         },
         AirPodsEvent::EarDetectionChanged(ear_detection) => {
            iface
               .ear_detection_changed(addr_str, &ear_detection.to_json().to_string())
               .await?;
         },
         AirPodsEvent::DeviceNameChanged(name) => {
            iface.device_name_changed(addr_str, &name).await?;
         },
         AirPodsEvent::ConversationalAwarenessChanged(enabled) => {
            iface
               .conversational_awareness_changed(addr_str, enabled)
               .await?;
         },
         AirPodsEvent::SpeechDetected(lowered) => {
            iface.speech_detected(addr_str, lowered).await?;
         },
         AirPodsEvent::PairingKeysReceived => {
            // The key exchange completed; write the identity to disk so the
            // broadcast path survives a restart
            manager.persist_identity().await;
         },
         AirPodsEvent::DeviceError => {
            iface.device_error(addr_str).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      manager: BluetoothManager,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PodsService>("/org/openpods/manager")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &manager, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &AirPods, event: AirPodsEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
