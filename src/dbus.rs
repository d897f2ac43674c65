use std::{collections::HashMap, str::FromStr};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{
   airpods::protocol::{FeatureId, NoiseControlMode},
   bluetooth::manager::BluetoothManager,
};

pub struct PodsService {
   bluetooth_manager: BluetoothManager,
}

impl PodsService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

#[interface(name = "org.openpods.Manager")]
impl PodsService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .bluetooth_manager
         .get_device()
         .await
         .map(|d| d.to_json())
         .into_iter()
         .collect();
      Ok(serde_json::Value::Array(states).to_string())
   }

   async fn get_device(&self) -> zbus::fdo::Result<String> {
      let dev = self
         .bluetooth_manager
         .get_device()
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("No device".into()))?;
      Ok(dev.to_json().to_string())
   }

   async fn passthrough(&self, packet: String) -> zbus::fdo::Result<bool> {
      let dev = self
         .bluetooth_manager
         .get_device()
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("No device".into()))?;

      let packet = hex::decode(packet).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      dev.passthrough(&packet)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn send_command(
      &self,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let dev = self
         .bluetooth_manager
         .get_device()
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("No device".into()))?;

      match action.as_str() {
         "set_noise_mode" => {
            let mode_str = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;

            let mode = NoiseControlMode::from_str(mode_str.as_str()).map_err(|_| {
               zbus::fdo::Error::InvalidArgs(format!("Invalid noise mode: {mode_str}"))
            })?;

            dev.set_noise_control(mode)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set noise mode to {mode}");
         },

         "set_feature" => {
            let feature = params
               .get("feature")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'feature' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'feature' parameter: {e}"))
               })?;

            let enabled = params
               .get("enabled")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'enabled' parameter".into()))?
               .downcast_ref::<bool>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!(
                     "Invalid 'enabled' value for feature: {feature}: {e}"
                  ))
               })?;

            let feature = FeatureId::from_str(&feature)
               .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown feature: {feature}")))?;

            dev.set_feature(feature, enabled)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set feature {feature} to {enabled}");
         },

         "set_adaptive_noise_level" => {
            let level = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<u32>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;

            dev.set_adaptive_noise_level(level.min(100) as u8)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set adaptive noise level to {level}");
         },

         "set_volume_interval" => {
            let interval = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<u32>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;

            dev.set_volume_swipe_interval(interval.min(u32::from(u8::MAX)) as u8)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set volume swipe interval to {interval}");
         },

         "rename" => {
            let name = params
               .get("value")
               .ok_or_else(|| zbus::fdo::Error::InvalidArgs("Missing 'value' parameter".into()))?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
               })?;

            dev.rename(&name)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Renamed device to {name}");
         },

         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
               "Unknown action: {action}"
            )));
         },
      }

      Ok(true)
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .bluetooth_manager
         .connect_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn disconnect_device(&self) -> zbus::fdo::Result<bool> {
      self
         .bluetooth_manager
         .disconnect_device()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   /// Entry point for the external sleep collaborator.
   async fn set_system_sleep(&self, sleeping: bool) -> zbus::fdo::Result<bool> {
      self.bluetooth_manager.set_system_sleep(sleeping).await;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_control_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      mode: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn conversational_awareness_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      enabled: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn speech_detected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      lowered: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn device(&self) -> String {
      self.get_device().await.unwrap_or_else(|_| "null".into())
   }
}
