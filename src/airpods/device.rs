//! Accessory device implementation and connection state machine.
//!
//! This module provides the core `AirPods` type which owns the primary
//! link, drives the handshake sequence, dispatches decoded packets into the
//! device state model, and folds in verified BLE broadcasts.

use core::fmt;
use std::{
   mem,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::{RwLock, mpsc},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   airpods::{
      parser,
      protocol::{
         BatteryInfo, FeatureCmd, FeatureId, HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE,
         HDR_BATTERY_STATE, HDR_CA_DATA, HDR_CMD_CTL, HDR_EAR_DETECTION, HDR_MAGIC_KEYS,
         HDR_METADATA, HDR_NOISE_CTL, NoiseControlMode, PKT_HANDSHAKE, PKT_REQUEST_MAGIC_KEYS,
         PKT_REQUEST_NOTIFY, PKT_SET_FEATURES, build_adaptive_noise_packet, build_rename_packet,
         build_volume_interval_packet, parse_state_byte,
      },
      state::{DeviceIdentity, DeviceState, EarDetection},
   },
   ble::{advertisement::Advertisement, crypto},
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet},
   error::{PodsError, Result},
   event::{AirPodsEvent, EventSender},
};

/// Delay before the one-shot re-send of the notification request.
///
/// Covers a class of devices that silently drop the first request.
const NOTIFY_RESEND_DELAY: Duration = Duration::from_millis(2000);

/// Handshake phases of the primary link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkPhase {
   #[default]
   Disconnected,
   Connecting,
   AwaitingHandshakeAck,
   AwaitingFeatureAck,
   Active,
}

/// Internal state for an active L2CAP connection.
#[derive(Debug)]
struct ConnectionState {
   sender: L2CapSender,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Internal shared state for an accessory device.
#[derive(Debug, Default)]
struct AirPodsInner {
   address: Address,
   address_str: SmolStr,
   state: parking_lot::Mutex<DeviceState>,
   is_connected: AtomicBool,
   battery_seen: AtomicBool,
   reached_active: AtomicBool,
   phase: AtomicCell<LinkPhase>,
   relay_tx: parking_lot::Mutex<Option<mpsc::Sender<Packet>>>,
   noise_mode: AtomicCell<Option<NoiseControlMode>>,
   conversational: AtomicCell<Option<bool>>,
   one_bud_anc: AtomicCell<Option<bool>>,
   adaptive_noise_level: AtomicCell<Option<u8>>,
   features: [AtomicU64; 256 / 64],
   features_seen: [AtomicU64; 256 / 64],
   conn: RwLock<Option<ConnectionState>>,
   // Connection-attempt generation; bumped on every session start and on
   // disconnect so stale one-shot timers recognize they are outdated.
   generation: AtomicU64,
}

/// Represents a known accessory device.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct AirPods(Arc<AirPodsInner>);

/// Weak reference to an accessory device.
#[derive(Debug, Clone)]
pub struct WeakAirPods(Weak<AirPodsInner>);

impl WeakAirPods {
   pub fn new(airpods: &AirPods) -> Self {
      Self(Arc::downgrade(&airpods.0))
   }

   pub fn upgrade(&self) -> Option<AirPods> {
      self.0.upgrade().map(AirPods)
   }
}

impl fmt::Debug for AirPods {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(new), new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

impl AirPods {
   /// Creates a new accessory device instance.
   pub fn new(address: Address, name: SmolStr) -> Self {
      let inner = AirPodsInner {
         address,
         address_str: address.to_smolstr(),
         ..Default::default()
      };
      inner.state.lock().identity.name = name;
      Self(Arc::new(inner))
   }

   /// Gets the address of the device.
   pub fn address(&self) -> Address {
      self.0.address
   }

   /// Gets the address string of the device.
   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   /// Gets the name of the device.
   pub fn name(&self) -> SmolStr {
      self.0.state.lock().identity.name.clone()
   }

   /// Updates the name of the device.
   pub fn update_name(&self, name: SmolStr) -> UpdateOp<SmolStr> {
      let mut state = self.0.state.lock();
      if state.identity.name == name {
         return UpdateOp::Noop;
      }
      UpdateOp::Updated(mem::replace(&mut state.identity.name, name))
   }

   /// Restores a persisted identity, e.g. at startup.
   pub fn restore_identity(&self, identity: DeviceIdentity) {
      self.0.state.lock().identity = identity;
   }

   /// Gets a snapshot of the durable identity.
   pub fn identity(&self) -> DeviceIdentity {
      self.0.state.lock().identity.clone()
   }

   /// Gets the battery information of the device.
   pub fn battery_info(&self) -> BatteryInfo {
      self.0.state.lock().battery.info()
   }

   /// Gets the ear detection status of the device.
   pub fn ear_detection(&self) -> EarDetection {
      self.0.state.lock().ear_detection
   }

   /// Checks if the primary link is established.
   pub fn is_connected(&self) -> bool {
      self.0.is_connected.load(Ordering::Relaxed)
   }

   /// Current handshake phase of the primary link.
   pub fn phase(&self) -> LinkPhase {
      self.0.phase.load()
   }

   /// Whether the current or last session reached the `Active` phase.
   pub fn reached_active(&self) -> bool {
      self.0.reached_active.load(Ordering::Relaxed)
   }

   /// Installs or removes the tap that mirrors every inbound packet, used
   /// for the companion-link relay.
   pub fn set_relay(&self, tx: Option<mpsc::Sender<Packet>>) {
      *self.0.relay_tx.lock() = tx;
   }

   fn relay(&self, packet: &Packet) {
      if let Some(tx) = self.0.relay_tx.lock().as_ref() {
         let _ = tx.try_send(packet.clone());
      }
   }

   /// Gets the noise control mode of the device.
   pub fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.0.noise_mode.load()
   }

   /// Sets the noise control mode of the device.
   pub fn update_noise_mode(
      &self,
      mode: impl Into<Option<NoiseControlMode>>,
   ) -> UpdateOp<NoiseControlMode> {
      UpdateOp::apply_atomic(&self.0.noise_mode, mode.into())
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let (battery, ears, identity) = {
         let state = self.0.state.lock();
         (state.battery, state.ear_detection, state.identity.clone())
      };

      let mut info = json!({
          "address": self.address_str().as_str(),
          "name": identity.name.as_str(),
          "connected": self.is_connected(),
          "phase": self.phase().to_string(),
          "battery": battery.info().to_json(),
          "left_primary": battery.is_left_primary(),
          "ear_detection": ears.to_json(),
      });

      if let Some(primary) = battery.primary_pod() {
         info["primary_pod"] = json!(primary.to_string());
      }
      if let Some(secondary) = battery.secondary_pod() {
         info["secondary_pod"] = json!(secondary.to_string());
      }
      if let Some(model) = identity.model {
         info["model"] = json!(model.to_string());
      }
      if let Some(mode) = self.noise_mode() {
         info["noise_mode"] = json!(mode.to_str());
      }
      if let Some(ca) = self.0.conversational.load() {
         info["conversational"] = json!(ca);
      }
      if let Some(one_bud) = self.0.one_bud_anc.load() {
         info["one_bud_anc"] = json!(one_bud);
      }
      if let Some(level) = self.0.adaptive_noise_level.load() {
         info["adaptive_noise_level"] = json!(level);
      }

      let features: serde_json::Map<_, _> = self
         .features()
         .into_iter()
         .map(|(k, v)| (k.to_str().to_owned(), json!(v)))
         .collect();
      info["features"] = json!(features);
      info
   }

   pub fn feature_enabled(&self, feature: FeatureId) -> bool {
      let (idx, mask) = Self::feature_bitpos(feature);
      self.0.features[idx].load(Ordering::Relaxed) & mask != 0
   }

   pub fn seen_feature(&self, feature: FeatureId) -> bool {
      let (idx, mask) = Self::feature_bitpos(feature);
      self.0.features_seen[idx].load(Ordering::Relaxed) & mask != 0
   }

   pub fn features(&self) -> Vec<(FeatureId, bool)> {
      let mut features = Vec::new();
      for i in 0..=0xff {
         let feat = FeatureId::from_id(i);
         if self.seen_feature(feat) {
            features.push((feat, self.feature_enabled(feat)));
         }
      }
      features
   }

   pub fn set_feature_enabled(&self, feature: FeatureId, enabled: bool) -> bool {
      let (idx, mask) = Self::feature_bitpos(feature);
      self.0.features_seen[idx].fetch_or(mask, Ordering::Relaxed);
      let prev = if enabled {
         self.0.features[idx].fetch_or(mask, Ordering::Relaxed)
      } else {
         self.0.features[idx].fetch_and(!mask, Ordering::Relaxed)
      };
      prev & mask != 0
   }

   const fn feature_bitpos(feature: FeatureId) -> (usize, u64) {
      let idx = feature.id() as usize >> 6;
      let mask = 1 << (feature.id() as usize & 0x3f);
      (idx, mask)
   }

   /// Establishes the primary L2CAP connection and starts the handshake.
   ///
   /// Returns a join handle that resolves when the connection is closed.
   pub async fn connect(&self, event_tx: &EventSender) -> Result<JoinHandle<Option<PodsError>>> {
      info!("Connecting to accessory at {}", self.address());
      self.0.phase.store(LinkPhase::Connecting);

      let mut jset = JoinSet::new();
      let (receiver, sender) = match l2cap::connect(&mut jset, self.address(), None).await {
         Ok(halves) => halves,
         Err(e) => {
            self.0.phase.store(LinkPhase::Disconnected);
            return Err(e);
         },
      };

      self.begin_session(jset, receiver, sender, event_tx).await
   }

   /// Starts the handshake sequence over an already-connected transport.
   async fn begin_session(
      &self,
      jset: JoinSet<()>,
      receiver: L2CapReceiver,
      sender: L2CapSender,
      event_tx: &EventSender,
   ) -> Result<JoinHandle<Option<PodsError>>> {
      let mut conn = self.0.conn.write().await;
      let _ = conn.take();

      let generation = self.0.generation.fetch_add(1, Ordering::Relaxed) + 1;
      self.0.battery_seen.store(false, Ordering::Relaxed);
      self.0.reached_active.store(false, Ordering::Relaxed);

      if let Err(e) = sender.send(PKT_HANDSHAKE).await {
         self.0.phase.store(LinkPhase::Disconnected);
         return Err(e);
      }
      self.0.phase.store(LinkPhase::AwaitingHandshakeAck);

      let jhandle =
         self.start_packet_processor(receiver, sender.clone(), event_tx.clone(), generation);

      *conn = Some(ConnectionState { sender, jset });
      self.0.is_connected.store(true, Ordering::Relaxed);
      info!("{}: handshake started", self.address());
      Ok(jhandle)
   }

   pub async fn disconnect(&self) {
      self.0.generation.fetch_add(1, Ordering::Relaxed);
      self.0.is_connected.store(false, Ordering::Relaxed);
      self.0.phase.store(LinkPhase::Disconnected);
      self.0.state.lock().reset();
      let _ = self.0.conn.write().await.take();
      info!("Disconnected from {}", self.address());
   }

   async fn notify_disconnected(&self, event_tx: &EventSender) {
      self.disconnect().await;
      event_tx.emit(self, AirPodsEvent::DeviceDisconnected);
   }

   fn start_packet_processor(
      &self,
      mut rx: L2CapReceiver,
      sender: L2CapSender,
      event_tx: EventSender,
      generation: u64,
   ) -> JoinHandle<Option<PodsError>> {
      let addr = self.address();
      let weak = WeakAirPods::new(self);
      tokio::spawn(async move {
         let mut err = None;
         loop {
            match rx.recv().await {
               Ok(packet) => {
                  if let Some(this) = weak.upgrade() {
                     this.relay(&packet);
                     this
                        .process_packet(addr, packet, &sender, generation, &event_tx)
                        .await;
                  } else {
                     warn!("{addr}: device instance was dropped");
                     break;
                  }
               },
               Err(e) => {
                  if let Some(this) = weak.upgrade() {
                     this.notify_disconnected(&event_tx).await;
                  } else {
                     warn!("{addr}: connection closed: {e:?}");
                  }
                  err = Some(e);
                  break;
               },
            }
         }
         err
      })
   }

   /// Schedules the single delayed re-send of the notification request.
   ///
   /// The timer is keyed to the connection-attempt generation; a reconnect
   /// or disconnect invalidates it.
   fn schedule_notify_resend(&self, sender: L2CapSender, generation: u64) {
      let weak = WeakAirPods::new(self);
      let mac = self.address();
      tokio::spawn(async move {
         time::sleep(NOTIFY_RESEND_DELAY).await;

         let Some(this) = weak.upgrade() else { return };
         if this.0.generation.load(Ordering::Relaxed) != generation {
            return; // superseded attempt
         }
         if this.0.battery_seen.load(Ordering::Relaxed) {
            return;
         }
         warn!("{mac}: no battery status after notification request, re-sending once");
         let _ = sender.send(PKT_REQUEST_NOTIFY).await;
      });
   }

   async fn process_packet(
      &self,
      address: Address,
      packet: Packet,
      sender: &L2CapSender,
      generation: u64,
      event_tx: &EventSender,
   ) {
      match self.0.phase.load() {
         LinkPhase::AwaitingHandshakeAck if packet.starts_with(HDR_ACK_HANDSHAKE) => {
            debug!("{address}: handshake acknowledged");
            if sender.send(PKT_SET_FEATURES).await.is_ok() {
               self.0.phase.store(LinkPhase::AwaitingFeatureAck);
            }
            return;
         },
         LinkPhase::AwaitingFeatureAck if packet.starts_with(HDR_ACK_FEATURES) => {
            debug!("{address}: features acknowledged");
            if sender.send(PKT_REQUEST_NOTIFY).await.is_ok() {
               self.0.phase.store(LinkPhase::Active);
               self.0.reached_active.store(true, Ordering::Relaxed);
               self.schedule_notify_resend(sender.clone(), generation);
            }
            return;
         },
         _ => {},
      }

      // Battery status
      if packet.starts_with(HDR_BATTERY_STATE) {
         match parser::parse_battery_status(&packet) {
            Ok(parsed) => {
               let (before, after) = {
                  let mut state = self.0.state.lock();
                  let before = state.battery;
                  state.battery.apply_packet(&parsed);
                  (before, state.battery)
               };
               self.0.battery_seen.store(true, Ordering::Relaxed);

               let info = after.info();
               debug!(
                  "Battery updated for {}: L:{}% R:{}% C:{}%",
                  address, info.left.level, info.right.level, info.case.level
               );
               if before != after {
                  event_tx.emit(self, AirPodsEvent::BatteryUpdated(info));
               }
            },
            Err(e) => warn!("Failed to parse battery: {e}"),
         }
      }
      // Ear detection
      else if packet.starts_with(HDR_EAR_DETECTION) {
         match parser::parse_ear_detection(&packet) {
            Ok((primary, secondary)) => {
               let (before, after) = {
                  let mut state = self.0.state.lock();
                  let before = state.ear_detection;
                  state.ear_detection.apply_packet(primary, secondary);
                  (before, state.ear_detection)
               };
               debug!("Ear detection updated for {address}: P:{primary} S:{secondary}");
               if before != after {
                  event_tx.emit(self, AirPodsEvent::EarDetectionChanged(after));
               }
            },
            Err(e) => warn!("Failed to parse ear detection: {e}"),
         }
      }
      // Pairing keys response
      else if packet.starts_with(HDR_MAGIC_KEYS) {
         match parser::parse_magic_keys(&packet) {
            Ok(keys) => {
               info!("{address}: pairing keys received");
               self.0.state.lock().identity.keys = Some(keys);
               event_tx.emit(self, AirPodsEvent::PairingKeysReceived);
            },
            // Deviating key packets count as "not received"
            Err(e) => warn!("Failed to parse pairing keys: {e}"),
         }
      }
      // Metadata
      else if packet.starts_with(HDR_METADATA) {
         match parser::parse_metadata(&packet) {
            Ok(metadata) => {
               debug!("Device metadata for {address}: {metadata:?}");
               {
                  let mut state = self.0.state.lock();
                  state.identity.model_number = metadata.model_number;
                  state.identity.manufacturer = metadata.manufacturer;
               }
               if !metadata.device_name.is_empty()
                  && self.update_name(metadata.device_name.clone()).is_updated()
               {
                  event_tx.emit(self, AirPodsEvent::DeviceNameChanged(metadata.device_name));
               }
               // Metadata marks the link as usable; initiate the key exchange
               let _ = sender.send(PKT_REQUEST_MAGIC_KEYS).await;
            },
            Err(e) => warn!("Failed to parse metadata: {e}"),
         }
      }
      // Conversational awareness data (speech detection)
      else if packet.starts_with(HDR_CA_DATA) {
         if let Some(lowered) = parser::parse_conversational_data(&packet) {
            debug!("{address}: speech detected = {lowered}");
            event_tx.emit(self, AirPodsEvent::SpeechDetected(lowered));
         }
      }
      // Noise control mode
      else if packet.starts_with(HDR_NOISE_CTL) {
         match parser::parse_noise_mode(&packet) {
            Ok(mode) => {
               debug!("Noise mode updated for {address}: {mode}");
               if self.update_noise_mode(mode).is_updated() {
                  event_tx.emit(self, AirPodsEvent::NoiseControlChanged(mode));
               }
            },
            Err(e) => warn!("Failed to parse noise mode: {e}"),
         }
      }
      // Two-state feature replies on the control channel
      else if packet.starts_with(HDR_CMD_CTL) {
         self.process_control_reply(address, &packet, event_tx);
      }
      // Late or repeated acks
      else if packet.starts_with(HDR_ACK_HANDSHAKE) {
         debug!("Received handshake ACK from {address}");
      } else if packet.starts_with(HDR_ACK_FEATURES) {
         debug!("Received features ACK from {address}");
      } else {
         let data = if packet.len() < 16 {
            hex::encode(&packet)
         } else {
            format!(
               "{}..{}",
               hex::encode(&packet[..8]),
               hex::encode(&packet[8..])
            )
         };

         debug!(
            "Unknown packet from {} | {} bytes => {}",
            address,
            packet.len(),
            data
         );
      }
   }

   fn process_control_reply(&self, address: Address, packet: &[u8], event_tx: &EventSender) {
      let Some(&cmd) = packet.get(6) else {
         debug!("Short control packet from {address}");
         return;
      };

      if cmd == FeatureId::CONVERSATIONAL.id() {
         if let Some(enabled) = parse_state_byte(packet) {
            debug!("Conversational awareness for {address}: {enabled}");
            if UpdateOp::apply_atomic(&self.0.conversational, Some(enabled)).is_updated() {
               event_tx.emit(self, AirPodsEvent::ConversationalAwarenessChanged(enabled));
            }
            self.set_feature_enabled(FeatureId::CONVERSATIONAL, enabled);
         }
      } else if cmd == FeatureId::ONE_BUD_ANC.id() {
         if let Some(enabled) = parse_state_byte(packet) {
            debug!("One-bud ANC for {address}: {enabled}");
            self.0.one_bud_anc.store(Some(enabled));
            self.set_feature_enabled(FeatureId::ONE_BUD_ANC, enabled);
         }
      } else if let Some((feature, op)) = FeatureCmd::parse(packet) {
         debug!("Received feature command from {address}: {feature} {op:?}");
         if matches!(op, FeatureCmd::Enable | FeatureCmd::Disable) {
            self.set_feature_enabled(feature, matches!(op, FeatureCmd::Enable));
         }
      } else {
         debug!("Unhandled control reply from {address}: {}", hex::encode(packet));
      }
   }

   /// Folds a decoded broadcast into the state model.
   ///
   /// The advertisement address must cryptographically resolve against the
   /// stored identity resolving key; anything else is discarded without
   /// touching state. With no keys stored yet this path is simply inert.
   pub fn apply_advertisement(&self, adv: &Advertisement, event_tx: &EventSender) -> bool {
      let (update, battery) = {
         let mut state = self.0.state.lock();
         let Some(irk) = state.identity.irk() else {
            return false; // no keys yet, expected before first pairing
         };
         if !crypto::verify_resolvable_address(&adv.address.to_string(), irk) {
            debug!("{}: advertisement address did not resolve", adv.address);
            return false;
         }
         let Some(enc_key) = state.identity.enc_key() else {
            return false;
         };
         let Some(payload) = crypto::decrypt_payload(&adv.encrypted_payload, enc_key) else {
            return false;
         };

         let update = state.apply_broadcast(adv, &payload);
         (update, state.battery.info())
      };

      if update.battery_changed {
         event_tx.emit(self, AirPodsEvent::BatteryUpdated(battery));
      }
      if update.ear_changed {
         event_tx.emit(self, AirPodsEvent::EarDetectionChanged(self.ear_detection()));
      }
      true
   }

   pub async fn set_noise_control(&self, mode: NoiseControlMode) -> Result<()> {
      self.send_packet(&mode.build()).await?;
      self.0.noise_mode.store(Some(mode));
      Ok(())
   }

   pub async fn set_feature(&self, feature: FeatureId, enabled: bool) -> Result<()> {
      let packet = if enabled {
         FeatureCmd::Enable.build(feature.id())
      } else {
         FeatureCmd::Disable.build(feature.id())
      };
      self.send_packet(&packet).await?;
      self.set_feature_enabled(feature, enabled);
      if feature == FeatureId::CONVERSATIONAL {
         self.0.conversational.store(Some(enabled));
      } else if feature == FeatureId::ONE_BUD_ANC {
         self.0.one_bud_anc.store(Some(enabled));
      }
      Ok(())
   }

   pub async fn set_adaptive_noise_level(&self, level: u8) -> Result<()> {
      let level = level.min(100);
      self.send_packet(&build_adaptive_noise_packet(level)).await?;
      self.0.adaptive_noise_level.store(Some(level));
      Ok(())
   }

   pub async fn set_volume_swipe_interval(&self, interval: u8) -> Result<()> {
      self.send_packet(&build_volume_interval_packet(interval)).await
   }

   pub async fn rename(&self, name: &str) -> Result<()> {
      if name.is_empty() {
         return Err(PodsError::InvalidName("empty"));
      }
      if name.len() > 32 {
         return Err(PodsError::InvalidName("longer than 32 bytes"));
      }
      self.send_packet(&build_rename_packet(name)).await?;
      self.update_name(name.into());
      Ok(())
   }

   pub async fn passthrough(&self, packet: &[u8]) -> Result<()> {
      self.send_packet(packet).await
   }

   async fn send_packet(&self, packet: &[u8]) -> Result<()> {
      let conn = self.0.conn.read().await;
      if let Some(conn) = conn.as_ref() {
         conn.sender.send(packet).await
      } else {
         Err(PodsError::DeviceNotConnected)
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      airpods::{parser::MagicKeys, protocol::EarStatus},
      bluetooth::l2cap::testing::loopback,
   };
   use aes::{
      Aes128,
      cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
   };
   use tokio::sync::mpsc;

   #[derive(Default)]
   struct RecordingBus {
      events: parking_lot::Mutex<Vec<AirPodsEvent>>,
   }

   impl RecordingBus {
      fn take(&self) -> Vec<AirPodsEvent> {
         mem::take(&mut *self.events.lock())
      }
   }

   impl crate::event::EventBus for RecordingBus {
      fn emit(&self, _device: &AirPods, event: AirPodsEvent) {
         self.events.lock().push(event);
      }
   }

   fn ack(prefix: &[u8]) -> Packet {
      let mut packet = Packet::from_slice(prefix);
      packet.push(0x00);
      packet.push(0x00);
      packet
   }

   fn battery_packet() -> Packet {
      let mut data = Packet::from_slice(HDR_BATTERY_STATE);
      data.push(2);
      data.extend_from_slice(&[0x04, 0x01, 50, 0x02, 0x01]);
      data.extend_from_slice(&[0x02, 0x01, 60, 0x02, 0x01]);
      data
   }

   async fn start(
      airpods: &AirPods,
      bus: &EventSender,
   ) -> (
      mpsc::Sender<Result<Packet>>,
      mpsc::Receiver<Packet>,
      JoinHandle<Option<PodsError>>,
   ) {
      let (receiver, sender, in_tx, out_rx) = loopback();
      let jhandle = airpods
         .begin_session(JoinSet::new(), receiver, sender, bus)
         .await
         .unwrap();
      (in_tx, out_rx, jhandle)
   }

   async fn drive_to_active(
      airpods: &AirPods,
      in_tx: &mpsc::Sender<Result<Packet>>,
      out_rx: &mut mpsc::Receiver<Packet>,
   ) {
      // The phase flips after each send completes, so let the processor
      // task settle before asserting.
      assert_eq!(out_rx.recv().await.unwrap().as_slice(), PKT_HANDSHAKE);
      assert_eq!(airpods.phase(), LinkPhase::AwaitingHandshakeAck);

      in_tx.send(Ok(ack(HDR_ACK_HANDSHAKE))).await.unwrap();
      assert_eq!(out_rx.recv().await.unwrap().as_slice(), PKT_SET_FEATURES);
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(airpods.phase(), LinkPhase::AwaitingFeatureAck);

      in_tx.send(Ok(ack(HDR_ACK_FEATURES))).await.unwrap();
      assert_eq!(out_rx.recv().await.unwrap().as_slice(), PKT_REQUEST_NOTIFY);
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(airpods.phase(), LinkPhase::Active);
   }

   #[tokio::test(start_paused = true)]
   async fn notification_request_resent_exactly_once_without_battery() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let (in_tx, mut out_rx, _jhandle) = start(&airpods, &event_tx).await;
      drive_to_active(&airpods, &in_tx, &mut out_rx).await;

      // No battery data within the window: exactly one re-send
      let resend = time::timeout(Duration::from_secs(3), out_rx.recv())
         .await
         .expect("resend was due")
         .unwrap();
      assert_eq!(resend.as_slice(), PKT_REQUEST_NOTIFY);

      assert!(
         time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .is_err(),
         "only one resend expected"
      );
   }

   #[tokio::test(start_paused = true)]
   async fn battery_arrival_suppresses_resend() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let (in_tx, mut out_rx, _jhandle) = start(&airpods, &event_tx).await;
      drive_to_active(&airpods, &in_tx, &mut out_rx).await;

      in_tx.send(Ok(battery_packet())).await.unwrap();
      // Give the processor a moment to fold the packet in
      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(airpods.battery_info().left.level, 50);
      assert!(
         bus.take()
            .iter()
            .any(|e| matches!(e, AirPodsEvent::BatteryUpdated(_)))
      );

      assert!(
         time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .is_err(),
         "resend must be suppressed once battery data arrived"
      );
   }

   #[tokio::test(start_paused = true)]
   async fn active_dispatch_updates_state() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let (in_tx, mut out_rx, _jhandle) = start(&airpods, &event_tx).await;
      drive_to_active(&airpods, &in_tx, &mut out_rx).await;
      bus.take();

      // Noise mode reply: wire value 0x03 is transparency
      let mut noise = Packet::from_slice(HDR_NOISE_CTL);
      noise.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
      in_tx.send(Ok(noise)).await.unwrap();

      // Ear detection: primary in ear, secondary in case
      let mut ear = Packet::from_slice(HDR_EAR_DETECTION);
      ear.extend_from_slice(&[0x00, 0x02]);
      in_tx.send(Ok(ear)).await.unwrap();

      // Garbage is logged and dropped without touching state
      in_tx
         .send(Ok(Packet::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF])))
         .await
         .unwrap();

      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(airpods.noise_mode(), Some(NoiseControlMode::Transparency));
      let ears = airpods.ear_detection();
      assert_eq!(ears.primary, EarStatus::InEar);
      assert_eq!(ears.secondary, EarStatus::InCase);

      let events = bus.take();
      assert!(
         events
            .iter()
            .any(|e| matches!(e, AirPodsEvent::NoiseControlChanged(NoiseControlMode::Transparency)))
      );
      assert!(
         events
            .iter()
            .any(|e| matches!(e, AirPodsEvent::EarDetectionChanged(_)))
      );
   }

   #[tokio::test(start_paused = true)]
   async fn metadata_triggers_key_request() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let (in_tx, mut out_rx, _jhandle) = start(&airpods, &event_tx).await;
      drive_to_active(&airpods, &in_tx, &mut out_rx).await;

      let mut meta = Packet::from_slice(HDR_METADATA);
      meta.extend_from_slice(&[0u8; 6]);
      meta.extend_from_slice(b"AirPods Pro\0A2084\0Apple Inc.\0");
      in_tx.send(Ok(meta)).await.unwrap();

      assert_eq!(out_rx.recv().await.unwrap().as_slice(), PKT_REQUEST_MAGIC_KEYS);
      assert_eq!(airpods.name(), "AirPods Pro");
      assert_eq!(airpods.identity().model_number, "A2084");
   }

   #[tokio::test(start_paused = true)]
   async fn transport_error_resets_state() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let (in_tx, mut out_rx, jhandle) = start(&airpods, &event_tx).await;
      drive_to_active(&airpods, &in_tx, &mut out_rx).await;

      in_tx.send(Ok(battery_packet())).await.unwrap();
      in_tx.send(Err(PodsError::ConnectionLost)).await.unwrap();

      let err = jhandle.await.unwrap();
      assert!(matches!(err, Some(PodsError::ConnectionLost)));
      assert!(!airpods.is_connected());
      assert_eq!(airpods.phase(), LinkPhase::Disconnected);
      // State model cleared back to unknown/disconnected
      assert_eq!(airpods.battery_info(), BatteryInfo::new());
      assert!(
         bus.take()
            .iter()
            .any(|e| matches!(e, AirPodsEvent::DeviceDisconnected))
      );
   }

   // IRK from the Bluetooth Core Specification ah sample data, in the
   // least-significant-byte-first convention used by the crypto module.
   const IRK: [u8; 16] = [
      0x9b, 0x7d, 0x39, 0x0a, 0xa6, 0x10, 0x10, 0x34, 0x05, 0xad, 0xc8, 0x57, 0xa3, 0x34, 0x02,
      0xec,
   ];
   const ENC_KEY: [u8; 16] = [0x42; 16];
   const RPA: Address = Address::new([0x70, 0x81, 0x94, 0x0D, 0xFB, 0xAA]);

   fn broadcast(address: Address, payload_plain: [u8; 16]) -> Advertisement {
      let cipher = Aes128::new(GenericArray::from_slice(&ENC_KEY));
      let mut block = GenericArray::from(payload_plain);
      cipher.encrypt_block(&mut block);

      let mut data = vec![
         0x07, 0x19, 0x01, 0x0E, 0x20, 0x21, 0x73, 0x00, 0x00, 0x00, 0x05,
      ];
      data.extend_from_slice(block.as_slice());
      Advertisement::decode(address, &data).expect("valid advertisement")
   }

   #[test]
   fn broadcast_updates_verified_state() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());

      let mut plain = [0u8; 16];
      plain[1] = 0x80 | 55; // left, charging
      plain[2] = 65;
      plain[3] = 85;

      // Without stored keys the broadcast path is inert
      assert!(!airpods.apply_advertisement(&broadcast(RPA, plain), &event_tx));

      airpods.restore_identity(DeviceIdentity {
         keys: Some(MagicKeys {
            irk: IRK,
            enc_key: ENC_KEY,
         }),
         ..Default::default()
      });

      assert!(airpods.apply_advertisement(&broadcast(RPA, plain), &event_tx));
      let battery = airpods.battery_info();
      assert_eq!(battery.left.level, 55);
      assert!(battery.left.is_charging());
      assert_eq!(battery.right.level, 65);
      assert_eq!(battery.case.level, 85);

      let events = bus.take();
      assert!(
         events
            .iter()
            .any(|e| matches!(e, AirPodsEvent::BatteryUpdated(_)))
      );
   }

   #[test]
   fn broadcast_from_unresolvable_address_is_discarded() {
      let bus = Arc::new(RecordingBus::default());
      let event_tx: EventSender = bus.clone();
      let airpods = AirPods::new(Address::any(), "Test".into());
      airpods.restore_identity(DeviceIdentity {
         keys: Some(MagicKeys {
            irk: IRK,
            enc_key: ENC_KEY,
         }),
         ..Default::default()
      });

      let mut plain = [0u8; 16];
      plain[1] = 55;
      let wrong = Address::new([0x70, 0x81, 0x94, 0x0D, 0xFB, 0xAB]);
      assert!(!airpods.apply_advertisement(&broadcast(wrong, plain), &event_tx));
      assert_eq!(airpods.battery_info(), BatteryInfo::new());
      assert!(bus.take().is_empty());
   }
}
