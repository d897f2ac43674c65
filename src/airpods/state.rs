//! Device state model.
//!
//! Holds the authoritative battery, ear-detection, and identity state fed by
//! the packet parsers and the BLE broadcast decoder, including the merge
//! rules between the two sources. The connection state machine is the sole
//! writer; everything here is plain data with pure update methods.

use serde_json::json;
use smol_str::SmolStr;

use crate::{
   airpods::{
      parser::{BatteryPacket, MagicKeys},
      protocol::{AirPodsModel, BatteryInfo, BatteryStatus, Component, EarStatus},
   },
   ble::advertisement::Advertisement,
};

/// Sentinel level bits in an encrypted-broadcast battery byte meaning
/// "no data for this component".
const BROADCAST_LEVEL_UNKNOWN: u8 = 0x7F;

/// Charging flag and raw level decoded from one encrypted battery byte.
const fn split_broadcast_byte(byte: u8) -> (bool, u8) {
   (byte & 0x80 != 0, byte & 0x7F)
}

/// Battery state for all components plus the primary/secondary pod roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Battery {
   info: BatteryInfo,
   primary_pod: Option<Component>,
   secondary_pod: Option<Component>,
}

impl Battery {
   pub const fn new() -> Self {
      Self {
         info: BatteryInfo::new(),
         primary_pod: None,
         secondary_pod: None,
      }
   }

   pub const fn info(&self) -> BatteryInfo {
      self.info
   }

   pub const fn primary_pod(&self) -> Option<Component> {
      self.primary_pod
   }

   pub const fn secondary_pod(&self) -> Option<Component> {
      self.secondary_pod
   }

   pub fn is_left_primary(&self) -> bool {
      // Left is also assumed primary before any packet told us otherwise.
      self.primary_pod != Some(Component::Right)
   }

   /// Clears all components back to unknown/disconnected.
   pub fn reset(&mut self) {
      *self = Self::new();
   }

   /// Applies a direct-connection battery packet.
   ///
   /// Components present in the packet are overwritten wholesale; pod roles
   /// are reassigned from record order only when at least one pod record is
   /// present.
   pub fn apply_packet(&mut self, packet: &BatteryPacket) {
      for (component, state) in &packet.records {
         *self.info.get_mut(*component) = *state;
      }
      if let Some(first) = packet.pod_order.first() {
         self.primary_pod = Some(*first);
      }
      if let Some(second) = packet.pod_order.get(1) {
         self.secondary_pod = Some(*second);
      }
   }

   /// Applies a decrypted broadcast payload.
   ///
   /// Byte offsets for the pods depend on which side is primary; byte 3 is
   /// always the case. A component whose level bits carry the sentinel keeps
   /// its previous level and charging flag, the others are overwritten.
   /// Pod roles are reassigned unconditionally.
   // TODO: confirm whether the in-case flag should swap the pod offsets here
   // the way it swaps the in-ear status bits in the advertisement decoder.
   pub fn apply_broadcast(&mut self, payload: &[u8; 16], left_primary: bool) {
      let left_index = if left_primary { 1 } else { 2 };
      let right_index = if left_primary { 2 } else { 1 };

      self.merge_broadcast_byte(Component::Left, payload[left_index]);
      self.merge_broadcast_byte(Component::Right, payload[right_index]);
      self.merge_broadcast_byte(Component::Case, payload[3]);

      let (primary, secondary) = if left_primary {
         (Component::Left, Component::Right)
      } else {
         (Component::Right, Component::Left)
      };
      self.primary_pod = Some(primary);
      self.secondary_pod = Some(secondary);
   }

   fn merge_broadcast_byte(&mut self, component: Component, byte: u8) {
      let (mut charging, mut level) = split_broadcast_byte(byte);
      if level == BROADCAST_LEVEL_UNKNOWN {
         // No data for this component, carry the last known values forward.
         let prev = self.info.get(component);
         level = prev.level;
         charging = prev.is_charging();
      }
      let state = self.info.get_mut(component);
      state.level = level;
      state.status = if charging {
         BatteryStatus::Charging
      } else {
         BatteryStatus::Discharging
      };
   }
}

impl Default for Battery {
   fn default() -> Self {
      Self::new()
   }
}

/// In-ear status per logical pod role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarDetection {
   pub primary: EarStatus,
   pub secondary: EarStatus,
}

impl EarDetection {
   pub const fn new() -> Self {
      Self {
         primary: EarStatus::Disconnected,
         secondary: EarStatus::Disconnected,
      }
   }

   pub fn reset(&mut self) {
      *self = Self::new();
   }

   /// Applies the two explicit status bytes of a direct-connection packet.
   pub fn apply_packet(&mut self, primary: EarStatus, secondary: EarStatus) {
      self.primary = primary;
      self.secondary = secondary;
   }

   /// Overrides both roles wholesale from a broadcast in-ear flag pair.
   pub fn apply_broadcast(&mut self, primary_in_ear: bool, secondary_in_ear: bool) {
      self.primary = if primary_in_ear {
         EarStatus::InEar
      } else {
         EarStatus::NotInEar
      };
      self.secondary = if secondary_in_ear {
         EarStatus::InEar
      } else {
         EarStatus::NotInEar
      };
   }

   pub fn one_or_more_in_ear(&self) -> bool {
      self.primary.is_in_ear() || self.secondary.is_in_ear()
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "primary": self.primary.to_string(),
          "secondary": self.secondary.to_string(),
          "any_in_ear": self.one_or_more_in_ear(),
      })
   }
}

impl Default for EarDetection {
   fn default() -> Self {
      Self::new()
   }
}

/// Durable identity of the paired accessory.
///
/// The name, model, and key pair survive across sessions; the rest is
/// refreshed from metadata packets on each connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
   pub name: SmolStr,
   pub model: Option<AirPodsModel>,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
   pub keys: Option<MagicKeys>,
}

impl DeviceIdentity {
   /// Identity resolving key, if the key exchange completed.
   pub fn irk(&self) -> Option<&[u8; 16]> {
      self.keys.as_ref().map(|k| &k.irk)
   }

   /// Payload decryption key, if the key exchange completed.
   pub fn enc_key(&self) -> Option<&[u8; 16]> {
      self.keys.as_ref().map(|k| &k.enc_key)
   }
}

/// Result of folding a decoded advertisement into the state model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastUpdate {
   pub battery_changed: bool,
   pub ear_changed: bool,
}

/// The complete mutable device state owned by the connection state machine.
#[derive(Debug, Default, Clone)]
pub struct DeviceState {
   pub battery: Battery,
   pub ear_detection: EarDetection,
   pub identity: DeviceIdentity,
}

impl DeviceState {
   /// Clears the volatile state on disconnect. Identity is kept.
   pub fn reset(&mut self) {
      self.battery.reset();
      self.ear_detection.reset();
   }

   /// Folds an accepted (address-verified) broadcast and its decrypted
   /// payload into the state model.
   pub fn apply_broadcast(&mut self, adv: &Advertisement, payload: &[u8; 16]) -> BroadcastUpdate {
      let battery_before = self.battery;
      let ear_before = self.ear_detection;

      self.identity.model = Some(adv.model);
      self.battery.apply_broadcast(payload, adv.primary_left);
      self
         .ear_detection
         .apply_broadcast(adv.primary_in_ear(), adv.secondary_in_ear());

      BroadcastUpdate {
         battery_changed: battery_before != self.battery,
         ear_changed: ear_before != self.ear_detection,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::{parser::parse_battery_status, protocol::HDR_BATTERY_STATE};

   fn direct_packet(records: &[[u8; 5]]) -> BatteryPacket {
      let mut data = HDR_BATTERY_STATE.to_vec();
      data.push(records.len() as u8);
      for r in records {
         data.extend_from_slice(r);
      }
      parse_battery_status(&data).unwrap()
   }

   #[test]
   fn direct_packet_assigns_roles_from_order() {
      let mut battery = Battery::new();
      battery.apply_packet(&direct_packet(&[
         [0x02, 0x01, 60, 0x02, 0x01], // right first
         [0x04, 0x01, 50, 0x02, 0x01],
         [0x08, 0x01, 90, 0x01, 0x01],
      ]));

      assert_eq!(battery.primary_pod(), Some(Component::Right));
      assert_eq!(battery.secondary_pod(), Some(Component::Left));
      assert!(!battery.is_left_primary());
      assert_eq!(battery.info().right.level, 60);
      assert_eq!(battery.info().case.level, 90);
   }

   #[test]
   fn case_only_packet_keeps_roles() {
      let mut battery = Battery::new();
      battery.apply_packet(&direct_packet(&[[0x04, 0x01, 50, 0x02, 0x01]]));
      assert_eq!(battery.primary_pod(), Some(Component::Left));

      battery.apply_packet(&direct_packet(&[[0x08, 0x01, 70, 0x01, 0x01]]));
      assert_eq!(battery.primary_pod(), Some(Component::Left));
      assert_eq!(battery.info().case.level, 70);
   }

   #[test]
   fn broadcast_sentinel_preserves_single_slot() {
      let mut battery = Battery::new();
      battery.apply_packet(&direct_packet(&[
         [0x04, 0x01, 50, 0x01, 0x01],
         [0x02, 0x01, 60, 0x02, 0x01],
         [0x08, 0x01, 90, 0x02, 0x01],
      ]));

      // Left primary: payload[1] = left, payload[2] = right, payload[3] = case.
      // Right byte carries the sentinel, left and case have fresh data.
      let mut payload = [0u8; 16];
      payload[1] = 0x80 | 45; // left, charging
      payload[2] = BROADCAST_LEVEL_UNKNOWN;
      payload[3] = 85;
      battery.apply_broadcast(&payload, true);

      let info = battery.info();
      assert_eq!(info.left.level, 45);
      assert!(info.left.is_charging());
      // Sentinel slot carried forward the previous level and charging flag
      assert_eq!(info.right.level, 60);
      assert!(!info.right.is_charging());
      assert_eq!(info.case.level, 85);
      assert!(!info.case.is_charging());
   }

   #[test]
   fn broadcast_sentinel_drops_prior_charging_state() {
      let mut battery = Battery::new();
      battery.apply_packet(&direct_packet(&[[0x08, 0x01, 90, 0x01, 0x01]]));
      assert!(battery.info().case.is_charging());

      let mut payload = [0u8; 16];
      payload[1] = 40;
      payload[2] = 42;
      payload[3] = 0x80 | BROADCAST_LEVEL_UNKNOWN;
      battery.apply_broadcast(&payload, true);

      // The sentinel slot keeps the previous charging flag even though the
      // raw byte had the charging bit set.
      assert_eq!(battery.info().case.level, 90);
      assert!(battery.info().case.is_charging());
   }

   #[test]
   fn broadcast_reassigns_roles_unconditionally() {
      let mut battery = Battery::new();
      battery.apply_packet(&direct_packet(&[
         [0x04, 0x01, 50, 0x02, 0x01],
         [0x02, 0x01, 60, 0x02, 0x01],
      ]));
      assert_eq!(battery.primary_pod(), Some(Component::Left));

      let mut payload = [0u8; 16];
      payload[1] = 60;
      payload[2] = 50;
      payload[3] = 80;
      battery.apply_broadcast(&payload, false);
      assert_eq!(battery.primary_pod(), Some(Component::Right));
      assert_eq!(battery.secondary_pod(), Some(Component::Left));
      // Right primary swaps the pod byte offsets
      assert_eq!(battery.info().right.level, 60);
      assert_eq!(battery.info().left.level, 50);
   }

   #[test]
   fn broadcast_overrides_ear_state_wholesale() {
      let mut ears = EarDetection::new();
      ears.apply_packet(EarStatus::InCase, EarStatus::Disconnected);
      ears.apply_broadcast(true, false);
      assert_eq!(ears.primary, EarStatus::InEar);
      assert_eq!(ears.secondary, EarStatus::NotInEar);
   }

   #[test]
   fn reset_clears_battery_and_ears() {
      let mut state = DeviceState::default();
      state
         .battery
         .apply_packet(&direct_packet(&[[0x04, 0x01, 50, 0x01, 0x01]]));
      state.ear_detection.apply_broadcast(true, true);
      state.identity.name = "Buds".into();

      state.reset();
      assert_eq!(state.battery, Battery::new());
      assert_eq!(state.ear_detection, EarDetection::new());
      assert_eq!(state.identity.name, "Buds");
   }
}
