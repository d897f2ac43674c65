//! Proximity-broadcast advertisement decoder.
//!
//! Decodes the vendor-specific manufacturer data of a BLE advertisement
//! into a structured snapshot. The bit meaning of several fields depends on
//! which pod is primary and whether the reporting pod sits in its case, so
//! the flip logic lives in small pure functions over an explicit
//! [`PodOrientation`] context.

use std::fmt;

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::airpods::protocol::AirPodsModel;

/// Apple company identifier carried in the manufacturer data.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Marker byte of a proximity-pairing message.
pub const PROXIMITY_MARKER: u8 = 0x07;

/// Minimum manufacturer-data length for a candidate advertisement.
pub const MIN_CANDIDATE_LEN: usize = 10;

/// Length of the trailing encrypted payload.
pub const ENCRYPTED_PAYLOAD_LEN: usize = 16;

/// Lid state of the charging case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum LidState {
   Open,
   Closed,
}

/// Coarse connection state advertised by the accessory.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum ConnectionState {
   Disconnected = 0x00,
   Idle = 0x04,
   Music = 0x05,
   Call = 0x06,
   Ringing = 0x07,
   HangingUp = 0x09,
   Unknown = 0xFF,
}

impl ConnectionState {
   pub fn from_byte(byte: u8) -> Self {
      Self::from_repr(byte).unwrap_or(Self::Unknown)
   }
}

/// The context that decides how pod-specific bits are assigned to the left
/// and right pod.
///
/// Values are flipped whenever the right pod, not the left, is primary; the
/// in-ear bits are additionally cross-wired by the in-case flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodOrientation {
   pub primary_left: bool,
   pub in_case: bool,
}

const fn nibble_level(nibble: u8) -> Option<u8> {
   // Nibble value 15 means unknown
   if nibble == 0x0F { None } else { Some(nibble * 10) }
}

impl PodOrientation {
   pub const fn flipped(self) -> bool {
      !self.primary_left
   }

   /// Splits the pods battery byte into (left, right) percentages.
   pub const fn battery_levels(self, byte: u8) -> (Option<u8>, Option<u8>) {
      let high = nibble_level((byte >> 4) & 0x0F);
      let low = nibble_level(byte & 0x0F);
      if self.flipped() { (low, high) } else { (high, low) }
   }

   /// Decodes the charging bits into (left, right, case).
   pub const fn charging(self, flags: u8) -> (bool, bool, bool) {
      let bit0 = flags & 0x01 != 0;
      let bit1 = flags & 0x02 != 0;
      let case = flags & 0x04 != 0;
      if self.flipped() {
         (bit1, bit0, case)
      } else {
         (bit0, bit1, case)
      }
   }

   /// Decodes the in-ear bits of the status byte into (left, right).
   ///
   /// The bit assignment is cross-wired by both the flip rule and the
   /// in-case flag.
   pub const fn in_ear(self, status: u8) -> (bool, bool) {
      let bit1 = status & 0x02 != 0;
      let bit3 = status & 0x08 != 0;
      if self.flipped() ^ self.in_case {
         (bit3, bit1)
      } else {
         (bit1, bit3)
      }
   }
}

/// A decoded proximity advertisement.
///
/// Ephemeral per-scan-event structure; consumed immediately into the device
/// state model after address verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
   pub address: Address,
   pub model_code: u16,
   pub model: AirPodsModel,
   pub primary_left: bool,
   pub this_pod_in_case: bool,
   pub one_pod_in_case: bool,
   pub both_pods_in_case: bool,
   pub left_battery: Option<u8>,
   pub right_battery: Option<u8>,
   pub case_battery: Option<u8>,
   pub left_charging: bool,
   pub right_charging: bool,
   pub case_charging: bool,
   pub left_in_ear: bool,
   pub right_in_ear: bool,
   pub lid: Option<LidState>,
   pub lid_open_count: u8,
   pub color: u8,
   pub connection_state: ConnectionState,
   pub encrypted_payload: [u8; ENCRYPTED_PAYLOAD_LEN],
}

impl Advertisement {
   /// Decodes one advertisement's manufacturer data block.
   ///
   /// Returns `None` for anything that is not a paired-mode proximity
   /// message or whose declared length does not cover every accessed
   /// offset; a discarded event never updates state partially.
   pub fn decode(address: Address, data: &[u8]) -> Option<Self> {
      if data.len() < MIN_CANDIDATE_LEN || *data.first()? != PROXIMITY_MARKER {
         return None;
      }
      // data[1] is the length byte of the message

      // Pairing-mode messages use a different, unsupported layout
      if *data.get(2)? == 0x00 {
         return None;
      }

      let model_code = u16::from_be_bytes([*data.get(3)?, *data.get(4)?]);
      let status = *data.get(5)?;
      let pods_battery = *data.get(6)?;
      let flags_and_case = *data.get(7)?;
      let lid_indicator = *data.get(8)?;
      let color = *data.get(9)?;
      let connection_state = ConnectionState::from_byte(*data.get(10)?);

      let payload_start = data.len().checked_sub(ENCRYPTED_PAYLOAD_LEN)?;
      if payload_start < 11 {
         // Payload would alias the prefix fields
         return None;
      }
      let encrypted_payload: [u8; ENCRYPTED_PAYLOAD_LEN] = data[payload_start..].try_into().ok()?;

      let orientation = PodOrientation {
         primary_left: status & 0x20 != 0,
         in_case: status & 0x40 != 0,
      };

      let (left_battery, right_battery) = orientation.battery_levels(pods_battery);
      let case_battery = nibble_level(flags_and_case & 0x0F);
      let (left_charging, right_charging, case_charging) =
         orientation.charging((flags_and_case >> 4) & 0x0F);
      let (left_in_ear, right_in_ear) = orientation.in_ear(status);

      // Lid state is only meaningful while the reporting pod is in the case
      let lid = if orientation.in_case {
         Some(if lid_indicator & 0x08 != 0 {
            LidState::Closed
         } else {
            LidState::Open
         })
      } else {
         None
      };

      Some(Self {
         address,
         model_code,
         model: AirPodsModel::from_code(model_code),
         primary_left: orientation.primary_left,
         this_pod_in_case: orientation.in_case,
         one_pod_in_case: status & 0x10 != 0,
         both_pods_in_case: status & 0x04 != 0,
         left_battery,
         right_battery,
         case_battery,
         left_charging,
         right_charging,
         case_charging,
         left_in_ear,
         right_in_ear,
         lid,
         lid_open_count: lid_indicator & 0x07,
         color,
         connection_state,
         encrypted_payload,
      })
   }

   pub const fn primary_in_ear(&self) -> bool {
      if self.primary_left {
         self.left_in_ear
      } else {
         self.right_in_ear
      }
   }

   pub const fn secondary_in_ear(&self) -> bool {
      if self.primary_left {
         self.right_in_ear
      } else {
         self.left_in_ear
      }
   }
}

impl fmt::Display for Advertisement {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fn level(value: Option<u8>) -> String {
         value.map_or_else(|| "?".into(), |v| v.to_string())
      }
      write!(
         f,
         "{} ({:#06x}) L:{}%{} R:{}%{} C:{}%{} ear L:{} R:{} case:{}/{}/{} lid:{:?}({}) color:{} {}",
         self.model,
         self.model_code,
         level(self.left_battery),
         if self.left_charging { "+" } else { "" },
         level(self.right_battery),
         if self.right_charging { "+" } else { "" },
         level(self.case_battery),
         if self.case_charging { "+" } else { "" },
         self.left_in_ear,
         self.right_in_ear,
         self.this_pod_in_case,
         self.one_pod_in_case,
         self.both_pods_in_case,
         self.lid,
         self.lid_open_count,
         self.color,
         self.connection_state,
      )
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR: Address = Address::new([0x70, 0x81, 0x94, 0x0D, 0xFB, 0xAA]);

   fn raw(status: u8, pods_battery: u8, flags_and_case: u8, lid: u8) -> Vec<u8> {
      let mut data = vec![
         PROXIMITY_MARKER,
         0x19,
         0x01, // paired
         0x0E,
         0x20, // model code
         status,
         pods_battery,
         flags_and_case,
         lid,
         0x00, // color
         0x05, // music
      ];
      data.extend_from_slice(&[0x5A; ENCRYPTED_PAYLOAD_LEN]);
      data
   }

   #[test]
   fn left_primary_non_flipped_nibbles() {
      // Bit 5 set: left primary, values not flipped, left = high nibble.
      let adv = Advertisement::decode(ADDR, &raw(0x21, 0x73, 0x00, 0x00)).unwrap();
      assert!(adv.primary_left);
      assert_eq!(adv.left_battery, Some(70));
      assert_eq!(adv.right_battery, Some(30));
      assert_eq!(adv.model, AirPodsModel::AirPodsPro);
      assert_eq!(adv.connection_state, ConnectionState::Music);
      assert_eq!(adv.encrypted_payload, [0x5A; 16]);
   }

   #[test]
   fn right_primary_flips_nibbles_and_charging() {
      let adv = Advertisement::decode(ADDR, &raw(0x01, 0x73, 0x1F, 0x00)).unwrap();
      assert!(!adv.primary_left);
      assert_eq!(adv.left_battery, Some(30));
      assert_eq!(adv.right_battery, Some(70));
      // Case nibble 15 is the unknown sentinel
      assert_eq!(adv.case_battery, None);
      // Flags 0x1: bit 0 set maps to the right pod when flipped
      assert!(adv.right_charging);
      assert!(!adv.left_charging);
      assert!(!adv.case_charging);
   }

   #[test]
   fn charging_bits_non_flipped() {
      let adv = Advertisement::decode(ADDR, &raw(0x21, 0x73, 0x53, 0x00)).unwrap();
      // Flags 0x5: bits 0 and 2 set, case nibble 3
      assert!(adv.left_charging);
      assert!(!adv.right_charging);
      assert!(adv.case_charging);
      assert_eq!(adv.case_battery, Some(30));
   }

   #[test]
   fn in_ear_bits_cross_wired_by_case_flag() {
      // Left primary, not in case: left = bit 1
      let adv = Advertisement::decode(ADDR, &raw(0x22, 0x73, 0x00, 0x00)).unwrap();
      assert!(adv.left_in_ear);
      assert!(!adv.right_in_ear);

      // Left primary, in case: selection swaps to bit 3
      let adv = Advertisement::decode(ADDR, &raw(0x62, 0x73, 0x00, 0x00)).unwrap();
      assert!(!adv.left_in_ear);
      assert!(adv.right_in_ear);

      // Right primary, in case: double cross-wiring cancels out
      let adv = Advertisement::decode(ADDR, &raw(0x42, 0x73, 0x00, 0x00)).unwrap();
      assert!(adv.left_in_ear);
      assert!(!adv.right_in_ear);
   }

   #[test]
   fn lid_state_requires_in_case() {
      let adv = Advertisement::decode(ADDR, &raw(0x61, 0x73, 0x00, 0x0B)).unwrap();
      assert_eq!(adv.lid, Some(LidState::Closed));
      assert_eq!(adv.lid_open_count, 3);

      let adv = Advertisement::decode(ADDR, &raw(0x21, 0x73, 0x00, 0x0B)).unwrap();
      assert_eq!(adv.lid, None);
   }

   #[test]
   fn rejects_pairing_mode_and_short_data() {
      let mut data = raw(0x21, 0x73, 0x00, 0x00);
      data[2] = 0x00;
      assert!(Advertisement::decode(ADDR, &data).is_none());

      let data = raw(0x21, 0x73, 0x00, 0x00);
      assert!(Advertisement::decode(ADDR, &data[..9]).is_none());
      // Candidate length reached but accessed offsets not covered
      assert!(Advertisement::decode(ADDR, &data[..12]).is_none());

      let mut data = raw(0x21, 0x73, 0x00, 0x00);
      data[0] = 0x10;
      assert!(Advertisement::decode(ADDR, &data).is_none());
   }

   #[test]
   fn primary_role_helpers() {
      let adv = Advertisement::decode(ADDR, &raw(0x22, 0x73, 0x00, 0x00)).unwrap();
      assert!(adv.primary_in_ear());
      assert!(!adv.secondary_in_ear());

      let adv = Advertisement::decode(ADDR, &raw(0x08, 0x73, 0x00, 0x00)).unwrap();
      assert!(!adv.primary_left);
      // Right primary, not in case: right = bit 1 of status (unset), left = bit 3
      assert!(adv.left_in_ear);
      assert!(!adv.primary_in_ear());
      assert!(adv.secondary_in_ear());
   }
}
