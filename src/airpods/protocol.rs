//! AAP protocol definitions and data structures.
//!
//! This module contains the protocol constants, packet builders, and data
//! structures shared by the packet parsers and the connection state machine.

use std::{fmt, str::FromStr, sync::LazyLock};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bluetooth::l2cap::Packet;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];
pub const PKT_REQUEST_MAGIC_KEYS: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x30, 0x00, 0x05, 0x00];

// Parsing headers
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_NOISE_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00\x0D";
pub const HDR_CMD_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_METADATA: &[u8] = b"\x04\x00\x04\x00\x1d";
pub const HDR_MAGIC_KEYS: &[u8] = b"\x04\x00\x04\x00\x31\x00\x02";
pub const HDR_CA_DATA: &[u8] = b"\x04\x00\x04\x00\x4B\x00\x02\x00\x01";

// ACK packet headers
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2b";

// Companion-link command vocabulary. Anything else on that link is relayed
// verbatim.
pub const COMPANION_NOTIFY: &[u8] = &[0x00, 0x04, 0x00, 0x01];
pub const COMPANION_CONNECTED: &[u8] = &[0x00, 0x01, 0x00, 0x01];
pub const COMPANION_DISCONNECTED: &[u8] = &[0x00, 0x01, 0x00, 0x00];
pub const COMPANION_STATUS_REQUEST: &[u8] = &[0x00, 0x02, 0x00, 0x03];
pub const COMPANION_DISCONNECT_REQUEST: &[u8] = &[0x00, 0x02, 0x00, 0x00];

/// Offset of the generic state byte in control-command replies.
pub const STATE_BYTE_OFFSET: usize = 7;

/// Physical components of the accessory.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status reported per component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Noise control modes.
///
/// The wire value is the enum value plus one; replies are decremented before
/// the range check. The skipped zero value is reserved on the wire.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x00,
   #[strum(serialize = "nc")]
   NoiseCancellation = 0x01,
   #[strum(serialize = "trans", serialize = "transparency")]
   Transparency = 0x02,
   #[strum(serialize = "adapt", serialize = "adaptive")]
   Adaptive = 0x03,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub fn from_wire(value: u8) -> Option<Self> {
      Self::from_repr(value.wrapping_sub(1))
   }

   pub const fn to_wire(self) -> u8 {
      self as u8 + 1
   }

   pub fn build(self) -> Packet {
      build_control_packet(FeatureId::NOISE_CONTROL.id(), [self.to_wire(), 0, 0, 0])
   }
}

/// Device models enumerated by their 16-bit advertisement model code.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u16)]
pub enum AirPodsModel {
   AirPods1 = 0x0220,
   AirPods2 = 0x0F20,
   AirPods3 = 0x1320,
   AirPods4 = 0x1920,
   AirPods4Anc = 0x1B20,
   AirPodsMaxLightning = 0x0A20,
   AirPodsMaxUsbC = 0x1F20,
   AirPodsPro = 0x0E20,
   AirPodsPro2Lightning = 0x1420,
   AirPodsPro2UsbC = 0x2420,
   Unknown = 0x0000,
}

impl AirPodsModel {
   pub fn from_code(code: u16) -> Self {
      Self::from_repr(code).unwrap_or(Self::Unknown)
   }

   pub const fn code(self) -> u16 {
      self as u16
   }
}

pub const KNOWN_FEATURES: &[(u8, &str)] = &[
   (FeatureId::NOISE_CONTROL.id(), "noise_control"),
   (FeatureId::ONE_BUD_ANC.id(), "one_bud_anc"),
   (FeatureId::VOLUME_INTERVAL.id(), "volume_interval"),
   (FeatureId::VOLUME_SWIPE.id(), "volume_swipe"),
   (FeatureId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (FeatureId::CONVERSATIONAL.id(), "conversational"),
   (FeatureId::ADAPTIVE_NOISE.id(), "adaptive_noise"),
   (FeatureId::HEARING_ASSIST.id(), "hearing_assist"),
   (FeatureId::ALLOW_OFF.id(), "allow_off"),
];

/// A feature command identifier on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FeatureId(u8);

impl FromStr for FeatureId {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (repr, name) in KNOWN_FEATURES {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*repr));
         }
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

static U8_TO_HEX: LazyLock<[[u8; 2]; 256]> = LazyLock::new(|| {
   let mut featids = [[0u8; 2]; 256];
   for i in 0..=255u8 {
      const fn nibble_to_hex(n: u8) -> u8 {
         if n < 10 { n + b'0' } else { n - 10 + b'a' }
      }
      featids[i as usize] = [nibble_to_hex(i >> 4), nibble_to_hex(i & 0x0f)];
   }
   featids
});

impl FeatureId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const RENAME: Self = Self(0x1A);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const VOLUME_INTERVAL: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATIONAL: Self = Self(0x28);
   pub const ADAPTIVE_NOISE: Self = Self(0x2E);
   pub const HEARING_ASSIST: Self = Self(0x33);
   pub const ALLOW_OFF: Self = Self(0x34);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      let Ok(i) = KNOWN_FEATURES.binary_search_by_key(&self.0, |(repr, _)| *repr) else {
         return None;
      };
      let (_, name) = KNOWN_FEATURES[i];
      Some(name)
   }

   pub fn to_str(self) -> &'static str {
      if let Some(name) = self.try_to_str() {
         name
      } else {
         let bytes = &U8_TO_HEX[self.0 as usize];
         str::from_utf8(bytes).unwrap_or("??")
      }
   }
}

impl fmt::Display for FeatureId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

impl Default for BatteryState {
   fn default() -> Self {
      Self::new()
   }
}

/// Complete battery information for all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
      }
   }

   pub const fn get(&self, component: Component) -> BatteryState {
      match component {
         Component::Left => self.left,
         Component::Right => self.right,
         Component::Case => self.case,
      }
   }

   pub const fn get_mut(&mut self, component: Component) -> &mut BatteryState {
      match component {
         Component::Left => &mut self.left,
         Component::Right => &mut self.right,
         Component::Case => &mut self.case,
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

impl Default for BatteryInfo {
   fn default() -> Self {
      Self::new()
   }
}

/// In-ear status of a single pod role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum EarStatus {
   InEar,
   NotInEar,
   InCase,
   Disconnected,
}

impl EarStatus {
   pub const fn from_byte(byte: u8) -> Self {
      match byte {
         0x00 => Self::InEar,
         0x01 => Self::NotInEar,
         0x02 => Self::InCase,
         _ => Self::Disconnected,
      }
   }

   pub fn is_in_ear(self) -> bool {
      self == Self::InEar
   }
}

/// Builds a control packet: fixed header, command identifier, four parameter
/// bytes.
pub fn build_control_packet(cmd: u8, data: [u8; 4]) -> Packet {
   HDR_CMD_CTL
      .iter()
      .copied()
      .chain([cmd])
      .chain(data.iter().copied())
      .collect()
}

/// Reads the value byte of a control-command reply, checking the header.
pub fn parse_control_value(data: &[u8]) -> Option<u8> {
   if !data.starts_with(HDR_CMD_CTL) {
      return None;
   }
   data.get(STATE_BYTE_OFFSET).copied()
}

/// Decodes the generic two-state reply shape shared by most features.
pub fn parse_state_byte(data: &[u8]) -> Option<bool> {
   match parse_control_value(data)? {
      0x01 => Some(true),
      0x02 => Some(false),
      _ => None,
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FeatureCmd {
   Query = 0,
   Enable = 1,
   Disable = 2,
}

impl FeatureCmd {
   pub fn build(self, feature: u8) -> Packet {
      let data = self as u32;
      build_control_packet(feature, data.to_le_bytes())
   }

   pub fn parse(data: &[u8]) -> Option<(FeatureId, Self)> {
      let rest = data.strip_prefix(HDR_CMD_CTL)?;
      let (feature, rest) = rest.split_first()?;
      let u: u32 = u32::from_le_bytes(rest.try_into().ok()?);
      match u {
         0 => Some((FeatureId::from_id(*feature), Self::Query)),
         1 => Some((FeatureId::from_id(*feature), Self::Enable)),
         2 => Some((FeatureId::from_id(*feature), Self::Disable)),
         _ => None,
      }
   }
}

/// Builds an adaptive-noise strength packet for the given level (0-100).
pub fn build_adaptive_noise_packet(level: u8) -> Packet {
   build_control_packet(FeatureId::ADAPTIVE_NOISE.id(), [level, 0x00, 0x00, 0x00])
}

/// Builds a volume-swipe interval packet.
pub fn build_volume_interval_packet(interval: u8) -> Packet {
   build_control_packet(FeatureId::VOLUME_INTERVAL.id(), [interval, 0x00, 0x00, 0x00])
}

/// Builds a rename packet: 4-byte prefix, command id, 0x00, 0x01, length
/// byte, NUL, UTF-8 name bytes.
pub fn build_rename_packet(name: &str) -> Packet {
   let bytes = name.as_bytes();
   [0x04, 0x00, 0x04, 0x00]
      .into_iter()
      .chain([FeatureId::RENAME.id(), 0x00, 0x01, bytes.len() as u8, 0x00])
      .chain(bytes.iter().copied())
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn control_packet_round_trip() {
      for cmd in [0x0D, 0x1B, 0x28, 0x34] {
         let packet = build_control_packet(cmd, [0x01, 0x00, 0x00, 0x00]);
         assert_eq!(packet.len(), 11);
         assert_eq!(packet[6], cmd);
         assert_eq!(parse_state_byte(&packet), Some(true));

         let packet = build_control_packet(cmd, [0x02, 0x00, 0x00, 0x00]);
         assert_eq!(parse_state_byte(&packet), Some(false));
      }
   }

   #[test]
   fn state_byte_rejects_other_values() {
      let packet = build_control_packet(0x1B, [0x03, 0x00, 0x00, 0x00]);
      assert_eq!(parse_state_byte(&packet), None);
      // Header mismatch
      assert_eq!(parse_state_byte(&[0x01, 0x02, 0x03]), None);
      // Truncated before the state byte
      assert_eq!(parse_state_byte(&HDR_CMD_CTL[..5]), None);
   }

   #[test]
   fn noise_mode_wire_offset() {
      // Wire values are shifted by one relative to the mode enum.
      assert_eq!(NoiseControlMode::from_wire(0x01), Some(NoiseControlMode::Off));
      assert_eq!(NoiseControlMode::from_wire(0x04), Some(NoiseControlMode::Adaptive));
      assert_eq!(NoiseControlMode::from_wire(0x00), None);
      assert_eq!(NoiseControlMode::from_wire(0x05), None);
      assert_eq!(NoiseControlMode::Transparency.to_wire(), 0x03);

      let packet = NoiseControlMode::NoiseCancellation.build();
      assert!(packet.starts_with(HDR_NOISE_CTL));
      assert_eq!(packet[7], 0x02);
   }

   #[test]
   fn model_codes() {
      assert_eq!(AirPodsModel::from_code(0x1420), AirPodsModel::AirPodsPro2Lightning);
      assert_eq!(AirPodsModel::from_code(0xBEEF), AirPodsModel::Unknown);
      assert_eq!(AirPodsModel::AirPods3.code(), 0x1320);
   }

   #[test]
   fn feature_lookup() {
      assert_eq!(FeatureId::from_str("noise_control"), Ok(FeatureId::NOISE_CONTROL));
      assert_eq!(FeatureId::from_id(0x28).to_str(), "conversational");
      assert_eq!(FeatureId::from_id(0xAB).to_str(), "ab");
   }

   #[test]
   fn rename_packet_layout() {
      let packet = build_rename_packet("Buds");
      assert_eq!(&packet[..4], &[0x04, 0x00, 0x04, 0x00]);
      assert_eq!(packet[4], 0x1A);
      assert_eq!(packet[7], 4);
      assert_eq!(&packet[9..], b"Buds");
   }
}
