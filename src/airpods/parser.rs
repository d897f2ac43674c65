//! Packet parsing for the AAP protocol.
//!
//! This module contains functions to parse the AAP packet types received
//! from the accessory over the L2CAP connection. All parsers are pure and
//! reject malformed input with an error instead of panicking.

use std::str;

use log::{debug, warn};
use smol_str::SmolStr;

use crate::{
   airpods::protocol::{
      BatteryState, BatteryStatus, Component, EarStatus, HDR_BATTERY_STATE, HDR_CA_DATA,
      HDR_EAR_DETECTION, HDR_MAGIC_KEYS, HDR_METADATA, HDR_NOISE_CTL, NoiseControlMode,
      parse_control_value,
   },
   error::Result,
};

use thiserror::Error;

/// Error type for protocol parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Packet is not of the expected type
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Unknown component type in battery status
   #[error("Unknown component type: 0x{component_type:02x}")]
   UnknownComponentType { component_type: u8 },

   /// Spacer or end marker byte of a battery record is wrong
   #[error("Invalid battery record marker: 0x{marker:02x} at offset {offset}")]
   InvalidRecordMarker { marker: u8, offset: usize },

   /// Unknown noise control mode
   #[error("Unknown noise control mode: 0x{mode:02x}")]
   UnknownNoiseMode { mode: u8 },

   /// A TLV block in the key packet deviates from the expected layout
   #[error("Invalid key block: {reason}")]
   InvalidKeyBlock { reason: &'static str },
}

/// Battery records decoded from a direct-connection battery packet.
///
/// `pod_order` preserves the order in which pod components appeared, which
/// determines the primary/secondary role assignment.
#[derive(Debug, Default)]
pub struct BatteryPacket {
   pub records: heapless::Vec<(Component, BatteryState), 3>,
   pub pod_order: heapless::Vec<Component, 2>,
}

/// Parses a battery status packet.
///
/// The packet carries a count byte followed by 5-byte records for up to
/// three components. The total length must match the count exactly and every
/// record must carry its 0x01 spacer and end markers; any deviation rejects
/// the whole packet.
pub fn parse_battery_status(data: &[u8]) -> Result<BatteryPacket> {
   if !data.starts_with(HDR_BATTERY_STATE) {
      return Err(
         ProtoError::WrongPacketType {
            expected: "battery status",
         }
         .into(),
      );
   }

   if data.len() < 7 {
      return Err(
         ProtoError::PacketTooShort {
            expected: 7,
            actual: data.len(),
         }
         .into(),
      );
   }

   let battery_count = data[6];
   if battery_count > 3 {
      return Err(
         ProtoError::InvalidBatteryCount {
            count: battery_count,
         }
         .into(),
      );
   }

   let expected_length = 7 + 5 * battery_count as usize;
   if data.len() != expected_length {
      return Err(
         ProtoError::PacketSizeMismatch {
            expected: expected_length,
            actual: data.len(),
         }
         .into(),
      );
   }

   let mut packet = BatteryPacket::default();

   for i in 0..battery_count as usize {
      let offset = 7 + 5 * i;
      let id = data[offset];
      let spacer = data[offset + 1];
      let level = data[offset + 2];
      let status = data[offset + 3];
      let end = data[offset + 4];

      if spacer != 0x01 {
         return Err(
            ProtoError::InvalidRecordMarker {
               marker: spacer,
               offset: offset + 1,
            }
            .into(),
         );
      }
      if end != 0x01 {
         return Err(
            ProtoError::InvalidRecordMarker {
               marker: end,
               offset: offset + 4,
            }
            .into(),
         );
      }

      let Some(component) = Component::from_repr(id) else {
         return Err(ProtoError::UnknownComponentType { component_type: id }.into());
      };

      let bat_status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!(
            "Unknown battery status 0x{status:02x} for component {component}, treating as Discharging"
         );
         BatteryStatus::Discharging
      });

      debug!("Battery record {i}: {component} = {level}% ({bat_status})");

      let _ = packet.records.push((
         component,
         BatteryState {
            level,
            status: bat_status,
         },
      ));

      if matches!(component, Component::Left | Component::Right) {
         let _ = packet.pod_order.push(component);
      }
   }

   Ok(packet)
}

pub fn parse_noise_mode(data: &[u8]) -> Result<NoiseControlMode> {
   if !data.starts_with(HDR_NOISE_CTL) {
      return Err(
         ProtoError::WrongPacketType {
            expected: "noise control",
         }
         .into(),
      );
   }
   let Some(value) = parse_control_value(data) else {
      return Err(
         ProtoError::PacketTooShort {
            expected: 8,
            actual: data.len(),
         }
         .into(),
      );
   };
   // The wire value is offset by one; decrement before the range check.
   let Some(mode) = NoiseControlMode::from_wire(value) else {
      return Err(ProtoError::UnknownNoiseMode { mode: value }.into());
   };
   Ok(mode)
}

/// Parses an ear detection packet into (primary, secondary) status bytes.
pub fn parse_ear_detection(data: &[u8]) -> Result<(EarStatus, EarStatus)> {
   if !data.starts_with(HDR_EAR_DETECTION) {
      return Err(
         ProtoError::WrongPacketType {
            expected: "ear detection",
         }
         .into(),
      );
   }
   if data.len() < 8 {
      return Err(
         ProtoError::PacketTooShort {
            expected: 8,
            actual: data.len(),
         }
         .into(),
      );
   }
   Ok((EarStatus::from_byte(data[6]), EarStatus::from_byte(data[7])))
}

/// Device metadata strings extracted from a metadata packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
   pub device_name: SmolStr,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
}

/// Parses a metadata packet.
///
/// After the header and six skip bytes, three NUL-terminated UTF-8 strings
/// follow: device name, model number, manufacturer. A truncated buffer
/// yields empty trailing strings rather than an error.
pub fn parse_metadata(data: &[u8]) -> Result<Metadata> {
   if !data.starts_with(HDR_METADATA) {
      return Err(
         ProtoError::WrongPacketType {
            expected: "metadata",
         }
         .into(),
      );
   }
   let skip = HDR_METADATA.len() + 6;
   if data.len() < skip {
      return Err(
         ProtoError::PacketTooShort {
            expected: skip,
            actual: data.len(),
         }
         .into(),
      );
   }

   let mut pos = skip;
   let mut extract = || -> SmolStr {
      let start = pos;
      while pos < data.len() && data[pos] != 0 {
         pos += 1;
      }
      let s = str::from_utf8(&data[start..pos]).unwrap_or_default();
      if pos < data.len() {
         pos += 1; // move past the terminator
      }
      s.into()
   };

   Ok(Metadata {
      device_name: extract(),
      model_number: extract(),
      manufacturer: extract(),
   })
}

/// Long-term key pair received in the pairing-key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicKeys {
   pub irk: [u8; 16],
   pub enc_key: [u8; 16],
}

/// Parses a pairing-key packet.
///
/// Two TLV blocks must appear in order: tag 0x01 (identity resolving key)
/// then tag 0x04 (payload decryption key), each with a big-endian length of
/// 16 followed by one reserved byte. Any deviation aborts parsing; callers
/// must treat the error as "keys not received", never as zero keys.
pub fn parse_magic_keys(data: &[u8]) -> Result<MagicKeys> {
   if !data.starts_with(HDR_MAGIC_KEYS) {
      return Err(
         ProtoError::WrongPacketType {
            expected: "pairing keys",
         }
         .into(),
      );
   }

   let mut pos = HDR_MAGIC_KEYS.len();
   let mut read_block = |tag: u8| -> Result<[u8; 16]> {
      if data.len() < pos + 4 + 16 {
         return Err(
            ProtoError::PacketTooShort {
               expected: pos + 4 + 16,
               actual: data.len(),
            }
            .into(),
         );
      }
      if data[pos] != tag {
         return Err(ProtoError::InvalidKeyBlock { reason: "wrong tag" }.into());
      }
      let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
      if len != 16 {
         return Err(
            ProtoError::InvalidKeyBlock {
               reason: "wrong length",
            }
            .into(),
         );
      }
      // Skip tag, length, and one reserved byte
      pos += 4;
      let mut key = [0u8; 16];
      key.copy_from_slice(&data[pos..pos + 16]);
      pos += 16;
      Ok(key)
   };

   let irk = read_block(0x01)?;
   let enc_key = read_block(0x04)?;
   Ok(MagicKeys { irk, enc_key })
}

/// Parses a conversational-awareness data packet.
///
/// Returns whether nearby speech was detected (volume lowered).
pub fn parse_conversational_data(data: &[u8]) -> Option<bool> {
   if !data.starts_with(HDR_CA_DATA) {
      return None;
   }
   data.get(9).map(|b| *b == 0x01)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::HDR_EAR_DETECTION;

   fn battery_packet(records: &[[u8; 5]]) -> Vec<u8> {
      let mut data = HDR_BATTERY_STATE.to_vec();
      data.push(records.len() as u8);
      for r in records {
         data.extend_from_slice(r);
      }
      data
   }

   #[test]
   fn battery_two_pods() {
      let data = battery_packet(&[[0x04, 0x01, 50, 0x01, 0x01], [0x02, 0x01, 60, 0x02, 0x01]]);
      assert_eq!(data.len(), 17);

      let packet = parse_battery_status(&data).unwrap();
      assert_eq!(packet.records.len(), 2);
      assert_eq!(
         packet.records[0],
         (
            Component::Left,
            BatteryState {
               level: 50,
               status: BatteryStatus::Charging,
            }
         )
      );
      assert_eq!(&packet.pod_order[..], &[Component::Left, Component::Right]);
   }

   #[test]
   fn battery_length_must_match_count_exactly() {
      let data = battery_packet(&[[0x04, 0x01, 50, 0x01, 0x01], [0x02, 0x01, 60, 0x02, 0x01]]);

      // One byte short and one byte long around the valid 17-byte packet.
      assert!(parse_battery_status(&data[..16]).is_err());
      let mut long = data.clone();
      long.push(0x00);
      assert!(parse_battery_status(&long).is_err());
      assert!(parse_battery_status(&data).is_ok());
   }

   #[test]
   fn battery_rejects_bad_markers() {
      // Spacer byte not 0x01
      let data = battery_packet(&[[0x04, 0x02, 50, 0x01, 0x01]]);
      assert!(parse_battery_status(&data).is_err());

      // End byte not 0x01
      let data = battery_packet(&[[0x04, 0x01, 50, 0x01, 0x02]]);
      assert!(parse_battery_status(&data).is_err());

      // Unknown component tag
      let data = battery_packet(&[[0x07, 0x01, 50, 0x01, 0x01]]);
      assert!(parse_battery_status(&data).is_err());

      // Count above 3
      let mut data = battery_packet(&[]);
      data[6] = 4;
      assert!(parse_battery_status(&data).is_err());
   }

   #[test]
   fn battery_case_only_leaves_pod_order_empty() {
      let data = battery_packet(&[[0x08, 0x01, 80, 0x02, 0x01]]);
      let packet = parse_battery_status(&data).unwrap();
      assert_eq!(packet.records.len(), 1);
      assert!(packet.pod_order.is_empty());
   }

   #[test]
   fn ear_detection_bytes() {
      let mut data = HDR_EAR_DETECTION.to_vec();
      data.extend_from_slice(&[0x00, 0x02]);
      assert_eq!(
         parse_ear_detection(&data).unwrap(),
         (EarStatus::InEar, EarStatus::InCase)
      );

      data[7] = 0x09;
      assert_eq!(parse_ear_detection(&data).unwrap().1, EarStatus::Disconnected);

      assert!(parse_ear_detection(&data[..7]).is_err());
   }

   #[test]
   fn noise_mode_decrement() {
      let mut data = HDR_NOISE_CTL.to_vec();
      data.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
      assert_eq!(parse_noise_mode(&data).unwrap(), NoiseControlMode::Transparency);

      data[7] = 0x00;
      assert!(parse_noise_mode(&data).is_err());
      data[7] = 0x05;
      assert!(parse_noise_mode(&data).is_err());
   }

   fn metadata_packet(strings: &[&str]) -> Vec<u8> {
      let mut data = HDR_METADATA.to_vec();
      data.extend_from_slice(&[0u8; 6]);
      for s in strings {
         data.extend_from_slice(s.as_bytes());
         data.push(0);
      }
      data
   }

   #[test]
   fn metadata_three_strings() {
      let data = metadata_packet(&["AirPods Pro", "A2084", "Apple Inc."]);
      let meta = parse_metadata(&data).unwrap();
      assert_eq!(meta.device_name, "AirPods Pro");
      assert_eq!(meta.model_number, "A2084");
      assert_eq!(meta.manufacturer, "Apple Inc.");
   }

   #[test]
   fn metadata_truncation_yields_empty_strings() {
      let data = metadata_packet(&["AirPods Pro"]);
      let meta = parse_metadata(&data).unwrap();
      assert_eq!(meta.device_name, "AirPods Pro");
      assert_eq!(meta.model_number, "");
      assert_eq!(meta.manufacturer, "");

      // String cut off mid-way, no terminator
      let mut data = HDR_METADATA.to_vec();
      data.extend_from_slice(&[0u8; 6]);
      data.extend_from_slice(b"AirP");
      let meta = parse_metadata(&data).unwrap();
      assert_eq!(meta.device_name, "AirP");
      assert_eq!(meta.model_number, "");
   }

   fn key_packet(tag1: u8, len1: u16, tag2: u8, len2: u16) -> Vec<u8> {
      let mut data = HDR_MAGIC_KEYS.to_vec();
      data.push(tag1);
      data.extend_from_slice(&len1.to_be_bytes());
      data.push(0x00);
      data.extend_from_slice(&[0x11; 16]);
      data.push(tag2);
      data.extend_from_slice(&len2.to_be_bytes());
      data.push(0x00);
      data.extend_from_slice(&[0x22; 16]);
      data
   }

   #[test]
   fn magic_keys_happy_path() {
      let keys = parse_magic_keys(&key_packet(0x01, 16, 0x04, 16)).unwrap();
      assert_eq!(keys.irk, [0x11; 16]);
      assert_eq!(keys.enc_key, [0x22; 16]);
   }

   #[test]
   fn magic_keys_reject_deviations() {
      assert!(parse_magic_keys(&key_packet(0x02, 16, 0x04, 16)).is_err());
      assert!(parse_magic_keys(&key_packet(0x01, 16, 0x05, 16)).is_err());
      assert!(parse_magic_keys(&key_packet(0x01, 17, 0x04, 16)).is_err());
      assert!(parse_magic_keys(&key_packet(0x01, 16, 0x04, 15)).is_err());

      // Truncated second block
      let data = key_packet(0x01, 16, 0x04, 16);
      assert!(parse_magic_keys(&data[..data.len() - 4]).is_err());
   }

   #[test]
   fn conversational_data() {
      let mut data = HDR_CA_DATA.to_vec();
      data.push(0x01);
      assert_eq!(parse_conversational_data(&data), Some(true));
      data[9] = 0x02;
      assert_eq!(parse_conversational_data(&data), Some(false));
      assert_eq!(parse_conversational_data(&data[..9]), None);
   }
}
