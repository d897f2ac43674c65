//! Device recognition heuristics.
//!
//! Decides whether a bluetoothd device is one of ours based on modalias,
//! manufacturer data, advertised services, and name/alias patterns, in
//! decreasing order of reliability.

use uuid::Uuid;

use crate::ble::advertisement::{APPLE_COMPANY_ID, PROXIMITY_MARKER};

/// Name patterns that identify supported accessories (case-insensitive).
/// Note: "earpods" are wired earphones, not a Bluetooth accessory.
const NAME_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple vendor ID as reported in the modalias
const APPLE_VID: u32 = 0x004C;

/// Offset of the product-id byte inside the manufacturer data
const PID_OFFSET: usize = 6;

/// Product ids of known compatible headphones
const ACCESSORY_PIDS: &[u32] = &[
   0x2002, // Beats (also some AirPods variants)
   0x200E, // AirPods (2nd gen)
   0x200A, // AirPods (3rd gen)
   0x200F, // Beats Solo Pro
   0x2012, // PowerBeats Pro
   0x2013, // AirPods Max
   0x2014, // AirPods Pro (2nd gen)
   0x2024, // AirPods Pro (1st gen)
];

/// Vendor service UUIDs. Not always advertised, but definitive when found.
static VENDOR_SERVICES: [Uuid; 3] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd39_0000_1000_8000_00805f9b34fb),
   Uuid::from_u128(0x0000fd32_0000_1000_8000_00805f9b34fb),
];

fn check_manufacturer_data(data: &[u8]) -> bool {
   if data.len() > PID_OFFSET && data[0] == PROXIMITY_MARKER {
      let product_id = data[PID_OFFSET];
      return ACCESSORY_PIDS.iter().any(|&x| (x & 0xFF) as u8 == product_id);
   }
   false
}

pub async fn is_device_airpods(dev: &bluer::Device) -> bool {
   // Modalias is the most reliable source for connected devices
   if let Ok(Some(modalias)) = dev.modalias().await
      && modalias.vendor == APPLE_VID
      && ACCESSORY_PIDS.contains(&modalias.product)
   {
      log::debug!(
         "Accessory detected via modalias: vendor={:#06x}, product={:#06x}",
         modalias.vendor,
         modalias.product
      );
      return true;
   }

   // Manufacturer data covers advertising/unconnected devices
   if let Ok(Some(mfg_data)) = dev.manufacturer_data().await
      && let Some(vendor_data) = mfg_data.get(&APPLE_COMPANY_ID)
      && check_manufacturer_data(vendor_data)
   {
      log::debug!("Accessory detected via manufacturer data");
      return true;
   }

   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.iter().any(|u| VENDOR_SERVICES.contains(u))
   {
      log::debug!("Accessory detected via vendor service UUID");
      return true;
   }

   // Last-chance name/alias pattern matching
   if let Ok(Some(mut name)) = dev.name().await {
      name.make_ascii_lowercase();
      for pattern in NAME_PATTERNS {
         if name.contains(pattern) {
            log::debug!("Accessory detected via name pattern: {name} => {pattern}");
            return true;
         }
      }
   }
   if let Ok(mut alias) = dev.alias().await {
      alias.make_ascii_lowercase();
      for pattern in NAME_PATTERNS {
         if alias.contains(pattern) {
            log::debug!("Accessory detected via alias pattern: {alias} => {pattern}");
            return true;
         }
      }
   }
   false
}
