//! Configuration management for the daemon.
//!
//! Handles loading and saving configuration from disk, including connection
//! parameters, the companion-link settings, and the persisted identity of
//! the paired accessory (name, model, and long-term keys).

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
   airpods::{
      parser::MagicKeys,
      protocol::AirPodsModel,
      state::DeviceIdentity,
   },
   error::{PodsError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay_ms")]
   pub reconnect_delay_ms: u64,

   #[serde(default)]
   pub companion: CompanionConfig,

   /// Durable identity of the paired accessory, written after the
   /// pairing-key exchange completes.
   #[serde(default)]
   pub device: Option<PairedDevice>,
}

/// A device the user marked as theirs regardless of recognition heuristics.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

/// Companion-link (secondary device) settings.
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct CompanionConfig {
   #[serde(default)]
   pub enabled: bool,

   /// Bluetooth address of the companion device.
   #[serde(default)]
   pub address: Option<String>,
}

/// The persisted subset of the paired accessory's identity.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PairedDevice {
   pub name: String,
   pub model_code: u16,

   #[serde(with = "hex::serde")]
   pub irk: [u8; 16],

   #[serde(with = "hex::serde")]
   pub enc_key: [u8; 16],
}

impl PairedDevice {
   pub fn to_identity(&self) -> DeviceIdentity {
      DeviceIdentity {
         name: self.name.as_str().into(),
         model: Some(AirPodsModel::from_code(self.model_code)),
         keys: Some(MagicKeys {
            irk: self.irk,
            enc_key: self.enc_key,
         }),
         ..Default::default()
      }
   }

   /// Extracts the persistable subset; `None` until the key exchange has
   /// completed.
   pub fn from_identity(identity: &DeviceIdentity) -> Option<Self> {
      let keys = identity.keys?;
      Some(Self {
         name: identity.name.to_string(),
         model_code: identity.model.unwrap_or(AirPodsModel::Unknown).code(),
         irk: keys.irk,
         enc_key: keys.enc_key,
      })
   }
}

const fn default_poll_interval() -> u64 {
   30
}

const fn default_retry_count() -> u32 {
   3
}

const fn default_reconnect_delay_ms() -> u64 {
   1500
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_path()?)
   }

   fn load_from(config_path: PathBuf) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default_with_values();
         config.save_to(&config_path)?;
         Ok(config)
      }
   }

   pub fn default_with_values() -> Self {
      Self {
         known_devices: vec![],
         poll_interval: default_poll_interval(),
         connection_retry_count: default_retry_count(),
         reconnect_delay_ms: default_reconnect_delay_ms(),
         companion: CompanionConfig::default(),
         device: None,
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   fn save_to(&self, config_path: &PathBuf) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("OPENPODS_HOME") {
         PathBuf::from(home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(PodsError::ConfigDirNotFound);
      };

      Ok(config_dir.join("openpods-service").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn paired_device_round_trips_through_toml() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default_with_values();
      config.device = Some(PairedDevice {
         name: "AirPods Pro".into(),
         model_code: 0x0E20,
         irk: [0x11; 16],
         enc_key: [0x22; 16],
      });
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(path).unwrap();
      assert_eq!(loaded.device, config.device);
      assert_eq!(loaded.connection_retry_count, 3);
      assert_eq!(loaded.reconnect_delay_ms, 1500);
   }

   #[test]
   fn missing_file_creates_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("sub").join("config.toml");

      let config = Config::load_from(path.clone()).unwrap();
      assert!(config.device.is_none());
      assert!(path.exists());
   }

   #[test]
   fn identity_conversion_requires_keys() {
      let identity = DeviceIdentity {
         name: "Buds".into(),
         ..Default::default()
      };
      assert!(PairedDevice::from_identity(&identity).is_none());

      let paired = PairedDevice {
         name: "Buds".into(),
         model_code: 0x1420,
         irk: [0xAA; 16],
         enc_key: [0xBB; 16],
      };
      let identity = paired.to_identity();
      assert_eq!(identity.name, "Buds");
      assert_eq!(identity.model, Some(AirPodsModel::AirPodsPro2Lightning));
      assert_eq!(PairedDevice::from_identity(&identity), Some(paired));
   }
}
