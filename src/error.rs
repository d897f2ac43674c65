//! Error types for the daemon.
//!
//! One crate-wide error enum covering Bluetooth, D-Bus, I/O, configuration,
//! and protocol errors. Nothing here is process-fatal; every failure
//! degrades to waiting for the next event.

use bluer::Address;
use thiserror::Error;
use tokio::task::JoinError;

use crate::airpods::parser::ProtoError;

/// Main error type for the daemon.
#[derive(Error, Debug)]
pub enum PodsError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Proto(#[from] ProtoError),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Invalid device name: {0}")]
   InvalidName(&'static str),

   #[error("Actor panicked: {0}")]
   ActorPanicked(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `PodsError`.
pub type Result<T> = std::result::Result<T, PodsError>;
