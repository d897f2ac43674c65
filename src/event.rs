//! Event handling for accessory status updates.
//!
//! The protocol engine is the sole writer of device state; every observable
//! change is published through the [`EventBus`] so consumers never poll
//! ambient globals.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::airpods::{
   device::AirPods,
   protocol::{BatteryInfo, NoiseControlMode},
   state::EarDetection,
};

/// Events emitted by the protocol engine.
#[derive(Debug, Clone)]
pub enum AirPodsEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(BatteryInfo),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetection),
   DeviceNameChanged(SmolStr),
   ConversationalAwarenessChanged(bool),
   /// Nearby speech detected (true) or ended (false) while conversational
   /// awareness is active.
   SpeechDetected(bool),
   PairingKeysReceived,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &AirPods, event: AirPodsEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
