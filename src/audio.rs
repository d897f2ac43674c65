//! Audio-routing capability interface.
//!
//! Audio profile management lives outside the protocol engine; the engine
//! only signals through this trait. Implementations are expected to run
//! their blocking calls on a background context and to serialize calls per
//! device.

use std::sync::Arc;

use bluer::Address;
use log::debug;
use smol_str::SmolStr;

/// Capability interface for the OS audio-routing collaborator.
pub trait AudioRouting: Send + Sync {
   /// Activates the stereo output profile for the device.
   fn activate_output(&self, address: Address);

   /// Releases the output profile for the device.
   fn deactivate_output(&self, address: Address);

   /// Resolves the name of the output sink for the device, if any.
   fn output_name(&self, address: Address) -> Option<SmolStr>;
}

/// No-op implementation used when no audio collaborator is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioRouting;

impl AudioRouting for NullAudioRouting {
   fn activate_output(&self, address: Address) {
      debug!("audio: activate output for {address} (no-op)");
   }

   fn deactivate_output(&self, address: Address) {
      debug!("audio: deactivate output for {address} (no-op)");
   }

   fn output_name(&self, _address: Address) -> Option<SmolStr> {
      None
   }
}

/// Type alias for a shared audio-routing handle.
pub type AudioSink = Arc<dyn AudioRouting>;
