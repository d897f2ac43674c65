//! Companion-device link.
//!
//! A parallel L2CAP connection to a companion device (typically a phone
//! running the counterpart app) that multiplexes a small command vocabulary
//! and relays all other bytes verbatim between the two links. Unlike the
//! primary link this one has no retry budget; reconnecting is caller-driven.

use bluer::Address;
use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
   airpods::protocol::{
      COMPANION_CONNECTED, COMPANION_DISCONNECT_REQUEST, COMPANION_DISCONNECTED, COMPANION_NOTIFY,
      COMPANION_STATUS_REQUEST,
   },
   bluetooth::l2cap::{self, L2CapSender, Packet},
   error::{PodsError, Result},
};

/// PSM of the companion control channel.
const PSM_COMPANION: u16 = 0x1003;

/// What an inbound companion packet asks of us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionAction {
   /// Forward these bytes to the primary link.
   RelayToPrimary(Packet),
   /// The companion took over the accessory.
   PeerConnected,
   /// The companion released the accessory.
   PeerDisconnected,
   /// The companion asks whether our primary link is up.
   StatusRequest,
   /// The companion asks us to drop the primary link.
   DisconnectRequest,
}

/// Classifies one inbound companion packet.
///
/// Notification-wrapped payloads are unwrapped; the four fixed command
/// sequences map to their commands; anything else is relayed verbatim.
pub fn classify(packet: &[u8]) -> CompanionAction {
   if let Some(inner) = packet.strip_prefix(COMPANION_NOTIFY) {
      CompanionAction::RelayToPrimary(Packet::from_slice(inner))
   } else if packet.starts_with(COMPANION_CONNECTED) {
      CompanionAction::PeerConnected
   } else if packet.starts_with(COMPANION_DISCONNECTED) {
      CompanionAction::PeerDisconnected
   } else if packet.starts_with(COMPANION_STATUS_REQUEST) {
      CompanionAction::StatusRequest
   } else if packet.starts_with(COMPANION_DISCONNECT_REQUEST) {
      CompanionAction::DisconnectRequest
   } else {
      CompanionAction::RelayToPrimary(Packet::from_slice(packet))
   }
}

/// Events surfaced to the owner of the link.
#[derive(Debug)]
pub enum CompanionEvent {
   Action(CompanionAction),
   /// The link died; reconnect is up to the caller.
   Closed(PodsError),
}

/// An established companion link.
#[derive(Debug)]
pub struct CompanionLink {
   sender: L2CapSender,
   _jset: JoinSet<()>,
}

impl CompanionLink {
   /// Connects to the companion device and starts the inbound dispatcher.
   pub async fn connect(
      address: Address,
      events: mpsc::Sender<CompanionEvent>,
   ) -> Result<Self> {
      let mut jset = JoinSet::new();
      let (mut receiver, sender) = l2cap::connect(&mut jset, address, Some(PSM_COMPANION)).await?;
      info!("Companion link established to {address}");

      jset.spawn(async move {
         loop {
            match receiver.recv().await {
               Ok(packet) => {
                  let action = classify(&packet);
                  debug!("Companion packet from {address}: {action:?}");
                  if events.send(CompanionEvent::Action(action)).await.is_err() {
                     return;
                  }
               },
               Err(e) => {
                  warn!("Companion link to {address} closed: {e}");
                  let _ = events.send(CompanionEvent::Closed(e)).await;
                  return;
               },
            }
         }
      });

      Ok(Self {
         sender,
         _jset: jset,
      })
   }

   pub fn is_connected(&self) -> bool {
      self.sender.is_connected()
   }

   /// Announces that something happened on the primary link.
   pub async fn notify(&self) -> Result<()> {
      self.sender.send(COMPANION_NOTIFY).await
   }

   /// Reports the primary link status in reply to a status request.
   pub async fn send_status(&self, connected: bool) -> Result<()> {
      let response = if connected {
         COMPANION_CONNECTED
      } else {
         COMPANION_DISCONNECTED
      };
      self.sender.send(response).await
   }

   /// Tells the companion that the accessory disconnected from us.
   pub async fn send_disconnected(&self) -> Result<()> {
      self.sender.send(COMPANION_DISCONNECTED).await
   }

   /// Asks the companion to release the accessory.
   pub async fn send_disconnect_request(&self) -> Result<()> {
      self.sender.send(COMPANION_DISCONNECT_REQUEST).await
   }

   /// Relays a packet from the primary link, notification-wrapped.
   pub async fn relay_from_primary(&self, packet: &[u8]) -> Result<()> {
      let mut wrapped = Packet::from_slice(COMPANION_NOTIFY);
      wrapped.extend_from_slice(packet);
      self.sender.send(&wrapped).await
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn vocabulary_dispatch() {
      assert_eq!(classify(&[0x00, 0x01, 0x00, 0x01]), CompanionAction::PeerConnected);
      assert_eq!(
         classify(&[0x00, 0x01, 0x00, 0x00]),
         CompanionAction::PeerDisconnected
      );
      assert_eq!(classify(&[0x00, 0x02, 0x00, 0x03]), CompanionAction::StatusRequest);
      assert_eq!(
         classify(&[0x00, 0x02, 0x00, 0x00]),
         CompanionAction::DisconnectRequest
      );
   }

   #[test]
   fn notification_payload_is_unwrapped() {
      let packet = [0x00, 0x04, 0x00, 0x01, 0xAA, 0xBB];
      match classify(&packet) {
         CompanionAction::RelayToPrimary(inner) => assert_eq!(inner.as_slice(), &[0xAA, 0xBB]),
         other => panic!("unexpected action: {other:?}"),
      }
   }

   #[test]
   fn unknown_bytes_relay_verbatim() {
      let packet = [0x04, 0x00, 0x04, 0x00, 0x0D];
      match classify(&packet) {
         CompanionAction::RelayToPrimary(inner) => assert_eq!(inner.as_slice(), &packet),
         other => panic!("unexpected action: {other:?}"),
      }
   }
}
