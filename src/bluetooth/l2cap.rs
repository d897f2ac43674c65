//! L2CAP socket plumbing for the accessory links.
//!
//! Provides async seq-packet socket handling with separate sender and
//! receiver halves. Both the primary accessory link and the companion link
//! run over this transport.

use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{PodsError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) for the accessory control channel
const PSM_CONTROL: u16 = 0x1001;
/// Maximum transmission unit for L2CAP packets
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(PodsError::ConnectionClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(PodsError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| PodsError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| PodsError::RequestTimeout)?
         .map_err(|_| PodsError::ConnectionClosed)?
   }
}

pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
   psm: Option<u16>,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let psm = psm.unwrap_or(PSM_CONTROL);
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let seq_packet = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| PodsError::RequestTimeout)??;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_thread(address, in_tx, seq_packet.clone()));
   jset.spawn(send_thread(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx }))
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Result<Packet>>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; L2CAP_MTU];
   while let Ok(n) = sp.recv(&mut stack).await {
      if n == 0 {
         warn!("Connection lost");
         let _ = tx.send(Err(PodsError::ConnectionLost)).await;
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      let bytes = Packet::from_slice(recvd);
      if let Err(e) = tx.send(Ok(bytes)).await {
         warn!("Failed to send data: {e:?}");
         return;
      }
      stack[..n].fill(0);
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(PodsError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   warn!("User shutdown");
}

#[cfg(test)]
pub(crate) mod testing {
   use super::*;

   /// In-process stand-in for a connected socket: returns the connection
   /// halves plus a handle to feed inbound packets and one to observe
   /// outbound packets.
   pub fn loopback() -> (
      L2CapReceiver,
      L2CapSender,
      mpsc::Sender<Result<Packet>>,
      mpsc::Receiver<Packet>,
   ) {
      let (cmd_tx, mut cmd_rx) = mpsc::channel(128);
      let (in_tx, in_rx) = mpsc::channel(128);
      let (out_tx, out_rx) = mpsc::channel(128);

      tokio::spawn(async move {
         while let Some(Command::Send { data, then }) = cmd_rx.recv().await {
            let _ = out_tx.send(data).await;
            let _ = then.send(Ok(()));
         }
      });

      (
         L2CapReceiver { rx: in_rx },
         L2CapSender { tx: cmd_tx },
         in_tx,
         out_rx,
      )
   }
}
