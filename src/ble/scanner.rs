//! Continuous BLE discovery actor.
//!
//! Scans for proximity broadcasts, decodes candidate manufacturer data, and
//! forwards decoded advertisements to the manager. Scanning restarts itself
//! when the discovery stream ends and can be paused around system sleep.

use std::time::Duration;

use bluer::{Adapter, AdapterEvent, DiscoveryFilter, DiscoveryTransport};
use futures::StreamExt;
use log::{debug, warn};
use tokio::{select, sync::mpsc, time};

use crate::ble::advertisement::{APPLE_COMPANY_ID, Advertisement};

/// Delay before restarting discovery after a failure.
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanCommand {
   Pause,
   Resume,
}

/// Handle to a running scan actor.
///
/// Dropping the handle stops the actor.
#[derive(Debug, Clone)]
pub struct BleScanner {
   tx: mpsc::Sender<ScanCommand>,
}

impl BleScanner {
   /// Spawns the scan actor on the given adapter. Decoded advertisements
   /// are delivered through `found_tx`.
   pub fn spawn(adapter: Adapter, found_tx: mpsc::Sender<Advertisement>) -> Self {
      let (tx, rx) = mpsc::channel(16);
      tokio::spawn(run(adapter, rx, found_tx));
      Self { tx }
   }

   /// Pauses scanning, e.g. while the system is asleep.
   pub async fn pause(&self) {
      let _ = self.tx.send(ScanCommand::Pause).await;
   }

   /// Resumes scanning after a pause.
   pub async fn resume(&self) {
      let _ = self.tx.send(ScanCommand::Resume).await;
   }
}

async fn run(
   adapter: Adapter,
   mut cmd_rx: mpsc::Receiver<ScanCommand>,
   found_tx: mpsc::Sender<Advertisement>,
) {
   let mut scanning = true;
   loop {
      if !scanning {
         match cmd_rx.recv().await {
            Some(ScanCommand::Resume) => scanning = true,
            Some(ScanCommand::Pause) => {},
            None => return,
         }
         continue;
      }

      let filter = DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      };
      if let Err(e) = adapter.set_discovery_filter(filter).await {
         warn!("Failed to set discovery filter: {e}");
      }

      let mut events = match adapter.discover_devices_with_changes().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Failed to start discovery: {e}, retrying in {RESTART_DELAY:?}");
            time::sleep(RESTART_DELAY).await;
            continue;
         },
      };
      debug!("BLE scan started on {}", adapter.name());

      loop {
         select! {
             cmd = cmd_rx.recv() => match cmd {
                 Some(ScanCommand::Pause) => {
                     debug!("BLE scan paused");
                     scanning = false;
                     break;
                 }
                 Some(ScanCommand::Resume) => {}
                 None => return,
             },
             event = events.next() => match event {
                 Some(AdapterEvent::DeviceAdded(addr)) => {
                     if let Some(adv) = read_advertisement(&adapter, addr).await
                         && found_tx.send(adv).await.is_err()
                     {
                         return;
                     }
                 }
                 Some(_) => {}
                 None => {
                     // Discovery stream ended; restart the scan
                     debug!("BLE scan stream ended, restarting");
                     break;
                 }
             },
         }
      }
   }
}

async fn read_advertisement(adapter: &Adapter, addr: bluer::Address) -> Option<Advertisement> {
   let device = adapter.device(addr).ok()?;
   let mfg_data = device.manufacturer_data().await.ok()??;
   let data = mfg_data.get(&APPLE_COMPANY_ID)?;
   Advertisement::decode(addr, data)
}
