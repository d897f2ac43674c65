//! Bluetooth lifecycle manager.
//!
//! One actor owns the adapter set, the paired accessory, the BLE scan
//! actor, and the companion link. All socket completions, discovery
//! events, and decoded advertisements are delivered onto this actor, so
//! device state routing needs no further locking.

use std::{collections::HashMap, str::FromStr, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods::{self, device::AirPods},
   audio::AudioSink,
   ble::{advertisement::Advertisement, scanner::BleScanner},
   bluetooth::{
      companion::{CompanionAction, CompanionEvent, CompanionLink},
      l2cap::Packet,
   },
   config::{Config, PairedDevice},
   error::{PodsError, Result},
   event::{AirPodsEvent, EventSender},
};

/// Interval to poll for connection health and already-connected devices
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum time to wait for the primary link to come up
const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

// === Retry policy ===

/// Bounded fixed-delay retry for the primary link.
///
/// Exhausting the budget resets the counter and stops automatic retries;
/// the next discovery event starts a fresh budget.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
   attempts: u32,
   limit: u32,
   delay: Duration,
}

impl RetryPolicy {
   const fn new(limit: u32, delay: Duration) -> Self {
      Self {
         attempts: 0,
         limit,
         delay,
      }
   }

   fn next_delay(&mut self) -> Option<Duration> {
      if self.attempts < self.limit {
         self.attempts += 1;
         Some(self.delay)
      } else {
         self.attempts = 0;
         None
      }
   }

   fn reset(&mut self) {
      self.attempts = 0;
   }
}

// === Adapter management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   name: SmolStr,
}

// === Device management ===

#[derive(Debug, Copy, Clone, PartialEq)]
enum LinkStatus {
   Disconnected,
   Connecting,
   Connected,
}

struct ManagedDevice {
   device: AirPods,
   adapter_name: Option<SmolStr>,
   link: LinkStatus,
   handle: Option<JoinHandle<()>>,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String),

   // Device events
   DeviceDiscovered(Address, SmolStr),
   LinkEstablished(Address),
   LinkClosed(Address, bool), // address, is_error

   // Broadcast and companion traffic
   Advertisement(Box<Advertisement>),
   Companion(CompanionEvent),
   RelayToCompanion(Packet),

   // User commands
   EstablishLink(Address, Option<oneshot::Sender<Result<()>>>),
   DisconnectLink(Option<oneshot::Sender<Result<()>>>),
   GetDevice(oneshot::Sender<Option<AirPods>>),
   SystemSleep(bool),
   PersistIdentity,
}

// === Main manager ===

/// Handle to the Bluetooth manager actor.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(event_tx: EventSender, config: Config, audio: AudioSink) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ManagerActor::new(config, event_tx, command_rx, audio)
            .await
            .run(),
      );
      Ok(Self { inbox: command_tx })
   }

   pub async fn connect_device(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::EstablishLink(address, Some(tx)))
         .await
         .map_err(|_| PodsError::ManagerShutdown)?;
      rx.await.map_err(|_| PodsError::ManagerShutdown)?
   }

   pub async fn disconnect_device(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::DisconnectLink(Some(tx)))
         .await
         .map_err(|_| PodsError::ManagerShutdown)?;
      rx.await.map_err(|_| PodsError::ManagerShutdown)?
   }

   pub async fn get_device(&self) -> Option<AirPods> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetDevice(tx))
         .await
         .ok()?;
      rx.await.ok().flatten()
   }

   /// Entry point for the system-sleep collaborator: pauses BLE scanning
   /// while asleep and resumes it on wake.
   pub async fn set_system_sleep(&self, sleeping: bool) {
      let _ = self.inbox.send(ManagerCommand::SystemSleep(sleeping)).await;
   }

   /// Writes the paired identity (name, model, keys) back to disk.
   pub async fn persist_identity(&self) {
      let _ = self.inbox.send(ManagerCommand::PersistIdentity).await;
   }
}

// === Manager actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   audio: AudioSink,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   relay_tx: mpsc::Sender<Packet>,
   session: Session,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   device: Option<ManagedDevice>,
   connecting: bool,
   retry: RetryPolicy,
   scanner: Option<(SmolStr, BleScanner)>,
   companion: Option<CompanionLink>,
   companion_available: bool,
   sleeping: bool,
}

impl ManagerActor {
   async fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      audio: AudioSink,
   ) -> Self {
      let session = Session::new()
         .await
         .expect("Failed to create Bluetooth session");

      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      // Forward the primary-link packet tap into the actor
      let (relay_tx, mut relay_rx) = mpsc::channel::<Packet>(CHANNEL_BUFFER_SIZE);
      let relay_loopback = loopback_tx.clone();
      tokio::spawn(async move {
         while let Some(packet) = relay_rx.recv().await {
            if relay_loopback
               .send(ManagerCommand::RelayToCompanion(packet))
               .await
               .is_err()
            {
               return;
            }
         }
      });

      let retry = RetryPolicy::new(
         config.connection_retry_count,
         Duration::from_millis(config.reconnect_delay_ms),
      );

      let mut actor = Self {
         config,
         event_tx,
         audio,
         command_rx,
         loopback_rx,
         loopback_tx,
         relay_tx,
         session,
         adapters: HashMap::new(),
         device: None,
         connecting: false,
         retry,
         scanner: None,
         companion: None,
         companion_available: true,
         sleeping: false,
      };

      // A persisted identity makes the broadcast path live before the
      // accessory is ever seen over bluetoothd in this session.
      if let Some(paired) = actor.config.device.clone() {
         info!("Restoring paired accessory '{}'", paired.name);
         let device = AirPods::new(Address::any(), paired.name.as_str().into());
         device.restore_identity(paired.to_identity());
         actor.device = Some(ManagedDevice {
            device,
            adapter_name: None,
            link: LinkStatus::Disconnected,
            handle: None,
         });
      }

      actor
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapters().await;
      self.connect_companion().await;

      let mut health_check_interval = time::interval(HEALTH_CHECK_INTERVAL);
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_connection_health().await;
                 self.scan_for_connected_accessories().await;
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            error!("Adapter error on {name}: {error}");
            if let Some(info) = self.adapters.get_mut(&name) {
               info.state = AdapterState::Failed(error);
            }
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::LinkEstablished(addr) => {
            self.handle_link_established(addr).await;
         },
         ManagerCommand::LinkClosed(addr, is_error) => {
            self.handle_link_closed(addr, is_error).await;
         },
         ManagerCommand::Advertisement(adv) => {
            self.handle_advertisement(&adv);
         },
         ManagerCommand::Companion(event) => {
            self.handle_companion_event(event).await;
         },
         ManagerCommand::RelayToCompanion(packet) => {
            self.relay_to_companion(&packet).await;
         },
         ManagerCommand::EstablishLink(addr, reply) => {
            // If the companion currently holds the accessory, ask it to let
            // go before we grab the link.
            if !self.companion_available
               && let Some(companion) = &self.companion
            {
               let _ = companion.send_disconnect_request().await;
            }
            let result = self.establish_link(addr);
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::DisconnectLink(reply) => {
            let result = self.disconnect_link().await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::GetDevice(reply) => {
            let _ = reply.send(self.device.as_ref().map(|d| d.device.clone()));
         },
         ManagerCommand::SystemSleep(sleeping) => {
            self.handle_system_sleep(sleeping).await;
         },
         ManagerCommand::PersistIdentity => {
            self.persist_identity();
         },
      }
   }

   // === Adapters ===

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            if let Ok(powered) = adapter.is_powered().await
               && !powered
            {
               if let Err(e) = adapter.set_powered(true).await {
                  warn!("Failed to power on adapter {name}: {e}");
                  let loopback = self.loopback_tx.clone();
                  let name_clone = name.clone();
                  let adapter_clone = adapter.clone();
                  tokio::spawn(async move {
                     time::sleep(ADAPTER_RECOVERY_DELAY).await;
                     let _ = loopback
                        .send(ManagerCommand::AdapterAvailable(name_clone, adapter_clone))
                        .await;
                  });
                  return;
               }
               info!("Powered on adapter: {name}");
            }

            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name.clone(),
                     adapter.clone(),
                  )),
                  adapter: adapter.clone(),
                  name: name.clone(),
               },
            );

            self.ensure_scanner(&name, &adapter);
            self.check_connected_devices(&name).await;
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            let _ = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await;
            return;
         };

         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = event {
               debug!("Device added on {name}: {addr}");
               let _ = loopback
                  .send(ManagerCommand::DeviceDiscovered(addr, name.clone()))
                  .await;
            }
         }

         // Event stream ended, adapter is probably gone
         let _ = loopback.send(ManagerCommand::AdapterLost(name)).await;
      })
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter.clone();
         info.state = AdapterState::Active;

         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               adapter.clone(),
            ));
         }

         self.ensure_scanner(&name, &adapter);
         self.check_connected_devices(&name).await;
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.state = AdapterState::Lost;

         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
         }
      }

      // The scan actor dies with its adapter
      if self
         .scanner
         .as_ref()
         .is_some_and(|(scanner_adapter, _)| *scanner_adapter == name)
      {
         self.scanner = None;
      }

      if let Some(managed) = &mut self.device
         && managed.adapter_name.as_ref() == Some(&name)
      {
         if let Some(handle) = managed.handle.take() {
            handle.abort();
         }
         managed.link = LinkStatus::Disconnected;
         self
            .event_tx
            .emit(&managed.device, AirPodsEvent::DeviceError);
      }
   }

   fn ensure_scanner(&mut self, name: &SmolStr, adapter: &Adapter) {
      if self.scanner.is_some() {
         return;
      }

      let (adv_tx, mut adv_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         while let Some(adv) = adv_rx.recv().await {
            if loopback
               .send(ManagerCommand::Advertisement(Box::new(adv)))
               .await
               .is_err()
            {
               return;
            }
         }
      });

      let scanner = BleScanner::spawn(adapter.clone(), adv_tx);
      self.scanner = Some((name.clone(), scanner));
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   // === Discovery ===

   async fn check_connected_devices(&self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };

      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if let Ok(device) = adapter_info.adapter.device(addr)
            && device.is_connected().await == Ok(true)
            && self.is_accessory_device(&device).await
         {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn scan_for_connected_accessories(&self) {
      for adapter_info in self.adapters.values() {
         if adapter_info.state != AdapterState::Active {
            continue;
         }
         self.check_connected_devices(&adapter_info.name).await;
      }
   }

   async fn is_accessory_device(&self, device: &bluer::Device) -> bool {
      let addr = device.address();
      if self.config.is_known_device(&addr.to_string()).is_some() {
         return true;
      }
      airpods::recognition::is_device_airpods(device).await
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      // Ignore repeats for the device we are already driving
      if self
         .device
         .as_ref()
         .is_some_and(|d| d.device.address() == addr && d.link != LinkStatus::Disconnected)
      {
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };
      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };
      if !self.is_accessory_device(&device).await {
         return;
      }
      // Only proceed once bluetoothd holds the baseband connection
      if !device.is_connected().await.unwrap_or(false) {
         debug!("Discovered accessory at {addr} but not connected by system");
         return;
      }
      if !device.is_paired().await.unwrap_or(false) {
         debug!("Discovered accessory at {addr} but it is not paired");
         return;
      }

      let name = device
         .name()
         .await
         .ok()
         .flatten()
         .unwrap_or_else(|| addr.to_string());
      info!("Found connected accessory: {name} ({addr})");

      self.bind_device(addr, name.into(), adapter_name);

      // A fresh discovery event starts a fresh retry budget
      self.retry.reset();
      let _ = self.establish_link(addr);
   }

   /// Creates or re-addresses the managed device, carrying the identity
   /// (including any pairing keys) over from the previous instance or the
   /// persisted configuration.
   fn bind_device(&mut self, addr: Address, name: SmolStr, adapter_name: SmolStr) {
      if let Some(managed) = &mut self.device
         && managed.device.address() == addr
      {
         managed.adapter_name = Some(adapter_name);
         return;
      }

      let identity = self
         .device
         .as_ref()
         .map(|d| d.device.identity())
         .filter(|identity| identity.keys.is_some())
         .or_else(|| self.config.device.as_ref().map(PairedDevice::to_identity));

      let device = AirPods::new(addr, name);
      if let Some(mut identity) = identity {
         if identity.name.is_empty() {
            identity.name = device.name();
         }
         device.restore_identity(identity);
      }
      if self.config.companion.enabled {
         device.set_relay(Some(self.relay_tx.clone()));
      }

      if let Some(old) = self.device.take()
         && let Some(handle) = old.handle
      {
         handle.abort();
      }

      self.device = Some(ManagedDevice {
         device,
         adapter_name: Some(adapter_name),
         link: LinkStatus::Disconnected,
         handle: None,
      });
   }

   // === Primary link ===

   fn establish_link(&mut self, addr: Address) -> Result<()> {
      if self.connecting {
         return Err(PodsError::AlreadyConnecting);
      }

      let managed = self
         .device
         .as_mut()
         .filter(|d| d.device.address() == addr)
         .ok_or(PodsError::DeviceNotFound(addr))?;

      if managed.link == LinkStatus::Connected {
         return Ok(());
      }

      let adapter_name = managed
         .adapter_name
         .clone()
         .ok_or(PodsError::AdapterNotFound)?;
      match self.adapters.get(&adapter_name) {
         Some(info) if info.state == AdapterState::Active => {},
         Some(_) => return Err(PodsError::AdapterNotAvailable),
         None => return Err(PodsError::AdapterNotFound),
      }

      let device = managed.device.clone();
      let event_tx = self.event_tx.clone();
      let loopback = self.loopback_tx.clone();

      let handle = tokio::spawn(async move {
         let err = match time::timeout(LINK_CONNECT_TIMEOUT, device.connect(&event_tx)).await {
            Ok(Err(e)) => {
               warn!("Failed to establish link to {addr}: {e}");
               Some(e)
            },
            Err(_) => {
               warn!("Link to {addr} timed out");
               Some(PodsError::RequestTimeout)
            },
            Ok(Ok(jhandle)) => {
               if loopback
                  .send(ManagerCommand::LinkEstablished(addr))
                  .await
                  .is_err()
               {
                  return;
               }

               let err = match jhandle.await {
                  Ok(x) => x,
                  Err(x) => Some(PodsError::ActorPanicked(x)),
               };

               if let Some(err) = &err {
                  warn!("Link to {addr} terminated: {err:?}");
               } else {
                  info!("Link to {addr} closed cleanly");
               }
               err
            },
         };
         let _ = loopback
            .send(ManagerCommand::LinkClosed(addr, err.is_some()))
            .await;
      });

      managed.handle = Some(handle);
      managed.link = LinkStatus::Connecting;
      self.connecting = true;

      Ok(())
   }

   async fn handle_link_established(&mut self, addr: Address) {
      self.connecting = false;
      let Some(managed) = &mut self.device else {
         return;
      };
      managed.link = LinkStatus::Connected;
      self.retry.reset();

      self
         .event_tx
         .emit(&managed.device, AirPodsEvent::DeviceConnected);
      self.audio.activate_output(addr);

      // The direct link carries the same data the broadcasts do; stop
      // burning the radio while it is up.
      if let Some((_, scanner)) = &self.scanner {
         scanner.pause().await;
      }

      if let Some(companion) = &self.companion {
         let _ = companion.notify().await;
      } else {
         self.connect_companion().await;
      }
   }

   async fn handle_link_closed(&mut self, addr: Address, is_error: bool) {
      self.connecting = false;
      let Some(managed) = &mut self.device else {
         return;
      };
      let was_connecting = managed.link == LinkStatus::Connecting;
      managed.link = LinkStatus::Disconnected;
      managed.handle = None;
      let reached_active = managed.device.reached_active();

      // Broadcasts are the only data source again
      if !self.sleeping
         && let Some((_, scanner)) = &self.scanner
      {
         scanner.resume().await;
      }
      if let Some(companion) = &self.companion {
         let _ = companion.send_disconnected().await;
      }

      if is_error && was_connecting && !reached_active {
         // Handshake never completed; bounded fixed-delay retry
         if let Some(delay) = self.retry.next_delay() {
            info!("Link to {addr} failed, retrying in {delay:?}");
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(delay).await;
               let _ = loopback.send(ManagerCommand::EstablishLink(addr, None)).await;
            });
         } else {
            warn!("Link to {addr} failed too often, waiting for a fresh discovery");
            self
               .event_tx
               .emit(&managed.device, AirPodsEvent::DeviceError);
         }
      } else {
         self.retry.reset();
      }
   }

   async fn disconnect_link(&mut self) -> Result<()> {
      let managed = self.device.as_mut().ok_or(PodsError::DeviceNotConnected)?;

      if let Some(handle) = managed.handle.take() {
         handle.abort();
      }
      managed.link = LinkStatus::Disconnected;
      managed.device.disconnect().await;
      self.connecting = false;

      self
         .event_tx
         .emit(&managed.device, AirPodsEvent::DeviceDisconnected);

      if !self.sleeping
         && let Some((_, scanner)) = &self.scanner
      {
         scanner.resume().await;
      }

      Ok(())
   }

   async fn check_connection_health(&mut self) {
      let Some(managed) = &self.device else {
         return;
      };
      let Some(adapter_name) = &managed.adapter_name else {
         return;
      };
      if managed.link != LinkStatus::Connected {
         return;
      }

      if let Some(adapter_info) = self.adapters.get(adapter_name)
         && let Ok(bluer_device) = adapter_info.adapter.device(managed.device.address())
         && !bluer_device.is_connected().await.unwrap_or(false)
      {
         info!("Baseband connection to {} is gone", managed.device.address());
         let _ = self.disconnect_link().await;
      }
   }

   // === Broadcast path ===

   fn handle_advertisement(&mut self, adv: &Advertisement) {
      debug!("Broadcast from {}: {adv}", adv.address);
      let Some(managed) = &self.device else {
         // Nothing paired yet; nothing to verify against
         return;
      };
      managed.device.apply_advertisement(adv, &self.event_tx);
   }

   // === Companion link ===

   async fn connect_companion(&mut self) {
      if !self.config.companion.enabled || self.companion.is_some() {
         return;
      }
      let Some(address) = self.config.companion.address.as_deref() else {
         debug!("Companion link enabled but no address configured");
         return;
      };
      let Ok(address) = Address::from_str(address) else {
         warn!("Invalid companion address: {address}");
         return;
      };

      let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         while let Some(event) = event_rx.recv().await {
            if loopback
               .send(ManagerCommand::Companion(event))
               .await
               .is_err()
            {
               return;
            }
         }
      });

      match CompanionLink::connect(address, event_tx).await {
         Ok(link) => self.companion = Some(link),
         Err(e) => debug!("Companion link unavailable: {e}"),
      }
   }

   async fn handle_companion_event(&mut self, event: CompanionEvent) {
      match event {
         CompanionEvent::Action(CompanionAction::RelayToPrimary(packet)) => {
            if let Some(managed) = &self.device {
               if let Err(e) = managed.device.passthrough(&packet).await {
                  warn!("Cannot relay companion packet to accessory: {e}");
               }
            }
         },
         CompanionEvent::Action(CompanionAction::PeerConnected) => {
            info!("Companion took over the accessory");
            self.companion_available = false;
         },
         CompanionEvent::Action(CompanionAction::PeerDisconnected) => {
            info!("Companion released the accessory");
            self.companion_available = true;
         },
         CompanionEvent::Action(CompanionAction::StatusRequest) => {
            let connected = self
               .device
               .as_ref()
               .is_some_and(|d| d.link == LinkStatus::Connected);
            if let Some(companion) = &self.companion {
               let _ = companion.send_status(connected).await;
            }
         },
         CompanionEvent::Action(CompanionAction::DisconnectRequest) => {
            info!("Companion requested we release the accessory");
            let addr = self.device.as_ref().map(|d| d.device.address());
            let _ = self.disconnect_link().await;
            if let Some(addr) = addr {
               self.audio.deactivate_output(addr);
               self.baseband_disconnect(addr).await;
            }
         },
         CompanionEvent::Closed(e) => {
            // No retry budget here; the next primary-link event re-connects
            debug!("Companion link closed: {e}");
            self.companion = None;
         },
      }
   }

   async fn baseband_disconnect(&self, addr: Address) {
      for adapter_info in self.adapters.values() {
         if let Ok(device) = adapter_info.adapter.device(addr) {
            let _ = device.disconnect().await;
         }
      }
   }

   async fn relay_to_companion(&mut self, packet: &Packet) {
      if !self.config.companion.enabled {
         return;
      }
      match &self.companion {
         Some(companion) if companion.is_connected() => {
            if let Err(e) = companion.relay_from_primary(packet).await {
               debug!("Companion relay failed: {e}");
               self.companion = None;
            }
         },
         _ => {
            self.companion = None;
            self.connect_companion().await;
         },
      }
   }

   // === Sleep/wake and persistence ===

   async fn handle_system_sleep(&mut self, sleeping: bool) {
      self.sleeping = sleeping;
      if sleeping {
         info!("System going to sleep, pausing BLE scan");
         if let Some((_, scanner)) = &self.scanner {
            scanner.pause().await;
         }
      } else {
         info!("System waking up, resuming BLE scan");
         if let Some((_, scanner)) = &self.scanner {
            scanner.resume().await;
         }
         self.scan_for_connected_accessories().await;
      }
   }

   fn persist_identity(&mut self) {
      let Some(managed) = &self.device else {
         return;
      };
      let Some(paired) = PairedDevice::from_identity(&managed.device.identity()) else {
         debug!("No pairing keys yet, nothing to persist");
         return;
      };

      if self.config.device.as_ref() == Some(&paired) {
         return;
      }
      self.config.device = Some(paired);
      if let Err(e) = self.config.save() {
         warn!("Failed to persist device identity: {e}");
      } else {
         info!("Persisted identity for '{}'", managed.device.name());
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      if let Some(managed) = &mut self.device {
         if let Some(handle) = managed.handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
         managed.device.disconnect().await;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn retry_policy_is_bounded_and_fixed() {
      let mut retry = RetryPolicy::new(3, Duration::from_millis(1500));

      // Three consecutive failures produce three fixed-delay attempts
      assert_eq!(retry.next_delay(), Some(Duration::from_millis(1500)));
      assert_eq!(retry.next_delay(), Some(Duration::from_millis(1500)));
      assert_eq!(retry.next_delay(), Some(Duration::from_millis(1500)));

      // The budget is spent: no retry, and the counter resets
      assert_eq!(retry.next_delay(), None);

      // A later failure (e.g. after a fresh discovery) retries again
      assert_eq!(retry.next_delay(), Some(Duration::from_millis(1500)));
   }

   #[test]
   fn retry_policy_reset_restores_budget() {
      let mut retry = RetryPolicy::new(2, Duration::from_millis(1500));
      assert!(retry.next_delay().is_some());
      retry.reset();
      assert!(retry.next_delay().is_some());
      assert!(retry.next_delay().is_some());
      assert_eq!(retry.next_delay(), None);
   }

   #[test]
   fn zero_limit_never_retries() {
      let mut retry = RetryPolicy::new(0, Duration::from_millis(1500));
      assert_eq!(retry.next_delay(), None);
      assert_eq!(retry.next_delay(), None);
   }
}
