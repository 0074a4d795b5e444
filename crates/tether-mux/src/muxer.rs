//! Multiplexer core
//!
//! The `Muxer` owns the live device and client registries, assigns device
//! ids, fans out attach/detach/pair notifications to listening clients and
//! arbitrates connection setup between a client and a named device.
//!
//! Registries are reader/writer locked: membership changes are serialized,
//! queries run concurrently. No registry lock is held across a call into a
//! `Client` or `Device` collaborator, with one deliberate exception: a
//! notification fan-out keeps the client registry *read* lock for the
//! duration of its iteration so a newly added client cannot miss or double
//! receive the document being broadcast.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tether_control::{DocBuilder, Document};

use crate::client::Client;
use crate::device::{usb_location, ConnectionKind, Device};
use crate::error::MuxError;
use crate::managers::ManagerSet;

/// Public device id: `(slot << 1) | transport_flag`
pub type DeviceId = u32;

/// Highest assignable slot; 0 is reserved for "no id yet"
pub const MAX_SLOT: u32 = (i32::MAX / 2) as u32;

/// Tag used for unsolicited notifications
const NOTIFY_TAG: u32 = 0;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Run the pairing preflight against newly attached USB devices
    pub preflight: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self { preflight: true }
    }
}

/// Outcome reported by the pairing collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    /// The device is already paired with this host
    Paired,
    /// Pairing is still pending on the device side
    Pending,
}

/// Pairing/preflight collaborator
///
/// Runs best effort on the USB attach path; failures are logged and never
/// fatal. An external pairing flow may also call [`Muxer::notify_paired`]
/// directly once a pending device completes pairing.
pub trait PairingAgent: Send + Sync {
    fn preflight(&self, serial: &str, id: DeviceId) -> Result<PairingStatus, MuxError>;
}

/// Ordered device table plus the slot cursor it protects
struct DeviceTable {
    entries: Vec<Arc<Device>>,
    next_slot: u32,
}

/// The multiplexer core
pub struct Muxer {
    devices: RwLock<DeviceTable>,
    clients: RwLock<Vec<Arc<dyn Client>>>,
    config: MuxConfig,
    pairing: Option<Arc<dyn PairingAgent>>,
    pub(crate) managers: Mutex<ManagerSet>,
}

impl Muxer {
    /// Create a multiplexer with default configuration
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(config: MuxConfig) -> Self {
        Self {
            devices: RwLock::new(DeviceTable {
                entries: Vec::new(),
                next_slot: 1,
            }),
            clients: RwLock::new(Vec::new()),
            config,
            pairing: None,
            managers: Mutex::new(ManagerSet::default()),
        }
    }

    /// Create with a pairing collaborator for the USB attach path
    pub fn with_pairing(config: MuxConfig, agent: Arc<dyn PairingAgent>) -> Self {
        Self {
            pairing: Some(agent),
            ..Self::with_config(config)
        }
    }

    // -------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------

    /// Register a device and assign its public id
    ///
    /// A peer registration of the same serial on the opposite transport
    /// shares its slot; otherwise a fresh slot is allocated. On success the
    /// `Attached` notification has been fanned out and the id is returned.
    /// A network device whose loop fails to start is rolled back before any
    /// notification is sent.
    pub fn add_device(&self, dev: Arc<Device>) -> Result<DeviceId, MuxError> {
        debug!("add_device {}", dev.serial());

        let id = {
            let mut table = self.devices.write().expect("device registry poisoned");
            let peer = lookup_id(&table.entries, dev.serial(), dev.kind().opposite());
            let base = if peer == 0 {
                allocate_slot(&mut table) << 1
            } else {
                // Strip the peer's transport flag, keep its slot.
                peer & !1
            };
            let id = base | dev.kind().id_flag();
            dev.set_id(id);
            table.entries.push(dev.clone());
            id
        };

        info!("adding device {} with id {}", dev.serial(), id);

        if dev.kind() == ConnectionKind::Wifi {
            if let Err(e) = dev.start_loop() {
                warn!("failed to start device {}: {}", dev.serial(), e);
                self.unregister(&dev);
                return Err(MuxError::DeviceStart {
                    serial: dev.serial().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let mut paired = false;
        if dev.kind() == ConnectionKind::Usb && self.config.preflight {
            if let Some(agent) = &self.pairing {
                match agent.preflight(dev.serial(), id) {
                    Ok(PairingStatus::Paired) => paired = true,
                    Ok(PairingStatus::Pending) => {}
                    Err(e) => warn!("preflight for {} failed: {}", dev.serial(), e),
                }
            }
        }

        self.notify_attached(&dev);
        if paired {
            self.notify_paired(id);
        }
        Ok(id)
    }

    /// Remove a device by handle and fan out `Detached`
    ///
    /// Nothing is emitted when the handle is not registered.
    pub fn remove_device(&self, dev: &Arc<Device>) {
        if let Some(id) = self.unregister(dev) {
            self.notify_detached(id);
        }
    }

    /// Remove the USB device at a bus/address location and fan out `Detached`
    ///
    /// Only USB registrations match; nothing is emitted when no device does.
    pub fn remove_device_at(&self, bus: u8, address: u8) {
        let location = usb_location(bus, address);
        let removed = {
            let mut table = self.devices.write().expect("device registry poisoned");
            match table
                .entries
                .iter()
                .position(|d| d.usb_location() == Some(location))
            {
                Some(pos) => Some(table.entries.remove(pos).id()),
                None => None,
            }
        };
        match removed {
            Some(id) => self.notify_detached(id),
            None => debug!("no usb device at bus {} address {}", bus, address),
        }
    }

    /// Remove the registry entry without notifying; returns the removed id
    fn unregister(&self, dev: &Arc<Device>) -> Option<DeviceId> {
        let mut table = self.devices.write().expect("device registry poisoned");
        let pos = table.entries.iter().position(|d| Arc::ptr_eq(d, dev))?;
        Some(table.entries.remove(pos).id())
    }

    /// True when a USB device is registered at this bus/address location
    pub fn have_usb_device(&self, bus: u8, address: u8) -> bool {
        let location = usb_location(bus, address);
        let table = self.devices.read().expect("device registry poisoned");
        table
            .entries
            .iter()
            .any(|d| d.usb_location() == Some(location))
    }

    /// True when a Wi-Fi device with this mac is registered
    pub fn have_wifi_device(&self, mac: &str) -> bool {
        let table = self.devices.read().expect("device registry poisoned");
        table.entries.iter().any(|d| d.wifi_mac() == Some(mac))
    }

    /// Id of the live device matching serial and transport, 0 when absent
    pub fn id_for_device(&self, serial: &str, kind: ConnectionKind) -> DeviceId {
        let table = self.devices.read().expect("device registry poisoned");
        lookup_id(&table.entries, serial, kind)
    }

    /// Number of live device registrations
    pub fn device_count(&self) -> usize {
        let table = self.devices.read().expect("device registry poisoned");
        table.entries.len()
    }

    // -------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------

    /// Register a client and start serving its control stream
    ///
    /// A client whose loop fails to start is removed again before the error
    /// propagates, so it is never observable half-registered.
    pub fn add_client(&self, cli: Arc<dyn Client>) -> Result<(), MuxError> {
        debug!("add_client fd {}", cli.fd());
        {
            let mut clients = self.clients.write().expect("client registry poisoned");
            clients.push(cli.clone());
        }
        if let Err(e) = cli.clone().start_loop() {
            self.remove_client(&cli);
            return Err(MuxError::ClientStart {
                fd: cli.fd(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    /// Remove the client with this fd and kill it
    pub fn remove_client_fd(&self, fd: i32) {
        debug!("remove_client fd {}", fd);
        let removed = {
            let mut clients = self.clients.write().expect("client registry poisoned");
            match clients.iter().position(|c| c.fd() == fd) {
                Some(pos) => Some(clients.remove(pos)),
                None => None,
            }
        };
        // The handle is gone from the registry, so no other deleter can
        // reach it; kill runs exactly once, outside the lock.
        if let Some(cli) = removed {
            cli.kill();
        }
    }

    /// Remove a client by handle identity and kill it
    pub fn remove_client(&self, cli: &Arc<dyn Client>) {
        debug!("remove_client fd {}", cli.fd());
        let removed = {
            let mut clients = self.clients.write().expect("client registry poisoned");
            match clients.iter().position(|c| Arc::ptr_eq(c, cli)) {
                Some(pos) => Some(clients.remove(pos)),
                None => None,
            }
        };
        if removed.is_some() {
            cli.kill();
        }
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        let clients = self.clients.read().expect("client registry poisoned");
        clients.len()
    }

    // -------------------------------------------------------------------
    // Connection dispatch
    // -------------------------------------------------------------------

    /// Resolve a device id and delegate stream setup to its transport
    ///
    /// The registry lock is dropped before the transport call so the
    /// device's own locking cannot invert against the registry.
    pub fn start_connect(
        &self,
        device_id: DeviceId,
        port: u16,
        cli: Arc<dyn Client>,
    ) -> Result<(), MuxError> {
        let dev = {
            let table = self.devices.read().expect("device registry poisoned");
            table.entries.iter().find(|d| d.id() == device_id).cloned()
        }
        .ok_or(MuxError::NoSuchDevice(device_id))?;

        debug!(
            "start_connect id {} port {} for client fd {}",
            device_id,
            port,
            cli.fd()
        );
        dev.start_connect(port, cli)
    }

    // -------------------------------------------------------------------
    // Control replies
    // -------------------------------------------------------------------

    /// Reply to a device-list request with the current registry snapshot
    pub fn send_device_list(&self, cli: &dyn Client, tag: u32) -> Result<(), MuxError> {
        let list: Vec<Document> = {
            let table = self.devices.read().expect("device registry poisoned");
            table
                .entries
                .iter()
                .map(|d| d.properties_document())
                .collect()
        };
        cli.send_control(tag, DocBuilder::new().put("DeviceList", list).build())
    }

    /// Reply to a listener-list request with the current client snapshot
    pub fn send_listener_list(&self, cli: &dyn Client, tag: u32) -> Result<(), MuxError> {
        let list: Vec<Document> = {
            let clients = self.clients.read().expect("client registry poisoned");
            clients.iter().map(|c| client_document(c.as_ref())).collect()
        };
        cli.send_control(tag, DocBuilder::new().put("ListenerList", list).build())
    }

    // -------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------

    /// Replay one `Attached` per registered device to a newly listening client
    ///
    /// The device read lock is held for the duration, so the client sees a
    /// consistent snapshot. Send errors are swallowed.
    pub fn notify_all_devices(&self, cli: &dyn Client) {
        debug!("notify_all_devices fd {}", cli.fd());
        if !cli.is_listening() {
            warn!("notify_all_devices called on a client which is not listening");
            return;
        }
        let table = self.devices.read().expect("device registry poisoned");
        for dev in &table.entries {
            if let Err(e) = cli.send_control(NOTIFY_TAG, dev.attached_document()) {
                debug!("dropping backlog notification for fd {}: {}", cli.fd(), e);
            }
        }
    }

    /// Fan out `Paired` for a device id
    pub fn notify_paired(&self, id: DeviceId) {
        self.broadcast(
            &DocBuilder::new()
                .put("MessageType", "Paired")
                .put("DeviceID", id)
                .build(),
        );
    }

    fn notify_attached(&self, dev: &Device) {
        debug!("notify_attached id {}", dev.id());
        self.broadcast(&dev.attached_document());
    }

    fn notify_detached(&self, id: DeviceId) {
        debug!("notify_detached id {}", id);
        self.broadcast(
            &DocBuilder::new()
                .put("MessageType", "Detached")
                .put("DeviceID", id)
                .build(),
        );
    }

    /// Push one document to every listening client
    ///
    /// A slow or dead listener must not stall the hot path: individual send
    /// failures are logged and skipped, iteration always completes.
    fn broadcast(&self, doc: &Document) {
        let clients = self.clients.read().expect("client registry poisoned");
        for cli in clients.iter().filter(|c| c.is_listening()) {
            if let Err(e) = cli.send_control(NOTIFY_TAG, doc.clone()) {
                debug!("dropping notification for fd {}: {}", cli.fd(), e);
            }
        }
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of the entry matching serial and transport, 0 when absent
fn lookup_id(entries: &[Arc<Device>], serial: &str, kind: ConnectionKind) -> DeviceId {
    entries
        .iter()
        .find(|d| d.kind() == kind && d.serial() == serial)
        .map(|d| d.id())
        .unwrap_or(0)
}

/// Claim the smallest free slot at or after the cursor, wrapping past the cap
///
/// The registry is always vastly smaller than the slot space, so the scan
/// terminates quickly in practice.
fn allocate_slot(table: &mut DeviceTable) -> u32 {
    let used: HashSet<u32> = table.entries.iter().map(|d| d.id() >> 1).collect();
    let mut slot = table.next_slot;
    loop {
        if slot > MAX_SLOT {
            slot = 1;
        }
        if !used.contains(&slot) {
            break;
        }
        slot += 1;
    }
    table.next_slot = slot + 1;
    slot
}

/// Per-client descriptor in the listener list
fn client_document(cli: &dyn Client) -> Document {
    let info = cli.info();
    DocBuilder::new()
        .put("Blacklisted", false)
        .put("BundleID", info.bundle_id)
        .put("ConnType", 0u64)
        .put("ID String", format!("{}-{}", cli.number(), info.prog_name))
        .put("ProgName", info.prog_name)
        .put("kLibUSBMuxVersion", info.lib_version)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientInfo;
    use crate::device::DeviceLink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingClient {
        fd: i32,
        number: u64,
        listening: AtomicBool,
        fail_sends: bool,
        fail_start: bool,
        sent: StdMutex<Vec<(u32, Document)>>,
        kills: AtomicUsize,
    }

    impl RecordingClient {
        fn listening(fd: i32) -> Arc<Self> {
            Arc::new(Self {
                fd,
                number: fd as u64,
                listening: AtomicBool::new(true),
                fail_sends: false,
                fail_start: false,
                sent: StdMutex::new(Vec::new()),
                kills: AtomicUsize::new(0),
            })
        }

        fn silent(fd: i32) -> Arc<Self> {
            let cli = Self::listening(fd);
            cli.listening.store(false, Ordering::Relaxed);
            cli
        }

        fn broken(fd: i32) -> Arc<Self> {
            Arc::new(Self {
                fd,
                number: fd as u64,
                listening: AtomicBool::new(true),
                fail_sends: true,
                fail_start: false,
                sent: StdMutex::new(Vec::new()),
                kills: AtomicUsize::new(0),
            })
        }

        fn failing_start(fd: i32) -> Arc<Self> {
            Arc::new(Self {
                fd,
                number: fd as u64,
                listening: AtomicBool::new(false),
                fail_sends: false,
                fail_start: true,
                sent: StdMutex::new(Vec::new()),
                kills: AtomicUsize::new(0),
            })
        }

        fn sent(&self) -> Vec<(u32, Document)> {
            self.sent.lock().unwrap().clone()
        }

        fn message_types(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter_map(|(_, doc)| {
                    doc.get("MessageType")
                        .and_then(Document::as_str)
                        .map(str::to_string)
                })
                .collect()
        }
    }

    impl Client for RecordingClient {
        fn fd(&self) -> i32 {
            self.fd
        }

        fn number(&self) -> u64 {
            self.number
        }

        fn is_listening(&self) -> bool {
            self.listening.load(Ordering::Relaxed)
        }

        fn info(&self) -> ClientInfo {
            ClientInfo {
                bundle_id: "com.example.tool".into(),
                prog_name: format!("tool{}", self.fd),
                lib_version: 3,
            }
        }

        fn send_control(&self, tag: u32, doc: Document) -> Result<(), MuxError> {
            if self.fail_sends {
                return Err(MuxError::Send("socket gone".into()));
            }
            self.sent.lock().unwrap().push((tag, doc));
            Ok(())
        }

        fn start_loop(self: Arc<Self>) -> Result<(), MuxError> {
            if self.fail_start {
                Err(MuxError::Io(std::io::Error::other("epoll registration")))
            } else {
                Ok(())
            }
        }

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullLink;

    impl DeviceLink for NullLink {
        fn start_connect(&self, _port: u16, _client: Arc<dyn Client>) -> Result<(), MuxError> {
            Ok(())
        }
    }

    struct FailingLink;

    impl DeviceLink for FailingLink {
        fn start_connect(&self, _port: u16, _client: Arc<dyn Client>) -> Result<(), MuxError> {
            Err(MuxError::Io(std::io::Error::other("refused")))
        }

        fn start_loop(&self) -> Result<(), MuxError> {
            Err(MuxError::Io(std::io::Error::other("no route")))
        }
    }

    fn usb_device(serial: &str, bus: u8, address: u8) -> Arc<Device> {
        Arc::new(Device::usb(
            serial.into(),
            bus,
            address,
            480_000_000,
            0x12a8,
            Box::new(NullLink),
        ))
    }

    fn wifi_device(serial: &str, mac: &str, addrs: &[&str]) -> Arc<Device> {
        Arc::new(Device::wifi(
            serial.into(),
            format!("{mac}@fe80::1._apple-mobdev2._tcp.local."),
            addrs.iter().map(|a| a.to_string()).collect(),
            Box::new(NullLink),
        ))
    }

    #[test]
    fn test_first_device_gets_slot_one() {
        let mux = Muxer::new();
        let id = mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        assert_eq!(id, 2, "slot 1, usb flag 0");
    }

    #[test]
    fn test_peer_shares_slot_usb_first() {
        let mux = Muxer::new();
        let usb = mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        let wifi = mux
            .add_device(wifi_device("ABC", "aa:bb:cc:dd:ee:ff", &["192.0.2.7"]))
            .unwrap();

        assert_eq!(usb >> 1, wifi >> 1, "same slot across transports");
        assert_eq!(usb & 1, 0);
        assert_eq!(wifi & 1, 1);
    }

    #[test]
    fn test_peer_shares_slot_wifi_first() {
        let mux = Muxer::new();
        let wifi = mux
            .add_device(wifi_device("ABC", "aa:bb:cc:dd:ee:ff", &["192.0.2.7"]))
            .unwrap();
        let usb = mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert_eq!(wifi, 3);
        assert_eq!(usb, 2);
    }

    #[test]
    fn test_slot_reused_after_usb_reconnect() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        mux.add_device(wifi_device("ABC", "aa:bb:cc:dd:ee:ff", &["192.0.2.7"]))
            .unwrap();

        mux.remove_device_at(1, 5);
        assert_eq!(mux.device_count(), 1);

        // The wifi peer still pins slot 1, so the reconnect gets id 2 back.
        let id = mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_fresh_slots_are_monotonic() {
        let mux = Muxer::new();
        let a = mux.add_device(usb_device("A", 1, 1)).unwrap();
        let b = mux.add_device(usb_device("B", 1, 2)).unwrap();
        let c = mux.add_device(usb_device("C", 1, 3)).unwrap();
        assert_eq!((a, b, c), (2, 4, 6));
    }

    #[test]
    fn test_removed_slot_not_reused_before_wrap() {
        let mux = Muxer::new();
        let a = mux.add_device(usb_device("A", 1, 1)).unwrap();
        mux.add_device(usb_device("B", 1, 2)).unwrap();
        mux.remove_device_at(1, 1);

        let c = mux.add_device(usb_device("C", 1, 3)).unwrap();
        assert_eq!(a, 2);
        assert_eq!(c, 6, "the cursor keeps advancing past freed slots");
    }

    #[test]
    fn test_id_for_device_matches_serial_and_transport() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert_eq!(mux.id_for_device("ABC", ConnectionKind::Usb), 2);
        assert_eq!(mux.id_for_device("ABC", ConnectionKind::Wifi), 0);
        assert_eq!(mux.id_for_device("XYZ", ConnectionKind::Usb), 0);
    }

    #[test]
    fn test_location_queries() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        mux.add_device(wifi_device("DEF", "aa:bb:cc:dd:ee:ff", &["192.0.2.7"]))
            .unwrap();

        assert!(mux.have_usb_device(1, 5));
        assert!(!mux.have_usb_device(1, 6));
        assert!(mux.have_wifi_device("aa:bb:cc:dd:ee:ff"));
        assert!(!mux.have_wifi_device("00:00:00:00:00:00"));
    }

    #[test]
    fn test_attach_and_detach_notify_listeners() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        let dev = usb_device("ABC", 1, 5);
        mux.add_device(dev.clone()).unwrap();
        mux.remove_device(&dev);

        assert_eq!(cli.message_types(), ["Attached", "Detached"]);
        let sent = cli.sent();
        let (tag, attached) = &sent[0];
        assert_eq!(*tag, 0);
        assert_eq!(attached.get("DeviceID").and_then(Document::as_uint), Some(2));
        let props = attached.get("Properties").unwrap();
        assert_eq!(
            props.get("LocationID").and_then(Document::as_uint),
            Some(0x10005)
        );
    }

    #[test]
    fn test_non_listening_clients_skipped() {
        let mux = Muxer::new();
        let quiet = RecordingClient::silent(3);
        mux.add_client(quiet.clone()).unwrap();

        mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert!(quiet.sent().is_empty());
    }

    #[test]
    fn test_send_failure_does_not_break_fanout() {
        let mux = Muxer::new();
        let broken = RecordingClient::broken(3);
        let healthy = RecordingClient::listening(4);
        mux.add_client(broken).unwrap();
        mux.add_client(healthy.clone()).unwrap();

        mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert_eq!(healthy.message_types(), ["Attached"]);
    }

    #[test]
    fn test_remove_without_match_emits_nothing() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        mux.remove_device_at(9, 9);
        mux.remove_device(&usb_device("GHOST", 2, 2));

        assert!(cli.sent().is_empty());
    }

    #[test]
    fn test_wifi_loop_failure_rolls_back_silently() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        let dev = Arc::new(Device::wifi(
            "ABC".into(),
            "aa:bb:cc:dd:ee:ff@x".into(),
            vec!["192.0.2.7".into()],
            Box::new(FailingLink),
        ));
        let err = mux.add_device(dev).unwrap_err();

        assert!(matches!(err, MuxError::DeviceStart { .. }));
        assert_eq!(mux.device_count(), 0);
        assert!(cli.sent().is_empty(), "no Attached, no Detached");
    }

    #[test]
    fn test_client_kill_exactly_once() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(9);
        mux.add_client(cli.clone()).unwrap();

        mux.remove_client_fd(9);
        mux.remove_client_fd(9);
        mux.remove_client(&(cli.clone() as Arc<dyn Client>));

        assert_eq!(cli.kills.load(Ordering::SeqCst), 1);
        assert_eq!(mux.client_count(), 0);
    }

    #[test]
    fn test_client_loop_failure_rolls_back() {
        let mux = Muxer::new();
        let cli = RecordingClient::failing_start(5);

        let err = mux.add_client(cli.clone()).unwrap_err();

        assert!(matches!(err, MuxError::ClientStart { fd: 5, .. }));
        assert_eq!(mux.client_count(), 0);
        assert_eq!(cli.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_connect_unknown_id() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(7);

        let err = mux.start_connect(42, 62078, cli).unwrap_err();

        assert!(matches!(err, MuxError::NoSuchDevice(42)));
        assert_eq!(mux.device_count(), 0);
        assert_eq!(mux.client_count(), 0);
    }

    #[test]
    fn test_start_connect_delegates_to_link() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        let cli = RecordingClient::listening(7);

        mux.start_connect(2, 62078, cli.clone()).unwrap();

        let dev = Arc::new(Device::usb(
            "BAD".into(),
            1,
            6,
            0,
            0,
            Box::new(FailingLink),
        ));
        mux.add_device(dev).unwrap();
        let err = mux.start_connect(4, 62078, cli).unwrap_err();
        assert!(matches!(err, MuxError::Io(_)));
    }

    #[test]
    fn test_device_list_reply() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        mux.add_device(wifi_device("DEF", "aa:bb:cc:dd:ee:ff", &["192.0.2.7"]))
            .unwrap();

        let cli = RecordingClient::listening(7);
        mux.send_device_list(cli.as_ref(), 99).unwrap();

        let sent = cli.sent();
        let (tag, doc) = &sent[0];
        assert_eq!(*tag, 99);
        let list = doc.get("DeviceList").and_then(Document::as_array).unwrap();
        assert_eq!(list.len(), 2);
        // Entries are bare property dictionaries, not full notifications.
        assert!(list[0].get("MessageType").is_none());
        assert_eq!(
            list[0].get("ConnectionType").and_then(Document::as_str),
            Some("USB")
        );
        assert_eq!(
            list[1].get("ConnectionType").and_then(Document::as_str),
            Some("Network")
        );
    }

    #[test]
    fn test_listener_list_reply() {
        let mux = Muxer::new();
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        mux.send_listener_list(cli.as_ref(), 12).unwrap();

        let sent = cli.sent();
        let (tag, doc) = &sent[0];
        assert_eq!(*tag, 12);
        let list = doc.get("ListenerList").and_then(Document::as_array).unwrap();
        assert_eq!(list.len(), 1);
        let entry = &list[0];
        assert_eq!(entry.get("Blacklisted").and_then(Document::as_bool), Some(false));
        assert_eq!(entry.get("ConnType").and_then(Document::as_uint), Some(0));
        assert_eq!(
            entry.get("ID String").and_then(Document::as_str),
            Some("7-tool7")
        );
        assert_eq!(
            entry.get("ProgName").and_then(Document::as_str),
            Some("tool7")
        );
        assert_eq!(
            entry.get("kLibUSBMuxVersion").and_then(Document::as_uint),
            Some(3)
        );
    }

    #[test]
    fn test_reply_send_failure_propagates() {
        let mux = Muxer::new();
        let broken = RecordingClient::broken(3);

        let err = mux.send_device_list(broken.as_ref(), 1).unwrap_err();
        assert!(matches!(err, MuxError::Send(_)));
    }

    #[test]
    fn test_notify_all_devices_targets_one_client() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
        mux.add_device(usb_device("DEF", 1, 6)).unwrap();

        let other = RecordingClient::listening(3);
        mux.add_client(other.clone()).unwrap();
        let joined = RecordingClient::listening(4);

        let before = other.sent().len();
        mux.notify_all_devices(joined.as_ref());

        assert_eq!(joined.message_types(), ["Attached", "Attached"]);
        assert_eq!(other.sent().len(), before, "no broadcast to other clients");
    }

    #[test]
    fn test_notify_all_devices_requires_listening() {
        let mux = Muxer::new();
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        let quiet = RecordingClient::silent(3);
        mux.notify_all_devices(quiet.as_ref());

        assert!(quiet.sent().is_empty());
    }

    #[test]
    fn test_paired_notification_follows_attach() {
        struct InstantAgent;
        impl PairingAgent for InstantAgent {
            fn preflight(&self, _serial: &str, _id: DeviceId) -> Result<PairingStatus, MuxError> {
                Ok(PairingStatus::Paired)
            }
        }

        let mux = Muxer::with_pairing(MuxConfig::default(), Arc::new(InstantAgent));
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert_eq!(cli.message_types(), ["Attached", "Paired"]);
        let sent = cli.sent();
        let (_, paired) = &sent[1];
        assert_eq!(paired.get("DeviceID").and_then(Document::as_uint), Some(2));
    }

    #[test]
    fn test_preflight_failure_is_not_fatal() {
        struct SourAgent;
        impl PairingAgent for SourAgent {
            fn preflight(&self, _serial: &str, _id: DeviceId) -> Result<PairingStatus, MuxError> {
                Err(MuxError::Io(std::io::Error::other("lockdownd unreachable")))
            }
        }

        let mux = Muxer::with_pairing(MuxConfig::default(), Arc::new(SourAgent));
        let cli = RecordingClient::listening(7);
        mux.add_client(cli.clone()).unwrap();

        let id = mux.add_device(usb_device("ABC", 1, 5)).unwrap();

        assert_eq!(id, 2);
        assert_eq!(cli.message_types(), ["Attached"]);
    }

    #[test]
    fn test_preflight_skipped_when_disabled() {
        struct PanickyAgent;
        impl PairingAgent for PanickyAgent {
            fn preflight(&self, _serial: &str, _id: DeviceId) -> Result<PairingStatus, MuxError> {
                panic!("preflight must not run");
            }
        }

        let mux = Muxer::with_pairing(MuxConfig { preflight: false }, Arc::new(PanickyAgent));
        mux.add_device(usb_device("ABC", 1, 5)).unwrap();
    }
}
