//! Manager supervision
//!
//! Three long-lived loops feed the muxer: the client acceptor, the USB
//! hotplug watcher and (optionally) the Wi-Fi discovery bridge. Each runs as
//! a task over a channel the corresponding transport adapter produces into,
//! is spawned at most once, and stops through its cancellation token or when
//! its producer hangs up.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::device::{usb_location, Device, DeviceLink};
use crate::error::MuxError;
use crate::muxer::Muxer;

#[cfg(feature = "wifi")]
use crate::discovery::{run_wifi_device_manager, WifiBackend};

/// Hotplug notification from the USB transport adapter
pub enum UsbHotplugEvent {
    /// A device appeared on the bus, with its session already opened
    Arrived {
        serial: String,
        bus: u8,
        address: u8,
        speed: u32,
        product_id: u16,
        link: Box<dyn DeviceLink>,
    },
    /// The device at this location left the bus
    Left { bus: u8, address: u8 },
}

/// One running manager loop
pub(crate) struct ManagerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ManagerHandle {
    fn new(task: JoinHandle<()>, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the loop and wait for it to exit
    async fn join(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("manager task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Managers owned by one muxer
#[derive(Default)]
pub(crate) struct ManagerSet {
    client: Option<ManagerHandle>,
    usb: Option<ManagerHandle>,
    wifi: Option<ManagerHandle>,
}

impl Muxer {
    /// Spawn the loop that registers clients accepted by the transport
    ///
    /// Fails with [`MuxError::AlreadySpawned`] on a second spawn.
    pub fn spawn_client_manager(
        self: &Arc<Self>,
        incoming: mpsc::Receiver<Arc<dyn Client>>,
    ) -> Result<(), MuxError> {
        let mut managers = self.managers.lock().expect("manager set poisoned");
        if managers.client.is_some() {
            return Err(MuxError::AlreadySpawned("client"));
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_client_manager(
            self.clone(),
            incoming,
            cancel.clone(),
        ));
        managers.client = Some(ManagerHandle::new(task, cancel));
        Ok(())
    }

    /// Spawn the loop that mirrors USB hotplug events into the registry
    ///
    /// Fails with [`MuxError::AlreadySpawned`] on a second spawn.
    pub fn spawn_usb_device_manager(
        self: &Arc<Self>,
        events: mpsc::Receiver<UsbHotplugEvent>,
    ) -> Result<(), MuxError> {
        let mut managers = self.managers.lock().expect("manager set poisoned");
        if managers.usb.is_some() {
            return Err(MuxError::AlreadySpawned("usb"));
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_usb_device_manager(
            self.clone(),
            events,
            cancel.clone(),
        ));
        managers.usb = Some(ManagerHandle::new(task, cancel));
        Ok(())
    }

    /// Spawn the Wi-Fi discovery bridge
    ///
    /// Fails with [`MuxError::AlreadySpawned`] on a second spawn.
    #[cfg(feature = "wifi")]
    pub fn spawn_wifi_device_manager(
        self: &Arc<Self>,
        backend: WifiBackend,
    ) -> Result<(), MuxError> {
        let mut managers = self.managers.lock().expect("manager set poisoned");
        if managers.wifi.is_some() {
            return Err(MuxError::AlreadySpawned("wifi"));
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_wifi_device_manager(
            self.clone(),
            backend,
            cancel.clone(),
        ));
        managers.wifi = Some(ManagerHandle::new(task, cancel));
        Ok(())
    }

    /// Wi-Fi discovery is not compiled into this build
    #[cfg(not(feature = "wifi"))]
    pub fn spawn_wifi_device_manager(self: &Arc<Self>) -> Result<(), MuxError> {
        Err(MuxError::NotImplemented)
    }

    /// True while a USB or Wi-Fi device manager is alive
    pub fn has_device_manager(&self) -> bool {
        let managers = self.managers.lock().expect("manager set poisoned");
        managers.usb.is_some() || managers.wifi.is_some()
    }

    /// Tear down manager loops and wait for them to exit
    ///
    /// Client and device registrations drain afterwards as their shared
    /// handles drop.
    pub async fn shutdown(&self) {
        let (client, usb, wifi) = {
            let mut managers = self.managers.lock().expect("manager set poisoned");
            (
                managers.client.take(),
                managers.usb.take(),
                managers.wifi.take(),
            )
        };
        for handle in [client, usb, wifi].into_iter().flatten() {
            handle.join().await;
        }
        info!("managers stopped");
    }
}

/// Client manager loop: registers accepted clients until the acceptor hangs
/// up or the manager is killed
async fn run_client_manager(
    mux: Arc<Muxer>,
    mut incoming: mpsc::Receiver<Arc<dyn Client>>,
    cancel: CancellationToken,
) {
    info!("client manager started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = incoming.recv() => match accepted {
                Some(cli) => {
                    if let Err(e) = mux.add_client(cli) {
                        warn!("dropping client: {}", e);
                    }
                }
                None => break,
            },
        }
    }
    info!("client manager stopped");
}

/// USB device manager loop: mirrors hotplug arrivals and departures into the
/// registry
async fn run_usb_device_manager(
    mux: Arc<Muxer>,
    mut events: mpsc::Receiver<UsbHotplugEvent>,
    cancel: CancellationToken,
) {
    info!("usb device manager started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(UsbHotplugEvent::Arrived { serial, bus, address, speed, product_id, link }) => {
                    if mux.have_usb_device(bus, address) {
                        debug!(
                            "device at {:#x} already registered, ignoring arrival",
                            usb_location(bus, address)
                        );
                        continue;
                    }
                    let dev = Arc::new(Device::usb(serial, bus, address, speed, product_id, link));
                    if let Err(e) = mux.add_device(dev) {
                        warn!("failed to add usb device: {}", e);
                    }
                }
                Some(UsbHotplugEvent::Left { bus, address }) => {
                    mux.remove_device_at(bus, address);
                }
                None => break,
            },
        }
    }
    info!("usb device manager stopped");
}
