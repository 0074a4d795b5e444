//! Device Multiplexer Core
//!
//! This crate provides the registry and dispatch hub of the tether daemon,
//! which bridges local client applications to mobile devices reachable over
//! USB or the local network:
//!
//! - Owns the sets of live devices and clients behind reader/writer locks
//! - Assigns the public device id `(slot << 1) | transport_flag`, keeping the
//!   slot stable when the same physical device moves between transports
//! - Fans out `Attached`/`Detached`/`Paired` control documents to listening
//!   clients and answers device-list/listener-list requests
//! - Resolves device ids for client connection requests and delegates stream
//!   setup to the transport link
//! - Supervises the client acceptor, USB hotplug and Wi-Fi discovery loops
//!
//! # Architecture
//!
//! Transports stay outside this crate: the USB adapter, the client socket
//! layer and the mDNS responder plug in through the [`DeviceLink`],
//! [`Client`] and [`DnssdSession`] seams plus the manager channels. The core
//! never parses control messages, speaks USB or performs DNS itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_mux::{Muxer, UsbHotplugEvent};
//! use tokio::sync::mpsc;
//!
//! let mux = Arc::new(Muxer::new());
//!
//! let (clients_tx, clients_rx) = mpsc::channel(16);
//! let (usb_tx, usb_rx) = mpsc::channel(16);
//! mux.spawn_client_manager(clients_rx)?;
//! mux.spawn_usb_device_manager(usb_rx)?;
//!
//! // The transport adapters feed accepted clients into clients_tx and
//! // hotplug events into usb_tx; the muxer does the rest.
//! ```

pub mod client;
pub mod device;
#[cfg(feature = "wifi")]
pub mod discovery;
pub mod error;
pub mod managers;
pub mod muxer;

// Document types appear in the `Client` seam; re-export them for implementors.
pub use tether_control::{DocBuilder, Document};

pub use client::{Client, ClientInfo};
pub use device::{usb_location, ConnectionKind, Device, DeviceLink, Transport};
#[cfg(feature = "wifi")]
pub use discovery::{
    DiscoveryConfig, DnssdEvent, DnssdSession, QueryId, SerialLookup, WifiBackend,
    WifiLinkFactory,
};
pub use error::MuxError;
pub use managers::UsbHotplugEvent;
pub use muxer::{DeviceId, MuxConfig, Muxer, PairingAgent, PairingStatus, MAX_SLOT};
