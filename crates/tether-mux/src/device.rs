//! Device records and the transport link seam
//!
//! A `Device` is one live connection to a physical unit over one transport.
//! The same physical unit may be registered twice, once per transport, in
//! which case both registrations share the slot portion of their ids.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tether_control::{first_network_address, DocBuilder, Document};

use crate::client::Client;
use crate::error::MuxError;

/// How a device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Vendor multiplexing protocol on a USB bulk interface
    Usb,
    /// Logical streams over the local network
    Wifi,
}

impl ConnectionKind {
    /// The other transport of the same physical device
    pub fn opposite(self) -> Self {
        match self {
            ConnectionKind::Usb => ConnectionKind::Wifi,
            ConnectionKind::Wifi => ConnectionKind::Usb,
        }
    }

    /// Transport flag carried in the low bit of a device id
    pub fn id_flag(self) -> u32 {
        match self {
            ConnectionKind::Usb => 0,
            ConnectionKind::Wifi => 1,
        }
    }
}

/// Pack a USB bus/address pair into the public location value
pub fn usb_location(bus: u8, address: u8) -> u32 {
    ((bus as u32) << 16) | address as u32
}

/// Transport-specific payload of a live device
#[derive(Debug, Clone)]
pub enum Transport {
    /// USB attachment
    Usb {
        /// `(bus << 16) | address`
        location: u32,
        /// Negotiated connection speed
        speed: u32,
        /// USB product id
        product_id: u16,
    },
    /// Network attachment
    Wifi {
        /// Full advertised service name, `mac@…`
        service_name: String,
        /// Ordered, non-empty list of textual addresses, possibly mixed v4/v6
        addresses: Vec<String>,
    },
}

/// Per-transport connection collaborator
///
/// Implemented by the transport adapters; the core never speaks USB or the
/// device stream protocol itself.
pub trait DeviceLink: Send + Sync {
    /// Splice `client` onto a logical TCP stream at `port` on the device
    fn start_connect(&self, port: u16, client: Arc<dyn Client>) -> Result<(), MuxError>;

    /// Start the device's own service loop (network devices only)
    fn start_loop(&self) -> Result<(), MuxError> {
        Ok(())
    }
}

/// One live device connection
pub struct Device {
    serial: String,
    /// Registry-assigned public id, 0 until registration
    id: AtomicU32,
    transport: Transport,
    link: Box<dyn DeviceLink>,
}

impl Device {
    /// Create a USB-attached device record
    pub fn usb(
        serial: String,
        bus: u8,
        address: u8,
        speed: u32,
        product_id: u16,
        link: Box<dyn DeviceLink>,
    ) -> Self {
        Self {
            serial,
            id: AtomicU32::new(0),
            transport: Transport::Usb {
                location: usb_location(bus, address),
                speed,
                product_id,
            },
            link,
        }
    }

    /// Create a network-attached device record
    pub fn wifi(
        serial: String,
        service_name: String,
        addresses: Vec<String>,
        link: Box<dyn DeviceLink>,
    ) -> Self {
        Self {
            serial,
            id: AtomicU32::new(0),
            transport: Transport::Wifi {
                service_name,
                addresses,
            },
            link,
        }
    }

    /// Stable serial of the physical unit
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Public device id; 0 until the registry assigned one
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Which transport this record represents
    pub fn kind(&self) -> ConnectionKind {
        match self.transport {
            Transport::Usb { .. } => ConnectionKind::Usb,
            Transport::Wifi { .. } => ConnectionKind::Wifi,
        }
    }

    /// Transport payload
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Packed USB location, for USB records
    pub fn usb_location(&self) -> Option<u32> {
        match self.transport {
            Transport::Usb { location, .. } => Some(location),
            Transport::Wifi { .. } => None,
        }
    }

    /// Mac portion of the service name (everything before `@`), for Wi-Fi records
    pub fn wifi_mac(&self) -> Option<&str> {
        match &self.transport {
            Transport::Wifi { service_name, .. } => service_name.split('@').next(),
            Transport::Usb { .. } => None,
        }
    }

    /// Delegate stream setup to the transport link
    pub fn start_connect(&self, port: u16, client: Arc<dyn Client>) -> Result<(), MuxError> {
        self.link.start_connect(port, client)
    }

    pub(crate) fn start_loop(&self) -> Result<(), MuxError> {
        self.link.start_loop()
    }

    /// Per-device property dictionary shared by `Attached` and `DeviceList`
    pub fn properties_document(&self) -> Document {
        let builder = DocBuilder::new().put("DeviceID", self.id());
        let builder = match &self.transport {
            Transport::Usb {
                location,
                speed,
                product_id,
            } => builder
                .put("ConnectionSpeed", *speed)
                .put("ConnectionType", "USB")
                .put("LocationID", *location)
                .put("ProductID", *product_id),
            Transport::Wifi {
                service_name,
                addresses,
            } => builder
                .put("ConnectionType", "Network")
                .put("EscapedFullServiceName", service_name.as_str())
                .put_opt(
                    "NetworkAddress",
                    first_network_address(addresses).map(|blob| blob.to_vec()),
                ),
        };
        builder.put("SerialNumber", self.serial.as_str()).build()
    }

    /// Full `Attached` notification document for this device
    pub fn attached_document(&self) -> Document {
        DocBuilder::new()
            .put("MessageType", "Attached")
            .put("DeviceID", self.id())
            .put("Properties", self.properties_document())
            .build()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("id", &self.id())
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLink;

    impl DeviceLink for NullLink {
        fn start_connect(&self, _port: u16, _client: Arc<dyn Client>) -> Result<(), MuxError> {
            Ok(())
        }
    }

    #[test]
    fn test_usb_location_packing() {
        assert_eq!(usb_location(1, 5), 0x10005);
        assert_eq!(usb_location(0xff, 0xff), 0x00ff_00ff);
        assert_eq!(usb_location(0, 0), 0);
    }

    #[test]
    fn test_usb_properties_document() {
        let dev = Device::usb("ABC".into(), 1, 5, 480_000_000, 0x12a8, Box::new(NullLink));
        dev.set_id(2);

        let props = dev.properties_document();
        assert_eq!(props.get("DeviceID").and_then(Document::as_uint), Some(2));
        assert_eq!(
            props.get("ConnectionType").and_then(Document::as_str),
            Some("USB")
        );
        assert_eq!(
            props.get("LocationID").and_then(Document::as_uint),
            Some(0x10005)
        );
        assert_eq!(
            props.get("ProductID").and_then(Document::as_uint),
            Some(0x12a8)
        );
        assert_eq!(
            props.get("SerialNumber").and_then(Document::as_str),
            Some("ABC")
        );
        assert!(props.get("NetworkAddress").is_none());
    }

    #[test]
    fn test_wifi_properties_document() {
        let dev = Device::wifi(
            "ABC".into(),
            "aa:bb:cc:dd:ee:ff@fe80::1".into(),
            vec!["192.0.2.7".into()],
            Box::new(NullLink),
        );
        dev.set_id(3);

        let props = dev.properties_document();
        assert_eq!(
            props.get("ConnectionType").and_then(Document::as_str),
            Some("Network")
        );
        assert_eq!(
            props.get("EscapedFullServiceName").and_then(Document::as_str),
            Some("aa:bb:cc:dd:ee:ff@fe80::1")
        );
        let blob = props.get("NetworkAddress").and_then(Document::as_data).unwrap();
        assert_eq!(
            blob,
            &[
                0x10, 0x02, 0x00, 0x00, 0xc0, 0x00, 0x02, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_wifi_unparseable_addresses_omit_network_address() {
        let dev = Device::wifi(
            "ABC".into(),
            "aa:bb:cc:dd:ee:ff@x".into(),
            vec!["garbage".into()],
            Box::new(NullLink),
        );

        let props = dev.properties_document();
        assert!(props.get("NetworkAddress").is_none());
    }

    #[test]
    fn test_wifi_mac_prefix() {
        let dev = Device::wifi(
            "ABC".into(),
            "aa:bb:cc:dd:ee:ff@fe80::1._apple-mobdev2._tcp.local.".into(),
            vec!["192.0.2.7".into()],
            Box::new(NullLink),
        );
        assert_eq!(dev.wifi_mac(), Some("aa:bb:cc:dd:ee:ff"));

        let usb = Device::usb("ABC".into(), 1, 5, 0, 0, Box::new(NullLink));
        assert_eq!(usb.wifi_mac(), None);
    }

    #[test]
    fn test_attached_document_wraps_properties() {
        let dev = Device::usb("XYZ".into(), 2, 3, 12, 0x4242, Box::new(NullLink));
        dev.set_id(4);

        let doc = dev.attached_document();
        assert_eq!(
            doc.get("MessageType").and_then(Document::as_str),
            Some("Attached")
        );
        assert_eq!(doc.get("DeviceID").and_then(Document::as_uint), Some(4));
        let props = doc.get("Properties").unwrap();
        assert_eq!(
            props.get("SerialNumber").and_then(Document::as_str),
            Some("XYZ")
        );
    }
}
