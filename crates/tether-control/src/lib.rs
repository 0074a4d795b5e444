//! Control Document Library
//!
//! This crate provides the typed document tree exchanged between the tether
//! daemon and its local clients:
//!
//! - **`Document`**: a recursive dictionary/array value with string, unsigned
//!   integer, boolean and raw-data leaves, built with [`DocBuilder`]
//! - **`NetworkAddress`**: the 16-byte binary address blob advertised for
//!   network-attached devices
//!
//! Wire framing and serialization of documents is the responsibility of the
//! client transport; this crate only models the values the daemon core
//! assembles and inspects.
//!
//! # Example
//!
//! ```rust
//! use tether_control::{DocBuilder, Document};
//!
//! let doc = DocBuilder::new()
//!     .put("MessageType", "Detached")
//!     .put("DeviceID", 2u64)
//!     .build();
//!
//! assert_eq!(doc.get("MessageType").and_then(Document::as_str), Some("Detached"));
//! assert_eq!(doc.get("DeviceID").and_then(Document::as_uint), Some(2));
//! ```

pub mod document;
pub mod netaddr;

pub use document::{DocBuilder, Document};
pub use netaddr::{encode_network_address, first_network_address, NETWORK_ADDRESS_LEN};
