//! Client handle seam
//!
//! A client is one local application connected to the daemon's control
//! endpoint. The client transport owns the socket, framing and request
//! parsing; the core only records handles and calls through this trait.

use std::sync::Arc;

use tether_control::Document;

use crate::error::MuxError;

/// Identity advertised by a client on its control connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Bundle identifier of the connecting application
    pub bundle_id: String,
    /// Program name of the connecting application
    pub prog_name: String,
    /// Client library version
    pub lib_version: u32,
}

/// One connected local application
pub trait Client: Send + Sync {
    /// Descriptor of the control connection; stable key for removal
    fn fd(&self) -> i32;

    /// Monotonic accept counter assigned by the client transport
    fn number(&self) -> u64;

    /// True once the client opted into unsolicited notifications
    fn is_listening(&self) -> bool;

    /// Identity advertised by the client
    fn info(&self) -> ClientInfo;

    /// Queue one control document; tag 0 marks unsolicited notifications,
    /// any other tag echoes the request the document replies to
    fn send_control(&self, tag: u32, doc: Document) -> Result<(), MuxError>;

    /// Start serving the client's control stream
    fn start_loop(self: Arc<Self>) -> Result<(), MuxError>;

    /// Tear the connection down; invoked exactly once, after the handle is
    /// no longer discoverable in the registry
    fn kill(&self);
}
