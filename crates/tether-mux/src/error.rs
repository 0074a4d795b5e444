//! Error types for the multiplexer core

use thiserror::Error;

/// Errors that can occur in the multiplexer
#[derive(Debug, Error)]
pub enum MuxError {
    /// No live device carries the requested id
    #[error("no device with id {0}")]
    NoSuchDevice(u32),

    /// A manager loop of this kind is already running
    #[error("{0} manager already spawned")]
    AlreadySpawned(&'static str),

    /// Wi-Fi discovery is not compiled into this build
    #[error("wifi discovery is not available in this build")]
    NotImplemented,

    /// Failure inside a discovery callback; only the offending query is torn down
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The device's own loop failed to start; its registry entry was rolled back
    #[error("device {serial} failed to start: {reason}")]
    DeviceStart { serial: String, reason: String },

    /// The client's loop failed to start; the client was removed again
    #[error("client fd {fd} failed to start: {reason}")]
    ClientStart { fd: i32, reason: String },

    /// The client transport refused a control document
    #[error("send to client failed: {0}")]
    Send(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
