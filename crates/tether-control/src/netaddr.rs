//! `NetworkAddress` binary layout
//!
//! Network-attached devices advertise one address as a fixed 16-byte blob.
//! The layout is compatibility-critical; clients parse it byte-for-byte:
//!
//! - IPv4: bytes 0..4 are `0x0210` little-endian (`10 02 00 00`), bytes 4..8
//!   carry the address in network order, the remainder is zero.
//! - IPv6: byte 0 is the blob length (`0x10`), byte 1 the family (`0x1E`),
//!   bytes 2..16 the leading 14 bytes of the address.

use std::net::IpAddr;

/// Size of the encoded blob in bytes
pub const NETWORK_ADDRESS_LEN: usize = 16;

const FAMILY_TAG_V4: u32 = 0x0210;
const FAMILY_V6: u8 = 0x1e;

/// Encode one address into the fixed blob layout
pub fn encode_network_address(addr: IpAddr) -> [u8; NETWORK_ADDRESS_LEN] {
    let mut buf = [0u8; NETWORK_ADDRESS_LEN];
    match addr {
        IpAddr::V4(v4) => {
            buf[..4].copy_from_slice(&FAMILY_TAG_V4.to_le_bytes());
            buf[4..8].copy_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf[0] = NETWORK_ADDRESS_LEN as u8;
            buf[1] = FAMILY_V6;
            // Only the leading 14 bytes fit after the length/family prefix.
            buf[2..].copy_from_slice(&v6.octets()[..NETWORK_ADDRESS_LEN - 2]);
        }
    }
    buf
}

/// Encode the first parseable address from an ordered list
///
/// Entries that fail to parse are skipped; `None` when nothing parses.
pub fn first_network_address<S: AsRef<str>>(addresses: &[S]) -> Option<[u8; NETWORK_ADDRESS_LEN]> {
    addresses
        .iter()
        .find_map(|a| a.as_ref().parse::<IpAddr>().ok())
        .map(encode_network_address)
}
