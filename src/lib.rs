#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

use std::fmt::Display;

use mac_address::MacAddress;
use serde::{Serialize, Serializer};

use crate::session::SessionError;

pub mod arp;
pub mod cisco;
pub mod cli;
pub mod session;
#[cfg(test)]
mod tests;
pub mod trace;

#[derive(Debug)]
pub enum MacTrailError {
    InvalidInput(String),
    Parse(String),
    Io(std::io::Error),
    Regex(regex::Error),
    Serde(String),
    Session(SessionError),
}

impl From<std::io::Error> for MacTrailError {
    fn from(err: std::io::Error) -> Self {
        MacTrailError::Io(err)
    }
}

impl From<regex::Error> for MacTrailError {
    fn from(err: regex::Error) -> Self {
        MacTrailError::Regex(err)
    }
}

impl From<serde_json::Error> for MacTrailError {
    fn from(err: serde_json::Error) -> Self {
        MacTrailError::Serde(err.to_string())
    }
}

impl From<SessionError> for MacTrailError {
    fn from(err: SessionError) -> Self {
        MacTrailError::Session(err)
    }
}

impl std::fmt::Display for MacTrailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacTrailError::InvalidInput(error) => write!(f, "Invalid input: {error}"),
            MacTrailError::Parse(error) => write!(f, "Parse error: {error}"),
            MacTrailError::Io(error) => write!(f, "IO error: {error}"),
            MacTrailError::Regex(error) => write!(f, "Regex error: {error}"),
            MacTrailError::Serde(error) => write!(f, "Serde error: {error}"),
            MacTrailError::Session(error) => write!(f, "Session error: {error}"),
        }
    }
}

impl std::error::Error for MacTrailError {}

/// A 48-bit link-layer address, held in canonical form.
///
/// Construction goes through [`HardwareAddress::canonicalize`], which accepts
/// any rendering that carries exactly 12 hex digits (colon, dash or dot
/// separated, any case) and normalizes it. [`Display`] renders the vendor
/// dot-hextet form (`aabb.ccdd.eeff`), which is the form every device query
/// is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress(MacAddress);

impl HardwareAddress {
    /// Strip every character that is not a hex digit and rebuild the address
    /// from the 12 digits that remain. Canonicalizing an already-canonical
    /// address returns it unchanged.
    pub fn canonicalize(input: &str) -> Result<Self, MacTrailError> {
        let digits: String = input
            .chars()
            .filter(char::is_ascii_hexdigit)
            .collect::<String>()
            .to_lowercase();

        if digits.len() != 12 {
            return Err(MacTrailError::InvalidInput(format!(
                "Expected 12 hex digits in hardware address '{}', found {}",
                input,
                digits.len()
            )));
        }

        let mut octets = [0u8; 6];
        for (index, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[index * 2..index * 2 + 2], 16).map_err(|err| {
                MacTrailError::Parse(format!("Invalid octet in '{digits}': {err}"))
            })?;
        }

        Ok(Self(MacAddress::new(octets)))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.bytes()
    }
}

impl Display for HardwareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.bytes();
        write!(
            f,
            "{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::str::FromStr for HardwareAddress {
    type Err = MacTrailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::canonicalize(s)
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// One row of a switch forwarding-table query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTableEntry {
    pub hardware_address: String,
    pub interface: String,
}

/// The identity a topology-discovery query reports for whatever sits on the
/// far side of a local interface. `device_id` and `platform` must both be
/// present for the record to exist at all; `management_ip` may be absent, in
/// which case the trail cannot be followed automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborRecord {
    pub device_id: String,
    pub management_ip: Option<String>,
    pub platform: String,
}

/// One hardware-address-to-IP binding from a router's ARP table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpEntry {
    pub ip_address: String,
    pub vlan: String,
}

#[cfg(test)]
pub(crate) fn setup_test_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_test_writer()
                .with_level(true),
        )
        .with(tracing_subscriber::EnvFilter::new("debug"))
        .try_init();
}
