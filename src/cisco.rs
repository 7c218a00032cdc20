//! Cisco IOS command strings and output parsing.
//!
//! Everything here is pure text handling: raw command responses in,
//! structured records out. Malformed input never raises: missing fields
//! yield empty or partial results instead.

use tracing::warn;

use crate::{AddressTableEntry, ArpEntry, HardwareAddress, NeighborRecord};

/// Forwarding-table lookup filtered by canonical address.
pub fn address_table_query(target: &HardwareAddress) -> String {
    format!("show mac address-table | i {target}")
}

/// Neighbor-detail lookup filtered by local interface name.
pub fn neighbor_detail_query(interface: &str) -> String {
    format!("show cdp ne {interface} detail")
}

/// ARP-table lookup filtered by canonical address.
pub fn arp_table_query(target: &HardwareAddress) -> String {
    format!("show ip arp | i {target}")
}

/// IOS answers an unrecognized command or filter with a caret marker under
/// the offending word; a filtered query with no matches comes back (near)
/// empty. Both mean "nothing here".
fn no_match(text: &str) -> bool {
    text.len() <= 1 || text.contains('^')
}

/// Parse forwarding-table output into one entry per line. The last
/// whitespace-delimited token of each line is the interface name. The caller
/// acts on the first entry only; the rest are reported, not explored.
pub fn parse_address_table(text: &str) -> Vec<AddressTableEntry> {
    if no_match(text) {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for line in text.trim().lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(interface) = tokens.last() else {
            continue;
        };
        // The address column position varies between IOS trains, so find the
        // dot-hextet token rather than indexing.
        let hardware_address = tokens
            .iter()
            .find(|token| {
                token.len() == 14 && token.chars().all(|c| c == '.' || c.is_ascii_hexdigit())
            })
            .unwrap_or(&tokens[0]);

        entries.push(AddressTableEntry {
            hardware_address: hardware_address.to_string(),
            interface: interface.to_string(),
        });
    }
    entries
}

/// Parse a neighbor-detail block. Returns a record only when both the device
/// identity and the platform line were seen; the management address is
/// optional. Scanning stops at the first `Platform` line; fields captured
/// before it are never overridden by anything after it.
pub fn parse_neighbor_detail(text: &str) -> Option<NeighborRecord> {
    if no_match(text) {
        return None;
    }

    let mut device_id = None;
    let mut management_ip = None;
    let mut platform = None;

    for line in text.trim().lines() {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if line.starts_with("Device ID") {
            device_id = tokens.get(2).map(|token| token.to_string());
        }
        if line.starts_with("IP address:") {
            management_ip = tokens.get(2).map(|token| token.to_string());
        }
        if line.starts_with("Platform") {
            platform = Some(line.to_string());
            break;
        }
    }

    match (device_id, platform) {
        (Some(device_id), Some(platform)) => Some(NeighborRecord {
            device_id,
            management_ip,
            platform,
        }),
        _ => None,
    }
}

/// Parse ARP-table output: per line, the second token is the IP address and
/// the sixth is the VLAN. A line with too few tokens is a data-quality fault
/// worth hearing about, not a reason to drop the other rows.
pub fn parse_arp_table(text: &str) -> Vec<ArpEntry> {
    if no_match(text) {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for line in text.trim().lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        match (tokens.get(1), tokens.get(5)) {
            (Some(ip_address), Some(vlan)) => entries.push(ArpEntry {
                ip_address: ip_address.to_string(),
                vlan: vlan.to_string(),
            }),
            _ => warn!("Malformed ARP table row skipped: '{line}'"),
        }
    }
    entries
}

/// Remove the decoration characters an interactive prompt carries
/// (`[ ] ' # >`). Display only, never used for control flow.
pub fn strip_decoration(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '[' | ']' | '\'' | '#' | '>'))
        .collect()
}
