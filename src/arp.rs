//! Side-query against an upstream router's ARP table.
//!
//! IP bindings are supplementary information: whatever goes wrong here is
//! reported and swallowed, and the trace result is never affected.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{info, warn};

use crate::session::{CommandSession, Credentials, Dialect, SessionError, SessionOpener};
use crate::{ArpEntry, HardwareAddress, cisco};

/// Look up the IP addresses a router currently binds to `target`. Opens its
/// own session to the router, never reusing a switch session, and degrades
/// to an empty list on any failure.
pub async fn resolve_ip<O: SessionOpener>(
    opener: &O,
    target: &HardwareAddress,
    router: Ipv4Addr,
    credentials: &Credentials,
    timeout: Duration,
) -> Vec<ArpEntry> {
    info!("Trying to find IP for {target}...");
    match query_router(opener, target, router, credentials, timeout).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("ARP lookup on {router} failed, no IP bindings found: {err}");
            Vec::new()
        }
    }
}

async fn query_router<O: SessionOpener>(
    opener: &O,
    target: &HardwareAddress,
    router: Ipv4Addr,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Vec<ArpEntry>, SessionError> {
    let mut session = opener
        .open(Dialect::Ssh, router, credentials, timeout)
        .await?;
    let output = session.send_command(&cisco::arp_table_query(target)).await;
    session.close().await;
    Ok(cisco::parse_arp_table(&output?))
}
