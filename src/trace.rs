//! The trace engine: walk from switch to switch until the target hardware
//! address terminates on an access port.
//!
//! The topology is not known in advance: every hop is discovered from the
//! previous device's answers. The walk keeps a visited set and a hop limit
//! so a lying or looping topology cannot run it forever.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::session::{CommandSession, Credentials, Dialect, SessionError, SessionOpener};
use crate::{ArpEntry, HardwareAddress, NeighborRecord, arp, cisco};

/// Decides whether the trace follows a discovered trail onto the next
/// device. Satisfied interactively by [`OperatorGate`], or by a scripted
/// double in tests.
pub trait ContinuationGate {
    fn confirm_continuation(&self, neighbor: &NeighborRecord) -> bool;
}

/// Asks the operator on the terminal. Blocks until an answer arrives; only
/// an explicit `y` continues the trace.
pub struct OperatorGate;

impl ContinuationGate for OperatorGate {
    fn confirm_continuation(&self, _neighbor: &NeighborRecord) -> bool {
        print!("Follow? (y/n) ");
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub credentials: Credentials,
    pub default_dialect: Dialect,
    /// Router to ask for IP bindings once the terminal port is found.
    pub router: Option<Ipv4Addr>,
    pub timeout: std::time::Duration,
    /// Devices visited before the trace gives up.
    pub max_hops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceOutcome {
    /// The address was seen on at least one device.
    Found,
    /// The first device answered and the address was not in its table.
    NotFound,
    /// The trace could not establish whether the address is present.
    Faulted,
}

/// One device visited during the trace.
#[derive(Debug, Clone, Serialize)]
pub struct TrailHop {
    /// Device identity as shown by its prompt, decoration stripped.
    pub device: String,
    pub host: Ipv4Addr,
    pub interface: String,
    pub seen_at: String,
}

#[derive(Debug, Serialize)]
pub struct TraceReport {
    pub target: HardwareAddress,
    pub outcome: TraceOutcome,
    pub hops: Vec<TrailHop>,
    pub bindings: Vec<ArpEntry>,
    pub fault: Option<String>,
}

impl TraceReport {
    fn new(target: HardwareAddress) -> Self {
        Self {
            target,
            outcome: TraceOutcome::NotFound,
            hops: Vec::new(),
            bindings: Vec::new(),
            fault: None,
        }
    }

    pub fn found(&self) -> bool {
        matches!(self.outcome, TraceOutcome::Found)
    }

    fn record_hop(&mut self, device: &str, host: Ipv4Addr, interface: &str) {
        self.outcome = TraceOutcome::Found;
        self.hops.push(TrailHop {
            device: device.trim().to_string(),
            host,
            interface: interface.to_string(),
            seen_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    /// A fault only downgrades the outcome when nothing was confirmed yet;
    /// a hop that already saw the address stays found.
    fn faulted(mut self, fault: String) -> Self {
        self.fault = Some(fault);
        if self.hops.is_empty() {
            self.outcome = TraceOutcome::Faulted;
        }
        self
    }

    fn missing(mut self) -> Self {
        if self.hops.is_empty() {
            self.outcome = TraceOutcome::NotFound;
        }
        self
    }

    fn located(mut self) -> Self {
        self.outcome = TraceOutcome::Found;
        self
    }
}

/// What one device told us about the target address.
enum HopDecision {
    /// Not in the forwarding table.
    Missing,
    /// On an access port with no downstream switch.
    Terminal { interface: String },
    /// On a port that leads to another switch.
    Trail {
        interface: String,
        neighbor: NeighborRecord,
    },
}

pub struct Tracer<O, G> {
    pub(crate) opener: O,
    pub(crate) gate: G,
    pub(crate) config: TraceConfig,
}

impl<O: SessionOpener, G: ContinuationGate> Tracer<O, G> {
    pub fn new(opener: O, gate: G, config: TraceConfig) -> Self {
        Self {
            opener,
            gate,
            config,
        }
    }

    /// Trace `target` starting from the switch at `start`. Narrates progress
    /// as it goes and returns the accumulated report; `report.found()` is
    /// the classic boolean answer.
    pub async fn trace(&self, target: &HardwareAddress, start: Ipv4Addr) -> TraceReport {
        let mut report = TraceReport::new(*target);
        let mut visited: HashSet<Ipv4Addr> = HashSet::new();
        let mut next = start;

        for _ in 0..self.config.max_hops {
            if !visited.insert(next) {
                warn!("Loop detected: {next} was already visited, stopping the trace");
                return report.faulted(format!("loop detected at {next}"));
            }

            info!("Looking for {target} on {next}");

            let mut session = match self.open_session(next).await {
                Ok(session) => session,
                Err(err) => {
                    error!("Connection to {next} failed: {err}");
                    return report.faulted(format!("session to {next} failed: {err}"));
                }
            };

            let decision = self.interrogate(&mut session, target).await;
            let identity = cisco::strip_decoration(session.prompt());
            session.close().await;

            match decision {
                Err(err) => {
                    error!("Query on {next} failed: {err}");
                    return report.faulted(format!("query on {next} failed: {err}"));
                }
                Ok(HopDecision::Missing) => {
                    info!("MAC address not found on device {next}");
                    return report.missing();
                }
                Ok(HopDecision::Terminal { interface }) => {
                    report.record_hop(&identity, next, &interface);
                    info!("Found it! {identity}, port {interface}");
                    if let Some(router) = self.config.router {
                        report.bindings = arp::resolve_ip(
                            &self.opener,
                            target,
                            router,
                            &self.config.credentials,
                            self.config.timeout,
                        )
                        .await;
                        for entry in &report.bindings {
                            info!("Device IPs found: {} {}", entry.ip_address, entry.vlan);
                        }
                    }
                    return report.located();
                }
                Ok(HopDecision::Trail {
                    interface,
                    neighbor,
                }) => {
                    report.record_hop(&identity, next, &interface);
                    let management_ip = neighbor
                        .management_ip
                        .as_deref()
                        .and_then(|ip| ip.parse::<Ipv4Addr>().ok());

                    let Some(neighbor_host) = management_ip else {
                        info!(
                            "Found a trail: {identity} {interface} leading to {} ({}), but no management address was reported, cannot follow it",
                            neighbor.device_id, neighbor.platform
                        );
                        return report.located();
                    };

                    info!(
                        "Found a trail: {identity} {interface} leading to {} ({}) on {neighbor_host}",
                        neighbor.device_id, neighbor.platform
                    );
                    if !self.gate.confirm_continuation(&neighbor) {
                        return report.located();
                    }
                    next = neighbor_host;
                }
            }
        }

        warn!(
            "Hop limit ({}) reached, stopping the trace",
            self.config.max_hops
        );
        report.faulted(format!("hop limit ({}) reached", self.config.max_hops))
    }

    /// Open a session with the default dialect; an establishment timeout is
    /// retried exactly once on the fallback dialect.
    async fn open_session(&self, host: Ipv4Addr) -> Result<O::Session, SessionError> {
        let dialect = self.config.default_dialect;
        match self
            .opener
            .open(dialect, host, &self.config.credentials, self.config.timeout)
            .await
        {
            Ok(session) => Ok(session),
            Err(SessionError::Timeout) => match dialect.fallback() {
                Some(fallback) => {
                    warn!("Connection to {host} over {dialect} timed out, retrying over {fallback}");
                    self.opener
                        .open(fallback, host, &self.config.credentials, self.config.timeout)
                        .await
                }
                None => Err(SessionError::Timeout),
            },
            Err(err) => Err(err),
        }
    }

    async fn interrogate(
        &self,
        session: &mut O::Session,
        target: &HardwareAddress,
    ) -> Result<HopDecision, SessionError> {
        let table = session
            .send_command(&cisco::address_table_query(target))
            .await?;
        let entries = cisco::parse_address_table(&table);

        let Some(entry) = entries.first() else {
            return Ok(HopDecision::Missing);
        };
        if entries.len() > 1 {
            debug!(
                "{} additional forwarding-table matches ignored: {:?}",
                entries.len() - 1,
                entries[1..]
                    .iter()
                    .map(|entry| entry.interface.as_str())
                    .collect::<Vec<_>>()
            );
        }

        let interface = entry.interface.clone();
        let detail = session
            .send_command(&cisco::neighbor_detail_query(&interface))
            .await?;

        match cisco::parse_neighbor_detail(&detail) {
            Some(neighbor) => Ok(HopDecision::Trail {
                interface,
                neighbor,
            }),
            None => Ok(HopDecision::Terminal { interface }),
        }
    }
}
