//! Whole-trace tests driven through scripted device sessions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::session::{CommandSession, Credentials, Dialect, SessionError, SessionOpener};
use crate::trace::{ContinuationGate, TraceConfig, TraceOutcome, Tracer};
use crate::{HardwareAddress, NeighborRecord, arp, setup_test_logging};

const SW1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SW2: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

const CARET_RESPONSE: &str = "          ^\n% Invalid input detected at '^' marker.\n";

fn target() -> HardwareAddress {
    HardwareAddress::canonicalize("aa:bb:cc:dd:ee:ff").unwrap()
}

fn mac_table_row(interface: &str) -> String {
    format!(" 10    aabb.ccdd.eeff    DYNAMIC     {interface}\n")
}

fn cdp_block(device_id: &str, ip: Option<&str>) -> String {
    let mut block = format!(
        "-------------------------\nDevice ID: {device_id}\nEntry address(es):\n"
    );
    if let Some(ip) = ip {
        block.push_str(&format!("  IP address: {ip}\n"));
    }
    block.push_str("Platform: cisco WS-C2960,  Capabilities: Switch IGMP\n");
    block
}

/// One scripted device conversation: canned responses handed out in order.
struct SessionScript {
    prompt: String,
    responses: Vec<String>,
}

pub(crate) struct ScriptedSession {
    prompt: String,
    responses: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl CommandSession for ScriptedSession {
    fn send_command(
        &mut self,
        command: &str,
    ) -> impl Future<Output = Result<String, SessionError>> + Send {
        self.sent.lock().unwrap().push(command.to_string());
        let result = self
            .responses
            .pop_front()
            .ok_or_else(|| SessionError::Command(format!("no scripted response for '{command}'")));
        async move { result }
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn close(self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

pub(crate) struct ScriptedOpener {
    scripts: Mutex<HashMap<Ipv4Addr, VecDeque<SessionScript>>>,
    timeouts: HashSet<(Dialect, Ipv4Addr)>,
    opens: Mutex<Vec<(Dialect, Ipv4Addr)>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedOpener {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            timeouts: HashSet::new(),
            opens: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn script(self, host: Ipv4Addr, prompt: &str, responses: &[&str]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(host)
            .or_default()
            .push_back(SessionScript {
                prompt: prompt.to_string(),
                responses: responses.iter().map(|r| r.to_string()).collect(),
            });
        self
    }

    fn timeout_on(mut self, dialect: Dialect, host: Ipv4Addr) -> Self {
        self.timeouts.insert((dialect, host));
        self
    }

    fn opened(&self) -> Vec<(Dialect, Ipv4Addr)> {
        self.opens.lock().unwrap().clone()
    }

    fn commands_sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl SessionOpener for ScriptedOpener {
    type Session = ScriptedSession;

    fn open(
        &self,
        dialect: Dialect,
        host: Ipv4Addr,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send {
        self.opens.lock().unwrap().push((dialect, host));
        let result = if self.timeouts.contains(&(dialect, host)) {
            Err(SessionError::Timeout)
        } else {
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&host)
                .and_then(|queue| queue.pop_front())
                .map(|script| ScriptedSession {
                    prompt: script.prompt,
                    responses: script.responses.into(),
                    sent: Arc::clone(&self.sent),
                })
                .ok_or_else(|| SessionError::Connection(format!("no scripted session for {host}")))
        };
        async move { result }
    }
}

pub(crate) struct ScriptedGate {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<usize>,
}

impl ScriptedGate {
    fn answering(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            asked: Mutex::new(0),
        }
    }

    fn times_asked(&self) -> usize {
        *self.asked.lock().unwrap()
    }
}

impl ContinuationGate for ScriptedGate {
    fn confirm_continuation(&self, _neighbor: &NeighborRecord) -> bool {
        *self.asked.lock().unwrap() += 1;
        self.answers.lock().unwrap().pop_front().unwrap_or(false)
    }
}

fn test_config(router: Option<Ipv4Addr>, max_hops: usize) -> TraceConfig {
    TraceConfig {
        credentials: Credentials {
            username: "netops".to_string(),
            password: "hunter2".to_string(),
        },
        default_dialect: Dialect::Ssh,
        router,
        timeout: Duration::from_secs(5),
        max_hops,
    }
}

#[tokio::test]
async fn test_terminal_hop_without_router_issues_no_arp_query() {
    setup_test_logging();
    // Scenario: the address is on Gi1/0/1 and the neighbor-detail query
    // answers with the syntax-error caret, so the port is terminal.
    let opener =
        ScriptedOpener::new().script(SW1, "sw1#", &[&mac_table_row("Gi1/0/1"), CARET_RESPONSE]);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.outcome, TraceOutcome::Found);
    assert_eq!(report.hops.len(), 1);
    assert_eq!(report.hops[0].device, "sw1");
    assert_eq!(report.hops[0].host, SW1);
    assert_eq!(report.hops[0].interface, "Gi1/0/1");
    assert!(report.bindings.is_empty());

    assert_eq!(tracer.opener.opened(), vec![(Dialect::Ssh, SW1)]);
    assert_eq!(
        tracer.opener.commands_sent(),
        vec![
            "show mac address-table | i aabb.ccdd.eeff".to_string(),
            "show cdp ne Gi1/0/1 detail".to_string(),
        ]
    );
    assert_eq!(tracer.gate.times_asked(), 0);
}

#[tokio::test]
async fn test_trail_hop_continues_after_confirmation() {
    setup_test_logging();
    // sw1 reports a neighboring switch on Gi1/0/24, the operator says yes,
    // and the trace carries on into 10.0.0.2 with the same target address.
    let opener = ScriptedOpener::new()
        .script(
            SW1,
            "sw1#",
            &[
                &mac_table_row("Gi1/0/24"),
                &cdp_block("sw2", Some("10.0.0.2")),
            ],
        )
        .script(SW2, "sw2#", &[&mac_table_row("Gi1/0/5"), CARET_RESPONSE]);
    let tracer = Tracer::new(
        opener,
        ScriptedGate::answering(&[true]),
        test_config(None, 10),
    );

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.hops.len(), 2);
    assert_eq!(report.hops[0].device, "sw1");
    assert_eq!(report.hops[0].interface, "Gi1/0/24");
    assert_eq!(report.hops[1].device, "sw2");
    assert_eq!(report.hops[1].host, SW2);
    assert_eq!(report.hops[1].interface, "Gi1/0/5");

    assert_eq!(
        tracer.opener.opened(),
        vec![(Dialect::Ssh, SW1), (Dialect::Ssh, SW2)]
    );
    assert_eq!(tracer.gate.times_asked(), 1);
}

#[tokio::test]
async fn test_declined_continuation_stops_with_found() {
    setup_test_logging();
    let opener = ScriptedOpener::new().script(
        SW1,
        "sw1#",
        &[
            &mac_table_row("Gi1/0/24"),
            &cdp_block("sw2", Some("10.0.0.2")),
        ],
    );
    let tracer = Tracer::new(
        opener,
        ScriptedGate::answering(&[false]),
        test_config(None, 10),
    );

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.hops.len(), 1);
    assert_eq!(tracer.opener.opened().len(), 1);
    assert_eq!(tracer.gate.times_asked(), 1);
}

#[tokio::test]
async fn test_neighbor_without_management_ip_is_found_without_prompting() {
    setup_test_logging();
    let opener = ScriptedOpener::new().script(
        SW1,
        "sw1#",
        &[&mac_table_row("Gi1/0/24"), &cdp_block("sw2", None)],
    );
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.hops.len(), 1);
    assert_eq!(tracer.gate.times_asked(), 0);
    assert_eq!(tracer.opener.opened().len(), 1);
}

#[tokio::test]
async fn test_neighbor_with_unparseable_management_ip_is_found_without_prompting() {
    setup_test_logging();
    let opener = ScriptedOpener::new().script(
        SW1,
        "sw1#",
        &[
            &mac_table_row("Gi1/0/24"),
            &cdp_block("sw2", Some("not-an-ip")),
        ],
    );
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.hops.len(), 1);
    assert_eq!(tracer.gate.times_asked(), 0);
}

#[tokio::test]
async fn test_address_not_in_first_table_reports_not_found() {
    setup_test_logging();
    let opener = ScriptedOpener::new().script(SW1, "sw1#", &["", CARET_RESPONSE]);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(!report.found());
    assert_eq!(report.outcome, TraceOutcome::NotFound);
    assert!(report.hops.is_empty());
    // Only the forwarding-table query went out.
    assert_eq!(tracer.opener.commands_sent().len(), 1);
}

#[tokio::test]
async fn test_terminal_hop_with_router_narrates_arp_bindings() {
    setup_test_logging();
    // The ARP table answers two good rows and one malformed row; the
    // malformed one is skipped without taking the others down.
    let arp_output = "Internet  10.1.10.20   4   aabb.ccdd.eeff  ARPA   Vlan10\nInternet  10.1.20.7   12   aabb.ccdd.eeff  ARPA   Vlan20\nInternet  10.1.30.9\n";
    let opener = ScriptedOpener::new()
        .script(SW1, "sw1#", &[&mac_table_row("Gi1/0/1"), CARET_RESPONSE])
        .script(ROUTER, "rtr1#", &[arp_output]);
    let tracer = Tracer::new(
        opener,
        ScriptedGate::answering(&[]),
        test_config(Some(ROUTER), 10),
    );

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.bindings.len(), 2);
    assert_eq!(report.bindings[0].ip_address, "10.1.10.20");
    assert_eq!(report.bindings[0].vlan, "Vlan10");
    assert_eq!(report.bindings[1].ip_address, "10.1.20.7");
    assert_eq!(report.bindings[1].vlan, "Vlan20");

    assert_eq!(
        tracer.opener.opened(),
        vec![(Dialect::Ssh, SW1), (Dialect::Ssh, ROUTER)]
    );
    assert!(
        tracer
            .opener
            .commands_sent()
            .contains(&"show ip arp | i aabb.ccdd.eeff".to_string())
    );
}

#[tokio::test]
async fn test_timeout_retries_exactly_once_on_fallback_dialect() {
    setup_test_logging();
    let opener = ScriptedOpener::new()
        .script(SW1, "sw1#", &[&mac_table_row("Gi1/0/1"), CARET_RESPONSE])
        .timeout_on(Dialect::Ssh, SW1);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(
        tracer.opener.opened(),
        vec![(Dialect::Ssh, SW1), (Dialect::Telnet, SW1)]
    );
}

#[tokio::test]
async fn test_timeout_on_both_dialects_gives_up_after_one_retry() {
    setup_test_logging();
    let opener = ScriptedOpener::new()
        .timeout_on(Dialect::Ssh, SW1)
        .timeout_on(Dialect::Telnet, SW1);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert!(!report.found());
    assert_eq!(report.outcome, TraceOutcome::Faulted);
    assert!(report.fault.as_deref().unwrap_or("").contains("failed"));
    // Exactly one retry: two opens, no third attempt.
    assert_eq!(tracer.opener.opened().len(), 2);
}

#[tokio::test]
async fn test_session_query_fault_is_local_and_reported() {
    setup_test_logging();
    // The session opens but has no scripted responses, so the first query
    // fails; with nothing confirmed yet that is a fault, not "not found".
    let opener = ScriptedOpener::new().script(SW1, "sw1#", &[]);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;

    assert_eq!(report.outcome, TraceOutcome::Faulted);
    assert!(report.fault.as_deref().unwrap_or("").contains("query"));
    assert!(report.hops.is_empty());
}

#[tokio::test]
async fn test_topology_loop_is_detected_and_reported() {
    setup_test_logging();
    // sw1 and sw2 each report the other as the next hop; the revisit of sw1
    // must stop the walk instead of recursing forever.
    let opener = ScriptedOpener::new()
        .script(
            SW1,
            "sw1#",
            &[
                &mac_table_row("Gi1/0/24"),
                &cdp_block("sw2", Some("10.0.0.2")),
            ],
        )
        .script(
            SW2,
            "sw2#",
            &[
                &mac_table_row("Gi1/0/48"),
                &cdp_block("sw1", Some("10.0.0.1")),
            ],
        );
    let tracer = Tracer::new(
        opener,
        ScriptedGate::answering(&[true, true]),
        test_config(None, 10),
    );

    let report = tracer.trace(&target(), SW1).await;

    // The two legitimate hops stand; the loop is reported as a fault.
    assert!(report.found());
    assert_eq!(report.hops.len(), 2);
    assert!(report.fault.as_deref().unwrap_or("").contains("loop"));
    assert_eq!(tracer.opener.opened().len(), 2);
}

#[tokio::test]
async fn test_hop_limit_stops_the_walk() {
    setup_test_logging();
    let opener = ScriptedOpener::new().script(
        SW1,
        "sw1#",
        &[
            &mac_table_row("Gi1/0/24"),
            &cdp_block("sw2", Some("10.0.0.2")),
        ],
    );
    let tracer = Tracer::new(
        opener,
        ScriptedGate::answering(&[true]),
        test_config(None, 1),
    );

    let report = tracer.trace(&target(), SW1).await;

    assert!(report.found());
    assert_eq!(report.hops.len(), 1);
    assert!(report.fault.as_deref().unwrap_or("").contains("hop limit"));
    assert_eq!(tracer.opener.opened().len(), 1);
}

#[tokio::test]
async fn test_arp_resolver_swallows_session_failures() {
    setup_test_logging();
    // No script for the router: the open fails, and the resolver answers
    // with zero bindings instead of an error.
    let opener = ScriptedOpener::new();
    let config = test_config(Some(ROUTER), 10);

    let bindings = arp::resolve_ip(
        &opener,
        &target(),
        ROUTER,
        &config.credentials,
        config.timeout,
    )
    .await;

    assert!(bindings.is_empty());
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    setup_test_logging();
    let opener =
        ScriptedOpener::new().script(SW1, "sw1#", &[&mac_table_row("Gi1/0/1"), CARET_RESPONSE]);
    let tracer = Tracer::new(opener, ScriptedGate::answering(&[]), test_config(None, 10));

    let report = tracer.trace(&target(), SW1).await;
    let json = serde_json::to_string(&report).unwrap();

    assert!(json.contains("\"aabb.ccdd.eeff\""));
    assert!(json.contains("\"Found\""));
    assert!(json.contains("\"Gi1/0/1\""));
}
