//! CLI handling module

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use regex::Regex;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::session::{Credentials, Dialect, NetworkOpener};
use crate::trace::{OperatorGate, TraceConfig, Tracer};
use crate::{HardwareAddress, MacTrailError};

/// Mactrail - trace the switch port a MAC address lives on, hop by hop
#[derive(Parser)]
#[command(name = "mactrail")]
#[command(about = "Trace a MAC address through a tree of Cisco switches")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// MAC address to find (aa:bb:cc:dd:ee:ff, aa-bb-cc-dd-ee-ff or aabb.ccdd.eeff)
    mac_address: String,

    /// IP address of the switch to start the trace from
    switch_ip: String,

    /// Username for the device sessions
    #[arg(short, long)]
    user: String,

    /// Router IP to resolve IP bindings from once the port is found
    #[arg(short, long)]
    router: Option<String>,

    /// Session timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Maximum number of devices to visit before giving up
    #[arg(long, default_value_t = 10)]
    max_hops: usize,

    /// Print the trace report as JSON once the trace completes
    #[arg(long)]
    json: bool,

    /// Enable debug logging (shows session traffic and parsing detail)
    #[arg(short, long)]
    debug: bool,
}

pub async fn main_func() -> ExitCode {
    let cli = Cli::parse();

    let env_filter_str = if cli.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::new(format!("{env_filter_str},russh=info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(cli.debug)
                .with_thread_ids(false)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    // Everything is validated before any session is opened.
    let (target, start, router) = match validate_arguments(&cli) {
        Ok(validated) => validated,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(2);
        }
    };

    let password = match rpassword::prompt_password(format!("Password for {start}: ")) {
        Ok(password) => password,
        Err(err) => {
            error!("Failed to read password: {err}");
            return ExitCode::FAILURE;
        }
    };

    let tracer = Tracer::new(
        NetworkOpener,
        OperatorGate,
        TraceConfig {
            credentials: Credentials {
                username: cli.user.clone(),
                password,
            },
            default_dialect: Dialect::Ssh,
            router,
            timeout: Duration::from_secs(cli.timeout),
            max_hops: cli.max_hops,
        },
    );

    let report = tracer.trace(&target, start).await;
    debug!("Trace finished with outcome {:?}", report.outcome);

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("Failed to render JSON report: {err}"),
        }
    }

    // A completed run exits 0 whether or not the address was located; only
    // invalid input maps to a distinct code.
    ExitCode::SUCCESS
}

fn validate_arguments(
    cli: &Cli,
) -> Result<(HardwareAddress, Ipv4Addr, Option<Ipv4Addr>), MacTrailError> {
    if !mac_syntax_valid(&cli.mac_address)? {
        return Err(MacTrailError::InvalidInput(format!(
            "'{}' is not a MAC address",
            cli.mac_address
        )));
    }
    let target = HardwareAddress::canonicalize(&cli.mac_address)?;

    let start = parse_ipv4(&cli.switch_ip)?;
    let router = match &cli.router {
        Some(router) => Some(parse_ipv4(router)?),
        None => None,
    };

    Ok((target, start, router))
}

fn parse_ipv4(input: &str) -> Result<Ipv4Addr, MacTrailError> {
    input
        .parse()
        .map_err(|_| MacTrailError::InvalidInput(format!("'{input}' is not a valid IPv4 address")))
}

/// The accepted input syntaxes: generic colon/dash notation or the vendor
/// dot-hextet notation, either case.
fn mac_syntax_valid(input: &str) -> Result<bool, MacTrailError> {
    let generic = Regex::new(r"^(?i)([0-9a-f]{2}[:-]){5}[0-9a-f]{2}$")?;
    let dotted = Regex::new(r"^(?i)[0-9a-f]{4}\.[0-9a-f]{4}\.[0-9a-f]{4}$")?;
    Ok(generic.is_match(input) || dotted.is_match(input))
}
