//! simcard probe
//!
//! Opens a SIM gateway, prints every identity field and the card state, and
//! optionally replays a sequence of native status codes while subscribed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use simcard::{BackendConfig, InMemoryGateway, NativeStatus, Sim, SimConfig, SimGateway, SimResult};

/// Probe configuration
struct Args {
    /// JSON configuration file
    config: Option<PathBuf>,
    /// JSON card profile, overrides the configured one
    profile: Option<PathBuf>,
    /// Native status codes to replay while subscribed
    watch: Vec<NativeStatus>,
}

fn print_help() {
    println!("sim-probe - read SIM identity fields and state");
    println!();
    println!("USAGE:");
    println!("    sim-probe [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       JSON configuration file");
    println!("    -p, --profile <FILE>      JSON card profile");
    println!("    -w, --watch <CODES>       Comma separated native status codes to replay (e.g. 0x0b,3)");
    println!("    -h, --help                Print help information");
}

fn parse_code(raw: &str) -> Result<NativeStatus, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse::<u8>(),
    };
    parsed
        .map(NativeStatus::from_code)
        .map_err(|_| format!("invalid status code: {raw}"))
}

fn parse_args() -> Result<Option<Args>, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        profile: None,
        watch: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args.get(i + 1).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--profile" | "-p" => {
                let value = args.get(i + 1).ok_or("--profile requires a value")?;
                parsed.profile = Some(PathBuf::from(value));
                i += 2;
            }
            "--watch" | "-w" => {
                let value = args.get(i + 1).ok_or("--watch requires a value")?;
                parsed.watch = value
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(parse_code)
                    .collect::<Result<_, _>>()?;
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            arg => return Err(format!("unknown argument: {arg}")),
        }
    }

    Ok(Some(parsed))
}

fn show(label: &str, value: SimResult<Option<String>>) {
    match value {
        Ok(Some(v)) => println!("{label:<20} {v}"),
        Ok(None) => println!("{label:<20} (none)"),
        Err(err) => println!("{label:<20} error: {err}"),
    }
}

fn print_fields(sim: &Sim) {
    match sim.get_state() {
        Ok(state) => println!("{:<20} {state}", "state"),
        Err(err) => println!("{:<20} error: {err}", "state"),
    }
    show("icc-id", sim.get_icc_id());
    show("mcc", sim.get_mcc());
    show("mnc", sim.get_mnc());
    show("msin", sim.get_msin());
    show("spn", sim.get_spn());
    match sim.get_cphs_operator_name() {
        Ok((full, short)) => {
            show("cphs full name", Ok(full));
            show("cphs short name", Ok(short));
        }
        Err(err) => println!("{:<20} error: {err}", "cphs operator name"),
    }
    show("subscriber number", sim.get_subscriber_number());
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SimConfig::from_path(path)?,
        None => SimConfig::default(),
    };
    if let Some(profile) = args.profile {
        config.backend = BackendConfig::InMemory {
            profile: Some(profile),
        };
    }
    let gateway = Arc::new(InMemoryGateway::from_config(&config)?);
    let sim = Sim::new(Arc::clone(&gateway) as Arc<dyn SimGateway>);

    print_fields(&sim);

    if args.watch.is_empty() {
        return Ok(());
    }

    let stream = sim.manager().subscribe_stream(config.stream_capacity)?;
    info!(events = args.watch.len(), "replaying native status events");
    for status in args.watch {
        gateway.set_status(status)?;
    }
    gateway.flush()?;

    while let Some(change) = stream.recv_timeout(Duration::from_millis(100))? {
        println!(
            "{} {} -> {}",
            change.observed_at.to_rfc3339(),
            change.previous,
            change.current
        );
    }

    sim.unsubscribe()?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "probe failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
