//! # Aerolink Vehicle Daemon
//!
//! Reads the H.264 elementary stream produced by the onboard encoder,
//! splits it into FEC-protected blocks and broadcasts them over every
//! configured radio interface. Retransmission requests and encoding
//! updates arrive on a local control socket or over the air.
//!
//! ## Usage
//!
//! ```bash
//! # Encoder writes to a FIFO, radios from config
//! aerolink-vehicle --config /etc/aerolink/vehicle.toml --input /run/aerolink/video.h264
//!
//! # Pipe from stdin, control socket for the router process
//! encoder | aerolink-vehicle --config vehicle.toml --input - \
//!   --control /run/aerolink/video.sock --control-peer /run/aerolink/router.sock
//! ```

mod local;
mod udp_radio;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aerolink_transport::config::TransportConfig;
use aerolink_transport::ipc::{InProcessChannel, MessageChannel};
use aerolink_transport::radio::RadioDispatcher;
use aerolink_transport::runtime::TxLoop;
use aerolink_transport::sender::Scheduler;

use local::{EncoderInput, PollEvents, UnixControl};
use udp_radio::UdpRadio;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    tracing::info!(
        config = ?args.config,
        input = %args.input,
        control = ?args.control,
        control_peer = ?args.control_peer,
        stats = ?args.stats,
        "aerolink-vehicle starting"
    );

    // ── Config ──────────────────────────────────────────────────
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
            TransportConfig::from_toml_str(&text)?
        }
        None => TransportConfig::default(),
    };

    // ── Radios ──────────────────────────────────────────────────
    let mut radio = RadioDispatcher::new(config.radio.dispatch.clone());
    for iface in &config.radio.interfaces {
        match UdpRadio::open(iface) {
            Ok(r) => {
                radio.add_interface(Box::new(r));
            }
            Err(e) => tracing::error!(interface = %iface.name, error = %e, "radio open failed"),
        }
    }
    let frequencies: BTreeSet<u32> = config
        .radio
        .interfaces
        .iter()
        .filter_map(|i| i.frequency_khz)
        .collect();
    for frequency_khz in frequencies {
        if let Err(e) = radio.open_for_frequency(frequency_khz) {
            tracing::error!(frequency_khz, error = %e, "no radio for frequency");
        }
    }
    if config.radio.interfaces.is_empty() {
        tracing::warn!("no radio interfaces configured, video goes nowhere");
    }

    // ── Scheduler ───────────────────────────────────────────────
    let scheduler = Scheduler::new(config.scheduler.clone(), config.link_state()?, radio)?
        .with_faults(config.faults.injector());

    // ── Local I/O ───────────────────────────────────────────────
    let input = EncoderInput::open(&args.input)?;
    let stream_fd = input.raw_fd();

    // Without a socket the loop gets an in-process channel whose peer
    // stays alive, so keyframe commands are accepted and discarded.
    let (control, control_fd, _peer) = match &args.control {
        Some(path) => {
            let sock = UnixControl::bind(path, args.control_peer.clone())?;
            let fd = sock.raw_fd();
            (Box::new(sock) as Box<dyn MessageChannel>, Some(fd), None)
        }
        None => {
            let (ours, theirs) = InProcessChannel::pair(64);
            (Box::new(ours) as Box<dyn MessageChannel>, None, Some(theirs))
        }
    };
    let events = PollEvents::new(stream_fd, control_fd);

    // ── Graceful shutdown ───────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    // ── Transmit loop ───────────────────────────────────────────
    let mut tx = TxLoop::new(
        scheduler,
        config.loop_.clone(),
        config.send_mode,
        Box::new(events),
        Box::new(input),
        control,
    );
    if let Some(path) = args.stats.clone() {
        tx = tx.with_stats_path(path);
    }
    tx.run(&shutdown)?;

    let stats = tx.scheduler().stats();
    tracing::info!(
        blocks = stats.blocks_completed,
        packets = stats.packets_sent,
        "aerolink-vehicle stopped"
    );
    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<PathBuf>,
    input: String,
    control: Option<PathBuf>,
    control_peer: Option<PathBuf>,
    stats: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut input = None;
    let mut control = None;
    let mut control_peer = None;
    let mut stats = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || -> anyhow::Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match flag {
            "--config" | "-c" => config = Some(PathBuf::from(value()?)),
            "--input" | "-i" => input = Some(value()?),
            "--control" => control = Some(PathBuf::from(value()?)),
            "--control-peer" => control_peer = Some(PathBuf::from(value()?)),
            "--stats" | "-s" => stats = Some(PathBuf::from(value()?)),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other} (try --help)");
            }
        }
        i += 1;
    }

    // Environment variable fallbacks
    let env_path = |name: &str| {
        std::env::var(name)
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    };
    if config.is_none() {
        config = env_path("AEROLINK_CONFIG");
    }
    if input.is_none() {
        input = std::env::var("AEROLINK_INPUT").ok().filter(|s| !s.is_empty());
    }
    if control.is_none() {
        control = env_path("AEROLINK_CONTROL");
    }
    if control_peer.is_none() {
        control_peer = env_path("AEROLINK_CONTROL_PEER");
    }
    if stats.is_none() {
        stats = env_path("AEROLINK_STATS");
    }

    if control_peer.is_some() && control.is_none() {
        anyhow::bail!("--control-peer needs --control");
    }

    Ok(Args {
        config,
        input: input.unwrap_or_else(|| "-".into()),
        control,
        control_peer,
        stats,
    })
}

fn print_help() {
    eprintln!(
        r#"aerolink-vehicle: FEC video transmitter for lossy radio links

USAGE:
  aerolink-vehicle [OPTIONS]

OPTIONS:
  --config, -c <path>      TOML config (defaults apply when omitted)
  --input, -i <path>       H.264 input file or FIFO, "-" for stdin (default: -)
  --control <path>         Bind a Unix datagram control socket here
  --control-peer <path>    Socket that receives keyframe commands
  --stats, -s <path>       Write a JSON stats snapshot here periodically
  --help, -h               Show this help

ENVIRONMENT VARIABLES:
  AEROLINK_CONFIG          Fallback for --config
  AEROLINK_INPUT           Fallback for --input
  AEROLINK_CONTROL         Fallback for --control
  AEROLINK_CONTROL_PEER    Fallback for --control-peer
  AEROLINK_STATS           Fallback for --stats
  RUST_LOG                 Log level filter (e.g. info, aerolink_transport=debug)
"#
    );
}
