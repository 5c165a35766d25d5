//! tcpdiag command - periodic TCP connection metrics sampler.
//!
//! Samples established IPv4 TCP connections via socket diagnostics at a
//! fixed interval and prints one line per connection, as a table or as
//! JSON lines.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tcpdiag::{Config, PortRange, Sample, SampleBuf, Session};

#[derive(Parser)]
#[command(name = "tcpdiag", version, about = "TCP connection metrics sampler")]
struct Cli {
    /// Local port or port range to match (e.g. 5201 or 5200-5210). Repeatable.
    #[arg(short = 's', long = "sport", value_parser = parse_port_range)]
    sport: Vec<PortRange>,

    /// Remote port or port range to match. Repeatable.
    #[arg(short = 'd', long = "dport", value_parser = parse_port_range)]
    dport: Vec<PortRange>,

    /// Sampling interval in milliseconds.
    #[arg(short = 'i', long, default_value_t = 1000)]
    interval: u64,

    /// Number of sampling rounds, 0 to run until interrupted.
    #[arg(short = 'c', long, default_value_t = 0)]
    count: u64,

    /// Emit JSON lines instead of a table.
    #[arg(short = 'j', long)]
    json: bool,

    /// Receive timeout per dump, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    rcv_timeout: u64,

    /// Requested socket receive buffer size (SO_RCVBUF), 0 for the
    /// kernel default.
    #[arg(long, default_value_t = 0)]
    rcv_bufsize: u32,

    /// Forced receive buffer size (SO_RCVBUFFORCE, needs CAP_NET_ADMIN).
    #[arg(long, default_value_t = 0)]
    rcv_bufsize_force: u32,
}

fn parse_port_range(s: &str) -> Result<PortRange, String> {
    let parse_port =
        |p: &str| p.parse::<u16>().map_err(|_| format!("invalid port {p:?}"));
    let range = match s.split_once('-') {
        Some((lo, hi)) => PortRange::new(parse_port(lo)?, parse_port(hi)?),
        None => PortRange::single(parse_port(s)?),
    };
    if range.lo > range.hi {
        return Err(format!("empty port range {s:?}"));
    }
    Ok(range)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = Config {
        rcv_timeout: Duration::from_millis(cli.rcv_timeout),
        rcv_bufsize: cli.rcv_bufsize,
        rcv_bufsize_force: cli.rcv_bufsize_force,
        ..Config::default()
    };

    let mut session = Session::open(config, &cli.sport, &cli.dport)
        .context("opening diagnostics session")?;
    tracing::info!(
        rcv_bufsize = session.rcv_bufsize(),
        filter_len = session.filter_len(),
        "session open"
    );

    let interval = Duration::from_millis(cli.interval);
    let mut samples = SampleBuf::new();
    let mut round = 0u64;

    if !cli.json {
        print_header();
    }

    loop {
        let started = Instant::now();
        let stats = session.sample(&mut samples).context("sampling")?;
        tracing::debug!(
            samples = stats.samples,
            msgs = stats.msgs,
            msgs_len = stats.msgs_len,
            "dump complete"
        );

        for s in &samples {
            if cli.json {
                println!("{}", serde_json::to_string(s)?);
            } else {
                print_row(s);
            }
        }

        round += 1;
        if cli.count > 0 && round >= cli.count {
            break;
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }

    session.close().context("closing diagnostics session")?;
    Ok(())
}

fn print_header() {
    println!(
        "{:<21} {:<21} {:>9} {:>9} {:>10} {:>12} {:>7} {:>12}",
        "Local", "Remote", "RTT(us)", "MinRTT", "Cwnd(B)", "Pacing(bps)", "Retrans", "AckedB"
    );
}

fn print_row(s: &Sample) {
    println!(
        "{:<21} {:<21} {:>9} {:>9} {:>10} {:>12} {:>7} {:>12}",
        format!("{}:{}", Ipv4Addr::from(s.saddr), s.sport),
        format!("{}:{}", Ipv4Addr::from(s.daddr), s.dport),
        s.rtt_us,
        s.min_rtt_us,
        s.snd_cwnd_bytes,
        s.pacing_rate_bps,
        s.total_retrans,
        s.bytes_acked,
    )
}
