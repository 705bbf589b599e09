use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dnsgate::config::Timeouts;
use dnsgate::server::{self, ServerConfig};
use dnsgate::upstream::Upstream;

#[derive(Parser)]
#[command(name = "dnsgate")]
#[command(about = "DNS forwarder with UDP to TCP fallback", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "5353", env = "DNSGATE_PORT")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1", env = "DNSGATE_BIND")]
    bind: IpAddr,

    /// Upstream resolver: udp://, tcp:// or tcp+udp:// followed by ip[:port]
    #[arg(short, long, default_value = "tcp+udp://8.8.8.8:53", env = "DNSGATE_UPSTREAM")]
    upstream: Upstream,

    /// Overall budget of one query, in milliseconds
    #[arg(long, default_value = "17000", env = "DNSGATE_FLOW_TIMEOUT_MS")]
    flow_timeout_ms: u64,

    /// Budget of one dial attempt, in milliseconds; must be below the flow timeout
    #[arg(long, default_value = "8000", env = "DNSGATE_DIAL_TIMEOUT_MS")]
    dial_timeout_ms: u64,

    /// Network interface the upstream sockets bind to
    #[arg(short, long, env = "DNSGATE_INTERFACE")]
    interface: Option<String>,

    /// Lower bound of cached TTLs, in seconds
    #[arg(long, default_value = "60")]
    cache_min_ttl: u64,

    /// Upper bound of cached TTLs, in seconds
    #[arg(long, default_value = "86400")]
    cache_max_ttl: u64,

    /// Seconds between stats reports (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Close upstream sockets idle for this many seconds (0 disables)
    #[arg(long, default_value = "300")]
    pool_idle_secs: u64,
}

fn main() -> dnsgate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let timeouts = Timeouts::new(
        Duration::from_millis(args.flow_timeout_ms),
        Duration::from_millis(args.dial_timeout_ms),
    )?;

    let config = ServerConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        upstream: args.upstream,
        timeouts,
        interface: args.interface,
        cache_min_ttl: Duration::from_secs(args.cache_min_ttl),
        cache_max_ttl: Duration::from_secs(args.cache_max_ttl),
        stats_interval: Duration::from_secs(args.stats_interval),
        pool_idle: Duration::from_secs(args.pool_idle_secs),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(server::run(config))?;
    Ok(())
}
