//! Packet source: UDP and TCP listeners feeding the controller.
//!
//! Binds both transports on the listen address, hands every query to the
//! [`DnsController`] and runs the periodic housekeeping (stats, cache and
//! from-socket eviction). Runs until the process exits.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::anyfrom::AnyfromPool;
use crate::cache::DnsCache;
use crate::config::Timeouts;
use crate::controller::{DnsController, ResponseWriter};
use crate::dns::{HEADER_LEN, MAX_DNS_PACKET_SIZE};
use crate::forwarder::Forwarder;
use crate::stream::{read_message, write_message};
use crate::upstream::Upstream;

/// Configuration for the DNS forwarder.
pub struct ServerConfig {
    /// Local address to bind (e.g., 127.0.0.1:5353)
    pub bind_addr: SocketAddr,
    /// Upstream every query is forwarded to
    pub upstream: Upstream,
    pub timeouts: Timeouts,
    /// Device the from-sockets bind to
    pub interface: Option<String>,
    pub cache_min_ttl: Duration,
    pub cache_max_ttl: Duration,
    /// Stats logging period; zero disables the stats log
    pub stats_interval: Duration,
    /// Idle from-sockets older than this are closed, checked on a tick of the
    /// same length; zero disables eviction
    pub pool_idle: Duration,
}

/// Build the controller described by `config`.
pub fn build_controller(config: &ServerConfig) -> Arc<DnsController> {
    let pool = Arc::new(AnyfromPool::new());
    let forwarder =
        Forwarder::new(pool, config.timeouts.dial).with_interface(config.interface.clone());
    let cache = DnsCache::with_ttl_bounds(config.cache_min_ttl, config.cache_max_ttl);

    Arc::new(DnsController::new(forwarder, cache, config.timeouts))
}

/// Run the forwarder with the given configuration.
pub async fn run(config: ServerConfig) -> io::Result<()> {
    config
        .timeouts
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let controller = build_controller(&config);
    let upstream = Arc::new(config.upstream.clone());

    let udp = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    let tcp = TcpListener::bind(config.bind_addr).await?;

    tracing::info!(
        bind = %config.bind_addr,
        %upstream,
        flow_timeout = ?config.timeouts.flow,
        dial_timeout = ?config.timeouts.dial,
        "DNS forwarder listening"
    );

    tokio::spawn(run_udp(udp, controller.clone(), upstream.clone()));
    tokio::spawn(run_tcp(tcp, controller.clone(), upstream));

    spawn_housekeeping(&controller, &config);

    std::future::pending::<()>().await;

    Ok(())
}

struct UdpResponder {
    socket: Arc<UdpSocket>,
}

impl ResponseWriter for UdpResponder {
    fn write_response<'a>(
        &'a self,
        to: SocketAddr,
        response: &'a [u8],
    ) -> BoxFuture<'a, io::Result<()>> {
        async move { self.socket.send_to(response, to).await.map(|_| ()) }.boxed()
    }
}

/// Receive loop for UDP queries.
pub async fn run_udp(socket: Arc<UdpSocket>, controller: Arc<DnsController>, upstream: Arc<Upstream>) {
    let writer: Arc<dyn ResponseWriter> = Arc::new(UdpResponder {
        socket: socket.clone(),
    });
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        if len < HEADER_LEN {
            continue;
        }

        controller.handle_query(src, buf[..len].to_vec(), upstream.clone(), writer.clone());
    }
}

/// Writes length-prefixed responses on one client connection.
struct TcpResponder {
    writer: Mutex<OwnedWriteHalf>,
}

impl ResponseWriter for TcpResponder {
    fn write_response<'a>(
        &'a self,
        _to: SocketAddr,
        response: &'a [u8],
    ) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, response).await
        }
        .boxed()
    }
}

/// Accept loop for TCP clients; each connection runs in its own task.
pub async fn run_tcp(listener: TcpListener, controller: Arc<DnsController>, upstream: Arc<Upstream>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(
                    client,
                    peer,
                    controller.clone(),
                    upstream.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Read queries off one connection until the client closes it.
async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    controller: Arc<DnsController>,
    upstream: Arc<Upstream>,
) {
    let (mut reader, writer) = client.into_split();
    let writer: Arc<dyn ResponseWriter> = Arc::new(TcpResponder {
        writer: Mutex::new(writer),
    });

    loop {
        match read_message(&mut reader).await {
            Ok(Some(query)) if query.len() >= HEADER_LEN => {
                controller.handle_query(peer, query, upstream.clone(), writer.clone());
            }
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "TCP read error");
                return;
            }
        }
    }
}

/// Start the periodic stats log and idle sweep enabled in `config`.
///
/// The two run independently: either interval may be zero.
pub fn spawn_housekeeping(controller: &Arc<DnsController>, config: &ServerConfig) {
    if !config.stats_interval.is_zero() {
        tokio::spawn(log_stats(controller.clone(), config.stats_interval));
    }
    if !config.pool_idle.is_zero() {
        tokio::spawn(evict_idle(controller.clone(), config.pool_idle));
    }
}

async fn log_stats(controller: Arc<DnsController>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;

        let expired = controller.cache().evict_expired();
        let stats = controller.stats().snapshot_and_reset();
        tracing::info!(
            cache = controller.cache().len(),
            expired,
            from_sockets = controller.forwarder().pool().len(),
            requests = stats.requests,
            forwarded = stats.forwarded,
            cached = stats.cached,
            failed = stats.failed,
            malformed = stats.malformed,
            avg_response_ms = stats.avg_response_ms,
            "stats"
        );
    }
}

async fn evict_idle(controller: Arc<DnsController>, max_idle: Duration) {
    let mut interval = tokio::time::interval(max_idle);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;

        let closed = controller.forwarder().pool().evict_idle(max_idle);
        let expired = controller.cache().evict_expired();
        if closed > 0 || expired > 0 {
            tracing::debug!(closed, expired, "idle sweep");
        }
    }
}
