//! Shared "from" sockets used to talk to UDP upstreams.
//!
//! One unconnected UDP socket per [`BindKey`] serves every query using that
//! key. Each exchange gets a transaction id that is unique among in-flight
//! exchanges towards the same upstream; a reader task routes replies back by
//! (source address, id) and restores the caller's original id.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::context::QueryContext;
use crate::dial::{BindKey, IpVersion};
use crate::dns::{self, MAX_DNS_PACKET_SIZE};
use crate::error::ForwardError;
use crate::pool::Pool;

/// Random ids tried before falling back to a sweep of the id space.
const RANDOM_ID_ATTEMPTS: usize = 32;

/// Pause after a failed receive so a persistent socket error cannot spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

type Waiters = Arc<Mutex<FxHashMap<(SocketAddr, u16), oneshot::Sender<Vec<u8>>>>>;

/// A pooled UDP from-socket.
pub struct Anyfrom {
    key: BindKey,
    socket: Arc<UdpSocket>,
    waiters: Waiters,
    created_at: Instant,
    /// Milliseconds after `created_at`.
    last_used: AtomicU64,
    reader: AbortHandle,
}

impl Anyfrom {
    /// Create and bind a socket for `key` and start its reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(key: BindKey) -> Result<Self, ForwardError> {
        let socket = Self::open(&key).map_err(|source| ForwardError::Bind {
            key: key.to_string(),
            source,
        })?;
        let socket = Arc::new(socket);
        let waiters: Waiters = Arc::default();

        let reader = tokio::spawn(read_replies(socket.clone(), waiters.clone())).abort_handle();

        tracing::trace!(%key, local = ?socket.local_addr().ok(), "created from-socket");

        Ok(Self {
            key,
            socket,
            waiters,
            created_at: Instant::now(),
            last_used: AtomicU64::new(0),
            reader,
        })
    }

    fn open(key: &BindKey) -> io::Result<UdpSocket> {
        let (domain, local): (Domain, SocketAddr) = match key.ip_version {
            IpVersion::V4 => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into()),
            IpVersion::V6 => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into()),
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if key.ip_version == IpVersion::V6 {
            socket.set_only_v6(true)?;
        }
        if let Some(iface) = &key.interface {
            bind_device(&socket, iface)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        UdpSocket::from_std(socket.into())
    }

    pub fn key(&self) -> &BindKey {
        &self.key
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Time since the last exchange started on this socket.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Send `msg` to `target` and wait for the matching reply, bounded by `ctx`.
    pub async fn exchange(
        &self,
        ctx: &QueryContext,
        target: SocketAddr,
        msg: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let original_id = dns::message_id(msg).ok_or(ForwardError::Codec("query too short"))?;
        if msg.len() < dns::HEADER_LEN {
            return Err(ForwardError::Codec("query too short"));
        }

        self.touch();
        let (pending, rx) = self.register(target)?;

        let mut outgoing = msg.to_vec();
        dns::set_message_id(&mut outgoing, pending.id);

        let mut reply = ctx
            .run(async {
                self.socket.send_to(&outgoing, target).await?;
                rx.await.map_err(|_| ForwardError::ReaderClosed)
            })
            .await?;

        dns::set_message_id(&mut reply, original_id);
        Ok(reply)
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_used.fetch_max(now, Ordering::Relaxed);
    }

    fn register(
        &self,
        target: SocketAddr,
    ) -> Result<(Pending<'_>, oneshot::Receiver<Vec<u8>>), ForwardError> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());

        // Random picks first; the sweep from a random start only runs when the
        // id space towards `target` is nearly full.
        let start: u16 = rand::random();
        let candidates = (0..RANDOM_ID_ATTEMPTS)
            .map(|_| rand::random::<u16>())
            .chain((0..=u16::MAX).map(|offset| start.wrapping_add(offset)));

        for id in candidates {
            if waiters.contains_key(&(target, id)) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            waiters.insert((target, id), tx);
            let pending = Pending {
                waiters: &self.waiters,
                target,
                id,
            };
            return Ok((pending, rx));
        }

        Err(ForwardError::TransactionIdsExhausted)
    }
}

impl Drop for Anyfrom {
    fn drop(&mut self) {
        self.reader.abort();
        tracing::trace!(key = %self.key, "closed from-socket");
    }
}

/// Deregisters an in-flight exchange when it completes or is abandoned.
struct Pending<'a> {
    waiters: &'a Waiters,
    target: SocketAddr,
    id: u16,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.remove(&(self.target, self.id));
    }
}

async fn read_replies(socket: Arc<UdpSocket>, waiters: Waiters) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "from-socket recv error");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };

        let reply = &buf[..len];
        if !dns::is_response(reply) {
            continue;
        }
        let Some(id) = dns::message_id(reply) else {
            continue;
        };

        let waiter = waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(from, id));

        match waiter {
            Some(tx) => {
                let _ = tx.send(reply.to_vec());
            }
            None => tracing::trace!(%from, id, "dropping unsolicited or late reply"),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_device(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_device(_socket: &Socket, iface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {iface} is not supported on this platform"),
    ))
}

/// From-sockets keyed by [`BindKey`].
#[derive(Default)]
pub struct AnyfromPool {
    pool: Pool<BindKey, Anyfrom>,
}

impl AnyfromPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pooled socket for `key`, created on first use.
    pub async fn get_or_create(&self, key: &BindKey) -> Result<Arc<Anyfrom>, ForwardError> {
        self.pool
            .get_or_create(key, || async { Anyfrom::bind(key.clone()) })
            .await
    }

    /// Drop `socket` from the pool after it failed; holders keep their handle.
    pub fn invalidate(&self, socket: &Arc<Anyfrom>) {
        if self.pool.invalidate(socket.key(), socket) {
            tracing::debug!(key = %socket.key(), "invalidated from-socket");
        }
    }

    /// Close sockets idle for at least `max_idle` that nobody is using.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.pool
            .evict_unused(|_, socket| socket.idle_for() >= max_idle)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
