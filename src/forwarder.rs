//! Forwarding one query to one upstream.
//!
//! A query gets at most two attempts: the first over the transport the
//! upstream's scheme selects, and one TCP retry when a UDP attempt of a
//! `tcp+udp` upstream times out. Each attempt runs under its own dial
//! timeout nested inside the caller's context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpSocket, TcpStream};

use crate::anyfrom::AnyfromPool;
use crate::context::QueryContext;
use crate::dial::{self, DialArgument, IpVersion, L4Proto};
use crate::error::ForwardError;
use crate::stream::send_stream_dns;
use crate::upstream::Upstream;

pub struct Forwarder {
    pool: Arc<AnyfromPool>,
    dial_timeout: Duration,
    interface: Option<Arc<str>>,
}

impl Forwarder {
    pub fn new(pool: Arc<AnyfromPool>, dial_timeout: Duration) -> Self {
        Self {
            pool,
            dial_timeout,
            interface: None,
        }
    }

    /// Bind from-sockets to `interface` instead of the default route.
    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface.map(Arc::from);
        self
    }

    pub fn pool(&self) -> &Arc<AnyfromPool> {
        &self.pool
    }

    /// Resolve `msg` against `upstream`, returning the raw response.
    ///
    /// On a failed TCP fallback both errors are returned, UDP first.
    pub async fn forward(
        &self,
        ctx: &QueryContext,
        upstream: &Upstream,
        msg: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let arg = dial::resolve(upstream, L4Proto::Udp, self.interface.as_ref());

        let err = match self.attempt(ctx, &arg, msg).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        // The caller gave up; the attempt error is only a symptom.
        if let Some(ctx_err) = ctx.err() {
            return Err(ctx_err);
        }

        let Some(fallback) = dial::tcp_fallback(upstream, &arg, &err) else {
            return Err(err);
        };
        tracing::debug!(%upstream, error = %err, "udp attempt timed out, falling back to tcp");

        match self.attempt(ctx, &fallback, msg).await {
            Ok(response) => Ok(response),
            Err(tcp_err) => Err(ForwardError::Joined(vec![err, tcp_err])),
        }
    }

    async fn attempt(
        &self,
        ctx: &QueryContext,
        arg: &DialArgument,
        msg: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let attempt_ctx = ctx.with_timeout(self.dial_timeout);
        if let Some(err) = attempt_ctx.err() {
            return Err(err);
        }
        let start = Instant::now();

        let res = match arg.l4proto {
            L4Proto::Udp => self.exchange_udp(&attempt_ctx, arg, msg).await,
            L4Proto::Tcp => exchange_tcp(&attempt_ctx, arg, msg).await,
        };

        tracing::trace!(
            target_addr = %arg.target,
            proto = arg.l4proto.as_str(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            ok = res.is_ok(),
            "dial attempt finished"
        );
        res
    }

    async fn exchange_udp(
        &self,
        ctx: &QueryContext,
        arg: &DialArgument,
        msg: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let socket = self.pool.get_or_create(&arg.bind).await?;

        let res = socket.exchange(ctx, arg.target, msg).await;
        // A socket that failed for reasons other than the deadline is not
        // handed to new queries again.
        if let Err(ForwardError::Io(_) | ForwardError::ReaderClosed) = &res {
            self.pool.invalidate(&socket);
        }
        res
    }
}

async fn exchange_tcp(
    ctx: &QueryContext,
    arg: &DialArgument,
    msg: &[u8],
) -> Result<Vec<u8>, ForwardError> {
    let mut stream = ctx.run(connect_tcp(arg)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(target_addr = %arg.target, error = %e, "failed to set TCP_NODELAY");
    }

    send_stream_dns(ctx, &mut stream, msg).await
}

async fn connect_tcp(arg: &DialArgument) -> Result<TcpStream, ForwardError> {
    let socket = match arg.ip_version {
        IpVersion::V4 => TcpSocket::new_v4()?,
        IpVersion::V6 => TcpSocket::new_v6()?,
    };
    if let Some(iface) = &arg.bind.interface {
        bind_device(&socket, iface)?;
    }
    Ok(socket.connect(arg.target).await?)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_device(socket: &TcpSocket, iface: &str) -> std::io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_device(_socket: &TcpSocket, iface: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("binding to interface {iface} is not supported on this platform"),
    ))
}
