//! DNS controller: cache lookup, per-source dispatch, forwarding, reply.
//!
//! Transports hand queries to [`DnsController::handle_query`] and return
//! immediately. Cache hits are answered right away. Misses are queued on the
//! requester's serial queue, whose task spawns the actual exchange so a slow
//! upstream never holds up the next packet from the same source.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;

use crate::cache::{CacheKey, DnsCache};
use crate::config::Timeouts;
use crate::context::QueryContext;
use crate::dns::{self, DnsQuery};
use crate::error::ForwardError;
use crate::forwarder::Forwarder;
use crate::stats::Stats;
use crate::task_pool::UdpTaskPool;
use crate::upstream::Upstream;

/// Writes a response back to the requester a query came from.
pub trait ResponseWriter: Send + Sync {
    fn write_response<'a>(&'a self, to: SocketAddr, response: &'a [u8])
    -> BoxFuture<'a, io::Result<()>>;
}

pub struct DnsController {
    cache: DnsCache,
    forwarder: Forwarder,
    tasks: UdpTaskPool<SocketAddr>,
    timeouts: Timeouts,
    stats: Stats,
}

impl DnsController {
    pub fn new(forwarder: Forwarder, cache: DnsCache, timeouts: Timeouts) -> Self {
        Self {
            cache,
            forwarder,
            tasks: UdpTaskPool::new(),
            timeouts,
            stats: Stats::new(),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Answer `query` from `src` using `upstream`. Never waits on the network.
    ///
    /// Failed queries get no response; the requester's own retry logic
    /// takes over.
    pub fn handle_query(
        self: &Arc<Self>,
        src: SocketAddr,
        query: Vec<u8>,
        upstream: Arc<Upstream>,
        writer: Arc<dyn ResponseWriter>,
    ) {
        let start = Instant::now();

        let Some(parsed) = DnsQuery::parse(&query) else {
            self.stats.record_malformed();
            tracing::debug!(%src, len = query.len(), "dropping malformed query");
            return;
        };
        let key = CacheKey::new(&parsed, &upstream);

        if let Some(response) = self
            .cache
            .get(&key)
            .and_then(|entry| parsed.response_from_cache(&entry.response))
        {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = writer.write_response(src, &response).await {
                    tracing::warn!(%src, error = %e, "failed to write cached response");
                    return;
                }
                this.stats.record_cached(start.elapsed());
                tracing::debug!(
                    %src,
                    domain = %parsed.domain,
                    qtype = parsed.qtype,
                    elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "CACHED"
                );
            });
            return;
        }

        let this = self.clone();
        self.tasks.emit_task(src, move || {
            tokio::spawn(async move {
                this.forward_and_reply(src, parsed, key, query, upstream, writer, start)
                    .await;
            });
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_and_reply(
        &self,
        src: SocketAddr,
        parsed: DnsQuery,
        key: CacheKey,
        query: Vec<u8>,
        upstream: Arc<Upstream>,
        writer: Arc<dyn ResponseWriter>,
        start: Instant,
    ) {
        let ctx = QueryContext::background().with_timeout(self.timeouts.flow);

        let response = match self.forward(&ctx, &parsed, &upstream, &query).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failed();
                tracing::debug!(
                    %src,
                    %upstream,
                    domain = %parsed.domain,
                    error = %e,
                    "query failed, dropping"
                );
                return;
            }
        };

        if dns::is_cacheable(&response) {
            self.cache.put(key, self.cache.entry_for(&response));
        } else {
            tracing::trace!(
                %src,
                domain = %parsed.domain,
                rcode = dns::rcode(&response),
                "relaying uncacheable response"
            );
        }

        if let Err(e) = writer.write_response(src, &response).await {
            tracing::warn!(%src, error = %e, "failed to write response");
            return;
        }
        self.stats.record_forwarded(start.elapsed());
        tracing::debug!(
            %src,
            %upstream,
            domain = %parsed.domain,
            qtype = parsed.qtype,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "FORWARDED"
        );
    }

    async fn forward(
        &self,
        ctx: &QueryContext,
        parsed: &DnsQuery,
        upstream: &Upstream,
        query: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let response = self.forwarder.forward(ctx, upstream, query).await?;

        match DnsQuery::parse(&response) {
            Some(answer)
                if dns::is_response(&response)
                    && answer.id == parsed.id
                    && answer.same_question(parsed) =>
            {
                Ok(response)
            }
            _ => Err(ForwardError::Codec("upstream reply does not answer the query")),
        }
    }
}
