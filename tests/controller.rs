mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use dnsgate::anyfrom::AnyfromPool;
use dnsgate::cache::DnsCache;
use dnsgate::config::Timeouts;
use dnsgate::controller::{DnsController, ResponseWriter};
use dnsgate::forwarder::Forwarder;
use dnsgate::upstream::{Upstream, UpstreamScheme};

use common::{
    FakeUpstreamBuilder, build_dns_query, build_dns_response, build_servfail_response, query_id,
};

/// Answers with the right id but a different question type.
fn answer_other_question(query: &[u8]) -> Vec<u8> {
    let mut response = build_dns_response(query);
    let qtype = query.len() - 4;
    response[qtype..qtype + 2].copy_from_slice(&28u16.to_be_bytes());
    response
}

/// Collects every response the controller writes.
struct Collector {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl ResponseWriter for Collector {
    fn write_response<'a>(
        &'a self,
        to: SocketAddr,
        response: &'a [u8],
    ) -> BoxFuture<'a, io::Result<()>> {
        let _ = self.tx.send((to, response.to_vec()));
        futures::future::ready(Ok(())).boxed()
    }
}

fn collector() -> (Arc<dyn ResponseWriter>, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collector { tx }), rx)
}

fn controller() -> Arc<DnsController> {
    let timeouts = Timeouts::new(Duration::from_secs(2), Duration::from_millis(300)).unwrap();
    let forwarder = Forwarder::new(Arc::new(AnyfromPool::new()), timeouts.dial);
    Arc::new(DnsController::new(forwarder, DnsCache::new(), timeouts))
}

fn src(port: u16) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, 100], port))
}

async fn recv(
    rx: &mut mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
) -> Option<(SocketAddr, Vec<u8>)> {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn miss_forwards_then_hit_is_served_from_cache() {
    let fake = FakeUpstreamBuilder::new().spawn().await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    controller.handle_query(
        src(12345),
        build_dns_query(0x0101, "example.com"),
        upstream.clone(),
        writer.clone(),
    );
    let (to, response) = recv(&mut rx).await.unwrap();
    assert_eq!(to, src(12345));
    assert_eq!(query_id(&response), 0x0101);
    assert_eq!(controller.cache().len(), 1);

    controller.handle_query(
        src(23456),
        build_dns_query(0x0202, "EXAMPLE.com"),
        upstream,
        writer,
    );
    let (to, cached) = recv(&mut rx).await.unwrap();
    assert_eq!(to, src(23456));
    assert_eq!(query_id(&cached), 0x0202);
    assert_eq!(&cached[2..], &response[2..]);

    assert_eq!(fake.hits.udp(), 1);
    let stats = controller.stats().snapshot_and_reset();
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.cached, 1);
}

#[tokio::test]
async fn cache_is_scoped_per_upstream() {
    let first = FakeUpstreamBuilder::new().spawn().await;
    let second = FakeUpstreamBuilder::new().spawn().await;
    let controller = controller();
    let (writer, mut rx) = collector();

    for fake in [&first, &second] {
        let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
        controller.handle_query(src(1000), build_dns_query(9, "example.com"), upstream, writer.clone());
        recv(&mut rx).await.unwrap();
    }

    assert_eq!(first.hits.udp(), 1);
    assert_eq!(second.hits.udp(), 1);
    assert_eq!(controller.cache().len(), 2);
}

#[tokio::test]
async fn failed_query_is_dropped_without_caching() {
    let fake = FakeUpstreamBuilder::new().silent_udp().spawn().await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    controller.handle_query(src(5353), build_dns_query(1, "example.com"), upstream, writer.clone());

    let res = tokio::time::timeout(Duration::from_millis(800), rx.recv()).await;
    assert!(res.is_err(), "no response expected for a failed query");
    assert!(controller.cache().is_empty());
    assert_eq!(controller.stats().snapshot_and_reset().failed, 1);
}

#[tokio::test]
async fn servfail_is_relayed_but_not_cached() {
    let fake = FakeUpstreamBuilder::new()
        .respond_with(build_servfail_response)
        .spawn()
        .await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    for id in [1u16, 2] {
        controller.handle_query(
            src(5300),
            build_dns_query(id, "flaky.example.com"),
            upstream.clone(),
            writer.clone(),
        );
        let (_, response) = recv(&mut rx).await.unwrap();
        assert_eq!(query_id(&response), id);
        assert_eq!(response[3] & 0x0F, 2);
        assert_eq!(controller.cache().len(), 0);
    }

    assert_eq!(fake.hits.udp(), 2);
}

#[tokio::test]
async fn reply_for_another_question_is_rejected() {
    let fake = FakeUpstreamBuilder::new()
        .respond_with(answer_other_question)
        .spawn()
        .await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    controller.handle_query(src(5301), build_dns_query(7, "example.com"), upstream, writer.clone());

    let res = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(res.is_err(), "mismatched answer must not be relayed");
    assert!(controller.cache().is_empty());
    assert_eq!(controller.stats().snapshot_and_reset().failed, 1);
}

#[tokio::test]
async fn malformed_query_is_ignored() {
    let fake = FakeUpstreamBuilder::new().spawn().await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, _rx) = collector();

    controller.handle_query(src(1), vec![0u8; 13], upstream, writer);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fake.hits.udp(), 0);
    assert_eq!(controller.stats().snapshot_and_reset().malformed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_queries_from_one_source_do_not_queue_behind_each_other() {
    const QUERIES: u16 = 100;
    let fake = FakeUpstreamBuilder::new()
        .delay(Duration::from_millis(200))
        .spawn()
        .await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::Udp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    for i in 0..QUERIES {
        controller.handle_query(
            src(40000),
            build_dns_query(i, &format!("host{i}.example.com")),
            upstream.clone(),
            writer.clone(),
        );
    }

    // Serially these would take 20s.
    let mut ids = Vec::new();
    for _ in 0..QUERIES {
        let (_, response) = recv(&mut rx).await.unwrap();
        ids.push(query_id(&response));
    }
    ids.sort_unstable();
    assert_eq!(ids, (0..QUERIES).collect::<Vec<_>>());
}

#[tokio::test]
async fn tcp_udp_upstream_answers_through_fallback() {
    let fake = FakeUpstreamBuilder::new().silent_udp().with_tcp().spawn().await;
    let upstream = Arc::new(Upstream::new(UpstreamScheme::TcpUdp, fake.addr));
    let controller = controller();
    let (writer, mut rx) = collector();

    controller.handle_query(src(8053), build_dns_query(0x5151, "big.example.com"), upstream, writer);

    let (_, response) = recv(&mut rx).await.unwrap();
    assert_eq!(query_id(&response), 0x5151);
    assert_eq!(fake.hits.tcp(), 1);
    assert_eq!(controller.cache().len(), 1);
}
