#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

pub const MAX_DNS_PACKET_SIZE: usize = 4096;

pub fn build_dns_query(query_id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);

    // Header (12 bytes)
    packet.extend_from_slice(&query_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00]); // Answer RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Authority RRs: 0
    packet.extend_from_slice(&[0x00, 0x00]); // Additional RRs: 0

    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00); // Root label

    packet.extend_from_slice(&[0x00, 0x01]); // Type: A
    packet.extend_from_slice(&[0x00, 0x01]); // Class: IN

    packet
}

/// Answer `query` with one A record (93.184.216.34, TTL 300).
pub fn build_dns_response(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81; // Response flag
    response[3] = 0x80; // Recursion available
    response[6] = 0x00; // Answer count
    response[7] = 0x01;
    response.extend_from_slice(&[0xc0, 0x0c]); // Name pointer
    response.extend_from_slice(&[0x00, 0x01]); // Type: A
    response.extend_from_slice(&[0x00, 0x01]); // Class: IN
    response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // TTL: 300
    response.extend_from_slice(&[0x00, 0x04]); // Data length: 4
    response.extend_from_slice(&[93, 184, 216, 34]);
    response
}

/// Answer `query` with SERVFAIL and no records.
pub fn build_servfail_response(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81;
    response[3] = 0x82; // RA, RCODE 2
    response
}

pub fn query_id(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[0], msg[1]])
}

/// Counts packets an upstream saw on each transport.
#[derive(Default)]
pub struct Hits {
    pub udp: AtomicUsize,
    pub tcp: AtomicUsize,
    udp_ids: Mutex<Vec<u16>>,
}

impl Hits {
    pub fn udp(&self) -> usize {
        self.udp.load(Ordering::SeqCst)
    }

    pub fn tcp(&self) -> usize {
        self.tcp.load(Ordering::SeqCst)
    }

    /// Transaction ids of the UDP queries received, in arrival order.
    pub fn udp_ids(&self) -> Vec<u16> {
        self.udp_ids.lock().unwrap().clone()
    }
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub hits: Arc<Hits>,
}

/// Builder for a loopback upstream serving UDP and/or TCP on one port.
pub struct FakeUpstreamBuilder {
    udp_answers: bool,
    tcp: bool,
    delay: Duration,
    respond: fn(&[u8]) -> Vec<u8>,
}

impl FakeUpstreamBuilder {
    pub fn new() -> Self {
        Self {
            udp_answers: true,
            tcp: false,
            delay: Duration::ZERO,
            respond: build_dns_response,
        }
    }

    /// Receive UDP queries but never answer them.
    pub fn silent_udp(mut self) -> Self {
        self.udp_answers = false;
        self
    }

    /// Also answer length-prefixed queries over TCP on the same port.
    pub fn with_tcp(mut self) -> Self {
        self.tcp = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Build replies with `respond` instead of a single A record.
    pub fn respond_with(mut self, respond: fn(&[u8]) -> Vec<u8>) -> Self {
        self.respond = respond;
        self
    }

    pub async fn spawn(self) -> FakeUpstream {
        let hits = Arc::new(Hits::default());
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = udp.local_addr().unwrap();

        {
            let hits = hits.clone();
            let answers = self.udp_answers;
            let delay = self.delay;
            let respond = self.respond;
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
                loop {
                    let Ok((len, from)) = udp.recv_from(&mut buf).await else {
                        return;
                    };
                    hits.udp.fetch_add(1, Ordering::SeqCst);
                    hits.udp_ids.lock().unwrap().push(query_id(&buf[..len]));
                    if !answers {
                        continue;
                    }
                    let response = respond(&buf[..len]);
                    let udp = udp.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = udp.send_to(&response, from).await;
                    });
                }
            });
        }

        if self.tcp {
            let listener = TcpListener::bind(addr).await.unwrap();
            let hits = hits.clone();
            let delay = self.delay;
            let respond = self.respond;
            tokio::spawn(async move {
                loop {
                    let Ok((mut conn, _)) = listener.accept().await else {
                        return;
                    };
                    let hits = hits.clone();
                    tokio::spawn(async move {
                        let mut prefix = [0u8; 2];
                        if conn.read_exact(&mut prefix).await.is_err() {
                            return;
                        }
                        let mut query = vec![0u8; u16::from_be_bytes(prefix) as usize];
                        if conn.read_exact(&mut query).await.is_err() {
                            return;
                        }
                        hits.tcp.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;

                        let response = respond(&query);
                        let mut frame = (response.len() as u16).to_be_bytes().to_vec();
                        frame.extend_from_slice(&response);
                        let _ = conn.write_all(&frame).await;
                    });
                }
            });
        }

        FakeUpstream { addr, hits }
    }
}

/// A loopback address nothing listens on over TCP.
pub async fn closed_tcp_port_with_silent_udp() -> FakeUpstream {
    FakeUpstreamBuilder::new().silent_udp().spawn().await
}
