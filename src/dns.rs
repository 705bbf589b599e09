//! Minimal DNS wire helpers.
//!
//! Messages are otherwise treated as opaque bytes: only the header id, the
//! first question and record TTLs are ever looked at.

use std::time::Duration;

pub const HEADER_LEN: usize = 12;

/// Largest message accepted over UDP or TCP.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

/// The first question of a DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    /// Lower-cased, without the trailing dot; `.` for the root.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse the header and first question from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = message_id(data)?;
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount == 0 {
            return None;
        }

        let mut pos = HEADER_LEN;
        let mut labels = Vec::new();

        loop {
            let label_len = *data.get(pos)? as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            // Compression pointers are not valid in the first question.
            if label_len & 0xC0 != 0 || pos + label_len > data.len() {
                return None;
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
            labels.push(label.to_ascii_lowercase());
            pos += label_len;
        }

        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        let domain = if labels.is_empty() {
            ".".to_string()
        } else {
            labels.join(".")
        };

        Some(Self {
            id,
            domain,
            qtype,
            qclass,
        })
    }

    /// Whether `other` asks the same question (name, type and class).
    pub fn same_question(&self, other: &DnsQuery) -> bool {
        self.domain == other.domain && self.qtype == other.qtype && self.qclass == other.qclass
    }

    /// Copy of `cached` carrying this query's transaction id.
    pub fn response_from_cache(&self, cached: &[u8]) -> Option<Vec<u8>> {
        let mut response = cached.to_vec();
        set_message_id(&mut response, self.id).then_some(response)
    }
}

pub fn message_id(msg: &[u8]) -> Option<u16> {
    (msg.len() >= 2).then(|| u16::from_be_bytes([msg[0], msg[1]]))
}

/// Overwrite the transaction id in place. Returns `false` if `msg` is too short.
pub fn set_message_id(msg: &mut [u8], id: u16) -> bool {
    if msg.len() < 2 {
        return false;
    }
    msg[..2].copy_from_slice(&id.to_be_bytes());
    true
}

/// Whether the QR bit marks `msg` as a response.
pub fn is_response(msg: &[u8]) -> bool {
    msg.len() >= HEADER_LEN && msg[2] & 0x80 != 0
}

/// Whether the TC bit is set; truncated answers are relayed but not cached.
pub fn is_truncated(msg: &[u8]) -> bool {
    msg.len() >= HEADER_LEN && msg[2] & 0x02 != 0
}

/// Header response code (low four bits of the flags).
pub fn rcode(msg: &[u8]) -> Option<u8> {
    (msg.len() >= HEADER_LEN).then(|| msg[3] & 0x0F)
}

/// Whether a response may be cached: a complete answer that either resolved
/// the name or proved it does not exist.
pub fn is_cacheable(response: &[u8]) -> bool {
    !is_truncated(response) && matches!(rcode(response), Some(RCODE_NOERROR | RCODE_NXDOMAIN))
}

/// Minimum TTL across all records of a response, or `default` if it has none.
pub fn min_ttl(response: &[u8], default: Duration) -> Duration {
    if response.len() < HEADER_LEN {
        return default;
    }

    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
    let nscount = u16::from_be_bytes([response[8], response[9]]) as usize;
    let arcount = u16::from_be_bytes([response[10], response[11]]) as usize;
    let total_rrs = ancount + nscount + arcount;

    if total_rrs == 0 {
        return default;
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(response, pos) + 4; // QTYPE + QCLASS
    }

    let mut min_ttl = u32::MAX;

    for _ in 0..total_rrs {
        pos = skip_name(response, pos);
        if pos + 10 > response.len() {
            break;
        }

        let rtype = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let ttl = u32::from_be_bytes([
            response[pos + 4],
            response[pos + 5],
            response[pos + 6],
            response[pos + 7],
        ]);
        // OPT pseudo-records reuse the TTL field for flags.
        if rtype != 41 {
            min_ttl = min_ttl.min(ttl);
        }

        let rdlength = u16::from_be_bytes([response[pos + 8], response[pos + 9]]) as usize;
        pos += 10 + rdlength;
    }

    if min_ttl == u32::MAX {
        default
    } else {
        Duration::from_secs(min_ttl as u64)
    }
}

fn skip_name(msg: &[u8], mut pos: usize) -> usize {
    while pos < msg.len() {
        let b = msg[pos];
        if b == 0 {
            return pos + 1;
        }
        if b >= 0xC0 {
            return pos + 2;
        }
        pos += 1 + b as usize;
    }
    pos
}
