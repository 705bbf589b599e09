//! DNS response cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use crate::dns::{self, DnsQuery};
use crate::upstream::Upstream;

/// Normalized identity of a question, scoped to the upstream that answered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    pub scope: String,
}

impl CacheKey {
    pub fn new(query: &DnsQuery, upstream: &Upstream) -> Self {
        Self {
            domain: query.domain.clone(),
            qtype: query.qtype,
            qclass: query.qclass,
            scope: upstream.to_string(),
        }
    }
}

/// A cached answer. Entries are replaced whole, never edited.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: Vec<u8>,
    pub inserted_at: Instant,
    pub deadline: Instant,
}

impl CacheEntry {
    pub fn new(response: Vec<u8>, ttl: Duration) -> Self {
        let inserted_at = Instant::now();
        Self {
            response,
            inserted_at,
            deadline: inserted_at + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// TTL-based DNS cache behind a single lock.
pub struct DnsCache {
    entries: RwLock<FxHashMap<CacheKey, CacheEntry>>,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_ttl_bounds(Duration::from_secs(60), Duration::from_secs(86400))
    }

    pub fn with_ttl_bounds(min_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            min_ttl,
            max_ttl: max_ttl.max(min_ttl),
        }
    }

    /// Look up an unexpired entry. Expired entries read as a miss and stay
    /// in place until the next `put`.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Store `entry`, replacing any previous one, and drop expired entries.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| !e.is_expired(now));
        entries.insert(key, entry);
    }

    /// Build an entry for `response` with its TTL clamped to the cache bounds.
    pub fn entry_for(&self, response: &[u8]) -> CacheEntry {
        let ttl = dns::min_ttl(response, self.min_ttl).clamp(self.min_ttl, self.max_ttl);
        CacheEntry::new(response.to_vec(), ttl)
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
