//! TTL-clamped DNS response cache.
//!
//! Entries are whole response packets keyed by `(domain, qtype)`, with the
//! domain lowercased. TTLs are clamped into the `[30, 300]` window no
//! matter what upstream said; per-domain policies can veto caching or pin
//! a custom TTL, and a bypass list skips the cache entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::rules::wildcard_matches;
use crate::wire::{QueryType, TTL_CEILING, TTL_FLOOR};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Per-domain cache policy actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicyAction {
    /// Do not cache responses for matching domains.
    Never,
    /// Cache at the maximum TTL.
    Always,
    /// Cache at this TTL (clamped like everything else).
    Custom(u32),
}

/// A domain pattern (`example.com` or `*.okta.com`) with its policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCachePolicy {
    pub pattern: String,
    pub action: CachePolicyAction,
}

impl DomainCachePolicy {
    fn matches(&self, domain: &str) -> bool {
        match self.pattern.strip_prefix("*.") {
            Some(suffix) => wildcard_matches(
                &suffix.to_lowercase(),
                domain,
                crate::rules::WildcardMode::IncludeRoot,
            ),
            None => domain == self.pattern.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResponseKey {
    domain: String,
    qtype: QueryType,
}

impl ResponseKey {
    fn new(domain: &str, qtype: QueryType) -> Self {
        Self {
            domain: domain.to_lowercase(),
            qtype,
        }
    }
}

#[derive(Debug, Clone)]
struct ResponseEntry {
    response_bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct ResponseCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expired_evictions: AtomicU64,
}

/// Serializable statistics snapshot for `getStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expired_evictions: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct DnsResponseCache {
    entries: DashMap<ResponseKey, ResponseEntry>,
    max_entries: usize,
    /// Insertion order for LRU eviction.
    order: Mutex<Vec<ResponseKey>>,
    policies: RwLock<Vec<DomainCachePolicy>>,
    bypass_patterns: RwLock<Vec<String>>,
    stats: ResponseCacheStats,
}

impl DnsResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            order: Mutex::new(Vec::new()),
            policies: RwLock::new(Vec::new()),
            bypass_patterns: RwLock::new(Vec::new()),
            stats: ResponseCacheStats::default(),
        }
    }

    /// Replace the per-domain policy table and bypass list (configuration
    /// reload path).
    pub fn set_policies(&self, policies: Vec<DomainCachePolicy>, bypass: Vec<String>) {
        *self.policies.write() = policies;
        *self.bypass_patterns.write() = bypass;
    }

    /// Whether the cache must be skipped entirely for this domain.
    pub fn is_bypassed(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.bypass_patterns.read().iter().any(|pattern| {
            match pattern.strip_prefix("*.") {
                Some(suffix) => wildcard_matches(
                    &suffix.to_lowercase(),
                    &domain,
                    crate::rules::WildcardMode::IncludeRoot,
                ),
                None => domain == pattern.to_lowercase(),
            }
        })
    }

    /// The TTL this domain's responses are cached at, or `None` when the
    /// policy forbids caching.
    fn effective_ttl(&self, domain: &str, upstream_ttl: u32) -> Option<u32> {
        let policy = self
            .policies
            .read()
            .iter()
            .find(|p| p.matches(domain))
            .map(|p| p.action);

        match policy {
            Some(CachePolicyAction::Never) => None,
            Some(CachePolicyAction::Always) => Some(TTL_CEILING),
            Some(CachePolicyAction::Custom(ttl)) => Some(ttl.clamp(TTL_FLOOR, TTL_CEILING)),
            None => Some(upstream_ttl.clamp(TTL_FLOOR, TTL_CEILING)),
        }
    }

    /// Cache a response. Returns the TTL it was stored with, or `None`
    /// when policy or bypass prevented caching.
    pub fn insert(
        &self,
        domain: &str,
        qtype: QueryType,
        response_bytes: Vec<u8>,
        upstream_ttl: u32,
    ) -> Option<u32> {
        let key = ResponseKey::new(domain, qtype);
        if self.is_bypassed(&key.domain) {
            trace!("Cache bypassed for {}", key.domain);
            return None;
        }
        let ttl = self.effective_ttl(&key.domain, upstream_ttl)?;

        if self.entries.len() >= self.max_entries {
            self.evict_lru();
        }

        self.entries.insert(
            key.clone(),
            ResponseEntry {
                response_bytes,
                expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        {
            let mut order = self.order.lock();
            order.retain(|k| k != &key);
            order.push(key.clone());
        }

        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        debug!("Cached response for {} ({:?}, ttl {}s)", key.domain, qtype, ttl);
        Some(ttl)
    }

    /// A non-expired cached response, if present. Expired entries are
    /// purged lazily here and by the periodic sweep.
    pub fn get(&self, domain: &str, qtype: QueryType) -> Option<Vec<u8>> {
        let key = ResponseKey::new(domain, qtype);
        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > Instant::now() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!("Response cache hit for {}", key.domain);
                return Some(entry.response_bytes.clone());
            }
            drop(entry);
            self.entries.remove(&key);
            self.order.lock().retain(|k| k != &key);
            self.stats.expired_evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove all expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<ResponseKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        if expired.is_empty() {
            return;
        }
        let mut order = self.order.lock();
        for key in &expired {
            self.entries.remove(key);
            order.retain(|k| k != key);
        }
        self.stats
            .expired_evictions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        debug!("Swept {} expired responses", expired.len());
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().clear();
        debug!("Response cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> DnsCacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        DnsCacheStatsSnapshot {
            hits,
            misses,
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired_evictions: self.stats.expired_evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    fn evict_lru(&self) {
        let victim = {
            let mut order = self.order.lock();
            if order.is_empty() { None } else { Some(order.remove(0)) }
        };
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("Evicted LRU response for {}", key.domain);
        }
    }
}

impl Default for DnsResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
