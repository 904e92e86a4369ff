//! The live request path: receive, parse, classify, consult caches and
//! rules, then synthesize or forward.
//!
//! Each flow is one task on the worker pool, capped by a semaphore. The
//! caches and rule database are shared handles; response caching happens
//! after the client reply has been sent so clients never wait on cache
//! writes.

pub mod classify;

pub use classify::{QueryOrigin, classify};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cache::DnsResponseCache;
use crate::config::Preferences;
use crate::error::Result;
use crate::rules::{RuleDatabase, Verdict, WildcardMode, resolve};
use crate::wire::{
    self, DnsQuery, QueryType, RCODE_NOERROR, RCODE_SERVFAIL, build_blocked_response,
    build_formerr_raw, build_rcode_response, parse_query, parse_response, update_ttl,
};

/// Settings the proxy re-reads on configuration reload.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub upstream_servers: Vec<SocketAddr>,
    pub vpn_resolvers: Vec<IpNet>,
    pub enable_chain_preservation: bool,
    pub upstream_timeout: Duration,
    pub wildcard_mode: WildcardMode,
}

impl From<&Preferences> for ProxySettings {
    fn from(prefs: &Preferences) -> Self {
        Self {
            upstream_servers: prefs.upstream_servers.clone(),
            vpn_resolvers: prefs.vpn_resolvers.clone(),
            enable_chain_preservation: prefs.enable_chain_preservation,
            upstream_timeout: prefs.upstream_timeout,
            wildcard_mode: prefs.wildcard_mode,
        }
    }
}

/// What happened to a flow; broadcast for telemetry consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    CacheHit,
    Blocked,
    Forwarded,
    ServedStale,
    Failed,
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub domain: String,
    pub qtype: QueryType,
    pub outcome: FlowOutcome,
}

#[derive(Debug, Default)]
struct ProxyCounters {
    queries: AtomicU64,
    blocked: AtomicU64,
    forwarded: AtomicU64,
    cache_hits: AtomicU64,
    servfails: AtomicU64,
    formerrs: AtomicU64,
}

/// Serializable counters snapshot for `getStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    pub queries: u64,
    pub blocked: u64,
    pub forwarded: u64,
    pub cache_hits: u64,
    pub servfails: u64,
    pub formerrs: u64,
}

/// A fully-processed flow: the bytes to send back, plus a cache write to
/// perform after the reply is out the door.
struct FlowReply {
    bytes: Vec<u8>,
    cache_insert: Option<(String, QueryType, Vec<u8>, u32)>,
}

pub struct DnsProxy {
    settings: RwLock<ProxySettings>,
    db: Arc<RuleDatabase>,
    dns_cache: Arc<DnsResponseCache>,
    counters: ProxyCounters,
    /// Forward everything without rule evaluation (cache still applies).
    bypass: AtomicBool,
    /// Serve cache-or-SERVFAIL without touching the network.
    offline: AtomicBool,
    events: broadcast::Sender<QueryEvent>,
}

impl DnsProxy {
    pub fn new(prefs: &Preferences, db: Arc<RuleDatabase>, dns_cache: Arc<DnsResponseCache>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            settings: RwLock::new(ProxySettings::from(prefs)),
            db,
            dns_cache,
            counters: ProxyCounters::default(),
            bypass: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    pub fn set_bypass(&self, enabled: bool) {
        self.bypass.store(enabled, Ordering::Relaxed);
        info!("Bypass mode {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
        info!("Offline mode {}", if offline { "enabled" } else { "disabled" });
    }

    pub fn apply_settings(&self, settings: ProxySettings) {
        *self.settings.write() = settings;
        info!("Proxy settings reloaded");
    }

    pub fn stats(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            queries: self.counters.queries.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            servfails: self.counters.servfails.load(Ordering::Relaxed),
            formerrs: self.counters.formerrs.load(Ordering::Relaxed),
        }
    }

    /// UDP server loop with graceful shutdown.
    pub async fn run(
        self: Arc<Self>,
        socket: UdpSocket,
        max_concurrent: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        info!("DNS proxy listening on {:?}", socket.local_addr());

        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("DNS proxy received shutdown signal");
                    break;
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            error!("UDP receive failed: {}", e);
                            continue;
                        }
                    };

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max concurrent flows reached, dropping query from {}", src);
                            continue;
                        }
                    };

                    let proxy = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    let raw = buf[..len].to_vec();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let reply = proxy.handle_flow(&raw, src).await;
                        if let Some(reply) = reply {
                            if let Err(e) = socket.send_to(&reply.bytes, src).await {
                                error!("Failed to send reply to {}: {}", src, e);
                                return;
                            }
                            // Cache write strictly after the client reply
                            if let Some((domain, qtype, bytes, ttl)) = reply.cache_insert {
                                proxy.dns_cache.insert(&domain, qtype, bytes, ttl);
                            }
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Process one flow end to end. Returns `None` only when the packet
    /// is too mangled to even echo a transaction ID at.
    async fn handle_flow(&self, raw: &[u8], src: SocketAddr) -> Option<FlowReply> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let query = match parse_query(raw) {
            Ok(query) => query,
            Err(e) => {
                debug!("Rejected packet from {}: {}", src, e);
                self.counters.formerrs.fetch_add(1, Ordering::Relaxed);
                return build_formerr_raw(raw).map(|bytes| FlowReply {
                    bytes,
                    cache_insert: None,
                });
            }
        };

        let flow_id = Uuid::new_v4();
        trace!(
            "Flow {}: {} {:?} from {}",
            flow_id, query.domain, query.qtype, src
        );

        let (origin, settings) = {
            let settings = self.settings.read();
            (
                classify(src, &settings.vpn_resolvers, settings.enable_chain_preservation),
                settings.clone(),
            )
        };

        // Cache first; bypass and offline modes both still consult it
        if !self.dns_cache.is_bypassed(&query.domain) {
            if let Some(mut bytes) = self.dns_cache.get(&query.domain, query.qtype) {
                bytes[0..2].copy_from_slice(&query.id.to_be_bytes());
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.emit(&query, FlowOutcome::CacheHit);
                return Some(FlowReply {
                    bytes,
                    cache_insert: None,
                });
            }
        }

        if self.offline.load(Ordering::Relaxed) {
            debug!("Flow {}: offline and not cached, answering SERVFAIL", flow_id);
            return Some(self.servfail(&query));
        }

        if !self.bypass.load(Ordering::Relaxed) {
            match self.evaluate(&query.domain, settings.wildcard_mode) {
                Verdict::Block(rule) => {
                    debug!(
                        "Flow {}: blocked {} by {:?} rule '{}'",
                        flow_id, query.domain, rule.kind, rule.domain
                    );
                    self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                    self.emit(&query, FlowOutcome::Blocked);
                    return Some(FlowReply {
                        bytes: build_blocked_response(&query),
                        cache_insert: None,
                    });
                }
                Verdict::Allow(rule) => {
                    trace!("Flow {}: allowed by rule '{}'", flow_id, rule.domain);
                }
                Verdict::Unknown => {}
            }
        }

        self.forward(&query, origin, &settings).await
    }

    fn evaluate(&self, domain: &str, mode: WildcardMode) -> Verdict {
        match self.db.lookup(domain, mode) {
            Ok(matching) => resolve(&matching),
            Err(e) => {
                // A broken database never breaks resolution
                warn!("Rule lookup failed for {}: {}", domain, e);
                Verdict::Unknown
            }
        }
    }

    /// Forward upstream and shape the reply. Chain-preserved flows go
    /// back to their originating resolver with no failover; standard
    /// flows walk the upstream list.
    async fn forward(
        &self,
        query: &DnsQuery,
        origin: QueryOrigin,
        settings: &ProxySettings,
    ) -> Option<FlowReply> {
        let targets: Vec<SocketAddr> = match origin {
            QueryOrigin::ChainResolver(addr) => vec![addr],
            QueryOrigin::Standard => settings.upstream_servers.clone(),
        };

        for target in &targets {
            match self.query_upstream(&query.raw, *target, settings.upstream_timeout).await {
                Ok(bytes) => {
                    let response = match parse_response(&bytes) {
                        Ok(response) => response,
                        Err(e) => {
                            warn!("Malformed upstream response from {}: {}", target, e);
                            return Some(self.servfail(query));
                        }
                    };

                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    self.emit(query, FlowOutcome::Forwarded);

                    // Only clean NOERROR answers are cached; everything is
                    // passed through either way
                    if response.rcode == RCODE_NOERROR && response.answer_count > 0 {
                        let rewritten = match update_ttl(&bytes, response.min_ttl) {
                            Ok(rewritten) => rewritten,
                            Err(_) => bytes,
                        };
                        let clamped = response
                            .min_ttl
                            .clamp(wire::TTL_FLOOR, wire::TTL_CEILING);
                        return Some(FlowReply {
                            bytes: rewritten.clone(),
                            cache_insert: Some((
                                query.domain.clone(),
                                query.qtype,
                                rewritten,
                                clamped,
                            )),
                        });
                    }
                    return Some(FlowReply {
                        bytes,
                        cache_insert: None,
                    });
                }
                Err(e) => {
                    debug!("Upstream {} failed: {}", target, e);
                    if origin.enforces_original_resolver() {
                        break;
                    }
                }
            }
        }

        Some(self.servfail(query))
    }

    async fn query_upstream(
        &self,
        raw: &[u8],
        target: SocketAddr,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        socket.send(raw).await?;

        let mut buf = vec![0u8; 4096];
        let len = timeout(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| crate::error::DnshieldError::Timeout)??;
        buf.truncate(len);
        Ok(buf)
    }

    fn servfail(&self, query: &DnsQuery) -> FlowReply {
        self.counters.servfails.fetch_add(1, Ordering::Relaxed);
        self.emit(query, FlowOutcome::Failed);
        FlowReply {
            bytes: build_rcode_response(query, RCODE_SERVFAIL),
            cache_insert: None,
        }
    }

    fn emit(&self, query: &DnsQuery, outcome: FlowOutcome) {
        let _ = self.events.send(QueryEvent {
            domain: query.domain.clone(),
            qtype: query.qtype,
            outcome,
        });
    }

    /// Process a single packet and return the reply bytes, performing the
    /// deferred cache write inline. Exposed for integration tests and
    /// non-UDP transports.
    pub async fn process_packet(&self, raw: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        let reply = self.handle_flow(raw, src).await?;
        if let Some((domain, qtype, bytes, ttl)) = reply.cache_insert {
            self.dns_cache.insert(&domain, qtype, bytes, ttl);
        }
        Some(reply.bytes)
    }
}
