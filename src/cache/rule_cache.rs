//! Two-tier rule-set cache.
//!
//! The memory tier is a byte-budgeted LRU; the optional disk tier persists
//! entries across restarts and feeds promotion on memory misses. Both
//! tiers are TTL-aware and swept periodically. Writes to disk go through a
//! temp file and rename; multi-step disk maintenance takes an exclusive
//! lock file so concurrent processes cannot corrupt the tier.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use crate::error::{DnshieldError, Result};
use crate::rules::RuleSet;

const LOAD_TIME_SAMPLES: usize = 32;
const LOCK_FILE: &str = ".maintenance.lock";
const STALE_LOCK: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RuleCacheConfig {
    /// Memory tier budget in approximate bytes.
    pub max_memory_bytes: usize,
    /// Disk tier directory; `None` disables persistence.
    pub disk_dir: Option<PathBuf>,
    /// Disk tier budget in bytes.
    pub max_disk_bytes: u64,
    /// TTL applied when `store` is called without an explicit one, and the
    /// baseline for the freshness check in `get`.
    pub default_ttl: Duration,
    /// Expired-entry sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            disk_dir: None,
            max_disk_bytes: 128 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// One cached rule set, as stored in both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCacheEntry {
    pub source_id: String,
    pub rule_set: RuleSet,
    /// Unix seconds at fetch time; wall-clock so the disk tier survives
    /// process restarts.
    pub fetched_at: u64,
    pub ttl_secs: u64,
    pub approx_size: usize,
}

impl RuleCacheEntry {
    fn new(source_id: String, rule_set: RuleSet, ttl: Duration) -> Self {
        let approx_size = rule_set.approx_size();
        Self {
            source_id,
            rule_set,
            fetched_at: unix_now(),
            ttl_secs: ttl.as_secs(),
            approx_size,
        }
    }

    fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.fetched_at))
    }

    fn remaining_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs).saturating_sub(self.age())
    }

    fn is_expired(&self) -> bool {
        self.remaining_ttl().is_zero()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    Updated,
    Evicted,
}

/// Broadcast to interested components (status reporting, the proxy's
/// telemetry hook) whenever a source's cached rules change.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub source_id: String,
    pub kind: CacheEventKind,
}

#[derive(Debug, Default)]
struct RuleCacheStats {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    evictions: AtomicU64,
    load_times: Mutex<VecDeque<Duration>>,
}

impl RuleCacheStats {
    fn record_load_time(&self, elapsed: Duration) {
        let mut samples = self.load_times.lock();
        if samples.len() == LOAD_TIME_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }
}

/// Serializable statistics snapshot for `getStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCacheStatsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub avg_load_ms: f64,
}

#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<String, RuleCacheEntry>,
    /// LRU order, least recently used first.
    order: Vec<String>,
    total_bytes: usize,
}

impl MemoryTier {
    fn touch(&mut self, source_id: &str) {
        self.order.retain(|id| id != source_id);
        self.order.push(source_id.to_string());
    }

    fn insert(&mut self, entry: RuleCacheEntry, budget: usize) -> u64 {
        if let Some(old) = self.entries.remove(&entry.source_id) {
            self.total_bytes = self.total_bytes.saturating_sub(old.approx_size);
        }
        self.total_bytes += entry.approx_size;
        self.touch(&entry.source_id);
        self.entries.insert(entry.source_id.clone(), entry);

        let mut evicted = 0;
        while self.total_bytes > budget && self.order.len() > 1 {
            let victim = self.order.remove(0);
            if let Some(old) = self.entries.remove(&victim) {
                self.total_bytes = self.total_bytes.saturating_sub(old.approx_size);
                evicted += 1;
                trace!("Evicted rule set {} from memory tier", victim);
            }
        }
        evicted
    }

    fn remove(&mut self, source_id: &str) -> Option<RuleCacheEntry> {
        self.order.retain(|id| id != source_id);
        let entry = self.entries.remove(source_id)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.approx_size);
        Some(entry)
    }
}

pub struct RuleCache {
    config: RuleCacheConfig,
    memory: Mutex<MemoryTier>,
    stats: RuleCacheStats,
    events: broadcast::Sender<CacheEvent>,
}

impl RuleCache {
    pub fn new(config: RuleCacheConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            memory: Mutex::new(MemoryTier::default()),
            stats: RuleCacheStats::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Insert a rule set under `source_id` into the memory tier and, when
    /// persistence is enabled, the disk tier.
    pub async fn store(&self, source_id: &str, rule_set: RuleSet, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = RuleCacheEntry::new(source_id.to_string(), rule_set, ttl);

        {
            let mut memory = self.memory.lock();
            let evicted = memory.insert(entry.clone(), self.config.max_memory_bytes);
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        if let Some(dir) = &self.config.disk_dir {
            self.write_disk_entry(dir, &entry).await?;
        }

        let _ = self.events.send(CacheEvent {
            source_id: source_id.to_string(),
            kind: CacheEventKind::Updated,
        });
        debug!("Cached rule set for source {} (ttl {:?})", source_id, ttl);
        Ok(())
    }

    /// Fetch a cached rule set no staler than `max_age`.
    ///
    /// Memory first; a disk hit is promoted into memory. An entry whose
    /// remaining TTL has fallen below `default_ttl - max_age` is treated
    /// as a miss for this caller.
    pub async fn get(&self, source_id: &str, max_age: Duration) -> Option<RuleSet> {
        let fresh_enough = |entry: &RuleCacheEntry| {
            entry.remaining_ttl() >= self.config.default_ttl.saturating_sub(max_age)
        };

        enum MemoryLookup {
            Hit(RuleSet),
            Expired,
            Miss,
        }
        let looked_up = {
            let mut memory = self.memory.lock();
            let state = match memory.entries.get(source_id) {
                Some(entry) if entry.is_expired() => MemoryLookup::Expired,
                Some(entry) if fresh_enough(entry) => MemoryLookup::Hit(entry.rule_set.clone()),
                _ => MemoryLookup::Miss,
            };
            match state {
                MemoryLookup::Expired => {
                    memory.remove(source_id);
                    MemoryLookup::Miss
                }
                MemoryLookup::Hit(rule_set) => {
                    memory.touch(source_id);
                    MemoryLookup::Hit(rule_set)
                }
                MemoryLookup::Miss => MemoryLookup::Miss,
            }
        };
        if let MemoryLookup::Hit(rule_set) = looked_up {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(rule_set);
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        let dir = self.config.disk_dir.as_ref()?;
        let started = Instant::now();
        match self.read_disk_entry(dir, source_id).await {
            Some(entry) if !entry.is_expired() && fresh_enough(&entry) => {
                self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                self.stats.record_load_time(started.elapsed());
                let rule_set = entry.rule_set.clone();
                let mut memory = self.memory.lock();
                let evicted = memory.insert(entry, self.config.max_memory_bytes);
                self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
                trace!("Promoted rule set {} from disk tier", source_id);
                Some(rule_set)
            }
            _ => {
                self.stats.disk_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop a source from both tiers.
    pub async fn invalidate(&self, source_id: &str) {
        self.memory.lock().remove(source_id);
        if let Some(dir) = &self.config.disk_dir {
            let _ = fs::remove_file(entry_path(dir, source_id)).await;
        }
        let _ = self.events.send(CacheEvent {
            source_id: source_id.to_string(),
            kind: CacheEventKind::Evicted,
        });
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) {
        let ids: Vec<String> = {
            let mut memory = self.memory.lock();
            let ids = memory.entries.keys().cloned().collect();
            *memory = MemoryTier::default();
            ids
        };
        if let Some(dir) = &self.config.disk_dir {
            if let Ok(mut dir_entries) = fs::read_dir(dir).await {
                while let Ok(Some(file)) = dir_entries.next_entry().await {
                    if file.path().extension().is_some_and(|e| e == "cache") {
                        let _ = fs::remove_file(file.path()).await;
                    }
                }
            }
        }
        for source_id in ids {
            let _ = self.events.send(CacheEvent {
                source_id,
                kind: CacheEventKind::Evicted,
            });
        }
    }

    /// Hydrate the memory tier from every non-expired disk entry.
    pub async fn preload_all(&self) -> Result<usize> {
        let Some(dir) = &self.config.disk_dir else {
            return Ok(0);
        };
        let mut loaded = 0usize;
        let mut dir_entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Ok(Some(file)) = dir_entries.next_entry().await {
            if !file.path().extension().is_some_and(|e| e == "cache") {
                continue;
            }
            match decode_entry(&fs::read(file.path()).await?) {
                Ok(entry) if !entry.is_expired() => {
                    let mut memory = self.memory.lock();
                    memory.insert(entry, self.config.max_memory_bytes);
                    loaded += 1;
                }
                Ok(_) => {
                    let _ = fs::remove_file(file.path()).await;
                }
                Err(e) => {
                    warn!("Removing corrupted cache file {:?}: {}", file.path(), e);
                    let _ = fs::remove_file(file.path()).await;
                }
            }
        }

        info!("Preloaded {} rule sets from disk tier", loaded);
        Ok(loaded)
    }

    /// Remove expired entries from both tiers and enforce the disk budget.
    pub async fn sweep(&self) -> Result<()> {
        {
            let mut memory = self.memory.lock();
            let expired: Vec<String> = memory
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                memory.remove(&id);
                debug!("Swept expired rule set {} from memory tier", id);
            }
        }

        let Some(dir) = &self.config.disk_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir).await?;
        let _guard = MaintenanceLock::acquire(dir).await?;

        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut dir_entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Ok(Some(file)) = dir_entries.next_entry().await {
            let path = file.path();
            if !path.extension().is_some_and(|e| e == "cache") {
                continue;
            }
            match decode_entry(&fs::read(&path).await?) {
                Ok(entry) if entry.is_expired() => {
                    let _ = fs::remove_file(&path).await;
                }
                Ok(_) => {
                    if let Ok(meta) = file.metadata().await {
                        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
                        files.push((path, meta.len(), mtime));
                    }
                }
                Err(_) => {
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        // Enforce the disk budget, oldest first
        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, len, _) in files {
            if total <= self.config.max_disk_bytes {
                break;
            }
            let _ = fs::remove_file(&path).await;
            total = total.saturating_sub(len);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Start the periodic sweep task; it runs until the cache is dropped
    /// elsewhere and the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.sweep().await {
                    warn!("Rule cache sweep failed: {}", e);
                }
            }
        })
    }

    pub fn stats(&self) -> RuleCacheStatsSnapshot {
        let memory = self.memory.lock();
        let memory_hits = self.stats.memory_hits.load(Ordering::Relaxed);
        let memory_misses = self.stats.memory_misses.load(Ordering::Relaxed);
        let disk_hits = self.stats.disk_hits.load(Ordering::Relaxed);
        let total = memory_hits + memory_misses;
        let avg_load_ms = {
            let samples = self.stats.load_times.lock();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>()
                    / samples.len() as f64
            }
        };

        RuleCacheStatsSnapshot {
            memory_hits,
            memory_misses,
            disk_hits,
            disk_misses: self.stats.disk_misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                (memory_hits + disk_hits) as f64 / total as f64
            },
            memory_entries: memory.entries.len(),
            memory_bytes: memory.total_bytes,
            avg_load_ms,
        }
    }

    async fn write_disk_entry(&self, dir: &Path, entry: &RuleCacheEntry) -> Result<()> {
        fs::create_dir_all(dir).await?;
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| DnshieldError::Corrupted(e.to_string()))?;

        let path = entry_path(dir, &entry.source_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_disk_entry(&self, dir: &Path, source_id: &str) -> Option<RuleCacheEntry> {
        let bytes = fs::read(entry_path(dir, source_id)).await.ok()?;
        match decode_entry(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Corrupted disk entry for {}: {}", source_id, e);
                let _ = fs::remove_file(entry_path(dir, source_id)).await;
                None
            }
        }
    }
}

fn decode_entry(bytes: &[u8]) -> Result<RuleCacheEntry> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(entry, _)| entry)
        .map_err(|e| DnshieldError::Corrupted(e.to_string()))
}

/// Filename-safe encoding of a source id: the readable prefix plus a hash
/// suffix so distinct ids can never collide after sanitization.
fn entry_path(dir: &Path, source_id: &str) -> PathBuf {
    let safe: String = source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source_id.hash(&mut hasher);
    dir.join(format!("{}-{:016x}.cache", safe, hasher.finish()))
}

/// Exclusive lock file around multi-step disk maintenance. Stale locks
/// (crashed process) are broken after ten minutes.
struct MaintenanceLock {
    path: PathBuf,
}

impl MaintenanceLock {
    async fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let stale = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime.elapsed().unwrap_or_default() > STALE_LOCK)
                    .unwrap_or(true);
                if stale {
                    let _ = std::fs::remove_file(&path);
                    std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&path)
                        .map_err(|e| DnshieldError::LockFailed(e.to_string()))?;
                    Ok(Self { path })
                } else {
                    Err(DnshieldError::LockFailed(format!("{:?} held", path)))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
