//! Manifest discovery, include resolution and merging.
//!
//! Identifiers are tried along a fallback chain (client identifier,
//! device serial, then the literal `"default"`); auth and not-found
//! responses fall through to the next candidate. Resolved documents are
//! cached on disk and served stale when the network is down. Includes are
//! walked depth-first with a visited set, so cyclic include graphs
//! terminate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{ManifestFormat, Preferences};
use crate::error::{DnshieldError, Result};

use super::condition::{EvaluationContext, evaluate};
use super::disk_cache::{ManifestDiskCache, MANIFEST_CACHE_TTL};
use super::fetch::{ManifestFetch, RetryPolicy, fetch_with_retry};
use super::{ManagedRules, Manifest, RuleFeed, parse_manifest};

/// The merged result of one resolution pass: the root manifest plus its
/// include closure and every conditional item whose predicate held.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedManifest {
    pub root_identifier: String,
    pub managed_rules: ManagedRules,
    /// Managed rules contributed by conditional items that carry their
    /// own priority: `(domain, blocked, priority)`.
    pub prioritized_managed: Vec<(String, bool, u32)>,
    pub rule_feeds: Vec<RuleFeed>,
    /// Identifiers merged, in include order.
    pub included: Vec<String>,
    /// True when any document in the closure was served past its TTL.
    pub was_expired: bool,
}

impl ResolvedManifest {
    fn merge_managed(&mut self, rules: &ManagedRules) {
        for domain in &rules.block {
            if !self.managed_rules.block.contains(domain) {
                self.managed_rules.block.push(domain.clone());
            }
        }
        for domain in &rules.allow {
            if !self.managed_rules.allow.contains(domain) {
                self.managed_rules.allow.push(domain.clone());
            }
        }
    }

    /// Merge one feed. Feeds are keyed by id; in include order a later
    /// feed replaces an earlier one unless the earlier one carries a
    /// strictly higher priority.
    fn merge_feed(&mut self, feed: &RuleFeed) {
        match self.rule_feeds.iter_mut().find(|f| f.id == feed.id) {
            Some(existing) => {
                if feed.priority >= existing.priority {
                    *existing = feed.clone();
                }
            }
            None => self.rule_feeds.push(feed.clone()),
        }
    }
}

pub struct ManifestResolver {
    fetcher: Arc<dyn ManifestFetch>,
    disk_cache: ManifestDiskCache,
    retry: RetryPolicy,
    base_url: Option<String>,
    format: ManifestFormat,
    local_dirs: Vec<PathBuf>,
    client_identifier: Option<String>,
    manifest_identifier: Option<String>,
    device_serial: Option<String>,
    /// Identifiers whose last document failed to parse, with the failure
    /// time; not refetched for one cache TTL.
    poison: DashMap<String, Instant>,
}

impl ManifestResolver {
    pub fn new(prefs: &Preferences, fetcher: Arc<dyn ManifestFetch>) -> Self {
        Self {
            fetcher,
            disk_cache: ManifestDiskCache::new(prefs.manifest_cache_dir()),
            retry: RetryPolicy::from(prefs),
            base_url: prefs.manifest_base_url().map(String::from),
            format: prefs.manifest_format,
            local_dirs: prefs.local_manifest_dirs.clone(),
            client_identifier: prefs.client_identifier.clone(),
            manifest_identifier: prefs.manifest_identifier.clone(),
            device_serial: prefs.device_serial.clone(),
            poison: DashMap::new(),
        }
    }

    /// Override the disk cache location (the default comes from the
    /// application-support directory preference).
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.disk_cache = ManifestDiskCache::new(dir);
        self
    }

    /// Replace the disk cache wholesale, e.g. to adjust its TTL.
    pub fn with_disk_cache(mut self, cache: ManifestDiskCache) -> Self {
        self.disk_cache = cache;
        self
    }

    /// The ordered identifier candidates: the configured identifier (with
    /// the legacy preference as an alias), the device serial when it
    /// differs, then the literal `"default"`.
    pub fn identifier_chain(&self) -> Vec<String> {
        let initial = self
            .client_identifier
            .clone()
            .or_else(|| self.manifest_identifier.clone())
            .or_else(|| self.device_serial.clone())
            .unwrap_or_else(|| "default".to_string());

        let mut chain = vec![initial.clone()];
        if let Some(serial) = &self.device_serial {
            if *serial != initial {
                chain.push(serial.clone());
            }
        }
        if !chain.contains(&"default".to_string()) {
            chain.push("default".to_string());
        }
        chain
    }

    /// Resolve the full manifest tree, walking the identifier chain until
    /// a root manifest is found.
    pub async fn resolve(&self, ctx: &EvaluationContext) -> Result<ResolvedManifest> {
        self.resolve_with(ctx, false).await
    }

    /// Like [`resolve`](Self::resolve), but with `force` set every
    /// document is re-fetched even when its disk cache entry is fresh.
    pub async fn resolve_with(
        &self,
        ctx: &EvaluationContext,
        force: bool,
    ) -> Result<ResolvedManifest> {
        let mut last_err =
            DnshieldError::ManifestInvalid("no manifest identifier candidates".into());

        for id in self.identifier_chain() {
            match self.resolve_tree(&id, ctx, force).await {
                Ok(resolved) => {
                    info!(
                        "Resolved manifest '{}' ({} feeds, {} block / {} allow managed rules)",
                        id,
                        resolved.rule_feeds.len(),
                        resolved.managed_rules.block.len(),
                        resolved.managed_rules.allow.len()
                    );
                    return Ok(resolved);
                }
                Err(e @ DnshieldError::Http { status: 401 | 404 }) => {
                    debug!("Manifest '{}' unavailable ({}), falling through", id, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    async fn resolve_tree(
        &self,
        root_id: &str,
        ctx: &EvaluationContext,
        force: bool,
    ) -> Result<ResolvedManifest> {
        let mut resolved = ResolvedManifest {
            root_identifier: root_id.to_string(),
            ..Default::default()
        };
        let mut visited = HashSet::new();
        self.merge_into(root_id, &mut resolved, &mut visited, ctx, true, force)
            .await?;
        Ok(resolved)
    }

    /// Depth-first merge of one manifest and its include closure. The
    /// root is strict; failures in includes are logged and skipped so one
    /// broken include cannot take down the whole tree.
    fn merge_into<'a>(
        &'a self,
        id: &'a str,
        resolved: &'a mut ResolvedManifest,
        visited: &'a mut HashSet<String>,
        ctx: &'a EvaluationContext,
        strict: bool,
        force: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !visited.insert(id.to_string()) {
                debug!("Skipping already-visited manifest '{}'", id);
                return Ok(());
            }

            let (manifest, was_expired) = match self.get_manifest_with(id, force).await {
                Ok(found) => found,
                Err(e) if strict => return Err(e),
                Err(e) => {
                    warn!("Skipping included manifest '{}': {}", id, e);
                    return Ok(());
                }
            };

            resolved.included.push(id.to_string());
            resolved.was_expired |= was_expired;
            resolved.merge_managed(&manifest.managed_rules);
            for feed in &manifest.rule_sources {
                resolved.merge_feed(feed);
            }

            let mut pending_includes: Vec<String> = manifest.included_manifests.clone();

            for item in &manifest.conditional_items {
                match evaluate(&item.condition, ctx) {
                    Ok(true) => {
                        debug!("Condition '{}' active in '{}'", item.condition, id);
                        if let Some(rules) = &item.managed_rules {
                            match item.priority {
                                Some(priority) => {
                                    for domain in &rules.block {
                                        resolved
                                            .prioritized_managed
                                            .push((domain.clone(), true, priority));
                                    }
                                    for domain in &rules.allow {
                                        resolved
                                            .prioritized_managed
                                            .push((domain.clone(), false, priority));
                                    }
                                }
                                None => resolved.merge_managed(rules),
                            }
                        }
                        if let Some(feeds) = &item.rule_sources {
                            for feed in feeds {
                                resolved.merge_feed(feed);
                            }
                        }
                        if let Some(includes) = &item.included_manifests {
                            pending_includes.extend(includes.iter().cloned());
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            "Skipping conditional item in '{}': condition '{}' failed: {}",
                            id, item.condition, e
                        );
                    }
                }
            }

            for include in pending_includes {
                self.merge_into(&include, resolved, visited, ctx, false, force)
                    .await?;
            }

            Ok(())
        })
    }

    /// Fetch (or load from cache) a single manifest.
    ///
    /// Returns the manifest and whether it was served past its TTL. Parse
    /// failures poison the identifier for one cache TTL.
    pub async fn get_manifest(&self, id: &str) -> Result<(Manifest, bool)> {
        self.get_manifest_with(id, false).await
    }

    async fn get_manifest_with(&self, id: &str, force: bool) -> Result<(Manifest, bool)> {
        if let Some(poisoned_at) = self.poison.get(id).map(|p| *p.value()) {
            if poisoned_at.elapsed() < MANIFEST_CACHE_TTL {
                return Err(DnshieldError::ManifestParse(format!(
                    "manifest '{}' recently failed to parse",
                    id
                )));
            }
            self.poison.remove(id);
        }

        // Fresh cache entry wins outright, unless a forced refresh
        if !force {
            if let Some(cached) = self.disk_cache.load(id).await {
                if !cached.was_expired {
                    if let Ok(manifest) = manifest_from_value(&cached.value) {
                        return Ok((manifest, false));
                    }
                    let _ = self.disk_cache.remove(id).await;
                }
            }
        }

        match self.fetch_document(id).await {
            Ok(bytes) => match parse_manifest(&bytes) {
                Ok((manifest, sanitized)) => {
                    if let Err(e) = self.disk_cache.store(id, &sanitized).await {
                        warn!("Failed to cache manifest '{}': {}", id, e);
                    }
                    Ok((manifest, false))
                }
                Err(e) => {
                    self.poison.insert(id.to_string(), Instant::now());
                    Err(e)
                }
            },
            // Auth/not-found drive the identifier fall-through and are
            // never masked by a stale cache entry
            Err(e @ DnshieldError::Http {
                status: 401 | 403 | 404,
            }) => Err(e),
            Err(e) => {
                if let Some(cached) = self.disk_cache.load(id).await {
                    if let Ok(manifest) = manifest_from_value(&cached.value) {
                        warn!(
                            "Serving stale manifest '{}' after fetch failure: {}",
                            id, e
                        );
                        if let Err(touch_err) = self.disk_cache.touch(id).await {
                            warn!("Failed to refresh manifest '{}' mtime: {}", id, touch_err);
                        }
                        return Ok((manifest, cached.was_expired));
                    }
                }
                Err(e)
            }
        }
    }

    /// Try every extension candidate at the configured base URL, or
    /// search the standard local directories when no URL is set.
    async fn fetch_document(&self, id: &str) -> Result<Vec<u8>> {
        if let Some(base) = &self.base_url {
            let mut last_err = DnshieldError::Http { status: 404 };
            for ext in self.format.extension_candidates() {
                let url = format!("{}/{}{}", base, id, ext);
                match fetch_with_retry(self.fetcher.as_ref(), &url, &self.retry).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e @ DnshieldError::Http {
                        status: 401 | 404,
                    }) => last_err = e,
                    Err(e) => return Err(e),
                }
            }
            return Err(last_err);
        }

        for dir in &self.local_dirs {
            for ext in self.format.extension_candidates() {
                let path = dir.join(format!("{}{}", id, ext));
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        debug!("Loaded manifest '{}' from {:?}", id, path);
                        return Ok(bytes);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Err(DnshieldError::Http { status: 404 })
    }
}

fn manifest_from_value(value: &Value) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_value(value.clone())
        .map_err(|e| DnshieldError::ManifestParse(e.to_string()))?;
    super::validate(&manifest)?;
    Ok(manifest)
}
