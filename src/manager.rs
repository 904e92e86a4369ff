//! Orchestration: manifest resolution feeding the rule database through
//! the rule cache, on a restartable refresh timer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::cache::{DnsResponseCache, RuleCache};
use crate::commands::CommandHandler;
use crate::config::Preferences;
use crate::error::{DnshieldError, Result};
use crate::manifest::condition::EvaluationContext;
use crate::manifest::fetch::fetch_with_retry;
use crate::manifest::{FeedKind, ManifestFetch, ManifestResolver, ResolvedManifest, RuleFeed};
use crate::proxy::{DnsProxy, ProxySettings};
use crate::rules::parser::parse_rule_set;
use crate::rules::{Rule, RuleAction, RuleDatabase, RuleSet, RuleSource};

/// Priority applied to a manifest's inline managed rules. Feed rules use
/// each feed's own priority; user rules carry whatever the caller set.
pub const MANAGED_RULE_PRIORITY: u32 = 100;

pub struct RuleManager {
    db: Arc<RuleDatabase>,
    rule_cache: Arc<RuleCache>,
    resolver: Arc<ManifestResolver>,
    fetcher: Arc<dyn ManifestFetch>,
    retry: crate::manifest::RetryPolicy,
    update_timer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Host-supplied condition variables (device, network, user); the
    /// time fields are stamped fresh on every refresh.
    base_context: Mutex<EvaluationContext>,
    /// Bumped at the start of every refresh. A refresh that discovers a
    /// newer generation mid-flight abandons its results instead of
    /// clobbering them.
    refresh_generation: std::sync::atomic::AtomicU64,
    last_update: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl RuleManager {
    pub fn new(
        prefs: &Preferences,
        db: Arc<RuleDatabase>,
        rule_cache: Arc<RuleCache>,
        resolver: Arc<ManifestResolver>,
        fetcher: Arc<dyn ManifestFetch>,
    ) -> Self {
        Self {
            db,
            rule_cache,
            resolver,
            fetcher,
            retry: crate::manifest::RetryPolicy::from(prefs),
            update_timer: tokio::sync::Mutex::new(None),
            base_context: Mutex::new(EvaluationContext::default()),
            refresh_generation: std::sync::atomic::AtomicU64::new(0),
            last_update: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Install the host-side condition variables (device model, network
    /// state, user group, custom keys) used when evaluating conditional
    /// manifest items.
    pub fn set_evaluation_context(&self, ctx: EvaluationContext) {
        *self.base_context.lock() = ctx;
    }

    fn refresh_context(&self) -> EvaluationContext {
        let mut ctx = self.base_context.lock().clone();
        let now = EvaluationContext::now();
        ctx.time_of_day = now.time_of_day;
        ctx.day_of_week = now.day_of_week;
        ctx.is_weekend = now.is_weekend;
        ctx.current_date = now.current_date;
        ctx
    }

    /// Resolve the manifest and apply it to the database.
    ///
    /// With `force` set, the rule cache is skipped and every feed is
    /// re-downloaded. When resolution or every feed fails, the previously
    /// applied rules stay active.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        use std::sync::atomic::Ordering;

        let generation = self.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.refresh_context();
        let resolved = match self.resolver.resolve_with(&ctx, force).await {
            Ok(resolved) => resolved,
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                warn!("Manifest resolution failed, keeping current rules: {}", e);
                return Err(e);
            }
        };

        // A newer refresh started while this one was fetching; let it win
        if self.refresh_generation.load(Ordering::SeqCst) != generation {
            debug!("Refresh superseded before applying, abandoning");
            return Err(DnshieldError::Cancelled);
        }

        self.apply(&resolved, force).await?;

        *self.last_update.lock() = Some(chrono::Utc::now());
        *self.last_error.lock() = None;
        Ok(())
    }

    async fn apply(&self, resolved: &ResolvedManifest, force: bool) -> Result<()> {
        // Inline managed rules swap in atomically under their own source
        let mut managed = Vec::new();
        for domain in &resolved.managed_rules.block {
            managed.push(Rule::from_domain_spec(
                domain,
                RuleAction::Block,
                RuleSource::Managed,
                MANAGED_RULE_PRIORITY,
            ));
        }
        for domain in &resolved.managed_rules.allow {
            managed.push(Rule::from_domain_spec(
                domain,
                RuleAction::Allow,
                RuleSource::Managed,
                MANAGED_RULE_PRIORITY,
            ));
        }
        for (domain, blocked, priority) in &resolved.prioritized_managed {
            let action = if *blocked { RuleAction::Block } else { RuleAction::Allow };
            managed.push(Rule::from_domain_spec(
                domain,
                action,
                RuleSource::Managed,
                *priority,
            ));
        }
        self.replace_source(RuleSource::Managed, managed).await?;

        let feeds: Vec<&RuleFeed> = resolved.rule_feeds.iter().filter(|f| f.enabled).collect();
        let mut feed_rules: Vec<Rule> = Vec::new();
        let mut loaded = 0usize;

        for feed in &feeds {
            match self.load_feed(feed, force).await {
                Ok(rule_set) => {
                    loaded += 1;
                    feed_rules.extend(rule_set.rules);
                }
                Err(e) => {
                    warn!("Rule feed '{}' failed: {}", feed.id, e);
                    // A still-cached copy keeps the feed's rules alive
                    if let Some(stale) = self
                        .rule_cache
                        .get(&feed.id, Duration::from_secs(86400 * 365))
                        .await
                    {
                        debug!("Using cached rules for failed feed '{}'", feed.id);
                        loaded += 1;
                        feed_rules.extend(stale.rules);
                    }
                }
            }
        }

        if feeds.is_empty() || loaded > 0 {
            self.replace_source(RuleSource::Manifest, feed_rules).await?;
        } else {
            warn!("Every rule feed failed; keeping last applied feed rules");
        }

        Ok(())
    }

    /// Obtain a feed's rule set, consulting the rule cache unless forced.
    async fn load_feed(&self, feed: &RuleFeed, force: bool) -> Result<RuleSet> {
        let ttl = Duration::from_secs(feed.update_interval);
        if !force {
            if let Some(cached) = self.rule_cache.get(&feed.id, ttl).await {
                debug!("Rule feed '{}' served from cache", feed.id);
                return Ok(cached);
            }
        }

        let bytes = match feed.kind {
            FeedKind::Https => {
                let url = feed.url.as_ref().ok_or_else(|| {
                    DnshieldError::ConfigurationInvalid(format!("feed '{}' has no url", feed.id))
                })?;
                fetch_with_retry(self.fetcher.as_ref(), url, &self.retry).await?
            }
            FeedKind::File => {
                let path = feed.path.as_ref().ok_or_else(|| {
                    DnshieldError::ConfigurationInvalid(format!("feed '{}' has no path", feed.id))
                })?;
                tokio::fs::read(path).await?
            }
        };

        let rule_set = parse_rule_set(
            &bytes,
            feed.format.into(),
            RuleSource::Manifest,
            feed.priority,
        )?;
        info!("Loaded {} rules from feed '{}'", rule_set.rules.len(), feed.id);

        self.rule_cache
            .store(&feed.id, rule_set.clone(), Some(ttl))
            .await?;
        Ok(rule_set)
    }

    async fn replace_source(&self, source: RuleSource, rules: Vec<Rule>) -> Result<usize> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.replace_source(source, &rules))
            .await
            .map_err(|e| DnshieldError::Io(e.to_string()))?
    }

    /// (Re)start the periodic refresh timer. A previous timer is always
    /// cancelled before the new one is installed.
    pub async fn start_update_timer(self: &Arc<Self>, period: Duration) {
        let mut guard = self.update_timer.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
            debug!("Cancelled previous rule update timer");
        }

        let manager = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = manager.refresh(false).await {
                    warn!("Scheduled rule refresh failed: {}", e);
                }
            }
        }));
        info!("Rule update timer started ({:?})", period);
    }

    pub async fn stop_update_timer(&self) {
        if let Some(timer) = self.update_timer.lock().await.take() {
            timer.abort();
        }
    }

    pub fn status(&self) -> Result<Value> {
        let counts = self.db.counts()?;
        Ok(json!({
            "rules": {
                "allow": counts.allow,
                "block": counts.block,
                "total": counts.total(),
            },
            "ruleCache": self.rule_cache.stats(),
            "lastUpdate": self.last_update.lock().as_ref().map(|t| t.to_rfc3339()),
            "lastError": self.last_error.lock().clone(),
        }))
    }
}

/// The assembled core: everything the command channel needs a handle to.
pub struct DnshieldCore {
    pub manager: Arc<RuleManager>,
    pub rule_cache: Arc<RuleCache>,
    pub dns_cache: Arc<DnsResponseCache>,
    pub proxy: Arc<DnsProxy>,
}

#[async_trait]
impl CommandHandler for DnshieldCore {
    async fn sync_rules(&self) -> Result<()> {
        self.manager.refresh(true).await
    }

    async fn update_rules(&self) -> Result<()> {
        self.manager.refresh(false).await
    }

    async fn clear_cache(&self) -> Result<()> {
        self.rule_cache.clear().await;
        self.dns_cache.clear();
        info!("Caches cleared by command");
        Ok(())
    }

    async fn reload_configuration(&self) -> Result<()> {
        let prefs = Preferences::from_env()?;
        self.dns_cache.set_policies(
            prefs.domain_cache_rules.clone(),
            prefs.cache_bypass_domains.clone(),
        );
        self.proxy.apply_settings(ProxySettings::from(&prefs));
        self.rule_cache.clear().await;
        self.dns_cache.clear();
        self.manager
            .start_update_timer(prefs.manifest_update_interval)
            .await;
        info!("Configuration reloaded");
        Ok(())
    }

    async fn status(&self) -> Result<Value> {
        let mut status = self.manager.status()?;
        if let Value::Object(map) = &mut status {
            map.insert("proxy".into(), serde_json::to_value(self.proxy.stats())?);
            map.insert(
                "dnsCache".into(),
                serde_json::to_value(self.dns_cache.stats())?,
            );
        }
        Ok(status)
    }
}
