use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use dnshield::cache::{RuleCache, RuleCacheConfig};
use dnshield::config::Preferences;
use dnshield::error::{DnshieldError, Result};
use dnshield::manager::{MANAGED_RULE_PRIORITY, RuleManager};
use dnshield::manifest::{ManifestFetch, ManifestResolver};
use dnshield::rules::{RuleAction, RuleDatabase, RuleSource, Verdict, WildcardMode, resolve};

struct StubFetcher {
    routes: Mutex<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
    feed_fetches: AtomicU32,
}

impl StubFetcher {
    fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            feed_fetches: AtomicU32::new(0),
        }
    }

    fn route(&self, url: &str, bytes: Vec<u8>) {
        self.routes.lock().insert(url.to_string(), bytes);
    }
}

#[async_trait]
impl ManifestFetch for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DnshieldError::NetworkUnavailable);
        }
        if url.contains("/feeds/") {
            self.feed_fetches.fetch_add(1, Ordering::SeqCst);
        }
        self.routes
            .lock()
            .get(url)
            .cloned()
            .ok_or(DnshieldError::Http { status: 404 })
    }
}

struct Fixture {
    manager: Arc<RuleManager>,
    db: Arc<RuleDatabase>,
    fetcher: Arc<StubFetcher>,
    _cache_dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let fetcher = Arc::new(StubFetcher::new());
    fetcher.route(
        "https://repo.test/default.json",
        serde_json::to_vec(&json!({
            "manifest_version": "1.0",
            "identifier": "default",
            "managed_rules": {
                "block": ["managed-block.example.com"],
                "allow": ["managed-allow.example.com"]
            },
            "rule_sources": [
                {"id": "corp-feed", "type": "https",
                 "url": "https://repo.test/feeds/corp.json",
                 "format": "json", "priority": 120, "updateInterval": 300}
            ]
        }))
        .unwrap(),
    );
    fetcher.route(
        "https://repo.test/feeds/corp.json",
        serde_json::to_vec(&json!({
            "name": "corp",
            "rules": [
                {"domain": "*.feed-blocked.example.com", "action": "block"},
                {"domain": "feed-allowed.example.com", "action": "allow", "priority": 200}
            ]
        }))
        .unwrap(),
    );

    let prefs = Preferences {
        manifest_url: Some("https://repo.test".into()),
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        ..Default::default()
    };

    let cache_dir = tempfile::tempdir().unwrap();
    let db = Arc::new(RuleDatabase::open_in_memory().unwrap());
    let rule_cache = Arc::new(RuleCache::new(RuleCacheConfig::default()));
    let resolver = Arc::new(
        ManifestResolver::new(&prefs, Arc::clone(&fetcher) as Arc<dyn ManifestFetch>)
            .with_cache_dir(cache_dir.path().join("manifests")),
    );
    let manager = Arc::new(RuleManager::new(
        &prefs,
        Arc::clone(&db),
        rule_cache,
        resolver,
        Arc::clone(&fetcher) as Arc<dyn ManifestFetch>,
    ));

    Fixture {
        manager,
        db,
        fetcher,
        _cache_dir: cache_dir,
    }
}

#[tokio::test]
async fn test_refresh_applies_managed_and_feed_rules() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();

    let managed = fx
        .db
        .lookup("managed-block.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].source, RuleSource::Managed);
    assert_eq!(managed[0].priority, MANAGED_RULE_PRIORITY);

    let feed = fx
        .db
        .lookup("deep.feed-blocked.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].source, RuleSource::Manifest);
    assert_eq!(feed[0].priority, 120); // the feed's priority flows through

    let allowed = fx
        .db
        .lookup("feed-allowed.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert_eq!(allowed[0].action, RuleAction::Allow);
    assert_eq!(allowed[0].priority, 200); // the rule's own priority wins

    let counts = fx.db.counts().unwrap();
    assert_eq!(counts.total(), 4);
}

#[tokio::test]
async fn test_second_refresh_uses_rule_cache() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();
    let fetches_after_first = fx.fetcher.feed_fetches.load(Ordering::SeqCst);
    assert_eq!(fetches_after_first, 1);

    fx.manager.refresh(false).await.unwrap();
    assert_eq!(
        fx.fetcher.feed_fetches.load(Ordering::SeqCst),
        fetches_after_first,
        "second refresh should be served from the rule cache"
    );

    // A forced sync re-downloads
    fx.manager.refresh(true).await.unwrap();
    assert_eq!(fx.fetcher.feed_fetches.load(Ordering::SeqCst), fetches_after_first + 1);
}

#[tokio::test]
async fn test_failed_feed_keeps_cached_rules() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();

    // The feed disappears; a forced refresh must not lose its rules
    fx.fetcher
        .routes
        .lock()
        .remove("https://repo.test/feeds/corp.json");
    fx.manager.refresh(true).await.unwrap();

    let feed = fx
        .db
        .lookup("x.feed-blocked.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert_eq!(feed.len(), 1, "cached feed rules survive the outage");
}

#[tokio::test]
async fn test_resolution_failure_fails_open() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();
    let counts_before = fx.db.counts().unwrap();

    // Full outage with an expired-free cache: resolution still succeeds
    // from the manifest disk cache, so force a truly cold failure with a
    // fresh manager over the same database.
    let prefs = Preferences {
        manifest_url: Some("https://repo.test".into()),
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        ..Default::default()
    };
    let cold_cache = tempfile::tempdir().unwrap();
    let offline_fetcher = Arc::new(StubFetcher::new());
    offline_fetcher.offline.store(true, Ordering::SeqCst);
    let resolver = Arc::new(
        ManifestResolver::new(&prefs, Arc::clone(&offline_fetcher) as Arc<dyn ManifestFetch>)
            .with_cache_dir(cold_cache.path().to_path_buf()),
    );
    let cold_manager = RuleManager::new(
        &prefs,
        Arc::clone(&fx.db),
        Arc::new(RuleCache::new(RuleCacheConfig::default())),
        resolver,
        offline_fetcher as Arc<dyn ManifestFetch>,
    );

    assert!(cold_manager.refresh(false).await.is_err());
    assert_eq!(fx.db.counts().unwrap(), counts_before, "rules unchanged after failure");
}

#[tokio::test]
async fn test_status_reports_totals() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();

    let status = fx.manager.status().unwrap();
    assert_eq!(status["rules"]["total"], 4);
    assert!(status["lastUpdate"].is_string());
    assert!(status["lastError"].is_null());
}

#[tokio::test]
async fn test_update_timer_restarts_cleanly() {
    let fx = fixture();
    // Installing twice cancels the first timer; stopping is idempotent
    fx.manager.start_update_timer(Duration::from_secs(3600)).await;
    fx.manager.start_update_timer(Duration::from_secs(3600)).await;
    fx.manager.stop_update_timer().await;
    fx.manager.stop_update_timer().await;
}

#[tokio::test]
async fn test_verdict_after_full_refresh() {
    let fx = fixture();
    fx.manager.refresh(false).await.unwrap();

    let matching = fx
        .db
        .lookup("tracker.feed-blocked.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert!(resolve(&matching).is_block());

    let matching = fx
        .db
        .lookup("managed-allow.example.com", WildcardMode::IncludeRoot)
        .unwrap();
    assert!(matches!(resolve(&matching), Verdict::Allow(_)));
}
