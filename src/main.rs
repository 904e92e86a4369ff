use std::sync::Arc;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dnshield::cache::{DnsResponseCache, RuleCache, RuleCacheConfig};
use dnshield::commands::CommandChannel;
use dnshield::config::Preferences;
use dnshield::manager::{DnshieldCore, RuleManager};
use dnshield::manifest::{HttpManifestFetcher, ManifestFetch, ManifestResolver};
use dnshield::proxy::DnsProxy;
use dnshield::rules::RuleDatabase;

#[derive(Debug, Parser)]
#[command(name = "dnshield", about = "DNS filtering daemon")]
struct Args {
    /// Override the DNS bind address (host:port)
    #[arg(long)]
    bind: Option<String>,

    /// Skip the initial manifest refresh on startup
    #[arg(long)]
    no_initial_refresh: bool,

    /// Forward everything without rule evaluation
    #[arg(long)]
    bypass: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut prefs = Preferences::from_env()?;
    if let Some(bind) = &args.bind {
        prefs.bind_addr = bind.parse()?;
    }

    info!("Starting DNShield core on {}", prefs.bind_addr);

    let db = Arc::new(RuleDatabase::open(&prefs.rules_db_path)?);
    let dns_cache = Arc::new(DnsResponseCache::new(prefs.max_dns_cache_entries));
    dns_cache.set_policies(
        prefs.domain_cache_rules.clone(),
        prefs.cache_bypass_domains.clone(),
    );

    let rule_cache = Arc::new(RuleCache::new(RuleCacheConfig {
        max_memory_bytes: prefs.rule_cache_memory_bytes,
        disk_dir: Some(prefs.rule_cache_dir()),
        max_disk_bytes: prefs.rule_cache_disk_bytes,
        ..Default::default()
    }));
    if let Err(e) = rule_cache.preload_all().await {
        warn!("Rule cache preload failed: {}", e);
    }
    let _sweeper = rule_cache.spawn_sweeper();

    let fetcher: Arc<dyn ManifestFetch> = Arc::new(HttpManifestFetcher::new(&prefs)?);
    let resolver = Arc::new(ManifestResolver::new(&prefs, Arc::clone(&fetcher)));
    let manager = Arc::new(RuleManager::new(
        &prefs,
        Arc::clone(&db),
        Arc::clone(&rule_cache),
        resolver,
        fetcher,
    ));

    let proxy = Arc::new(DnsProxy::new(&prefs, Arc::clone(&db), Arc::clone(&dns_cache)));
    if args.bypass {
        proxy.set_bypass(true);
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    // Periodic expired-response sweep
    {
        let dns_cache = Arc::clone(&dns_cache);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => dns_cache.sweep(),
                }
            }
        });
    }

    if !args.no_initial_refresh {
        if let Err(e) = manager.refresh(false).await {
            warn!("Initial rule refresh failed: {}", e);
        }
    }
    manager.start_update_timer(prefs.manifest_update_interval).await;

    let core = Arc::new(DnshieldCore {
        manager: Arc::clone(&manager),
        rule_cache: Arc::clone(&rule_cache),
        dns_cache: Arc::clone(&dns_cache),
        proxy: Arc::clone(&proxy),
    });
    let channel = Arc::new(CommandChannel::new(
        prefs.commands_incoming_dir(),
        prefs.commands_responses_dir(),
        core,
    ));
    let command_task = channel.start(shutdown_tx.subscribe()).await?;

    let socket = UdpSocket::bind(prefs.bind_addr).await?;
    let server = {
        let proxy = Arc::clone(&proxy);
        let shutdown = shutdown_tx.subscribe();
        let max_concurrent = prefs.max_concurrent_queries;
        tokio::spawn(async move { proxy.run(socket, max_concurrent, shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(());
    manager.stop_update_timer().await;

    if let Err(e) = command_task.await {
        error!("Command channel task failed: {}", e);
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("DNS proxy exited with error: {}", e),
        Err(e) => error!("DNS proxy task failed: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}
