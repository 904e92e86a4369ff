//! File-queue command channel.
//!
//! Control commands arrive as JSON files in an `incoming` directory
//! (world-writable in deployment, so the daemon does not trust content
//! beyond parsing). A watcher plus a periodic tick feed one serial worker
//! that reads a file, deletes it, deduplicates by `commandId`, dispatches
//! the handler, and writes the response before touching the next file.
//! Files that sit around for an hour are reaped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Bounded dedup window over recently-seen command ids.
const DEDUP_CAPACITY: usize = 100;
/// Commands older than this are deleted unprocessed.
const STALE_COMMAND_AGE: Duration = Duration::from_secs(3600);
/// Fallback scan cadence when file events are missed.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    #[serde(rename = "commandId")]
    pub command_id: String,
    /// ISO-8601 completion time.
    pub timestamp: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

/// The operations the core exposes to its host integrations.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Refresh the manifest, then force a rule update.
    async fn sync_rules(&self) -> Result<()>;
    /// Force a rule update from the current manifest.
    async fn update_rules(&self) -> Result<()>;
    /// Flush the rule cache and the DNS response cache.
    async fn clear_cache(&self) -> Result<()>;
    /// Re-read configuration, flush caches, restart timers.
    async fn reload_configuration(&self) -> Result<()>;
    /// A status document: cache stats, rule totals, proxy counters.
    async fn status(&self) -> Result<Value>;
}

/// Messages consumed by the serial worker.
#[derive(Debug)]
enum ChannelMessage {
    Tick,
    FileCreated(PathBuf),
}

pub struct CommandChannel {
    incoming: PathBuf,
    responses: PathBuf,
    handler: Arc<dyn CommandHandler>,
    seen: Mutex<VecDeque<String>>,
}

impl CommandChannel {
    pub fn new(incoming: PathBuf, responses: PathBuf, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            incoming,
            responses,
            handler,
            seen: Mutex::new(VecDeque::with_capacity(DEDUP_CAPACITY)),
        }
    }

    /// Start the watcher, ticker and serial worker. The returned handle
    /// runs until the shutdown channel fires.
    pub async fn start(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        fs::create_dir_all(&self.incoming).await?;
        fs::create_dir_all(&self.responses).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();

        // File-creation events from the incoming directory
        let watch_tx = tx.clone();
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = watch_tx.send(ChannelMessage::FileCreated(path));
                        }
                    }
                }
                Err(e) => error!("Command directory watch error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(|e| crate::error::DnshieldError::Io(e.to_string()))?;
        watcher
            .watch(&self.incoming, RecursiveMode::NonRecursive)
            .map_err(|e| crate::error::DnshieldError::Io(e.to_string()))?;

        // Periodic tick: catches missed events and drives stale reaping
        let tick_tx = tx.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tick_tx.send(ChannelMessage::Tick).is_err() {
                    break;
                }
            }
        });

        let channel = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            // The watcher must stay alive as long as the worker
            let _watcher = watcher;

            info!("Command channel watching {:?}", channel.incoming);
            channel.scan_incoming().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Command channel shutting down");
                        break;
                    }
                    message = rx.recv() => {
                        match message {
                            Some(ChannelMessage::FileCreated(path)) => {
                                channel.process_file(&path).await;
                            }
                            Some(ChannelMessage::Tick) => {
                                channel.scan_incoming().await;
                                channel.reap_stale().await;
                            }
                            None => break,
                        }
                    }
                }
            }
            ticker.abort();
        });

        Ok(handle)
    }

    /// One synchronous pass over the incoming directory: process every
    /// pending command, then reap stale files. This is what a tick does;
    /// it is public so callers without the background worker (tests, the
    /// CLI) can pump the queue.
    pub async fn drain_once(&self) {
        self.scan_incoming().await;
        self.reap_stale().await;
    }

    /// Process every command file currently in the incoming directory,
    /// oldest name first.
    async fn scan_incoming(&self) {
        let mut paths = Vec::new();
        let mut dir = match fs::read_dir(&self.incoming).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot read command directory: {}", e);
                return;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            self.process_file(&path).await;
        }
    }

    /// Read, delete, dedup, dispatch, respond. Reading and deleting up
    /// front means a second worker that loses the race simply finds no
    /// file.
    async fn process_file(&self, path: &Path) {
        if !path.extension().is_some_and(|ext| ext == "json") {
            return;
        }
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => return, // already consumed
        };
        if fs::remove_file(path).await.is_err() {
            // Another worker owned this file
            return;
        }

        let request: CommandRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("Discarding malformed command file {:?}: {}", path, e);
                return;
            }
        };

        if self.already_seen(&request.command_id) {
            debug!("Skipping duplicate command {}", request.command_id);
            return;
        }

        info!("Dispatching command {} ({})", request.command_id, request.kind);
        let response = self.dispatch(&request).await;
        if let Err(e) = self.write_response(&response).await {
            error!(
                "Failed to write response for command {}: {}",
                request.command_id, e
            );
        }
    }

    fn already_seen(&self, command_id: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.iter().any(|id| id == command_id) {
            return true;
        }
        if seen.len() == DEDUP_CAPACITY {
            seen.pop_front();
        }
        seen.push_back(command_id.to_string());
        false
    }

    async fn dispatch(&self, request: &CommandRequest) -> CommandResponse {
        let mut status = None;
        let result = match request.kind.as_str() {
            "syncRules" => self.handler.sync_rules().await,
            "updateRules" => self.handler.update_rules().await,
            "clearCache" => self.handler.clear_cache().await,
            "reloadConfiguration" => self.handler.reload_configuration().await,
            "getStatus" => match self.handler.status().await {
                Ok(value) => {
                    status = Some(value);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            unknown => Err(crate::error::DnshieldError::ConfigurationInvalid(format!(
                "unknown command type '{}'",
                unknown
            ))),
        };

        let (success, message) = match result {
            Ok(()) => (true, format!("{} completed", request.kind)),
            Err(e) => {
                warn!("Command {} failed: {}", request.command_id, e);
                (false, e.to_string())
            }
        };

        CommandResponse {
            command_id: request.command_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            success,
            message,
            status,
        }
    }

    async fn write_response(&self, response: &CommandResponse) -> Result<()> {
        let path = self
            .responses
            .join(format!("{}_response.json", response.command_id));
        let bytes = serde_json::to_vec_pretty(response)?;
        fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Delete command files that have sat unprocessed for over an hour.
    async fn reap_stale(&self) {
        let Ok(mut dir) = fs::read_dir(&self.incoming).await else {
            return;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .unwrap_or_default();
            if age > STALE_COMMAND_AGE {
                warn!("Reaping stale command file {:?}", entry.path());
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }
}
