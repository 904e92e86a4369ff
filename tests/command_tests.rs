use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use dnshield::commands::{CommandChannel, CommandHandler};
use dnshield::error::Result;

#[derive(Default)]
struct RecordingHandler {
    syncs: AtomicU32,
    updates: AtomicU32,
    clears: AtomicU32,
    reloads: AtomicU32,
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn sync_rules(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn update_rules(&self) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn clear_cache(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn reload_configuration(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn status(&self) -> Result<Value> {
        Ok(json!({"rules": {"total": 42}}))
    }
}

struct Fixture {
    channel: Arc<CommandChannel>,
    handler: Arc<RecordingHandler>,
    _dir: tempfile::TempDir,
    incoming: std::path::PathBuf,
    responses: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let incoming = dir.path().join("incoming");
    let responses = dir.path().join("responses");
    std::fs::create_dir_all(&incoming).unwrap();
    std::fs::create_dir_all(&responses).unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let channel = Arc::new(CommandChannel::new(
        incoming.clone(),
        responses.clone(),
        Arc::clone(&handler) as Arc<dyn CommandHandler>,
    ));
    Fixture {
        channel,
        handler,
        _dir: dir,
        incoming,
        responses,
    }
}

async fn write_command(dir: &Path, command_id: &str, kind: &str) {
    let body = json!({
        "commandId": command_id,
        "type": kind,
        "timestamp": 1700000000,
        "source": "test",
    });
    let name = format!("command_1700000000_{}.json", command_id);
    tokio::fs::write(dir.join(name), serde_json::to_vec(&body).unwrap())
        .await
        .unwrap();
}

async fn read_response(dir: &Path, command_id: &str) -> Value {
    let path = dir.join(format!("{}_response.json", command_id));
    let bytes = tokio::fs::read(path).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_commands_dispatch_and_respond() {
    let fx = fixture();
    write_command(&fx.incoming, "cmd-sync", "syncRules").await;
    write_command(&fx.incoming, "cmd-update", "updateRules").await;
    write_command(&fx.incoming, "cmd-clear", "clearCache").await;
    write_command(&fx.incoming, "cmd-reload", "reloadConfiguration").await;

    fx.channel.drain_once().await;

    assert_eq!(fx.handler.syncs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.handler.updates.load(Ordering::SeqCst), 1);
    assert_eq!(fx.handler.clears.load(Ordering::SeqCst), 1);
    assert_eq!(fx.handler.reloads.load(Ordering::SeqCst), 1);

    let response = read_response(&fx.responses, "cmd-sync").await;
    assert_eq!(response["commandId"], "cmd-sync");
    assert_eq!(response["success"], true);

    // Consumed files are deleted
    let mut entries = tokio::fs::read_dir(&fx.incoming).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_status_includes_payload() {
    let fx = fixture();
    write_command(&fx.incoming, "cmd-status", "getStatus").await;
    fx.channel.drain_once().await;

    let response = read_response(&fx.responses, "cmd-status").await;
    assert_eq!(response["success"], true);
    assert_eq!(response["status"]["rules"]["total"], 42);
    assert!(response["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_unknown_type_fails_command() {
    let fx = fixture();
    write_command(&fx.incoming, "cmd-nope", "selfDestruct").await;
    fx.channel.drain_once().await;

    let response = read_response(&fx.responses, "cmd-nope").await;
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("selfDestruct"));
}

#[tokio::test]
async fn test_duplicate_command_ids_run_once() {
    let fx = fixture();
    // Two distinct files carrying the same commandId
    let body = json!({"commandId": "dup-1", "type": "syncRules"});
    for name in ["command_1_a.json", "command_2_b.json"] {
        tokio::fs::write(fx.incoming.join(name), serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
    }

    fx.channel.drain_once().await;
    assert_eq!(fx.handler.syncs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_command_file_is_discarded() {
    let fx = fixture();
    tokio::fs::write(fx.incoming.join("command_bad.json"), b"{broken")
        .await
        .unwrap();
    write_command(&fx.incoming, "cmd-good", "updateRules").await;

    fx.channel.drain_once().await;

    assert_eq!(fx.handler.updates.load(Ordering::SeqCst), 1);
    let mut entries = tokio::fs::read_dir(&fx.incoming).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_json_files_left_alone() {
    let fx = fixture();
    tokio::fs::write(fx.incoming.join("README.txt"), b"not a command")
        .await
        .unwrap();

    fx.channel.drain_once().await;
    assert!(fx.incoming.join("README.txt").exists());
}

#[tokio::test]
async fn test_watcher_driven_processing() {
    let fx = fixture();
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let worker = Arc::clone(&fx.channel)
        .start(shutdown_tx.subscribe())
        .await
        .unwrap();

    write_command(&fx.incoming, "cmd-live", "clearCache").await;

    // The watcher delivers the event asynchronously
    for _ in 0..50 {
        if fx.handler.clears.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(fx.handler.clears.load(Ordering::SeqCst), 1);

    let _ = shutdown_tx.send(());
    worker.await.unwrap();
}
