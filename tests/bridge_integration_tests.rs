//! End-to-end tests of the JSON-lines transport
//!
//! A full context and router run behind an in-memory duplex stream; the test
//! plays the UI host. Desktop integrations are replaced by a recording fake.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use ootr_bridge::services::SourcePaths;
use ootr_bridge::ui::bridge::Bridge;
use ootr_bridge::ui::desktop::{DesktopError, DesktopShell, FileFilter};
use ootr_bridge::ui::{MessageRouter, register_handlers};
use ootr_bridge::{AppContext, ContextOptions};
use serde_json::{Value, json};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Default)]
struct RecordingDesktop {
    clipboard: Mutex<Vec<String>>,
    opened: Mutex<Vec<Utf8PathBuf>>,
    filters: Mutex<Vec<FileFilter>>,
}

#[async_trait]
impl DesktopShell for RecordingDesktop {
    async fn copy_to_clipboard(&self, text: String) -> Result<(), DesktopError> {
        self.clipboard.lock().unwrap().push(text);
        Ok(())
    }

    async fn browse_for_file(&self, filters: Vec<FileFilter>) -> Option<Vec<Utf8PathBuf>> {
        self.filters.lock().unwrap().extend(filters);
        Some(vec![Utf8PathBuf::from("/roms/oot.z64")])
    }

    async fn browse_for_directory(&self) -> Option<Vec<Utf8PathBuf>> {
        None
    }

    async fn open_path(&self, path: &Utf8Path) -> Result<(), DesktopError> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

struct Client {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    pending_events: Vec<Value>,
}

impl Client {
    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    async fn request(&mut self, id: u64, name: &str, payload: Value) -> Value {
        let line = json!({ "id": id, "name": name, "payload": payload }).to_string();
        self.send_raw(&line).await;
        self.response(Some(id)).await
    }

    async fn next_message(&mut self) -> Option<Value> {
        let line = timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("Timeout waiting for the bridge")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn response(&mut self, id: Option<u64>) -> Value {
        loop {
            let message = self.next_message().await.expect("Transport closed");
            if message["type"] == "response" && message["id"] == json!(id) {
                return message["result"].clone();
            }
            if message["type"] == "event" {
                self.pending_events.push(message);
            }
        }
    }

    async fn event(&mut self, name: &str) -> Value {
        if let Some(index) = self.pending_events.iter().position(|event| event["name"] == name) {
            return self.pending_events.remove(index)["payload"].clone();
        }
        loop {
            let message = self.next_message().await.expect("Transport closed");
            if message["type"] == "event" {
                if message["name"] == name {
                    return message["payload"].clone();
                }
                self.pending_events.push(message);
            }
        }
    }
}

struct Harness {
    _dir: TempDir,
    root: Utf8PathBuf,
    client: Client,
    context: Arc<AppContext>,
    desktop: Arc<RecordingDesktop>,
    bridge: JoinHandle<io::Result<()>>,
}

fn start(worker: Option<&str>) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    if let Some(worker) = worker {
        fs::write(root.join("generate.sh"), worker).unwrap();
    }

    let desktop = Arc::new(RecordingDesktop::default());
    let context = AppContext::new(
        ContextOptions::new(SourcePaths::new(root.clone(), "generate.sh", "settings_to_json.sh"), "sh"),
        desktop.clone(),
    );
    context.watch_fatal_errors();

    let mut router = MessageRouter::new(Arc::clone(&context), Arc::clone(&context.metrics));
    register_handlers(&mut router);
    let bridge = Bridge::new(Arc::new(router), &context.state, Arc::clone(&context.metrics));

    let (client_stream, bridge_stream) = tokio::io::duplex(64 * 1024);
    let (bridge_read, bridge_write) = tokio::io::split(bridge_stream);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let bridge = tokio::spawn(bridge.run(bridge_read, bridge_write, context.shutdown_signal()));

    Harness {
        _dir: dir,
        root,
        client: Client {
            writer: client_write,
            lines: BufReader::new(client_read).lines(),
            pending_events: Vec::new(),
        },
        context,
        desktop,
        bridge,
    }
}

#[tokio::test]
async fn test_saved_settings_read_back() {
    let mut h = start(None);
    let settings = json!({ "world_count": 1, "starting_age": "child", "disabled_locations": [] });

    let saved = h.client.request(1, "saveCurrentSettingsToFile", settings.clone()).await;
    assert_eq!(saved, Value::Null);

    let text = h.client.request(2, "getGeneratorGUILastUserSettings", Value::Null).await;
    let mut read_back: Value = serde_json::from_str(text.as_str().unwrap()).unwrap();
    assert_eq!(read_back["check_version"], json!(true));
    read_back.as_object_mut().unwrap().remove("check_version");
    assert_eq!(read_back, settings);
}

#[tokio::test]
async fn test_create_and_open_missing_then_existing_path() {
    let mut h = start(None);

    let created = h.client.request(1, "createAndOpenPath", json!("Output/Patches")).await;
    assert_eq!(created, json!(false));
    assert!(h.root.join("Output/Patches").is_dir());
    assert_eq!(h.client.event("createAndOpenPathResult").await, json!(""));

    let existing = h.client.request(2, "createAndOpenPath", json!("Output/Patches")).await;
    assert_eq!(existing, json!(true));

    // The existing path is opened in the background
    let target = h.root.join("Output/Patches");
    for _ in 0..50 {
        if h.desktop.opened.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*h.desktop.opened.lock().unwrap(), vec![target.clone(), target]);
}

#[tokio::test]
async fn test_empty_path_opens_source_root() {
    let mut h = start(None);

    let existed = h.client.request(1, "createAndOpenPath", json!("")).await;

    assert_eq!(existed, json!(true));
}

#[tokio::test]
async fn test_malformed_requests_rejected_without_side_effects() {
    let mut h = start(None);

    h.client.send_raw("this is not json").await;
    assert_eq!(h.client.response(None).await, json!(false));

    h.client.send_raw(r#"{"id": 9, "payload": {}}"#).await;
    assert_eq!(h.client.response(Some(9)).await, json!(false));

    assert_eq!(h.client.request(1, "deleteEverything", json!({})).await, json!(false));
    assert_eq!(h.client.request(2, "copyToClipboard", json!({ "content": "" })).await, json!(false));
    assert_eq!(
        h.client
            .request(3, "copyToClipboard", json!({ "content": "x", "extra": true }))
            .await,
        json!(false)
    );
    assert_eq!(
        h.client
            .request(4, "generateSeed", json!({ "settingsFile": {}, "staticSeed": "" }))
            .await,
        json!(false)
    );
    assert_eq!(h.client.request(5, "saveCurrentSettingsToFile", json!({})).await, json!(false));
    assert_eq!(h.client.request(6, "saveCurrentPresetsToFile", json!("")).await, json!(false));
    assert_eq!(h.client.request(7, "browseForFile", json!({ "fileTypes": "z64" })).await, json!(false));

    assert!(h.desktop.clipboard.lock().unwrap().is_empty());
    assert!(h.desktop.filters.lock().unwrap().is_empty());
    assert!(h.context.state.read(|state| state.job.is_none()));
    assert!(!h.root.join("settings.sav").exists());
    assert!(!h.root.join("presets.sav").exists());
    assert_eq!(
        h.context
            .metrics
            .requests_rejected
            .load(std::sync::atomic::Ordering::Relaxed),
        9
    );
}

#[tokio::test]
async fn test_clipboard_and_file_dialog() {
    let mut h = start(None);

    let copied = h.client.request(1, "copyToClipboard", json!({ "content": "BSAWFNCAAJB" })).await;
    assert_eq!(copied, json!(true));
    assert_eq!(*h.desktop.clipboard.lock().unwrap(), vec!["BSAWFNCAAJB".to_string()]);

    let picked = h
        .client
        .request(
            2,
            "browseForFile",
            json!({ "fileTypes": [{ "name": "ROM", "extensions": ["z64", "n64"] }] }),
        )
        .await;
    assert_eq!(picked, json!(["/roms/oot.z64"]));
    assert_eq!(h.desktop.filters.lock().unwrap()[0].name, "ROM");

    let directory = h.client.request(3, "browseForDirectory", Value::Null).await;
    assert_eq!(directory, Value::Null);
}

#[tokio::test]
async fn test_window_requests() {
    let mut h = start(None);

    assert_eq!(h.client.request(1, "window-is-maximized", Value::Null).await, json!(false));
    assert_eq!(h.client.request(2, "window-maximize", Value::Null).await, Value::Null);
    assert_eq!(h.client.event("window-maximized").await, json!(true));
    assert_eq!(h.client.request(3, "window-is-maximized", Value::Null).await, json!(true));
    assert_eq!(h.client.request(4, "window-minimize", Value::Null).await, Value::Null);

    assert_eq!(h.client.request(5, "window-close", Value::Null).await, Value::Null);
    let stopped = timeout(Duration::from_secs(5), h.bridge).await.unwrap().unwrap();
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_missing_settings_schema_is_fatal() {
    let mut h = start(None);

    let settings = h.client.request(1, "getGeneratorGUISettings", Value::Null).await;
    assert_eq!(settings, json!(false));

    let fatal = h.client.event("fatalError").await;
    assert_eq!(fatal["reason"], "missing_settings_list");

    let stopped = timeout(Duration::from_secs(5), h.bridge).await.unwrap().unwrap();
    assert!(stopped.is_ok());
    assert!(h.context.is_shutting_down());
}

#[tokio::test]
async fn test_gui_settings_include_presets() {
    let mut h = start(None);
    fs::create_dir_all(h.root.join("data/generated")).unwrap();
    fs::write(
        h.root.join("data/generated/settings_list.json"),
        r#"{"settingsObj": {}, "settingsArray": []}"#,
    )
    .unwrap();
    fs::write(
        h.root.join("data/presets_default.json"),
        r#"{"Tournament": {"world_count": 1}}"#,
    )
    .unwrap();

    let settings = h.client.request(1, "getGeneratorGUISettings", Value::Null).await;
    let settings: Value = serde_json::from_str(settings.as_str().unwrap()).unwrap();

    assert_eq!(settings["presets"]["[New Preset]"], json!({ "isNewPreset": true }));
    assert_eq!(
        settings["presets"]["Tournament"],
        json!({ "isProtectedPreset": true, "settings": { "world_count": 1 } })
    );
}

#[tokio::test]
async fn test_cancel_without_job_returns_false() {
    let mut h = start(None);

    assert_eq!(h.client.request(1, "cancelGenerateSeed", Value::Null).await, json!(false));
    assert!(h.context.state.read(|state| state.job.is_none()));
}

#[cfg(unix)]
#[tokio::test]
async fn test_generate_seed_over_the_wire() {
    let worker = r#"
echo "PROGRESS 25 Placing items"
echo "PROGRESS 75 Writing spoiler"
echo '{"seed": "ABCDEF"}'
"#;
    let mut h = start(Some(worker));
    let payload = json!({ "settingsFile": { "world_count": 1 }, "staticSeed": "" });

    assert_eq!(h.client.request(1, "generateSeed", payload).await, json!(true));

    let first = h.client.event("generateSeedProgress").await;
    let second = h.client.event("generateSeedProgress").await;
    assert_eq!(first, json!({ "progress": 25.0, "message": "Placing items" }));
    assert_eq!(second["progress"], json!(75.0));

    assert_eq!(h.client.event("generateSeedSuccess").await, json!({ "seed": "ABCDEF" }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_second_generate_rejected_while_running() {
    let worker = r#"
echo "PROGRESS 1 Working"
while [ ! -f "$OOTR_CANCEL_FILE" ]; do sleep 0.05; done
echo "FAILURE user_cancelled" >&2
exit 1
"#;
    let mut h = start(Some(worker));
    let payload = json!({ "settingsFile": { "world_count": 1 }, "staticSeed": "" });

    assert_eq!(h.client.request(1, "generateSeed", payload.clone()).await, json!(true));
    h.client.event("generateSeedProgress").await;

    assert_eq!(h.client.request(2, "generateSeed", payload).await, json!(false));
    assert_eq!(h.client.request(3, "cancelGenerateSeed", Value::Null).await, json!(true));
    assert_eq!(h.client.event("generateSeedCancelled").await, Value::Null);
}
