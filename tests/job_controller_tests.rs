//! Integration tests for the generation job lifecycle
//!
//! Workers are small shell scripts run through `sh`, so the unix-only tests
//! exercise real process spawning, streaming, cancellation and tree kills.

use camino::Utf8PathBuf;
use ootr_bridge::models::JobState;
use ootr_bridge::services::failure::FailureReason;
use ootr_bridge::services::{
    GenerateRequest, JobConfig, JobController, JobError, JobOutcome, PlatformCapabilities, ProcessSupervisor,
    SettingsStore, SourcePaths,
};
use ootr_bridge::{BridgeEvent, Metrics, StateManager};
use serde_json::{Map, Value, json};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct Fixture {
    _dir: TempDir,
    root: Utf8PathBuf,
    state: StateManager,
    metrics: Arc<Metrics>,
    jobs: JobController,
}

fn fixture(worker: &str, config: JobConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    fs::write(root.join("generate.sh"), worker).unwrap();

    let paths = SourcePaths::new(root.clone(), "generate.sh", "settings_to_json.sh");
    let state = StateManager::new();
    let metrics = Arc::new(Metrics::new());
    let jobs = JobController::new(
        state.clone(),
        ProcessSupervisor::new(PlatformCapabilities::detect()),
        Arc::new(SettingsStore::new(paths.clone())),
        paths,
        config,
        Arc::clone(&metrics),
    );

    Fixture {
        _dir: dir,
        root,
        state,
        metrics,
        jobs,
    }
}

fn sh_config() -> JobConfig {
    JobConfig::new("sh")
}

fn request(seed: &str) -> GenerateRequest {
    let mut settings = Map::new();
    settings.insert("world_count".to_string(), json!(1));
    GenerateRequest {
        settings_file: settings,
        static_seed: seed.to_string(),
    }
}

/// Push events of one job, up to and including its terminal event
async fn events_until_terminal(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Timeout waiting for terminal event")
            .expect("Channel closed");
        if matches!(event, BridgeEvent::JobStateChanged { .. }) {
            continue;
        }
        let terminal = event.is_job_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

async fn wait_for_progress(rx: &mut broadcast::Receiver<BridgeEvent>) {
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Timeout waiting for progress")
            .expect("Channel closed");
        if matches!(event, BridgeEvent::GenerateSeedProgress(_)) {
            return;
        }
    }
}

#[tokio::test]
async fn test_spawn_failure_fails_the_job() {
    let f = fixture("", JobConfig::new("ootr-bridge-no-such-interpreter"));
    let mut rx = f.state.subscribe();

    let ticket = f.jobs.start_job(request("")).unwrap();
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();

    match outcome {
        JobOutcome::Failed(failure) => assert_eq!(failure.reason, FailureReason::SpawnFailed),
        other => panic!("Expected spawn failure, got {:?}", other),
    }

    let events = events_until_terminal(&mut rx).await;
    assert!(matches!(events.as_slice(), [BridgeEvent::GenerateSeedError(_)]));
    assert!(!f.jobs.is_running());
    assert_eq!(f.jobs.status().unwrap().state, JobState::Failed);
}

#[cfg(unix)]
#[tokio::test]
async fn test_progress_in_order_then_success() {
    let worker = r#"
echo "PROGRESS 10 Creating seed"
echo "PROGRESS 50% Shuffling items"
echo "PROGRESS 100 Patching ROM"
echo '{"seed": "XYZ", "files": ["OoT_XYZ.zpf"]}'
"#;
    let f = fixture(worker, sh_config());
    let mut rx = f.state.subscribe();

    let ticket = f.jobs.start_job(request("")).unwrap();
    let events = events_until_terminal(&mut rx).await;

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            BridgeEvent::GenerateSeedProgress(progress) => Some(progress.progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10.0, 50.0, 100.0]);
    assert_eq!(
        events.last(),
        Some(&BridgeEvent::GenerateSeedSuccess(
            json!({ "seed": "XYZ", "files": ["OoT_XYZ.zpf"] })
        ))
    );

    assert!(matches!(ticket.wait().await, JobOutcome::Succeeded(_)));

    // Nothing follows the terminal event
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            matches!(event, BridgeEvent::JobStateChanged { .. }),
            "Unexpected event after terminal: {:?}",
            event
        );
    }

    assert_eq!(f.metrics.jobs_succeeded.load(Ordering::Relaxed), 1);
    assert_eq!(f.metrics.progress_events.load(Ordering::Relaxed), 3);
}

#[cfg(unix)]
#[tokio::test]
async fn test_settings_persisted_and_seed_passed() {
    let worker = r#"printf '{"args": "%s"}\n' "$*""#;
    let f = fixture(worker, sh_config());

    let ticket = f.jobs.start_job(request("  MYSEED ")).unwrap();
    let outcome = timeout(Duration::from_secs(10), ticket.wait()).await.unwrap();

    let JobOutcome::Succeeded(value) = outcome else {
        panic!("Expected success, got {:?}", outcome);
    };
    let settings_file = f.root.join("settings.sav");
    assert_eq!(
        value["args"],
        Value::String(format!("--settings {} --seed MYSEED", settings_file))
    );

    let saved: Value = serde_json::from_str(&fs::read_to_string(&settings_file).unwrap()).unwrap();
    assert_eq!(saved, json!({ "world_count": 1, "check_version": true }));
}

#[cfg(unix)]
#[tokio::test]
async fn test_second_start_rejected_without_spawning() {
    let worker = r#"
echo started >> starts.log
echo "PROGRESS 1 Working"
sleep 30
"#;
    let config = JobConfig {
        cooperative_cancel: false,
        ..sh_config()
    };
    let f = fixture(worker, config);
    let mut rx = f.state.subscribe();

    let first = f.jobs.start_job(request("")).unwrap();
    wait_for_progress(&mut rx).await;

    let second = f.jobs.start_job(request(""));
    assert_eq!(second.unwrap_err(), JobError::AlreadyRunning(first.id));

    assert!(f.jobs.cancel_active_job());
    let outcome = timeout(Duration::from_secs(10), first.wait()).await.unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);

    let starts = fs::read_to_string(f.root.join("starts.log")).unwrap();
    assert_eq!(starts.lines().count(), 1);
    assert_eq!(f.metrics.jobs_started.load(Ordering::Relaxed), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_cooperative_cancel_is_cancelled_not_failed() {
    let worker = r#"
echo "PROGRESS 5 Waiting for cancel"
while [ ! -f "$OOTR_CANCEL_FILE" ]; do sleep 0.05; done
echo "FAILURE user_cancelled" >&2
exit 1
"#;
    let f = fixture(worker, sh_config());
    let mut rx = f.state.subscribe();

    let ticket = f.jobs.start_job(request("")).unwrap();
    wait_for_progress(&mut rx).await;

    assert!(f.jobs.cancel_active_job());
    // A repeated cancel while one is in flight is acknowledged, not restarted
    assert!(f.jobs.cancel_active_job());

    let outcome = timeout(Duration::from_secs(4), ticket.wait()).await.unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);

    let events = events_until_terminal(&mut rx).await;
    assert_eq!(events.last(), Some(&BridgeEvent::GenerateSeedCancelled));
    assert!(!f.root.join("generation.cancel").exists());
    assert!(!f.jobs.cancel_active_job());
}

#[cfg(unix)]
#[tokio::test]
async fn test_hard_cancel_kills_worker_tree() {
    let worker = r#"
sleep 30 &
echo $! > grandchild.pid
echo "PROGRESS 1 Busy"
wait
"#;
    let config = JobConfig {
        cancel_grace: Duration::from_millis(100),
        ..sh_config()
    };
    let f = fixture(worker, config);
    let mut rx = f.state.subscribe();

    let ticket = f.jobs.start_job(request("")).unwrap();
    wait_for_progress(&mut rx).await;

    assert!(f.jobs.cancel_active_job());
    let outcome = timeout(Duration::from_secs(5), ticket.wait()).await.unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(f.metrics.jobs_cancelled.load(Ordering::Relaxed), 1);

    #[cfg(target_os = "linux")]
    {
        let pid: u32 = fs::read_to_string(f.root.join("grandchild.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(
            wait_until_gone(pid).await,
            "Grandchild {} survived the tree kill",
            pid
        );
    }
}

/// Gone, or a zombie waiting for a reaper
#[cfg(target_os = "linux")]
async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..40 {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => return true,
            Ok(stat) => {
                let state = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
                if state == Some("Z") {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[cfg(unix)]
#[tokio::test]
async fn test_declared_failure_is_reported() {
    let worker = r#"
echo "PROGRESS 20 Checking ROM"
echo "FAILURE rom_not_found: Could not find the base ROM" >&2
exit 1
"#;
    let f = fixture(worker, sh_config());

    let ticket = f.jobs.start_job(request("")).unwrap();
    let outcome = timeout(Duration::from_secs(10), ticket.wait()).await.unwrap();

    let JobOutcome::Failed(failure) = outcome else {
        panic!("Expected failure, got {:?}", outcome);
    };
    assert_eq!(failure.reason, FailureReason::Declared("rom_not_found".to_string()));
    assert_eq!(failure.short, "rom_not_found");
    assert_eq!(failure.long, "Could not find the base ROM");
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_dependency_raises_fatal_error() {
    let worker = r#"
echo "Traceback (most recent call last):" >&2
echo "ModuleNotFoundError: No module named 'tkinter'" >&2
exit 1
"#;
    let f = fixture(worker, sh_config());
    let mut rx = f.state.subscribe();

    let ticket = f.jobs.start_job(request("")).unwrap();
    let events = events_until_terminal(&mut rx).await;

    let Some(BridgeEvent::GenerateSeedError(failure)) = events.last() else {
        panic!("Expected an error event, got {:?}", events);
    };
    assert_eq!(failure.reason, FailureReason::MissingDependency);
    assert_eq!(failure.short, "ModuleNotFoundError: No module named 'tkinter'");

    let fatal = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(fatal, BridgeEvent::FatalError { ref reason, .. } if reason == "missing_dependency"));

    assert!(matches!(ticket.wait().await, JobOutcome::Failed(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_new_job_accepted_after_terminal() {
    let f = fixture("echo done\n", sh_config());

    let first = f.jobs.start_job(request("")).unwrap();
    assert!(matches!(first.wait().await, JobOutcome::Succeeded(_)));

    let second = f.jobs.start_job(request("")).unwrap();
    assert_eq!(second.id, 2);
    assert_eq!(
        second.wait().await,
        JobOutcome::Succeeded(Value::String("done".to_string()))
    );
}
