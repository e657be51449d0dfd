// Tests for the dispatcher against live and broken targets

use crate::{closed_port, network_device, spawn_agent};
use livesync::agent::{Agent, LogCapability};
use livesync::device::{DeviceRegistry, DeviceState};
use livesync::protocol::frame::{read_handshake, write_handshake};
use livesync::protocol::{CompressionLevel, CompressionType, ReasonCode, VERSION};
use livesync::sync::{AttemptOutcome, BandwidthLimit, DirectiveBuilder, Dispatcher, LocalTarget, Timeouts};
use livesync::watch::{ChangeBatch, ReloadKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

fn quick_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_millis(300),
        cold_connect: Duration::from_millis(300),
        ack: Duration::from_millis(300),
    }
}

fn dispatcher(project: &Path, registry: DeviceRegistry) -> Dispatcher {
    Dispatcher::new(Arc::new(registry), DirectiveBuilder::new(project)).with_timeouts(quick_timeouts())
}

fn hot(files: &[&str]) -> ChangeBatch {
    ChangeBatch::new(ReloadKind::HotReload, files.iter().map(PathBuf::from))
}

fn project_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    for (path, content) in files {
        let full = dir.path().join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_closed_port_is_connection_refused() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let registry = DeviceRegistry::new();
    registry.register(network_device("gone", closed_port().await)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::ConnectionRefused);
    assert!(report.is_total_failure());
    assert_eq!(
        dispatcher.registry().get("gone").unwrap().state(),
        DeviceState::Unreachable
    );
}

#[tokio::test]
async fn test_silent_listener_times_out_within_bound() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registry = DeviceRegistry::new();
    registry
        .register(network_device("silent", silent.local_addr().unwrap()))
        .unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    let attempt = &report.attempts[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Timeout);
    assert!(attempt.duration < Duration::from_secs(3), "took {:?}", attempt.duration);
    drop(silent);
}

#[tokio::test]
async fn test_version_mismatch_is_reported() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_handshake(&mut stream).await.unwrap();
        write_handshake(&mut stream, VERSION + 1).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let registry = DeviceRegistry::new();
    registry.register(network_device("future", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    assert_eq!(
        report.attempts[0].outcome,
        AttemptOutcome::ProtocolError(ReasonCode::VersionMismatch)
    );
}

#[tokio::test]
async fn test_successful_delivery_marks_device_connected() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let agent_root = tempdir().unwrap();
    let (addr, recorder) = spawn_agent(agent_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("pixel", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Ok);
    assert!(report.attempts[0].bytes_sent > 0);
    assert_eq!(dispatcher.registry().get("pixel").unwrap().state(), DeviceState::Connected);
    assert_eq!(
        fs::read_to_string(agent_root.path().join("screens/home.kv")).unwrap(),
        "<Home>:"
    );
    assert!(crate::eventually(|| recorder.hot_swap_count() == 1).await);
}

#[tokio::test]
async fn test_repeated_dispatch_is_idempotent() {
    let project = project_with(&[("screens/home.kv", "<Home>:"), ("screens/menu.kv", "<Menu>:")]);
    let agent_root = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(agent_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("pixel", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);
    let batch = hot(&["screens/home.kv", "screens/menu.kv"]);

    for _ in 0..2 {
        let report = dispatcher.dispatch(&batch).await.unwrap();
        assert_eq!(report.succeeded(), 1);
    }

    assert_eq!(fs::read_to_string(agent_root.path().join("screens/home.kv")).unwrap(), "<Home>:");
    assert_eq!(fs::read_to_string(agent_root.path().join("screens/menu.kv")).unwrap(), "<Menu>:");
    let leftovers: Vec<_> = fs::read_dir(agent_root.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".livesync-stage-"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_deleted_files_propagate() {
    let project = project_with(&[("screens/new.kv", "<New>:")]);
    let agent_root = tempdir().unwrap();
    fs::create_dir(agent_root.path().join("screens")).unwrap();
    fs::write(agent_root.path().join("screens/old.kv"), "<Old>:").unwrap();
    let (addr, _recorder) = spawn_agent(agent_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("pixel", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher
        .dispatch(&hot(&["screens/new.kv", "screens/old.kv"]))
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.succeeded(), 1);
    assert!(agent_root.path().join("screens/new.kv").exists());
    assert!(!agent_root.path().join("screens/old.kv").exists());
}

#[tokio::test]
async fn test_compressed_payloads_apply_byte_identically() {
    let text = "Label:\n    text: 'hello'\n".repeat(8 * 1024);
    let binary: Vec<u8> = (0..70_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
    let project = project_with(&[("screens/big.kv", text.as_str())]);
    fs::write(project.path().join("icon.png"), &binary).unwrap();

    for codec in [CompressionType::Gzip, CompressionType::Zstd] {
        let agent_root = tempdir().unwrap();
        let (addr, _recorder) = spawn_agent(agent_root.path()).await;
        let registry = DeviceRegistry::new();
        registry.register(network_device("pixel", addr)).unwrap();

        let builder = DirectiveBuilder::new(project.path()).with_compression(codec, CompressionLevel::new(5));
        let dispatcher = Dispatcher::new(Arc::new(registry), builder).with_timeouts(quick_timeouts());

        let report = dispatcher
            .dispatch(&hot(&["screens/big.kv", "icon.png"]))
            .await
            .unwrap();
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::Ok, "{}", codec.name());
        assert!(report.attempts[0].bytes_sent < (text.len() + binary.len()) as u64);
        assert_eq!(fs::read(agent_root.path().join("screens/big.kv")).unwrap(), text.as_bytes());
        assert_eq!(fs::read(agent_root.path().join("icon.png")).unwrap(), binary);
    }
}

#[tokio::test]
async fn test_one_dead_device_does_not_block_the_others() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let first_root = tempdir().unwrap();
    let second_root = tempdir().unwrap();
    let (first, _) = spawn_agent(first_root.path()).await;
    let (second, _) = spawn_agent(second_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("first", first)).unwrap();
    registry.register(network_device("dead", closed_port().await)).unwrap();
    registry.register(network_device("second", second)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.is_total_failure());
    assert_eq!(
        report.attempt("dead").unwrap().outcome,
        AttemptOutcome::ConnectionRefused
    );
    assert!(first_root.path().join("screens/home.kv").exists());
    assert!(second_root.path().join("screens/home.kv").exists());
}

#[tokio::test]
async fn test_local_mirror_target() {
    let project = project_with(&[("main.src", "print('hi')")]);
    let mirror = tempdir().unwrap();
    let local = LocalTarget::mirrored(
        Agent::new(mirror.path(), Arc::new(LogCapability)),
        Timeouts::default(),
    );
    let dispatcher = dispatcher(project.path(), DeviceRegistry::new())
        .with_remote(false)
        .with_local(Arc::new(local));

    let batch = ChangeBatch::new(ReloadKind::FullReload, [PathBuf::from("main.src")]);
    let report = dispatcher.dispatch(&batch).await.unwrap();

    let attempt = report.attempt(LocalTarget::NAME).unwrap();
    assert_eq!(attempt.outcome, AttemptOutcome::Ok);
    assert_eq!(attempt.transport, None);
    assert_eq!(fs::read_to_string(mirror.path().join("main.src")).unwrap(), "print('hi')");
}

#[tokio::test]
async fn test_report_json_names_each_target() {
    let project = project_with(&[("screens/home.kv", "<Home>:")]);
    let registry = DeviceRegistry::new();
    registry.register(network_device("gone", closed_port().await)).unwrap();
    let dispatcher = dispatcher(project.path(), registry);

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["attempts"][0]["target"], "gone");
    assert_eq!(json["attempts"][0]["outcome"]["status"], "CONNECTION_REFUSED");
}

#[tokio::test]
async fn test_throttled_delivery_fits_its_budget() {
    let content = "x".repeat(3 * 1024);
    let project = project_with(&[("screens/home.kv", content.as_str())]);
    let agent_root = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(agent_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("slow", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry).with_bandwidth(BandwidthLimit::new(2047));

    let report = dispatcher.dispatch(&hot(&["screens/home.kv"])).await.unwrap();
    let attempt = &report.attempts[0];
    assert_eq!(attempt.outcome, AttemptOutcome::Ok, "took {:?}", attempt.duration);
    assert!(attempt.duration >= Duration::from_millis(500));
    assert_eq!(
        fs::read_to_string(agent_root.path().join("screens/home.kv")).unwrap(),
        content
    );
}

fn ten_screens() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("screens")).unwrap();
    for i in 0..10 {
        fs::write(dir.path().join(format!("screens/s{}.kv", i)), format!("<S{}>:", i)).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_push_tree_sends_only_what_changed() {
    let project = ten_screens();
    let state = tempdir().unwrap();
    let agent_root = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(agent_root.path()).await;

    let registry = DeviceRegistry::new();
    registry.register(network_device("pixel", addr)).unwrap();
    let dispatcher = dispatcher(project.path(), registry).with_state_file(state.path().join("state.json"));

    let first = dispatcher.push_tree(false).await.unwrap().unwrap();
    assert_eq!(first.batch.len(), 10);
    assert_eq!(first.succeeded(), 1);

    fs::write(project.path().join("screens/s3.kv"), "<S3>:\n    edited").unwrap();
    fs::write(project.path().join("screens/extra.kv"), "<Extra>:").unwrap();
    fs::remove_file(project.path().join("screens/s7.kv")).unwrap();

    let second = dispatcher.push_tree(false).await.unwrap().unwrap();
    assert_eq!(second.batch.kind(), ReloadKind::FullReload);
    assert_eq!(second.batch.len(), 3);
    assert_eq!(second.removed, 1);
    assert_eq!(
        fs::read_to_string(agent_root.path().join("screens/s3.kv")).unwrap(),
        "<S3>:\n    edited"
    );
    assert!(agent_root.path().join("screens/extra.kv").exists());
    assert!(!agent_root.path().join("screens/s7.kv").exists());

    assert!(dispatcher.push_tree(false).await.unwrap().is_none());

    let forced = dispatcher.push_tree(true).await.unwrap().unwrap();
    assert_eq!(forced.batch.len(), 10);
}

#[tokio::test]
async fn test_failed_push_is_not_recorded() {
    let project = ten_screens();
    let state = tempdir().unwrap();
    let state_file = state.path().join("state.json");

    let registry = DeviceRegistry::new();
    registry.register(network_device("gone", closed_port().await)).unwrap();
    let dispatcher = dispatcher(project.path(), registry).with_state_file(&state_file);

    let report = dispatcher.push_tree(false).await.unwrap().unwrap();
    assert!(report.is_total_failure());
    assert!(!state_file.exists());

    let retry = dispatcher.push_tree(false).await.unwrap().unwrap();
    assert_eq!(retry.batch.len(), 10);
}
