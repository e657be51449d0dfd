// End-to-end scenarios: config, debouncer, dispatcher and agent together

use crate::spawn_agent;
use livesync::config::Config;
use livesync::session::Session;
use livesync::watch::{ChangeEvent, ChangeKind};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

fn project() -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("main.src"), "run()").unwrap();
    fs::create_dir_all(dir.path().join("screens/dialogs")).unwrap();
    fs::write(dir.path().join("screens/home.kv"), "<Home>:").unwrap();
    fs::write(dir.path().join("screens/dialogs/confirm.kv"), "<Confirm>:").unwrap();
    dir
}

fn config(root: &Path, device: SocketAddr) -> Config {
    let text = format!(
        r#"
[livesync]
full_reload_files = ["main.src"]
watched_folders_recursively = ["screens"]
do_not_watch_patterns = ["*.swp"]
debounce_ms = 50
ack_timeout_ms = 1000

[[livesync.devices]]
id = "pixel"
transport = "NETWORK"
address = "{}"
"#,
        device
    );
    Config::from_toml(&text, root).unwrap()
}

fn modified(root: &Path, rel: &str) -> ChangeEvent {
    ChangeEvent::new(root.join(rel), ChangeKind::Modified)
}

#[tokio::test]
async fn test_hot_edit_then_full_edit() {
    let project = project();
    let device_root = tempdir().unwrap();
    let (addr, recorder) = spawn_agent(device_root.path()).await;
    let session = Session::from_config(&config(project.path(), addr)).unwrap();

    let (tx, rx) = mpsc::channel(16);
    let root = project.path().to_path_buf();
    let feed = async move {
        tx.send(modified(&root, "screens/dialogs/confirm.kv")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(modified(&root, "main.src")).await.unwrap();
    };

    let (stats, ()) = tokio::join!(session.run_events(rx, std::future::pending()), feed);
    let stats = stats.unwrap();

    assert_eq!(stats.batches, 2);
    assert_eq!(stats.total_failures, 0);
    assert_eq!(
        fs::read_to_string(device_root.path().join("screens/dialogs/confirm.kv")).unwrap(),
        "<Confirm>:"
    );
    assert_eq!(fs::read_to_string(device_root.path().join("main.src")).unwrap(), "run()");
    assert!(crate::eventually(|| recorder.hot_swap_count() == 1 && recorder.restart_count() == 1).await);

    let hot = recorder.hot_swaps.lock().unwrap()[0].clone();
    assert_eq!(hot, vec![device_root.path().join("screens/dialogs/confirm.kv")]);
}

#[tokio::test]
async fn test_burst_collapses_into_one_full_reload() {
    let project = project();
    let device_root = tempdir().unwrap();
    let (addr, recorder) = spawn_agent(device_root.path()).await;
    let session = Session::from_config(&config(project.path(), addr)).unwrap();

    let (tx, rx) = mpsc::channel(16);
    for rel in ["screens/home.kv", "screens/home.kv", "main.src", "screens/dialogs/confirm.kv"] {
        tx.send(modified(project.path(), rel)).await.unwrap();
    }
    drop(tx);

    let stats = session.run_events(rx, std::future::pending()).await.unwrap();
    assert_eq!(stats.batches, 1);
    assert!(device_root.path().join("screens/home.kv").exists());
    assert!(device_root.path().join("main.src").exists());
    assert!(crate::eventually(|| recorder.restart_count() == 1).await);
    assert_eq!(recorder.hot_swap_count(), 0);
}

#[tokio::test]
async fn test_ignored_and_unwatched_paths_send_nothing() {
    let project = project();
    let device_root = tempdir().unwrap();
    let (addr, recorder) = spawn_agent(device_root.path()).await;
    let session = Session::from_config(&config(project.path(), addr)).unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(modified(project.path(), "screens/.home.kv.swp")).await.unwrap();
    tx.send(modified(project.path(), "README.md")).await.unwrap();
    drop(tx);

    let stats = session.run_events(rx, std::future::pending()).await.unwrap();
    assert_eq!(stats.batches, 0);
    assert_eq!(fs::read_dir(device_root.path()).unwrap().count(), 0);
    assert_eq!(recorder.hot_swap_count(), 0);
}

#[tokio::test]
async fn test_deleting_a_watched_file_removes_it_on_device() {
    let project = project();
    let device_root = tempdir().unwrap();
    fs::create_dir(device_root.path().join("screens")).unwrap();
    fs::write(device_root.path().join("screens/home.kv"), "<Home>:").unwrap();
    let (addr, _recorder) = spawn_agent(device_root.path()).await;
    let session = Session::from_config(&config(project.path(), addr)).unwrap();

    fs::remove_file(project.path().join("screens/home.kv")).unwrap();
    let (tx, rx) = mpsc::channel(16);
    tx.send(ChangeEvent::new(project.path().join("screens/home.kv"), ChangeKind::Deleted))
        .await
        .unwrap();
    drop(tx);

    let stats = session.run_events(rx, std::future::pending()).await.unwrap();
    assert_eq!(stats.batches, 1);
    assert!(!device_root.path().join("screens/home.kv").exists());
}

#[tokio::test]
async fn test_unreachable_device_counts_as_total_failure() {
    let project = project();
    let session = Session::from_config(&config(project.path(), crate::closed_port().await)).unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(modified(project.path(), "screens/home.kv")).await.unwrap();
    drop(tx);

    let stats = session.run_events(rx, std::future::pending()).await.unwrap();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.total_failures, 1);
}
