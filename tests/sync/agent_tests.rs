// Tests for the agent over a real socket
// A hand-driven client speaks the wire protocol directly

use crate::spawn_agent;
use livesync::protocol::frame::{read_ack, read_handshake, write_directive, write_handshake, Ack};
use livesync::protocol::{CompressionType, ContentHash, ReasonCode, WireDirective, WireFile, VERSION};
use livesync::watch::ReloadKind;
use std::fs;
use std::net::SocketAddr;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn file(path: &str, data: &[u8]) -> WireFile {
    WireFile {
        path: path.to_string(),
        codec: CompressionType::None,
        content: data.to_vec(),
        hash: ContentHash::of(data),
    }
}

async fn send(addr: SocketAddr, directive: &WireDirective) -> Ack {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_handshake(&mut stream, VERSION).await.unwrap();
    assert_eq!(read_handshake(&mut stream).await.unwrap(), VERSION);
    write_directive(&mut stream, directive).await.unwrap();
    read_ack(&mut stream).await.unwrap()
}

#[tokio::test]
async fn test_agent_applies_directive() {
    let dir = tempdir().unwrap();
    let (addr, recorder) = spawn_agent(dir.path()).await;

    let directive = WireDirective {
        kind: ReloadKind::HotReload,
        files: vec![file("screens/home.kv", b"<Home>:\n    Label:")],
        removed: vec![],
    };
    assert_eq!(send(addr, &directive).await, Ack::Ok);
    assert_eq!(
        fs::read(dir.path().join("screens/home.kv")).unwrap(),
        b"<Home>:\n    Label:"
    );
    assert!(crate::eventually(|| recorder.hot_swap_count() == 1).await);
    assert_eq!(recorder.restart_count(), 0);
}

#[tokio::test]
async fn test_hash_mismatch_leaves_root_untouched() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("keep.txt"), "old").unwrap();
    let (addr, recorder) = spawn_agent(dir.path()).await;

    let mut bad = file("new.txt", b"payload");
    bad.hash = ContentHash::of(b"something else");
    let directive = WireDirective {
        kind: ReloadKind::FullReload,
        files: vec![file("keep.txt", b"new"), bad],
        removed: vec![],
    };

    assert_eq!(send(addr, &directive).await, Ack::Error(ReasonCode::HashMismatch));
    assert_eq!(fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "old");
    assert!(!dir.path().join("new.txt").exists());
    assert_eq!(recorder.restart_count(), 0);
}

#[tokio::test]
async fn test_traversal_outside_root_is_rejected() {
    let outer = tempdir().unwrap();
    let root = outer.path().join("app");
    fs::create_dir(&root).unwrap();
    let (addr, _recorder) = spawn_agent(&root).await;

    for path in ["../escape.txt", "/etc/escape.txt", "a/../../escape.txt"] {
        let directive = WireDirective {
            kind: ReloadKind::HotReload,
            files: vec![file(path, b"x")],
            removed: vec![],
        };
        assert_eq!(send(addr, &directive).await, Ack::Error(ReasonCode::PathRejected), "{}", path);
    }
    assert!(!outer.path().join("escape.txt").exists());
    assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
}

#[tokio::test]
async fn test_removal_of_missing_file_is_ok() {
    let dir = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(dir.path()).await;

    let directive = WireDirective {
        kind: ReloadKind::HotReload,
        files: vec![],
        removed: vec!["never/existed.kv".to_string()],
    };
    assert_eq!(send(addr, &directive).await, Ack::Ok);
    assert_eq!(send(addr, &directive).await, Ack::Ok);
}

#[tokio::test]
async fn test_bad_magic_gets_error_ack() {
    let dir = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(dir.path()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"HTTP").await.unwrap();
    assert_eq!(read_ack(&mut stream).await.unwrap(), Ack::Error(ReasonCode::BadMagic));
}

#[tokio::test]
async fn test_truncated_directive_writes_nothing() {
    let dir = tempdir().unwrap();
    let (addr, _recorder) = spawn_agent(dir.path()).await;

    let directive = WireDirective {
        kind: ReloadKind::HotReload,
        files: vec![file("half.txt", &[7u8; 4096])],
        removed: vec![],
    };
    let encoded = directive.encode().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_handshake(&mut stream, VERSION).await.unwrap();
    read_handshake(&mut stream).await.unwrap();
    stream.write_all(&encoded[..encoded.len() / 2]).await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(read_ack(&mut stream).await.unwrap(), Ack::Error(ReasonCode::Truncated));
    assert!(!dir.path().join("half.txt").exists());
}
