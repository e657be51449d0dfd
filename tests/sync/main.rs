// Integration tests for change propagation
// Agents run on loopback listeners; devices are plain NETWORK targets

mod agent_tests;
mod dispatch_tests;
mod scenario_tests;

use async_trait::async_trait;
use livesync::agent::{Agent, ReloadCapability};
use livesync::device::{Device, TransportKind};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remembers what the agent asked the application to do.
#[derive(Default)]
pub struct Recorder {
    pub hot_swaps: Mutex<Vec<Vec<PathBuf>>>,
    pub restarts: Mutex<usize>,
}

impl Recorder {
    pub fn hot_swap_count(&self) -> usize {
        self.hot_swaps.lock().unwrap().len()
    }

    pub fn restart_count(&self) -> usize {
        *self.restarts.lock().unwrap()
    }
}

#[async_trait]
impl ReloadCapability for Recorder {
    async fn apply_hot_swap(&self, paths: &[PathBuf]) -> anyhow::Result<()> {
        self.hot_swaps.lock().unwrap().push(paths.to_vec());
        Ok(())
    }

    async fn apply_restart(&self) -> anyhow::Result<()> {
        *self.restarts.lock().unwrap() += 1;
        Ok(())
    }
}

/// Start an agent on an ephemeral loopback port.
pub async fn spawn_agent(root: &Path) -> (SocketAddr, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let agent = Agent::new(root, recorder.clone());
    let (agent, listener) = agent.bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(agent.serve(listener));
    (addr, recorder)
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn network_device(id: &str, addr: SocketAddr) -> Device {
    Device::new(id, TransportKind::Network, addr.to_string())
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
