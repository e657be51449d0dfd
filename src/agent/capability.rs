//! What a target does once the files of a directive are in place.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Environment variable holding the changed paths, one per line.
pub const CHANGED_ENV: &str = "LIVESYNC_CHANGED";

#[async_trait]
pub trait ReloadCapability: Send + Sync {
    /// Swap `paths` into the running application.
    async fn apply_hot_swap(&self, paths: &[PathBuf]) -> Result<()>;

    /// Restart the application.
    async fn apply_restart(&self) -> Result<()>;
}

/// Only logs. Useful when something else picks the files up.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCapability;

#[async_trait]
impl ReloadCapability for LogCapability {
    async fn apply_hot_swap(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            info!("Hot swap: {}", path.display());
        }
        Ok(())
    }

    async fn apply_restart(&self) -> Result<()> {
        info!("Restart requested");
        Ok(())
    }
}

/// Runs shell commands in the target root.
///
/// The hot swap command is awaited. The restart command is expected to be the
/// long-running application: the previous instance is killed and a new one spawned.
pub struct CommandCapability {
    workdir: PathBuf,
    hot_swap: Option<String>,
    restart: Option<String>,
    running: Mutex<Option<Child>>,
}

impl CommandCapability {
    pub fn new(workdir: impl Into<PathBuf>, hot_swap: Option<String>, restart: Option<String>) -> Self {
        Self {
            workdir: workdir.into(),
            hot_swap,
            restart,
            running: Mutex::new(None),
        }
    }

    fn shell(&self, command: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(command).current_dir(&self.workdir);
        cmd
    }
}

fn joined(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ReloadCapability for CommandCapability {
    async fn apply_hot_swap(&self, paths: &[PathBuf]) -> Result<()> {
        let Some(command) = &self.hot_swap else {
            return LogCapability.apply_hot_swap(paths).await;
        };

        let status = self
            .shell(command)
            .env(CHANGED_ENV, joined(paths))
            .status()
            .await
            .with_context(|| format!("Failed to run hot swap command '{}'", command))?;
        if !status.success() {
            bail!("Hot swap command '{}' exited with {}", command, status);
        }
        Ok(())
    }

    async fn apply_restart(&self) -> Result<()> {
        let Some(command) = &self.restart else {
            return LogCapability.apply_restart().await;
        };

        let mut running = self.running.lock().await;
        if let Some(mut previous) = running.take() {
            if let Err(e) = previous.kill().await {
                warn!("Failed to stop previous instance: {}", e);
            }
        }

        let child = self
            .shell(command)
            .spawn()
            .with_context(|| format!("Failed to run restart command '{}'", command))?;
        info!(pid = ?child.id(), "Application restarted");
        *running = Some(child);
        Ok(())
    }
}

/// Pick the capability for a root from optional commands.
pub fn from_commands(
    root: &Path,
    hot_swap: Option<String>,
    restart: Option<String>,
) -> std::sync::Arc<dyn ReloadCapability> {
    if hot_swap.is_none() && restart.is_none() {
        std::sync::Arc::new(LogCapability)
    } else {
        std::sync::Arc::new(CommandCapability::new(root, hot_swap, restart))
    }
}
