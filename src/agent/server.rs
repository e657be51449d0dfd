//! The device agent: receives directives, applies them and drives the capability.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::agent::capability::ReloadCapability;
use crate::agent::stage::{commit, validate_path};
use crate::protocol::compression::decompress;
use crate::protocol::error::ProtocolError;
use crate::protocol::frame::{
    read_directive, read_handshake, write_ack, write_handshake, Ack, WireDirective, MAX_FILE_SIZE, VERSION,
};
use crate::watch::types::ReloadKind;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A directive that has been committed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDirective {
    pub kind: ReloadKind,
    /// Root-relative paths that were written.
    pub changed: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

struct Verified {
    files: Vec<(PathBuf, Vec<u8>)>,
    removed: Vec<PathBuf>,
}

/// Check every entry before anything touches the disk.
fn verify(directive: &WireDirective) -> Result<Verified, ProtocolError> {
    let mut seen = HashSet::new();
    let mut files = Vec::with_capacity(directive.files.len());

    for file in &directive.files {
        let rel = validate_path(&file.path)?;
        if !seen.insert(rel.clone()) {
            return Err(ProtocolError::malformed(format!("duplicate path {}", file.path)));
        }
        let data = decompress(&file.content, file.codec, MAX_FILE_SIZE)?;
        if !file.hash.verify(&data) {
            return Err(ProtocolError::HashMismatch { path: file.path.clone() });
        }
        files.push((rel, data));
    }

    let mut removed = Vec::with_capacity(directive.removed.len());
    for path in &directive.removed {
        let rel = validate_path(path)?;
        if !seen.insert(rel.clone()) {
            return Err(ProtocolError::malformed(format!("duplicate path {}", path)));
        }
        removed.push(rel);
    }

    Ok(Verified { files, removed })
}

pub struct Agent {
    root: PathBuf,
    capability: Arc<dyn ReloadCapability>,
    apply_lock: Mutex<()>,
    read_timeout: Duration,
}

impl Agent {
    pub fn new(root: impl Into<PathBuf>, capability: Arc<dyn ReloadCapability>) -> Self {
        Self {
            root: root.into(),
            capability,
            apply_lock: Mutex::new(()),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Verify and commit without invoking the capability. Either every file is
    /// written or none is.
    async fn apply(&self, directive: WireDirective) -> Result<AppliedDirective, ProtocolError> {
        let root = self.root.clone();
        let kind = directive.kind;
        tokio::task::spawn_blocking(move || -> Result<AppliedDirective, ProtocolError> {
            let verified = verify(&directive)?;
            commit(&root, &verified.files, &verified.removed)?;
            Ok(AppliedDirective {
                kind,
                changed: verified.files.into_iter().map(|(rel, _)| rel).collect(),
                removed: verified.removed,
            })
        })
        .await
        .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?
    }

    /// Hand a committed directive to the capability. Failures are logged only.
    pub async fn invoke(&self, applied: &AppliedDirective) {
        let result = match applied.kind {
            ReloadKind::HotReload => {
                let paths: Vec<PathBuf> = applied.changed.iter().map(|rel| self.root.join(rel)).collect();
                self.capability.apply_hot_swap(&paths).await
            }
            ReloadKind::FullReload => self.capability.apply_restart().await,
        };
        if let Err(e) = result {
            error!("Failed to apply {}: {:#}", applied.kind, e);
        }
    }

    /// Apply a directive and invoke the capability, one directive at a time.
    pub async fn receive(&self, directive: WireDirective) -> Result<AppliedDirective, ProtocolError> {
        let _guard = self.apply_lock.lock().await;
        let applied = self.apply(directive).await?;
        self.invoke(&applied).await;
        Ok(applied)
    }

    /// Serve one connection: handshake, one directive, one ack.
    ///
    /// The ack goes out after the commit and before the capability runs.
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut stream: S,
    ) -> Result<AppliedDirective, ProtocolError> {
        let version = match timeout(self.read_timeout, read_handshake(&mut stream)).await {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                let _ = write_ack(&mut stream, Ack::Error(e.reason())).await;
                return Err(e);
            }
            Err(_) => return Err(timed_out("handshake")),
        };

        write_handshake(&mut stream, VERSION).await?;
        if version != VERSION {
            let _ = write_ack(&mut stream, Ack::Error(crate::protocol::ReasonCode::VersionMismatch)).await;
            return Err(ProtocolError::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let directive = match timeout(self.read_timeout, read_directive(&mut stream)).await {
            Ok(Ok(directive)) => directive,
            Ok(Err(e)) => {
                let _ = write_ack(&mut stream, Ack::Error(e.reason())).await;
                return Err(e);
            }
            Err(_) => return Err(timed_out("directive")),
        };

        let _guard = self.apply_lock.lock().await;
        match self.apply(directive).await {
            Ok(applied) => {
                if let Err(e) = write_ack(&mut stream, Ack::Ok).await {
                    warn!("Failed to acknowledge directive: {}", e);
                }
                drop(stream);
                self.invoke(&applied).await;
                Ok(applied)
            }
            Err(e) => {
                let _ = write_ack(&mut stream, Ack::Error(e.reason())).await;
                Err(e)
            }
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            root = %self.root.display(),
            address = %listener.local_addr().context("Listener has no local address")?,
            "Agent listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                match agent.handle(stream).await {
                    Ok(applied) => info!(
                        %peer,
                        kind = %applied.kind,
                        written = applied.changed.len(),
                        removed = applied.removed.len(),
                        "Applied directive"
                    ),
                    Err(e) => warn!(%peer, reason = %e.reason(), "Rejected directive: {}", e),
                }
            });
        }
    }

    pub async fn bind(self, address: impl ToSocketAddrs) -> Result<(Arc<Self>, TcpListener)> {
        let listener = TcpListener::bind(address).await.context("Failed to bind agent listener")?;
        Ok((Arc::new(self), listener))
    }
}

fn timed_out(stage: &str) -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("timed out waiting for {}", stage),
    ))
}
