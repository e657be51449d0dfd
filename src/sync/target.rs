//! Delivery targets: remote device agents and the local machine.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::agent::Agent;
use crate::device::{BoxedConnection, DeviceHandle, DeviceState, Transport, TransportKind};
use crate::protocol::frame::{read_ack, read_handshake, write_handshake, Ack, VERSION};
use crate::protocol::ReasonCode;
use crate::sync::directive::DirectiveSnapshot;
use crate::sync::report::AttemptOutcome;
use crate::sync::throttle::{BandwidthLimit, BandwidthLimiter};

/// Fixed allowance for moving a payload, on top of the per-byte budget.
const TRANSFER_BASE: Duration = Duration::from_secs(5);
/// Slowest throughput a transfer is allowed before it counts as timed out.
const MIN_THROUGHPUT: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Connect timeout for devices last seen CONNECTED.
    pub connect: Duration,
    /// Connect timeout for UNKNOWN or UNREACHABLE devices.
    pub cold_connect: Duration,
    /// How long to wait for each reply from the agent.
    pub ack: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(1000),
            cold_connect: Duration::from_millis(250),
            ack: Duration::from_millis(3000),
        }
    }
}

/// Outcome of one delivery, before timing is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub outcome: AttemptOutcome,
    pub bytes_sent: u64,
}

impl Delivery {
    pub fn ok(bytes_sent: u64) -> Self {
        Self {
            outcome: AttemptOutcome::Ok,
            bytes_sent,
        }
    }

    pub fn failed(outcome: AttemptOutcome, bytes_sent: u64) -> Self {
        Self { outcome, bytes_sent }
    }
}

#[async_trait]
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    /// `None` for the local target.
    fn transport(&self) -> Option<TransportKind>;

    /// Lane that orders directives to this target across overlapping dispatches.
    fn lane(&self) -> Option<&tokio::sync::Mutex<()>> {
        None
    }

    /// Upper bound on one delivery of `snapshot`.
    fn budget(&self, snapshot: &DirectiveSnapshot) -> Duration;

    /// `progress` counts bytes on the wire as they go, so an abandoned delivery can
    /// still report them.
    async fn deliver(&self, snapshot: Arc<DirectiveSnapshot>, progress: &AtomicU64) -> Delivery;
}

fn transfer_budget(payload: u64, limit: BandwidthLimit) -> Duration {
    let floor = Duration::from_secs_f64(payload as f64 / MIN_THROUGHPUT);
    TRANSFER_BASE + floor.max(limit.transfer_time(payload))
}

/// A device agent reached over a [`Transport`].
pub struct RemoteTarget {
    device: Arc<DeviceHandle>,
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    bandwidth: BandwidthLimit,
}

impl RemoteTarget {
    pub fn new(
        device: Arc<DeviceHandle>,
        transport: Arc<dyn Transport>,
        timeouts: Timeouts,
        bandwidth: BandwidthLimit,
    ) -> Self {
        Self {
            device,
            transport,
            timeouts,
            bandwidth,
        }
    }

    fn connect_timeout(&self) -> Duration {
        match self.device.state() {
            DeviceState::Connected => self.timeouts.connect,
            DeviceState::Unknown | DeviceState::Unreachable => self.timeouts.cold_connect,
        }
    }

    /// Handshake, send, wait for the ack.
    async fn exchange(
        &self,
        stream: &mut BoxedConnection,
        snapshot: &DirectiveSnapshot,
        progress: &AtomicU64,
    ) -> Delivery {
        if let Err(e) = write_handshake(stream, VERSION).await {
            return Delivery::failed(AttemptOutcome::from_io_error(&e), 0);
        }

        let version = match timeout(self.timeouts.ack, read_handshake(stream)).await {
            Err(_) => return Delivery::failed(AttemptOutcome::Timeout, 0),
            Ok(Err(e)) => return Delivery::failed(AttemptOutcome::from_protocol_error(&e), 0),
            Ok(Ok(version)) => version,
        };
        if version != VERSION {
            debug!(device = %self.device.id(), version, "Agent speaks a different protocol version");
            return Delivery::failed(AttemptOutcome::ProtocolError(ReasonCode::VersionMismatch), 0);
        }

        let segments = match snapshot.wire.segments() {
            Ok(segments) => segments,
            Err(e) => return Delivery::failed(AttemptOutcome::from_protocol_error(&e), 0),
        };
        let limiter = BandwidthLimiter::new(self.bandwidth);
        let sent = match limiter.write_segments(stream, &segments, progress).await {
            Ok(sent) => sent,
            Err(e) => {
                let partial = progress.load(Ordering::Relaxed);
                // The agent may have rejected the frame early and closed; its ack says why.
                let outcome = match timeout(self.timeouts.ack, read_ack(stream)).await {
                    Ok(Ok(Ack::Error(reason))) => AttemptOutcome::ProtocolError(reason),
                    _ => AttemptOutcome::from_io_error(&e),
                };
                return Delivery::failed(outcome, partial);
            }
        };

        match timeout(self.timeouts.ack, read_ack(stream)).await {
            Err(_) => Delivery::failed(AttemptOutcome::Timeout, sent),
            Ok(Err(e)) => Delivery::failed(AttemptOutcome::from_protocol_error(&e), sent),
            Ok(Ok(Ack::Error(reason))) => Delivery::failed(AttemptOutcome::ProtocolError(reason), sent),
            Ok(Ok(Ack::Ok)) => Delivery::ok(sent),
        }
    }
}

#[async_trait]
impl Target for RemoteTarget {
    fn name(&self) -> &str {
        self.device.id()
    }

    fn transport(&self) -> Option<TransportKind> {
        Some(self.device.device().transport)
    }

    fn lane(&self) -> Option<&tokio::sync::Mutex<()>> {
        Some(self.device.lane())
    }

    fn budget(&self, snapshot: &DirectiveSnapshot) -> Duration {
        self.connect_timeout() + self.timeouts.ack * 2 + transfer_budget(snapshot.payload_bytes(), self.bandwidth)
    }

    async fn deliver(&self, snapshot: Arc<DirectiveSnapshot>, progress: &AtomicU64) -> Delivery {
        let address = &self.device.device().address;
        let mut stream = match timeout(self.connect_timeout(), self.transport.connect(address)).await {
            Err(_) => return Delivery::failed(AttemptOutcome::Timeout, 0),
            Ok(Err(e)) => return Delivery::failed(AttemptOutcome::from_io_error(&e), 0),
            Ok(Ok(stream)) => stream,
        };
        self.exchange(&mut stream, &snapshot, progress).await
    }
}

/// The development machine itself.
///
/// With a mirror root the directive is applied there like on any agent; without one
/// the files are already in place and only the capability runs.
pub struct LocalTarget {
    agent: Agent,
    mirror: bool,
    timeouts: Timeouts,
}

impl LocalTarget {
    pub const NAME: &'static str = "local";

    pub fn mirrored(agent: Agent, timeouts: Timeouts) -> Self {
        Self {
            agent,
            mirror: true,
            timeouts,
        }
    }

    pub fn in_place(agent: Agent, timeouts: Timeouts) -> Self {
        Self {
            agent,
            mirror: false,
            timeouts,
        }
    }
}

#[async_trait]
impl Target for LocalTarget {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transport(&self) -> Option<TransportKind> {
        None
    }

    fn budget(&self, snapshot: &DirectiveSnapshot) -> Duration {
        self.timeouts.ack + transfer_budget(snapshot.payload_bytes(), BandwidthLimit::unlimited())
    }

    async fn deliver(&self, snapshot: Arc<DirectiveSnapshot>, _progress: &AtomicU64) -> Delivery {
        if !self.mirror {
            let applied = crate::agent::AppliedDirective {
                kind: snapshot.kind(),
                changed: snapshot.wire.files.iter().map(|f| f.path.clone().into()).collect(),
                removed: snapshot.wire.removed.iter().map(Into::into).collect(),
            };
            self.agent.invoke(&applied).await;
            return Delivery::ok(0);
        }

        match self.agent.receive(snapshot.wire.clone()).await {
            Ok(_) => Delivery::ok(snapshot.payload_bytes()),
            Err(e) => Delivery::failed(AttemptOutcome::ProtocolError(e.reason()), 0),
        }
    }
}
