//! Per-target results of one dispatch.

use chrono::{DateTime, Utc};
use colored::Colorize;
use humansize::{format_size, DECIMAL};
use serde::{Serialize, Serializer};
use std::fmt;
use std::io;
use std::time::Duration;

use crate::device::TransportKind;
use crate::protocol::{ProtocolError, ReasonCode};
use crate::watch::types::ChangeBatch;

/// How one attempt to reach one target ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Ok,
    Timeout,
    ConnectionRefused,
    /// Reset, no route, host down: the target vanished mid-session.
    Unreachable,
    ProtocolError(ReasonCode),
}

impl AttemptOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn from_io_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::ProtocolError(ReasonCode::Truncated),
            _ => Self::Unreachable,
        }
    }

    pub fn from_protocol_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Io(io) => Self::from_io_error(io),
            other => Self::ProtocolError(other.reason()),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::ConnectionRefused => write!(f, "CONNECTION_REFUSED"),
            Self::Unreachable => write!(f, "UNREACHABLE"),
            Self::ProtocolError(reason) => write!(f, "PROTOCOL_ERROR ({})", reason),
        }
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Result of delivering one directive to one target.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAttempt {
    pub target: String,
    /// `None` for the local target.
    pub transport: Option<TransportKind>,
    pub outcome: AttemptOutcome,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub bytes_sent: u64,
}

impl SyncAttempt {
    pub fn render(&self) -> String {
        let via = match self.transport {
            Some(transport) => transport.to_string(),
            None => "LOCAL".to_string(),
        };
        let outcome = if self.outcome.is_ok() {
            self.outcome.to_string().green().bold()
        } else {
            self.outcome.to_string().red().bold()
        };
        format!(
            "  {:<20} {:<8} {:<32} {:>10} {:>6}ms",
            self.target,
            via.dimmed(),
            outcome,
            format_size(self.bytes_sent, DECIMAL),
            self.duration.as_millis()
        )
    }
}

/// Aggregated outcome of one dispatch call.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub batch: ChangeBatch,
    pub removed: usize,
    /// Uncompressed size of the files in the directive.
    pub raw_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub attempts: Vec<SyncAttempt>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.attempts.iter().filter(|a| a.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempts.len() - self.succeeded()
    }

    /// True only when there was at least one target and every one of them failed.
    pub fn is_total_failure(&self) -> bool {
        !self.attempts.is_empty() && self.succeeded() == 0
    }

    pub fn attempt(&self, target: &str) -> Option<&SyncAttempt> {
        self.attempts.iter().find(|a| a.target == target)
    }

    /// One header line plus one line per target.
    pub fn render_lines(&self) -> Vec<String> {
        let header = format!(
            "{} {} file(s) ({}), {} removed -> {}/{} target(s) ok",
            self.batch.kind().label().to_uppercase().bold(),
            self.batch.len(),
            format_size(self.raw_bytes, DECIMAL),
            self.removed,
            self.succeeded(),
            self.attempts.len()
        );
        std::iter::once(header)
            .chain(self.attempts.iter().map(SyncAttempt::render))
            .collect()
    }
}
