//! Bandwidth throttling for directive transfers.
//!
//! A token bucket hands out 1 KiB credits; each connection gets its own bucket.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::frame::Segment;

const CREDIT_BYTES: usize = 1024;
/// Largest single write while throttled.
const MAX_WRITE: usize = 64 * 1024;
/// Burst allowance, in credits.
const BURST: NonZeroU32 = nonzero!(64u32);

/// Bytes per second; zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthLimit {
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    pub fn unlimited() -> Self {
        Self { bytes_per_second: 0 }
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }

    /// Time the limit alone imposes on `bytes`.
    pub fn transfer_time(&self, bytes: u64) -> Duration {
        if self.is_limited() {
            Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64)
        } else {
            Duration::ZERO
        }
    }

    pub fn display(&self) -> String {
        if !self.is_limited() {
            return "unlimited".to_string();
        }
        let bps = self.bytes_per_second;
        if bps >= 1_000_000_000 {
            format!("{:.1} GB/s", bps as f64 / 1_000_000_000.0)
        } else if bps >= 1_000_000 {
            format!("{:.1} MB/s", bps as f64 / 1_000_000.0)
        } else if bps >= 1_000 {
            format!("{:.1} KB/s", bps as f64 / 1_000.0)
        } else {
            format!("{} B/s", bps)
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    limit: BandwidthLimit,
}

impl BandwidthLimiter {
    /// One credit is replenished every `CREDIT_BYTES / bytes_per_second` seconds, so the
    /// pace matches the configured rate even when it is not a multiple of a credit.
    pub fn new(limit: BandwidthLimit) -> Self {
        let limiter = if limit.is_limited() {
            let period = Duration::from_secs_f64(CREDIT_BYTES as f64 / limit.bytes_per_second as f64);
            let per_second = (limit.bytes_per_second / CREDIT_BYTES as u64).clamp(1, u32::MAX as u64) as u32;
            let burst = NonZeroU32::new(per_second).map_or(BURST, |rate| BURST.min(rate));
            Quota::with_period(period).map(|quota| Arc::new(RateLimiter::direct(quota.allow_burst(burst))))
        } else {
            None
        };
        Self { limiter, limit }
    }

    pub fn unlimited() -> Self {
        Self::new(BandwidthLimit::unlimited())
    }

    async fn acquire_credits(&self, credits: usize) {
        if let Some(limiter) = &self.limiter {
            for _ in 0..credits {
                limiter.until_ready().await;
            }
        }
    }

    /// Write encoded segments, pacing them through the bucket. Returns bytes written.
    ///
    /// Credits are charged on the running byte count, so many small segments cost
    /// the same as one large one. `progress` tracks bytes written so far, which
    /// stays readable if the write fails or is abandoned.
    pub async fn write_segments<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        segments: &[Segment<'_>],
        progress: &AtomicU64,
    ) -> std::io::Result<u64> {
        let mut owed = 0usize;
        for segment in segments {
            for chunk in segment.as_ref().chunks(MAX_WRITE) {
                owed += chunk.len();
                self.acquire_credits(owed / CREDIT_BYTES).await;
                owed %= CREDIT_BYTES;
                writer.write_all(chunk).await?;
                progress.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }
        writer.flush().await?;
        Ok(progress.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter").field("limit", &self.limit.display()).finish()
    }
}
