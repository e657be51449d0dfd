//! Propagation of change batches to every target.
//!
//! A batch becomes one immutable directive snapshot, which the dispatcher delivers
//! to each device agent and the optional local target concurrently.

pub mod directive;
pub mod dispatcher;
pub mod exclude;
pub mod manifest;
pub mod report;
pub mod target;
pub mod throttle;

pub use directive::{DirectiveBuilder, DirectiveSnapshot};
pub use dispatcher::Dispatcher;
pub use exclude::ExcludePatterns;
pub use manifest::TreeManifest;
pub use report::{AttemptOutcome, DispatchReport, SyncAttempt};
pub use target::{Delivery, LocalTarget, RemoteTarget, Target, Timeouts};
pub use throttle::{BandwidthLimit, BandwidthLimiter};
