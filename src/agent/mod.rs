//! Device agent: the resident receiver on each target.

pub mod capability;
pub mod server;
pub mod stage;

pub use capability::{from_commands, CommandCapability, LogCapability, ReloadCapability, CHANGED_ENV};
pub use server::{Agent, AppliedDirective, DEFAULT_READ_TIMEOUT};
