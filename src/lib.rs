// Library module for livesync
// Re-exports modules for use in integration tests and the CLI

pub mod agent;
pub mod config;
pub mod device;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod watch;
