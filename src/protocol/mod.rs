//! Sync protocol v1: framing, content hashes and per-file compression.

pub mod compression;
pub mod error;
pub mod frame;
pub mod hash;

pub use compression::{CompressionLevel, CompressionType};
pub use error::{ProtocolError, ReasonCode};
pub use frame::{Ack, WireDirective, WireFile, MAGIC, VERSION};
pub use hash::ContentHash;
