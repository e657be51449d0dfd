//! Target devices and the transports used to reach them.

pub mod registry;
pub mod transport;

pub use registry::{Device, DeviceHandle, DeviceRegistry, DeviceSnapshot, DeviceState, RegistryError};
pub use transport::{normalize_address, BoxedConnection, Connection, TcpTransport, Transport, TransportKind};
