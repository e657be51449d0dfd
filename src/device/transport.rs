//! How the host reaches a device agent.
//!
//! Both transports end up as TCP: NETWORK devices are dialled directly, USB devices
//! through a port forwarded to the loopback interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Usb,
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Network => write!(f, "NETWORK"),
        }
    }
}

/// A bidirectional byte stream to an agent.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> io::Result<BoxedConnection>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> io::Result<BoxedConnection> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Normalize a configured address to `host:port`.
///
/// A bare host or IP gets `default_port`. Returns `None` when the address cannot
/// be dialled at all.
pub fn normalize_address(address: &str, default_port: u16) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return None;
    }

    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Some(socket.to_string());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port).to_string());
    }

    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            if host.is_empty() || host.contains(':') || port == 0 {
                return None;
            }
            Some(format!("{}:{}", host, port))
        }
        None => Some(format!("{}:{}", address, default_port)),
    }
}
