//! TCP connect probing

use crate::error::{is_resource_exhaustion, EngineError};
use crate::network::PortState;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Full-handshake TCP prober
#[derive(Debug, Clone)]
pub struct TcpConnectScanner {
    timeout: Duration,
}

impl TcpConnectScanner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single port.
    ///
    /// A refused connection maps to `Closed` and a timeout to `Filtered`.
    /// Errors are returned only for failures that say nothing about the port,
    /// such as an unreachable network or a process out of file descriptors.
    pub async fn scan_port(&self, target: IpAddr, port: u16) -> crate::Result<PortState> {
        let addr = SocketAddr::new(target, port);

        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(PortState::Open)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(PortState::Closed),
            Ok(Err(e)) => Err(classify_io_error(e, addr)),
            Err(_) => Ok(PortState::Filtered),
        }
    }

    /// Open a stream for a request, with the same timeout
    pub async fn connect(&self, addr: SocketAddr) -> crate::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(classify_io_error(e, addr)),
            Err(_) => Err(EngineError::Timeout),
        }
    }
}

/// Map a socket error to the engine taxonomy
pub fn classify_io_error(error: io::Error, addr: SocketAddr) -> EngineError {
    if is_resource_exhaustion(&error) {
        EngineError::ResourceExhausted(format!("{}: {}", addr, error))
    } else if error.kind() == io::ErrorKind::TimedOut {
        EngineError::Timeout
    } else {
        EngineError::Network(format!("{}: {}", addr, error))
    }
}
