use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::BoxedSocket;
use crate::error::MediumError;

/// TCP listener backing the Wi-Fi LAN upgraded medium.
#[derive(Debug)]
pub struct WifiLanListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WifiLanListener {
    /// Binds an ephemeral local port.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be bound.
    pub async fn bind() -> Result<Self, MediumError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "wifi-lan listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the IP the remote side should dial.
    #[must_use]
    pub fn ip(&self) -> String {
        self.local_addr.ip().to_string()
    }

    /// Returns the port the remote side should dial.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accepts the next inbound stream.
    ///
    /// # Errors
    ///
    /// Returns an error when the accept fails.
    pub async fn accept(&self) -> Result<BoxedSocket, MediumError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%remote, "wifi-lan inbound stream accepted");
        Ok(Box::new(stream))
    }
}

/// Dials a Wi-Fi LAN listener by ip/port credentials.
#[derive(Debug, Default)]
pub struct WifiLanDialer;

impl WifiLanDialer {
    /// Connects to `ip:port`.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream cannot be established.
    pub async fn connect(&self, ip: &str, port: u16) -> Result<BoxedSocket, MediumError> {
        let stream = TcpStream::connect((ip, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
