//! Reliable-stream transport (`tcp`).
//!
//! Grounded on `ipc::tcp_socket::TcpSocketTransport`'s `start_client`/
//! `start_server` socket setup, generalized to the shared `Transport` trait
//! and stripped of the benchmark-specific backpressure timing.

use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::{apply_stream_options, Transport};
use crate::endpoint::server::Acceptor;
use crate::error::EndpointError;
use crate::routing::PeerIdentity;

/// Client-side or accepted-connection TCP transport. A server's accept loop
/// constructs one per accepted connection via `from_stream`; a client
/// constructs one via `new` and drives it through `bind`/`connect`.
pub struct TcpTransport {
    remote: SocketAddr,
    local_port: Option<u16>,
    device: Option<String>,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(remote: SocketAddr, device: Option<String>) -> Self {
        Self {
            remote,
            local_port: None,
            device,
            stream: None,
        }
    }

    /// Wraps an already-connected stream, e.g. one an acceptor produced.
    /// Socket options are applied immediately since no `connect` call will
    /// follow.
    pub fn from_stream(stream: TcpStream, device: Option<String>) -> Result<Self, EndpointError> {
        let remote = stream
            .peer_addr()
            .map_err(EndpointError::classify_io)?;
        apply_options(&stream, device.as_deref())?;
        Ok(Self {
            remote,
            local_port: None,
            device,
            stream: Some(stream),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }
}

fn apply_options(stream: &TcpStream, device: Option<&str>) -> Result<(), EndpointError> {
    let socket = SockRef::from(stream);
    apply_stream_options(&socket, device).map_err(EndpointError::classify_io)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> Result<(), EndpointError> {
        Ok(())
    }

    async fn bind(&mut self, local_port: Option<u16>) -> Result<(), EndpointError> {
        self.local_port = local_port;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), EndpointError> {
        let socket = match self.remote {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(EndpointError::classify_io)?;

        if let Some(port) = self.local_port {
            let local = match self.remote {
                SocketAddr::V4(_) => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port),
                SocketAddr::V6(_) => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port),
            };
            socket.bind(local).map_err(EndpointError::classify_io)?;
        }

        let stream = socket
            .connect(self.remote)
            .await
            .map_err(EndpointError::classify_io)?;
        apply_options(&stream, self.device.as_deref())?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        use tokio::io::AsyncReadExt;
        let stream = self.stream.as_mut().ok_or(EndpointError::OperationAborted)?;
        let n = stream.read(buf).await.map_err(EndpointError::classify_io)?;
        if n == 0 {
            return Err(EndpointError::classify_io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, EndpointError> {
        use tokio::io::AsyncWriteExt;
        let stream = self.stream.as_mut().ok_or(EndpointError::OperationAborted)?;
        stream.write_all(buf).await.map_err(EndpointError::classify_io)?;
        Ok(buf.len())
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Accepts inbound TCP connections for `endpoint::server::ServerEndpoint`.
pub struct TcpAcceptor {
    listener: TcpListener,
    device: Option<String>,
}

impl TcpAcceptor {
    pub async fn bind(local: SocketAddr, device: Option<String>) -> Result<Self, EndpointError> {
        let socket = match local {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(EndpointError::classify_io)?;
        socket.set_reuseaddr(true).map_err(EndpointError::classify_io)?;
        socket.bind(local).map_err(EndpointError::classify_io)?;
        let listener = socket.listen(1024).map_err(EndpointError::classify_io)?;
        Ok(Self { listener, device })
    }
}

#[async_trait]
impl Acceptor<TcpTransport> for TcpAcceptor {
    async fn accept(&mut self) -> Result<(TcpTransport, SocketAddr, Option<PeerIdentity>), EndpointError> {
        let (stream, remote) = self.listener.accept().await.map_err(EndpointError::classify_io)?;
        let transport = TcpTransport::from_stream(stream, self.device.clone())?;
        Ok((transport, remote, None))
    }
}
