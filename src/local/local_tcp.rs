//! Local-TCP fallback transport: the same command framing as `local::uds`,
//! carried over a loopback TCP stream for platforms without Unix domain
//! sockets. Grounded on `local_tcp_client_endpoint_impl.cpp`/
//! `local_tcp_server_endpoint_impl.cpp` — same frame layout, no kernel
//! credentials, so the `ASSIGN_CLIENT_ID`/`ASSIGN_CLIENT_ACK` handshake
//! carries the only identity information available.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::EndpointError;
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;

/// Thin wrapper so the endpoint state machines can be generic over a
/// distinct `LocalTcp` type even though the byte-level transport is
/// identical to `TcpTransport`; keeps `Protocol::LocalTcp` and
/// `Protocol::Tcp` from being interchangeable at the type level.
pub struct LocalTcpTransport(TcpTransport);

impl LocalTcpTransport {
    pub fn new(remote: SocketAddr) -> Self {
        Self(TcpTransport::new(remote, None))
    }

    pub fn from_stream(stream: tokio::net::TcpStream) -> Result<Self, EndpointError> {
        Ok(Self(TcpTransport::from_stream(stream, None)?))
    }
}

#[async_trait]
impl Transport for LocalTcpTransport {
    async fn open(&mut self) -> Result<(), EndpointError> {
        self.0.open().await
    }

    async fn bind(&mut self, local_port: Option<u16>) -> Result<(), EndpointError> {
        self.0.bind(local_port).await
    }

    async fn connect(&mut self) -> Result<(), EndpointError> {
        self.0.connect().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        self.0.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, EndpointError> {
        self.0.write(buf).await
    }

    async fn close(&mut self) {
        self.0.close().await
    }

    fn is_open(&self) -> bool {
        self.0.is_open()
    }
}
