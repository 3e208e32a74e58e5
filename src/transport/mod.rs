//! # Transport Abstraction
//!
//! Models the deep tag-type parameterization of the original endpoint
//! hierarchy as a single trait. `ClientEndpoint<T: Transport>` and
//! `ServerEndpoint<T: Transport>` (see `crate::endpoint`) are generic over
//! this trait rather than duplicated per transport.
//!
//! Grounded on `ipc::tcp_socket::TcpSocketTransport` and
//! `ipc::unix_domain_socket::UnixDomainSocketTransport`'s `start_client` /
//! `start_server` / `send` / `receive` shape, generalized to a single seam
//! shared by every concrete transport instead of one inherent impl per type.

pub mod tcp;
pub mod udp;

use async_trait::async_trait;

use crate::error::EndpointError;

/// Socket-level capability every concrete transport implements.
///
/// `read`/`write` operate on whatever framing unit is natural for the
/// transport: a UDP transport's `read` returns one complete datagram, a TCP
/// transport's `read` returns whatever bytes the kernel currently has
/// buffered (the endpoint's receive loop reassembles messages from that).
#[async_trait]
pub trait Transport: Send {
    /// Opens the underlying socket without binding or connecting it.
    async fn open(&mut self) -> Result<(), EndpointError>;

    /// Binds to a local address. `None` lets the OS choose an ephemeral
    /// port.
    async fn bind(&mut self, local_port: Option<u16>) -> Result<(), EndpointError>;

    /// Issues an async connect to the remote peer (no-op for transports
    /// that are connectionless at this layer, e.g. an unbound UDP socket
    /// used purely for server-side receive).
    async fn connect(&mut self) -> Result<(), EndpointError>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError>;

    async fn write(&mut self, buf: &[u8]) -> Result<usize, EndpointError>;

    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Applies the socket options named for reliable streams: `TCP_NODELAY`,
/// `SO_KEEPALIVE`, `SO_REUSEADDR`, `SO_LINGER(true, 0)`, and an optional
/// bind-to-device name.
pub fn apply_stream_options(
    socket: &socket2::Socket,
    device: Option<&str>,
) -> Result<(), std::io::Error> {
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.set_linger(Some(std::time::Duration::from_secs(0)))?;
    if let Some(name) = device {
        bind_to_device(socket, name)?;
    }
    Ok(())
}

/// Applies the options for datagram sockets: `SO_REUSEADDR` plus, on the
/// multicast reception socket, `IP_PKTINFO`/`IPV6_RECVPKTINFO` so the
/// per-datagram destination address is recoverable (`transport::udp`).
pub fn apply_datagram_options(
    socket: &socket2::Socket,
    receive_buffer_size: usize,
    device: Option<&str>,
) -> Result<(), std::io::Error> {
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(receive_buffer_size)?;
    if let Some(name) = device {
        bind_to_device(socket, name)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &socket2::Socket, name: &str) -> Result<(), std::io::Error> {
    socket.bind_device(Some(name.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &socket2::Socket, _name: &str) -> Result<(), std::io::Error> {
    Ok(())
}
