//! # Local Server Endpoint (C8's listening side)
//!
//! The daemon side of a host-local transport: accepts connections from
//! local applications, resolves each one's client id through the
//! `ASSIGN_CLIENT_ID`/`ASSIGN_CLIENT_ACK` handshake, and from then on
//! multiplexes forwarded SOME/IP payloads over the same C8-framed stream.
//!
//! Deliberately not built on `endpoint::server::ServerEndpoint`: that type
//! parses `wire::message_size` straight off the stream and keys connections
//! by `SocketAddr`, neither of which fits a transport that frames every
//! command and whose connections are identified by client id rather than by
//! address. Grounded the same way as `endpoint::server`
//! (`ipc::tcp_socket::TcpSocketTransport`'s per-connection task plus a
//! shared connection-table mutex), adapted to local framing and to
//! `endpoint_manager_base.cpp`'s `create_local_server`/client-id-keyed
//! bookkeeping.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::config::ConfigurationView;
use crate::endpoint::EndpointId;
use crate::error::EndpointError;
use crate::local::{self, Opcode};
use crate::registry::{ClientIdAllocator, UNSET_CLIENT};
use crate::routing::{PeerIdentity, RoutingHost};
use crate::tp::{self, Reassembler};
use crate::train::TrainScheduler;
use crate::transport::Transport;
use crate::wire;

/// Local address placeholder passed to `ConfigurationView` timing lookups,
/// which are keyed by remote address for network transports; local
/// connections have no such address, so every lookup uses loopback.
const LOCAL_PLACEHOLDER_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Accepts new local connections. Implemented per concrete transport
/// (`uds`, `local_tcp`); unlike `endpoint::server::Acceptor` this yields no
/// `SocketAddr` since a local connection's identity is its assigned client
/// id, resolved only after the handshake completes.
#[async_trait]
pub trait LocalAcceptor<T: Transport>: Send {
    async fn accept(&mut self) -> Result<(T, Option<PeerIdentity>), EndpointError>;
}

struct EndpointData {
    scheduler: TrainScheduler,
    last_departure: Option<Instant>,
    writer: mpsc::Sender<Vec<u8>>,
}

pub struct LocalServerEndpoint<T: Transport + 'static, A: LocalAcceptor<T> + 'static> {
    id: EndpointId,
    acceptor: A,
    config: Arc<dyn ConfigurationView>,
    host: Arc<dyn RoutingHost>,
    queue_limit: usize,
    allocator: Arc<Mutex<ClientIdAllocator>>,
    connections: Arc<Mutex<HashMap<u16, EndpointData>>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Transport + 'static, A: LocalAcceptor<T> + 'static> LocalServerEndpoint<T, A> {
    pub fn new(
        id: EndpointId,
        acceptor: A,
        config: Arc<dyn ConfigurationView>,
        host: Arc<dyn RoutingHost>,
        queue_limit: usize,
        allocator: Arc<Mutex<ClientIdAllocator>>,
    ) -> Self {
        Self {
            id,
            acceptor,
            config,
            host,
            queue_limit,
            allocator,
            connections: Arc::new(Mutex::new(HashMap::new())),
            _marker: std::marker::PhantomData,
        }
    }

    /// Runs the accept loop forever. Mirrors
    /// `endpoint::server::ServerEndpoint::run`'s EMFILE/ENFILE retry.
    pub async fn run(mut self) {
        loop {
            match self.acceptor.accept().await {
                Ok((transport, peer_identity)) => {
                    self.spawn_connection(transport, peer_identity).await;
                }
                Err(EndpointError::TransientIo(io_err))
                    if matches!(io_err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) =>
                {
                    warn!(endpoint = %self.id, "accept out of descriptors, retrying in 1000ms");
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
                Err(err) => {
                    error!(endpoint = %self.id, %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
            }
        }
    }

    async fn spawn_connection(&mut self, transport: T, peer_identity: Option<PeerIdentity>) {
        let (writer_tx, writer_rx) = mpsc::channel(256);
        let connection = LocalServerConnection {
            id: self.id.clone(),
            transport,
            peer_identity,
            client: UNSET_CLIENT,
            config: self.config.clone(),
            host: self.host.clone(),
            allocator: self.allocator.clone(),
            connections: self.connections.clone(),
            writer_tx,
            writer_rx,
            reassembler: Reassembler::new(16 * 1024 * 1024, Duration::from_secs(5)),
            receive_buffer: Vec::with_capacity(4096),
        };
        tokio::spawn(connection.run());
    }

    /// Enqueues a payload addressed to `client`'s connection, if it's still
    /// present in the connection table (mirrors
    /// `ServerEndpoint::enqueue` but keyed by client id instead of remote
    /// address, since local routing has no SD-default-target fallback).
    pub async fn submit(&self, client: u16, payload: Vec<u8>) -> Result<(), EndpointError> {
        let service = wire::service_id(&payload).unwrap_or(0);
        let method = wire::method_id(&payload).unwrap_or(0);
        let timing =
            self.config
                .get_configured_timing_responses(service, LOCAL_PLACEHOLDER_IP, 0, method);
        let max_message_size = self.config.max_message_size_local();

        let mut connections = self.connections.lock().await;
        let data = connections.get_mut(&client).ok_or(EndpointError::OperationAborted)?;
        data.scheduler.submit(payload, timing, max_message_size, Instant::now());
        Ok(())
    }

    /// Flushes every connection's ready trains, wrapping each as a C8
    /// `Message` frame before handing it to the connection's writer task.
    pub async fn flush_all(&self) {
        let mut connections = self.connections.lock().await;
        let now = Instant::now();
        for (client, data) in connections.iter_mut() {
            data.scheduler.dispatch(now);
            while let Some(entry) = data.scheduler.pop_ready(now) {
                let framed = local::encode(Opcode::Message, *client, &entry.buffer);
                if data.writer.send(framed).await.is_ok() {
                    data.scheduler.on_write_complete(&entry, now);
                    data.last_departure = Some(now);
                } else {
                    debug!(client, "writer channel closed, dropping entry");
                }
            }
        }
    }

    pub fn prepare_stop(&self, service: Option<u16>) -> tokio::task::JoinHandle<()> {
        let connections = self.connections.clone();
        tokio::spawn(async move {
            let mut connections = connections.lock().await;
            for data in connections.values_mut() {
                data.scheduler.prepare_stop(service);
            }
        })
    }
}

/// Per-connection receive/send loop. Unlike `endpoint::server`'s
/// `ServerConnection`, this one starts unregistered: it only gains an entry
/// in the shared connection table once the client-id handshake assigns it
/// an id.
struct LocalServerConnection<T: Transport> {
    id: EndpointId,
    transport: T,
    peer_identity: Option<PeerIdentity>,
    client: u16,
    config: Arc<dyn ConfigurationView>,
    host: Arc<dyn RoutingHost>,
    allocator: Arc<Mutex<ClientIdAllocator>>,
    connections: Arc<Mutex<HashMap<u16, EndpointData>>>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    writer_rx: mpsc::Receiver<Vec<u8>>,
    reassembler: Reassembler,
    receive_buffer: Vec<u8>,
}

impl<T: Transport> LocalServerConnection<T> {
    async fn run(mut self) {
        let mut scratch = [0u8; 8192];
        loop {
            tokio::select! {
                biased;

                outbound = self.writer_rx.recv() => {
                    match outbound {
                        Some(framed) => {
                            if let Err(err) = self.transport.write(&framed).await {
                                error!(endpoint = %self.id, client = self.client, %err, "local server write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }

                result = self.transport.read(&mut scratch) => {
                    match result {
                        Ok(n) => {
                            self.receive_buffer.extend_from_slice(&scratch[..n]);
                            if !self.process_buffer().await {
                                break;
                            }
                        }
                        Err(EndpointError::TransientIo(_)) => continue,
                        Err(err) => {
                            debug!(endpoint = %self.id, client = self.client, %err, "local connection closed");
                            break;
                        }
                    }
                }
            }
        }

        self.transport.close().await;
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.client != UNSET_CLIENT {
            self.connections.lock().await.remove(&self.client);
            self.allocator.lock().await.release(self.client);
            self.host.on_disconnect(self.id.clone()).await;
        }
    }

    /// Decodes and dispatches every complete frame currently buffered.
    /// Returns `false` if local framing was violated and the connection
    /// must be torn down.
    async fn process_buffer(&mut self) -> bool {
        loop {
            let outcome = match local::decode(&self.receive_buffer, self.config.max_message_size_local()) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(endpoint = %self.id, %err, "local command framing error");
                    return false;
                }
            };

            let (frame, consumed) = match outcome {
                local::DecodeOutcome::Frame { frame, consumed } => (frame, consumed),
                local::DecodeOutcome::Incomplete { .. } => return true,
            };
            self.receive_buffer.drain(0..consumed);

            match frame.opcode {
                Opcode::AssignClientId => self.handle_assign_client_id(frame.client).await,
                Opcode::Message if self.client != UNSET_CLIENT => self.deliver(frame.body).await,
                Opcode::Message => {
                    warn!(endpoint = %self.id, "message frame before client-id assignment, dropping");
                }
                Opcode::Ping => {
                    let pong = local::encode(Opcode::Pong, self.client, &[]);
                    if self.writer_tx.send(pong).await.is_err() {
                        return false;
                    }
                }
                Opcode::Pong | Opcode::AssignClientAck => {}
            }
        }
    }

    /// Resolves the requested client id through the shared allocator and
    /// registers this connection in the connection table under the
    /// resulting id, then acknowledges with the id actually assigned
    /// (which may differ from what was requested).
    async fn handle_assign_client_id(&mut self, requested: u16) {
        if self.client != UNSET_CLIENT {
            return;
        }
        let name = format!("{}", self.id);
        let assigned = {
            let mut allocator = self.allocator.lock().await;
            if requested == UNSET_CLIENT {
                allocator.allocate(&name)
            } else {
                allocator.request(&name, requested)
            }
        };
        if assigned == UNSET_CLIENT {
            warn!(endpoint = %self.id, "client-id pool exhausted, rejecting connection");
            return;
        }

        self.client = assigned;
        self.connections.lock().await.insert(
            assigned,
            EndpointData {
                scheduler: TrainScheduler::new(0),
                last_departure: None,
                writer: self.writer_tx.clone(),
            },
        );
        self.host.on_connect(self.id.clone()).await;

        let ack = local::encode(Opcode::AssignClientAck, assigned, &[]);
        if self.writer_tx.send(ack).await.is_err() {
            warn!(endpoint = %self.id, client = assigned, "failed to queue client-id ack");
        }
    }

    async fn deliver(&mut self, payload: Vec<u8>) {
        let mut offset = 0usize;
        while offset < payload.len() {
            let remaining = &payload[offset..];
            let size = wire::message_size(remaining) as usize;
            if size == 0 || remaining.len() < size {
                self.host
                    .on_error(remaining, self.id.clone(), LOCAL_PLACEHOLDER_IP, 0)
                    .await;
                break;
            }
            let message = remaining[..size].to_vec();
            offset += size;

            let valid = wire::protocol_version(&message) == Some(0x01)
                && wire::message_type_byte(&message)
                    .map(wire::is_valid_message_type)
                    .unwrap_or(false)
                && wire::return_code_byte(&message)
                    .map(wire::is_valid_return_code)
                    .unwrap_or(false);
            if !valid {
                continue;
            }

            self.forward(message).await;
        }
    }

    async fn forward(&mut self, message: Vec<u8>) {
        let message_type = wire::message_type_byte(&message).unwrap_or(0);
        let reassembled = if wire::is_tp_flagged(message_type) {
            match tp::fragment_key(&message, LOCAL_PLACEHOLDER_IP, self.client) {
                Some(key) => match self.reassembler.feed(key, &message) {
                    Ok(Some(full)) => Some(full),
                    Ok(None) => None,
                    Err(_) => {
                        self.host
                            .on_error(&message, self.id.clone(), LOCAL_PLACEHOLDER_IP, 0)
                            .await;
                        None
                    }
                },
                None => None,
            }
        } else {
            Some(message)
        };

        let Some(complete) = reassembled else { return };
        self.host
            .on_message(
                &complete,
                self.id.clone(),
                false,
                self.client,
                self.peer_identity,
                LOCAL_PLACEHOLDER_IP,
                0,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfiguration;
    use crate::routing::test_support::RecordingHost;

    fn sample_request(service: u16, method: u16) -> Vec<u8> {
        let mut buf = vec![0u8; wire::HEADER_LENGTH];
        buf[0..2].copy_from_slice(&service.to_be_bytes());
        buf[2..4].copy_from_slice(&method.to_be_bytes());
        buf[4..8].copy_from_slice(&8u32.to_be_bytes());
        buf[12] = 0x01;
        buf[14] = 0x00;
        buf
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn open(&mut self) -> Result<(), EndpointError> {
            Ok(())
        }
        async fn bind(&mut self, _local_port: Option<u16>) -> Result<(), EndpointError> {
            Ok(())
        }
        async fn connect(&mut self) -> Result<(), EndpointError> {
            Ok(())
        }
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, EndpointError> {
            std::future::pending().await
        }
        async fn write(&mut self, buf: &[u8]) -> Result<usize, EndpointError> {
            Ok(buf.len())
        }
        async fn close(&mut self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn connection(host: Arc<RecordingHost>) -> LocalServerConnection<NullTransport> {
        let (writer_tx, writer_rx) = mpsc::channel(16);
        LocalServerConnection {
            id: EndpointId::Local {
                protocol: crate::endpoint::Protocol::LocalUds,
                path: "/run/test".into(),
            },
            transport: NullTransport,
            peer_identity: None,
            client: UNSET_CLIENT,
            config: Arc::new(StaticConfiguration::default()),
            host,
            allocator: Arc::new(Mutex::new(ClientIdAllocator::new(0, 0, std::iter::empty()))),
            connections: Arc::new(Mutex::new(HashMap::new())),
            writer_tx,
            writer_rx,
            reassembler: Reassembler::new(16 * 1024 * 1024, Duration::from_secs(5)),
            receive_buffer: Vec::new(),
        }
    }

    #[tokio::test]
    async fn assign_client_id_registers_and_acks() {
        let host = Arc::new(RecordingHost::default());
        let mut conn = connection(host);
        conn.handle_assign_client_id(UNSET_CLIENT).await;

        assert_ne!(conn.client, UNSET_CLIENT);
        assert!(conn.connections.lock().await.contains_key(&conn.client));

        let ack = conn.writer_rx.recv().await.unwrap();
        match local::decode(&ack, 1024).unwrap() {
            local::DecodeOutcome::Frame { frame, .. } => {
                assert_eq!(frame.opcode, Opcode::AssignClientAck);
                assert_eq!(frame.client, conn.client);
            }
            local::DecodeOutcome::Incomplete { .. } => panic!("expected a complete ack frame"),
        }
    }

    #[tokio::test]
    async fn repeated_assignment_request_is_ignored() {
        let host = Arc::new(RecordingHost::default());
        let mut conn = connection(host);
        conn.handle_assign_client_id(UNSET_CLIENT).await;
        let _ = conn.writer_rx.recv().await;
        let first = conn.client;

        conn.handle_assign_client_id(UNSET_CLIENT).await;
        assert_eq!(conn.client, first, "an already-bound connection keeps its id");
        assert_eq!(conn.connections.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn message_before_assignment_is_dropped_without_forwarding() {
        let host = Arc::new(RecordingHost::default());
        let mut conn = connection(host.clone());
        let framed = local::encode(Opcode::Message, 0x0001, &sample_request(1, 1));
        conn.receive_buffer.extend_from_slice(&framed);

        assert!(conn.process_buffer().await);
        assert!(host.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_after_assignment_forwards_to_host() {
        let host = Arc::new(RecordingHost::default());
        let mut conn = connection(host.clone());
        conn.handle_assign_client_id(UNSET_CLIENT).await;
        let _ = conn.writer_rx.recv().await;

        let client = conn.client;
        let framed = local::encode(Opcode::Message, client, &sample_request(7, 9));
        conn.receive_buffer.extend_from_slice(&framed);
        assert!(conn.process_buffer().await);
        assert_eq!(host.messages.lock().unwrap().len(), 1);
    }
}
