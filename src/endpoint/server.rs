//! # Server Endpoint
//!
//! `ServerEndpoint<T, A>` accepts inbound connections through an `Acceptor`,
//! gives each one its own per-remote `TrainScheduler`/receive buffer
//! (`EndpointData`), and maintains the *clients map* that routes an
//! outbound response back to whichever remote sent the matching request.
//!
//! One task runs the accept loop; each accepted connection gets its own
//! task, all coordinating through a shared, mutex-guarded connection table
//! — the "server-wide connections mutex" that guards the `remote →
//! connection` map on stream servers.
//!
//! Grounded on `ipc::tcp_socket::TcpSocketTransport`'s `connections:
//! Arc<Mutex<HashMap<ConnectionId, TcpStream>>>` multi-client bookkeeping,
//! generalized from a flat stream map to the richer per-remote
//! `EndpointData` a server-side endpoint needs, plus the clients-map
//! response-routing layer that benchmarking tool never needed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::config::ConfigurationView;
use crate::endpoint::{EndpointId, Protocol};
use crate::error::EndpointError;
use crate::routing::{PeerIdentity, RoutingHost};
use crate::tp::{self, Reassembler};
use crate::train::TrainScheduler;
use crate::transport::Transport;
use crate::wire;

/// Accepts new connections for one concrete transport. Implemented per
/// transport (`tcp`, `uds`, `local_tcp`) since `tokio`'s listener types
/// don't share a common accept trait.
#[async_trait]
pub trait Acceptor<T: Transport>: Send {
    async fn accept(&mut self) -> Result<(T, SocketAddr, Option<PeerIdentity>), EndpointError>;
}

/// Per-remote outbound state: a train scheduler plus the bookkeeping an
/// endpoint needs to drive it (whether a flush is already in flight, and
/// when it last departed).
struct EndpointData {
    scheduler: TrainScheduler,
    last_departure: Option<Instant>,
    writer: mpsc::Sender<Vec<u8>>,
}

/// `(service, method, client)` → `session → remote`, the table that routes
/// a response back to the connection that sent the matching request.
/// Must not grow unboundedly under request floods; entries are pruned
/// lazily whenever a response successfully drains its session,
/// and `prune_older_than` offers a periodic sweep for requests that never
/// got a reply.
#[derive(Default)]
struct ClientsMap {
    entries: HashMap<(u16, u16, u16), HashMap<u16, (SocketAddr, Instant)>>,
}

impl ClientsMap {
    fn record(&mut self, service: u16, method: u16, client: u16, session: u16, remote: SocketAddr) {
        self.entries
            .entry((service, method, client))
            .or_default()
            .insert(session, (remote, Instant::now()));
    }

    fn resolve(&mut self, service: u16, method: u16, client: u16, session: u16) -> Option<SocketAddr> {
        let sessions = self.entries.get_mut(&(service, method, client))?;
        sessions.remove(&session).map(|(remote, _)| remote)
    }

    fn prune_older_than(&mut self, max_age: Duration) {
        let now = Instant::now();
        for sessions in self.entries.values_mut() {
            sessions.retain(|_, (_, seen)| now.duration_since(*seen) <= max_age);
        }
        self.entries.retain(|_, sessions| !sessions.is_empty());
    }
}

pub struct ServerEndpoint<T: Transport + 'static, A: Acceptor<T> + 'static> {
    id: EndpointId,
    acceptor: A,
    config: Arc<dyn ConfigurationView>,
    host: Arc<dyn RoutingHost>,
    queue_limit: usize,
    connections: Arc<Mutex<HashMap<SocketAddr, EndpointData>>>,
    clients: Arc<Mutex<ClientsMap>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Transport + 'static, A: Acceptor<T> + 'static> ServerEndpoint<T, A> {
    pub fn new(
        id: EndpointId,
        acceptor: A,
        config: Arc<dyn ConfigurationView>,
        host: Arc<dyn RoutingHost>,
        queue_limit: usize,
    ) -> Self {
        Self {
            id,
            acceptor,
            config,
            host,
            queue_limit,
            connections: Arc::new(Mutex::new(HashMap::new())),
            clients: Arc::new(Mutex::new(ClientsMap::new_default())),
            _marker: std::marker::PhantomData,
        }
    }

    /// Runs the accept loop forever. `no_descriptors` (EMFILE/ENFILE) is
    /// retried after a fixed delay rather than treated as fatal.
    pub async fn run(mut self) {
        loop {
            match self.acceptor.accept().await {
                Ok((transport, remote, peer_identity)) => {
                    self.spawn_connection(transport, remote, peer_identity).await;
                }
                Err(EndpointError::TransientIo(io_err))
                    if matches!(
                        io_err.raw_os_error(),
                        Some(libc::EMFILE) | Some(libc::ENFILE)
                    ) =>
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

    async fn spawn_connection(&mut self, transport: T, remote: SocketAddr, peer_identity: Option<PeerIdentity>) {
        let (writer_tx, writer_rx) = mpsc::channel(256);
        {
            let mut connections = self.connections.lock().await;
            connections.insert(
                remote,
                EndpointData {
                    scheduler: TrainScheduler::new(self.queue_limit),
                    last_departure: None,
                    writer: writer_tx,
                },
            );
        }

        self.host.on_connect(self.endpoint_id_for(remote)).await;

        let connection = ServerConnection {
            id: self.id.clone(),
            transport,
            remote,
            peer_identity,
            config: self.config.clone(),
            host: self.host.clone(),
            connections: self.connections.clone(),
            clients: self.clients.clone(),
            writer_rx,
            reassembler: Reassembler::new(16 * 1024 * 1024, Duration::from_secs(5)),
            receive_buffer: Vec::with_capacity(4096),
            cookies_enabled: false,
            cookie_prefix_pending: true,
        };
        tokio::spawn(connection.run());
    }

    fn endpoint_id_for(&self, remote: SocketAddr) -> EndpointId {
        EndpointId::Network {
            protocol: protocol_of(&self.id),
            address: remote.ip(),
            port: remote.port(),
        }
    }

    /// Implements the SD-default-target fallback: if no active connection
    /// matches `remote`, ask the routing host for the default instance and
    /// use that connection's destination instead.
    pub async fn submit(
        &self,
        remote: SocketAddr,
        payload: Vec<u8>,
    ) -> Result<(), EndpointError> {
        let service = wire::service_id(&payload).ok_or(EndpointError::MessageTooBig)?;
        let method = wire::method_id(&payload).unwrap_or(0);
        let client = wire::client_id(&payload).unwrap_or(0);
        let session = wire::session_id(&payload).unwrap_or(0);
        let message_type = wire::message_type_byte(&payload).unwrap_or(0);

        if wire::is_reply_message_type(message_type) {
            let mut clients = self.clients.lock().await;
            if let Some(resolved) = clients.resolve(service, method, client, session) {
                drop(clients);
                return self.enqueue(resolved, payload).await;
            }
        } else {
            let mut clients = self.clients.lock().await;
            clients.record(service, method, client, session, remote);
        }

        let target = {
            let connections = self.connections.lock().await;
            if connections.contains_key(&remote) {
                Some(remote)
            } else {
                self.host
                    .find_instance(service, self.id.clone())
                    .and_then(|_| connections.keys().next().copied())
            }
        };

        match target {
            Some(remote) => self.enqueue(remote, payload).await,
            None => Err(EndpointError::PeerLoss(std::io::Error::from(
                std::io::ErrorKind::NotConnected,
            ))),
        }
    }

    async fn enqueue(&self, remote: SocketAddr, payload: Vec<u8>) -> Result<(), EndpointError> {
        let service = wire::service_id(&payload).unwrap_or(0);
        let method = wire::method_id(&payload).unwrap_or(0);
        let timing = self
            .config
            .get_configured_timing_responses(service, remote.ip(), remote.port(), method);
        let max_message_size = self.config.max_message_size_reliable(remote.ip(), remote.port());

        let mut connections = self.connections.lock().await;
        let data = connections
            .get_mut(&remote)
            .ok_or(EndpointError::OperationAborted)?;
        data.scheduler.submit(payload, timing, max_message_size, Instant::now());
        Ok(())
    }

    /// Flushes every connection's ready trains. Intended to be driven by a
    /// shared periodic timer external to the accept loop.
    pub async fn flush_all(&self) {
        let mut connections = self.connections.lock().await;
        let now = Instant::now();
        for (remote, data) in connections.iter_mut() {
            data.scheduler.dispatch(now);
            while let Some(entry) = data.scheduler.pop_ready(now) {
                if data.writer.send((*entry.buffer).clone()).await.is_ok() {
                    data.scheduler.on_write_complete(&entry, now);
                    data.last_departure = Some(now);
                } else {
                    debug!(remote = %remote, "writer channel closed, dropping entry");
                }
            }
        }
        self.clients.lock().await.prune_older_than(Duration::from_secs(60));
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

impl ClientsMap {
    fn new_default() -> Self {
        Self::default()
    }
}

fn protocol_of(id: &EndpointId) -> Protocol {
    match id {
        EndpointId::Network { protocol, .. } => *protocol,
        EndpointId::Local { protocol, .. } => *protocol,
    }
}

/// Per-connection receive/send loop, mirroring `ClientEndpoint`'s framing
/// and TP-reassembly logic without the reconnect state machine (a lost
/// server-side connection is simply removed from the connection table).
struct ServerConnection<T: Transport> {
    id: EndpointId,
    transport: T,
    remote: SocketAddr,
    peer_identity: Option<PeerIdentity>,
    config: Arc<dyn ConfigurationView>,
    host: Arc<dyn RoutingHost>,
    connections: Arc<Mutex<HashMap<SocketAddr, EndpointData>>>,
    clients: Arc<Mutex<ClientsMap>>,
    writer_rx: mpsc::Receiver<Vec<u8>>,
    reassembler: Reassembler,
    receive_buffer: Vec<u8>,
    cookies_enabled: bool,
    /// A server prefixes a service-cookie to the next outbound frame once
    /// magic-cookie mode has been enabled by the peer; this tracks whether
    /// that prefix is still owed.
    cookie_prefix_pending: bool,
}

impl<T: Transport> ServerConnection<T> {
    async fn run(mut self) {
        let mut scratch = [0u8; 8192];
        loop {
            tokio::select! {
                biased;

                outbound = self.writer_rx.recv() => {
                    match outbound {
                        Some(buffer) => {
                            let framed = self.prefix_cookie_if_due(buffer);
                            if let Err(err) = self.transport.write(&framed).await {
                                error!(remote = %self.remote, %err, "server write failed");
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
                            debug!(remote = %self.remote, %err, "server connection closed");
                            break;
                        }
                    }
                }
            }
        }

        self.transport.close().await;
        self.connections.lock().await.remove(&self.remote);
        self.host
            .on_disconnect(EndpointId::Network {
                protocol: protocol_of(&self.id),
                address: self.remote.ip(),
                port: self.remote.port(),
            })
            .await;
    }

    fn prefix_cookie_if_due(&mut self, buffer: Vec<u8>) -> Vec<u8> {
        if !self.cookies_enabled || !self.cookie_prefix_pending {
            return buffer;
        }
        self.cookie_prefix_pending = false;
        let mut out = Vec::with_capacity(wire::HEADER_LENGTH + buffer.len());
        out.extend_from_slice(&wire::SERVICE_COOKIE);
        out.extend_from_slice(&buffer);
        out
    }

    /// Returns `false` if the connection must be torn down (semantic
    /// reject on a stream resets the connection).
    async fn process_buffer(&mut self) -> bool {
        loop {
            if self.cookies_enabled {
                if let Some(cookie_at) = wire::find_magic_cookie(&self.receive_buffer, 0) {
                    if cookie_at > 0 {
                        self.receive_buffer.drain(0..cookie_at);
                        continue;
                    }
                }
            }

            if wire::is_magic_cookie(&self.receive_buffer, 0) {
                self.receive_buffer.drain(0..wire::HEADER_LENGTH);
                self.cookies_enabled = true;
                self.cookie_prefix_pending = true;
                continue;
            }

            let size = wire::message_size(&self.receive_buffer) as usize;
            if size == 0 || self.receive_buffer.len() < size {
                return true;
            }

            let message = self.receive_buffer[..size].to_vec();
            self.receive_buffer.drain(0..size);

            let valid = wire::protocol_version(&message) == Some(0x01)
                && wire::message_type_byte(&message)
                    .map(wire::is_valid_message_type)
                    .unwrap_or(false)
                && wire::return_code_byte(&message)
                    .map(wire::is_valid_return_code)
                    .unwrap_or(false)
                && (self.cookies_enabled || !wire::is_magic_cookie(&message, 0));

            if !valid {
                self.host
                    .on_error(&message, self.id.clone(), self.remote.ip(), self.remote.port())
                    .await;
                return false;
            }

            self.deliver(message).await;
        }
    }

    async fn deliver(&mut self, message: Vec<u8>) {
        let message_type = wire::message_type_byte(&message).unwrap_or(0);
        let reassembled = if wire::is_tp_flagged(message_type) {
            match tp::fragment_key(&message, self.remote.ip(), self.remote.port()) {
                Some(key) => match self.reassembler.feed(key, &message) {
                    Ok(Some(full)) => Some(full),
                    Ok(None) => None,
                    Err(_) => {
                        self.host
                            .on_error(&message, self.id.clone(), self.remote.ip(), self.remote.port())
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

        if !wire::is_reply_message_type(message_type) {
            if let (Some(service), Some(method), Some(client), Some(session)) = (
                wire::service_id(&complete),
                wire::method_id(&complete),
                wire::client_id(&complete),
                wire::session_id(&complete),
            ) {
                self.clients
                    .lock()
                    .await
                    .record(service, method, client, session, self.remote);
            }
        }

        let bound_client = self.host.get_client();
        self.host
            .on_message(
                &complete,
                self.id.clone(),
                false,
                bound_client,
                self.peer_identity,
                self.remote.ip(),
                self.remote.port(),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_map_resolves_once_then_forgets() {
        let mut map = ClientsMap::default();
        let remote: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        map.record(1, 2, 3, 4, remote);
        assert_eq!(map.resolve(1, 2, 3, 4), Some(remote));
        assert_eq!(map.resolve(1, 2, 3, 4), None);
    }

    #[test]
    fn clients_map_prunes_stale_entries() {
        let mut map = ClientsMap::default();
        let remote: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        map.record(1, 2, 3, 4, remote);
        map.prune_older_than(Duration::from_secs(0));
        assert_eq!(map.resolve(1, 2, 3, 4), None);
    }
}
