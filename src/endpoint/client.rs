//! # Client Endpoint State Machine
//!
//! `ClientEndpoint<T: Transport>` drives one outbound connection: connect,
//! receive, reconnect-with-backoff, and graceful shutdown, feeding the
//! per-destination `TrainScheduler` on the outbound side and the TP
//! `Reassembler` plus stream-framing resync on the inbound side.
//!
//! One endpoint owns exactly one `tokio::task`, draining a bounded command
//! channel and its transport concurrently via `tokio::select!` — this is
//! the "dedicated mpsc command channel drained by one task" actor shape
//! mentioned for the crate's concurrency model, chosen so no two tasks ever
//! touch the same `TrainScheduler`/receive buffer without synchronization.
//!
//! Grounded on `ipc::tcp_socket::TcpSocketTransport`'s read/write loop shape
//! and `ipc/mod.rs`'s `TransportState`, generalized to the `CLOSED →
//! CONNECTING → CONNECTED → ESTABLISHED` state machine and to reconnect
//! backoff, which that benchmarking tool never needed.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ConfigurationView;
use crate::endpoint::{ConnectionState, Destination, EndpointId};
use crate::error::EndpointError;
use crate::local;
use crate::routing::RoutingHost;
use crate::tp::{self, Reassembler};
use crate::train::{SubmitOutcome, TrainScheduler};
use crate::transport::Transport;
use crate::wire;

/// A client endpoint's read loop reads into a fixed-size scratch buffer
/// per iteration, then appends whatever arrived onto the growing message
/// buffer; this just bounds a single `read()` call, not the message buffer.
const READ_CHUNK: usize = 8192;

/// Consecutive near-empty reads before the receive buffer shrinks back to
/// `INITIAL_BUFFER_CAPACITY`.
const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// A client sends its own magic cookie at most this often, regardless of
/// how much outbound traffic occurred in between.
const COOKIE_RESEND_INTERVAL: Duration = Duration::from_secs(10);

/// Whether a transport carries discrete datagrams (one `read()` = one
/// complete message, or several back-to-back messages) or a raw byte
/// stream (C6 framing/cookie resync applies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    Stream,
    Datagram,
    /// Host-local transports (UDS, local TCP): every frame is wrapped in
    /// the C8 start/end-tag command framing and multiplexed with the
    /// `ASSIGN_CLIENT_ID`/`ASSIGN_CLIENT_ACK` handshake on the same stream.
    Local,
}

/// Local-transport frames declare a size up front, so a single command
/// body can never legitimately exceed the largest SOME/IP message this
/// crate will reassemble.
const MAX_LOCAL_BODY_LEN: usize = 16 * 1024 * 1024;

/// Commands accepted by a running client endpoint's command channel.
pub enum ClientCommand {
    Submit(Vec<u8>),
    PrepareStop(Option<u16>),
    /// `force=true` always restarts; `force=false` is suppressed while a
    /// connect attempt is young and the abort budget isn't exhausted yet.
    Restart { force: bool },
    Stop,
}

pub struct ClientEndpoint<T: Transport> {
    id: EndpointId,
    transport: T,
    framing: FramingKind,
    config: Arc<dyn ConfigurationView>,
    host: Arc<dyn RoutingHost>,
    commands: mpsc::Receiver<ClientCommand>,

    state: ConnectionState,
    remote_ip: IpAddr,
    remote_port: u16,
    local_port: Option<u16>,

    scheduler: TrainScheduler,
    reassembler: Reassembler,
    receive_buffer: Vec<u8>,
    idle_reads: u32,

    backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    restart_aborts: u32,
    connecting_since: Option<Instant>,

    cookies_enabled: bool,
    last_cookie_sent: Option<Instant>,
}

impl<T: Transport> ClientEndpoint<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: EndpointId,
        transport: T,
        framing: FramingKind,
        remote_ip: IpAddr,
        remote_port: u16,
        local_port: Option<u16>,
        config: Arc<dyn ConfigurationView>,
        host: Arc<dyn RoutingHost>,
        queue_limit: usize,
    ) -> (Self, mpsc::Sender<ClientCommand>) {
        let (tx, rx) = mpsc::channel(256);
        let endpoint = Self {
            id,
            transport,
            framing,
            config,
            host,
            commands: rx,
            state: ConnectionState::Closed,
            remote_ip,
            remote_port,
            local_port,
            scheduler: TrainScheduler::new(queue_limit),
            reassembler: Reassembler::new(16 * 1024 * 1024, Duration::from_secs(5)),
            receive_buffer: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            idle_reads: 0,
            backoff: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            restart_aborts: 0,
            connecting_since: None,
            cookies_enabled: false,
            last_cookie_sent: None,
        };
        (endpoint, tx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Promotes an already-`CONNECTED` endpoint to `ESTABLISHED`, e.g. after
    /// an external protocol handshake (local-transport client-id
    /// assignment) completes.
    pub fn promote_established(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Established;
        }
    }

    /// Drives the endpoint until a `Stop` command is received or the
    /// command channel closes. Owns the task this endpoint runs on.
    pub async fn run(mut self) {
        self.start().await;

        loop {
            let wakeup = self.scheduler.next_wakeup();
            let sleep = async {
                match wakeup {
                    Some(at) => tokio::time::sleep_until(to_tokio_instant(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let mut scratch = [0u8; READ_CHUNK];
            let can_read = matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Established
            );

            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ClientCommand::Stop) | None => {
                            self.transport.close().await;
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                result = self.transport.read(&mut scratch), if can_read => {
                    self.handle_read(result, &scratch).await;
                }

                _ = sleep => {
                    self.flush(Instant::now()).await;
                }

                _ = tokio::time::sleep(self.backoff), if self.state == ConnectionState::Connecting => {
                    self.retry_connect().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Submit(payload) => self.submit(payload).await,
            ClientCommand::PrepareStop(service) => self.scheduler.prepare_stop(service),
            ClientCommand::Restart { force } => self.restart(force).await,
            ClientCommand::Stop => unreachable!("handled in run()"),
        }
    }

    async fn start(&mut self) {
        self.state = ConnectionState::Connecting;
        self.connecting_since = Some(Instant::now());

        if let Err(err) = self.transport.open().await {
            warn!(endpoint = %self.id, %err, "open failed, will retry");
            return;
        }
        if let Err(err) = self.transport.bind(self.local_port).await {
            if let Some(new_port) = self
                .host
                .on_bind_error(self.id.clone(), self.remote_ip, self.remote_port)
                .await
            {
                self.local_port = Some(new_port);
            }
            warn!(endpoint = %self.id, %err, "bind failed");
            return;
        }
        self.try_connect().await;
    }

    async fn try_connect(&mut self) {
        match self.transport.connect().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.backoff = self.initial_backoff;
                self.restart_aborts = 0;
                self.host.on_connect(self.id.clone()).await;
                if self.framing == FramingKind::Local {
                    self.send_assign_client_id().await;
                }
            }
            Err(err) => {
                debug!(endpoint = %self.id, %err, "connect failed, backing off");
                self.backoff = (self.backoff * 2).min(self.max_backoff);
            }
        }
    }

    /// Kicks off the local client-id handshake: the endpoint stays
    /// `CONNECTED` (not `ESTABLISHED`, so outbound trains stay queued)
    /// until the daemon's `ASSIGN_CLIENT_ACK` arrives.
    async fn send_assign_client_id(&mut self) {
        let frame = local::encode(local::Opcode::AssignClientId, self.host.get_client(), &[]);
        if let Err(err) = self.transport.write(&frame).await {
            warn!(endpoint = %self.id, %err, "failed to send local client-id handshake");
        }
    }

    async fn retry_connect(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.try_connect().await;
        }
    }

    /// Implements `restart(force)`. Without `force`, suppresses the request
    /// while a connect attempt is young and the abort budget isn't
    /// exhausted, to prevent restart storms.
    async fn restart(&mut self, force: bool) {
        let young = self
            .connecting_since
            .map(|since| since.elapsed() < Duration::from_secs(1))
            .unwrap_or(false);
        let max_aborts = self.config.max_tcp_restart_aborts();

        if !force && self.state == ConnectionState::Connecting && young && self.restart_aborts < max_aborts {
            self.restart_aborts += 1;
            return;
        }

        self.transport.close().await;
        self.host.on_disconnect(self.id.clone()).await;
        self.state = ConnectionState::Closed;
        self.receive_buffer.clear();
        self.start().await;
    }

    async fn submit(&mut self, payload: Vec<u8>) {
        let (service, method) = match (wire::service_id(&payload), wire::method_id(&payload)) {
            (Some(s), Some(m)) => (s, m),
            _ => return,
        };
        let message_type = wire::message_type_byte(&payload).unwrap_or(0);
        let timing = if wire::is_reply_message_type(message_type) {
            self.config
                .get_configured_timing_responses(service, self.remote_ip, self.remote_port, method)
        } else {
            self.config
                .get_configured_timing_requests(service, self.remote_ip, self.remote_port, method)
        };

        let max_message_size = self.max_message_size();
        let now = Instant::now();

        if payload.len() <= max_message_size {
            let outcome = self.scheduler.submit(payload, timing, max_message_size, now);
            self.report_submit_outcome(outcome);
            return;
        }

        if !self
            .config
            .is_tp_client(service, self.remote_ip, self.remote_port, method)
        {
            warn!(endpoint = %self.id, "message too big and TP not enabled");
            return;
        }

        let tp_config = self
            .config
            .get_tp_configuration(service, self.remote_ip, self.remote_port, method);
        for segment in tp::split_message(&payload, tp_config.max_segment_length, tp_config.separation_time_us) {
            let outcome = self
                .scheduler
                .submit_segment(segment.bytes, segment.separation_time_us, now);
            self.report_submit_outcome(outcome);
        }
    }

    fn report_submit_outcome(&self, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Admitted | SubmitOutcome::AdmittedAsSegment => {}
            SubmitOutcome::QueueLimitExceeded => {
                debug!(endpoint = %self.id, "submit rejected: queue limit exceeded");
            }
            SubmitOutcome::MessageTooBig => {
                warn!(endpoint = %self.id, "submit rejected: message too big");
            }
            SubmitOutcome::Stopping => {
                debug!(endpoint = %self.id, "submit rejected: prepare_stop in effect");
            }
        }
    }

    fn max_message_size(&self) -> usize {
        match self.framing {
            FramingKind::Stream | FramingKind::Local => self
                .config
                .max_message_size_reliable(self.remote_ip, self.remote_port),
            FramingKind::Datagram => self.config.max_message_size_unreliable(),
        }
    }

    async fn flush(&mut self, now: Instant) {
        if self.state != ConnectionState::Established && self.framing == FramingKind::Local {
            return;
        }
        self.scheduler.dispatch(now);
        while let Some(entry) = self.scheduler.pop_ready(Instant::now()) {
            let buffer = self.frame_for_wire(&entry.buffer);
            match self.transport.write(&buffer).await {
                Ok(_) => {
                    self.scheduler.on_write_complete(&entry, Instant::now());
                }
                Err(err) => {
                    error!(endpoint = %self.id, %err, "write failed");
                    if err.implies_reconnect() {
                        self.restart(true).await;
                    }
                    break;
                }
            }
        }
    }

    /// Wraps a train's concatenated SOME/IP bytes for the wire: a magic
    /// cookie prefix on stream transports, a C8 command frame on local
    /// transports, or as-is on datagram transports.
    fn frame_for_wire(&mut self, buffer: &[u8]) -> Vec<u8> {
        match self.framing {
            FramingKind::Stream => self.prefix_cookie_if_due(buffer),
            FramingKind::Local => local::encode(local::Opcode::Message, self.host.get_client(), buffer),
            FramingKind::Datagram => buffer.to_vec(),
        }
    }

    fn prefix_cookie_if_due(&mut self, buffer: &[u8]) -> Vec<u8> {
        let due = self
            .last_cookie_sent
            .map(|at| at.elapsed() >= COOKIE_RESEND_INTERVAL)
            .unwrap_or(true);
        if !due {
            return buffer.to_vec();
        }
        self.last_cookie_sent = Some(Instant::now());
        let mut out = Vec::with_capacity(wire::HEADER_LENGTH + buffer.len());
        out.extend_from_slice(&wire::CLIENT_COOKIE);
        out.extend_from_slice(buffer);
        out
    }

    async fn handle_read(&mut self, result: Result<usize, EndpointError>, scratch: &[u8]) {
        match result {
            Ok(n) => {
                self.idle_reads = 0;
                self.receive_buffer.extend_from_slice(&scratch[..n]);
                match self.framing {
                    FramingKind::Stream => self.process_stream_buffer().await,
                    FramingKind::Datagram => self.process_datagram().await,
                    FramingKind::Local => self.process_local_buffer().await,
                }
            }
            Err(err) => {
                if matches!(err, EndpointError::TransientIo(_)) {
                    return;
                }
                error!(endpoint = %self.id, %err, "read failed");
                if err.implies_reconnect() {
                    self.restart(true).await;
                }
            }
        }
    }

    /// Implements the reliable-stream receive loop: shrink-if-idle, resync
    /// on embedded magic cookies, then extract whole messages.
    async fn process_stream_buffer(&mut self) {
        self.maybe_shrink_buffer();

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
                continue;
            }

            let size = wire::message_size(&self.receive_buffer) as usize;
            if size == 0 || self.receive_buffer.len() < size {
                break;
            }

            let message = self.receive_buffer[..size].to_vec();
            self.receive_buffer.drain(0..size);

            if !self.validate_message(&message) {
                self.host
                    .on_error(&message, self.id.clone(), self.remote_ip, self.remote_port)
                    .await;
                self.restart(true).await;
                return;
            }
            self.deliver(message, false).await;
        }
    }

    /// Datagram clients receive one or more back-to-back SOME/IP messages
    /// per `read()`, never a partial one.
    async fn process_datagram(&mut self) {
        let mut buf = std::mem::take(&mut self.receive_buffer);
        let mut offset = 0usize;
        while offset < buf.len() {
            let remaining = &buf[offset..];
            let size = wire::message_size(remaining) as usize;
            if size == 0 || remaining.len() < size {
                self.host
                    .on_error(remaining, self.id.clone(), self.remote_ip, self.remote_port)
                    .await;
                break;
            }
            let message = remaining[..size].to_vec();
            offset += size;
            if !self.validate_message(&message) {
                continue;
            }
            self.deliver(message, false).await;
        }
        buf.clear();
        self.receive_buffer = buf;
    }

    /// Decodes zero or more complete C8 command frames from the receive
    /// buffer, resolving the client-id handshake and unwrapping forwarded
    /// SOME/IP payloads exactly as `process_datagram` would for a
    /// back-to-back batch, since a frame's declared size already delimits
    /// a complete, self-contained body.
    async fn process_local_buffer(&mut self) {
        loop {
            let outcome = match local::decode(&self.receive_buffer, MAX_LOCAL_BODY_LEN) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(endpoint = %self.id, %err, "local command framing error");
                    self.restart(true).await;
                    return;
                }
            };

            let (frame, consumed) = match outcome {
                local::DecodeOutcome::Frame { frame, consumed } => (frame, consumed),
                local::DecodeOutcome::Incomplete { .. } => break,
            };
            self.receive_buffer.drain(0..consumed);

            match frame.opcode {
                local::Opcode::AssignClientAck => {
                    self.promote_established();
                }
                local::Opcode::Message => self.process_local_payload(frame.body).await,
                local::Opcode::Ping => {
                    let pong = local::encode(local::Opcode::Pong, self.host.get_client(), &[]);
                    if let Err(err) = self.transport.write(&pong).await {
                        warn!(endpoint = %self.id, %err, "failed to answer local ping");
                    }
                }
                local::Opcode::Pong | local::Opcode::AssignClientId => {}
            }
        }
    }

    async fn process_local_payload(&mut self, payload: Vec<u8>) {
        let mut offset = 0usize;
        while offset < payload.len() {
            let remaining = &payload[offset..];
            let size = wire::message_size(remaining) as usize;
            if size == 0 || remaining.len() < size {
                self.host
                    .on_error(remaining, self.id.clone(), self.remote_ip, self.remote_port)
                    .await;
                break;
            }
            let message = remaining[..size].to_vec();
            offset += size;
            if !self.validate_message(&message) {
                continue;
            }
            self.deliver(message, false).await;
        }
    }

    fn validate_message(&self, message: &[u8]) -> bool {
        let protocol_ok = wire::protocol_version(message) == Some(0x01);
        let type_ok = wire::message_type_byte(message)
            .map(wire::is_valid_message_type)
            .unwrap_or(false);
        let return_ok = wire::return_code_byte(message)
            .map(wire::is_valid_return_code)
            .unwrap_or(false);
        let no_embedded_cookie = self.cookies_enabled || !wire::is_magic_cookie(message, 0);
        protocol_ok && type_ok && return_ok && no_embedded_cookie
    }

    async fn deliver(&mut self, message: Vec<u8>, is_multicast: bool) {
        let message_type = wire::message_type_byte(&message).unwrap_or(0);
        if wire::is_tp_flagged(message_type) {
            if let Some(key) = tp::fragment_key(&message, self.remote_ip, self.remote_port) {
                match self.reassembler.feed(key, &message) {
                    Ok(Some(reassembled)) => {
                        self.forward(reassembled, is_multicast).await;
                    }
                    Ok(None) => {}
                    Err(_) => {
                        self.host
                            .on_error(&message, self.id.clone(), self.remote_ip, self.remote_port)
                            .await;
                    }
                }
            }
            return;
        }
        self.forward(message, is_multicast).await;
    }

    async fn forward(&self, message: Vec<u8>, is_multicast: bool) {
        let bound_client = self.host.get_client();
        self.host
            .on_message(
                &message,
                self.id.clone(),
                is_multicast,
                bound_client,
                None,
                self.remote_ip,
                self.remote_port,
            )
            .await;
    }

    fn maybe_shrink_buffer(&mut self) {
        if self.receive_buffer.is_empty() {
            self.idle_reads += 1;
            let threshold = self.config.buffer_shrink_threshold() as u32;
            if self.idle_reads >= threshold && self.receive_buffer.capacity() > INITIAL_BUFFER_CAPACITY {
                self.receive_buffer = Vec::with_capacity(INITIAL_BUFFER_CAPACITY);
                self.idle_reads = 0;
            }
        } else {
            self.idle_reads = 0;
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::Remote(std::net::SocketAddr::new(self.remote_ip, self.remote_port))
    }
}

fn to_tokio_instant(at: Instant) -> tokio::time::Instant {
    let now_std = Instant::now();
    let now_tokio = tokio::time::Instant::now();
    if at <= now_std {
        now_tokio
    } else {
        now_tokio + (at - now_std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfiguration;
    use crate::routing::test_support::RecordingHost;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// An in-memory transport for exercising `ClientEndpoint` without real
    /// sockets: `write`s are recorded, `read`s are served from a queue.
    struct MockTransport {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        pending_reads: VecDeque<Vec<u8>>,
        connected: bool,
    }

    impl MockTransport {
        fn new(writes: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
            Self {
                writes,
                pending_reads: VecDeque::new(),
                connected: false,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&mut self) -> Result<(), EndpointError> {
            Ok(())
        }
        async fn bind(&mut self, _local_port: Option<u16>) -> Result<(), EndpointError> {
            Ok(())
        }
        async fn connect(&mut self) -> Result<(), EndpointError> {
            self.connected = true;
            Ok(())
        }
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
            match self.pending_reads.pop_front() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                None => std::future::pending().await,
            }
        }
        async fn write(&mut self, buf: &[u8]) -> Result<usize, EndpointError> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
        async fn close(&mut self) {
            self.connected = false;
        }
        fn is_open(&self) -> bool {
            self.connected
        }
    }

    fn sample_request(service: u16, method: u16) -> Vec<u8> {
        let mut buf = vec![0u8; wire::HEADER_LENGTH];
        buf[0..2].copy_from_slice(&service.to_be_bytes());
        buf[2..4].copy_from_slice(&method.to_be_bytes());
        buf[4..8].copy_from_slice(&8u32.to_be_bytes());
        buf[12] = 0x01;
        buf[14] = 0x00;
        buf
    }

    #[tokio::test]
    async fn submit_then_flush_writes_the_batched_train() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::new(writes.clone());
        let config: Arc<dyn ConfigurationView> = Arc::new(StaticConfiguration::default());
        let host: Arc<dyn RoutingHost> = Arc::new(RecordingHost::default());

        let (mut endpoint, _tx) = ClientEndpoint::new(
            EndpointId::Network {
                protocol: crate::endpoint::Protocol::Tcp,
                address: "127.0.0.1".parse().unwrap(),
                port: 30509,
            },
            transport,
            FramingKind::Stream,
            "127.0.0.1".parse().unwrap(),
            30509,
            None,
            config,
            host,
            0,
        );

        endpoint.state = ConnectionState::Connected;
        endpoint.submit(sample_request(1, 1)).await;
        endpoint.flush(Instant::now() + Duration::from_secs(1)).await;

        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    /// Scenario: a stream message with a bad header is reported to
    /// `on_error` and the connection is reset, per the semantic-reject
    /// rule for reliable-stream framing.
    #[tokio::test]
    async fn bad_header_on_stream_reports_error_and_resets() {
        let config: Arc<dyn ConfigurationView> = Arc::new(StaticConfiguration::default());
        let host = Arc::new(RecordingHost::default());
        let (mut endpoint, _tx) = ClientEndpoint::new(
            EndpointId::Network {
                protocol: crate::endpoint::Protocol::Tcp,
                address: "127.0.0.1".parse().unwrap(),
                port: 30510,
            },
            MockTransport::new(Arc::new(Mutex::new(Vec::new()))),
            FramingKind::Stream,
            "127.0.0.1".parse().unwrap(),
            30510,
            None,
            config,
            host.clone() as Arc<dyn RoutingHost>,
            0,
        );
        endpoint.state = ConnectionState::Connected;

        let mut bad = sample_request(1, 1);
        bad[12] = 0xff; // invalid protocol version
        endpoint.receive_buffer.extend_from_slice(&bad);

        endpoint.process_stream_buffer().await;

        assert_eq!(host.errors.lock().unwrap().len(), 1);
        assert_eq!(host.disconnects.lock().unwrap().len(), 1);
        assert!(host.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn validate_message_rejects_bad_protocol_version() {
        let config: Arc<dyn ConfigurationView> = Arc::new(StaticConfiguration::default());
        let host: Arc<dyn RoutingHost> = Arc::new(RecordingHost::default());
        let (endpoint, _tx) = ClientEndpoint::new(
            EndpointId::Network {
                protocol: crate::endpoint::Protocol::Tcp,
                address: "127.0.0.1".parse().unwrap(),
                port: 1,
            },
            MockTransport::new(Arc::new(Mutex::new(Vec::new()))),
            FramingKind::Stream,
            "127.0.0.1".parse().unwrap(),
            1,
            None,
            config,
            host,
            0,
        );

        let mut bad = sample_request(1, 1);
        bad[12] = 0xff;
        assert!(!endpoint.validate_message(&bad));
    }
}
