//! # Routing-Host Callback Interface
//!
//! The routing layer (deciding which local application receives a
//! decoded message) out of this crate. Endpoints talk to it exclusively
//! through the `RoutingHost` trait, which mirrors the routing host's callback list
//! one-for-one. A host implementation lives outside this crate; endpoints
//! only need `Arc<dyn RoutingHost>`.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::endpoint::EndpointId;

/// Credentials attached to a local-transport connection (security/policy
/// is an opaque attachment here). Carries whatever a UDS peer-credential
/// exchange resolved, if the platform supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Routing-host callbacks consumed by endpoints.
#[async_trait]
pub trait RoutingHost: Send + Sync {
    /// A client endpoint transitioned to `CONNECTED`.
    async fn on_connect(&self, endpoint: EndpointId);

    /// A client endpoint lost its connection and is about to reconnect, or a
    /// server-side connection was torn down.
    async fn on_disconnect(&self, endpoint: EndpointId);

    /// `bind()` failed because another process holds the local port. The
    /// host may return a new local port to retry with; returning `None`
    /// means "do not retry".
    async fn on_bind_error(
        &self,
        endpoint: EndpointId,
        remote_ip: IpAddr,
        remote_port: u16,
    ) -> Option<u16>;

    /// Inbound bytes were rejected (semantic reject / framing errors).
    /// Gives the host enough context to synthesize an SD negative response.
    async fn on_error(&self, bytes: &[u8], endpoint: EndpointId, remote_ip: IpAddr, remote_port: u16);

    /// A fully-framed, reassembled-if-needed message arrived.
    #[allow(clippy::too_many_arguments)]
    async fn on_message(
        &self,
        bytes: &[u8],
        endpoint: EndpointId,
        is_multicast: bool,
        bound_client: u16,
        sec_client: Option<PeerIdentity>,
        remote_ip: IpAddr,
        remote_port: u16,
    );

    /// Join/leave a multicast group on `endpoint` (also used for suspend/resume).
    async fn add_multicast_option(&self, endpoint: EndpointId, join: bool, group: IpAddr);

    /// Allocates or returns this process's own client id.
    fn get_client(&self) -> u16;

    /// Resolves `(service, endpoint)` to a known service instance, used for
    /// the SD-default-target fallback.
    fn find_instance(&self, service: u16, endpoint: EndpointId) -> Option<u16>;

    /// Releases a local port previously reserved for `endpoint`, e.g. after
    /// a bind-error retry picked a different one.
    async fn release_port(&self, port: u16, reliable: bool);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every callback invocation for assertions in endpoint tests.
    #[derive(Default)]
    pub struct RecordingHost {
        pub connects: Mutex<Vec<EndpointId>>,
        pub disconnects: Mutex<Vec<EndpointId>>,
        pub messages: Mutex<Vec<(EndpointId, Vec<u8>, bool, u16)>>,
        pub errors: Mutex<Vec<(EndpointId, Vec<u8>)>>,
        pub client_id: u16,
    }

    #[async_trait]
    impl RoutingHost for RecordingHost {
        async fn on_connect(&self, endpoint: EndpointId) {
            self.connects.lock().unwrap().push(endpoint);
        }

        async fn on_disconnect(&self, endpoint: EndpointId) {
            self.disconnects.lock().unwrap().push(endpoint);
        }

        async fn on_bind_error(
            &self,
            _endpoint: EndpointId,
            _remote_ip: IpAddr,
            _remote_port: u16,
        ) -> Option<u16> {
            None
        }

        async fn on_error(
            &self,
            bytes: &[u8],
            endpoint: EndpointId,
            _remote_ip: IpAddr,
            _remote_port: u16,
        ) {
            self.errors.lock().unwrap().push((endpoint, bytes.to_vec()));
        }

        async fn on_message(
            &self,
            bytes: &[u8],
            endpoint: EndpointId,
            is_multicast: bool,
            bound_client: u16,
            _sec_client: Option<PeerIdentity>,
            _remote_ip: IpAddr,
            _remote_port: u16,
        ) {
            self.messages
                .lock()
                .unwrap()
                .push((endpoint, bytes.to_vec(), is_multicast, bound_client));
        }

        async fn add_multicast_option(&self, _endpoint: EndpointId, _join: bool, _group: IpAddr) {}

        fn get_client(&self) -> u16 {
            self.client_id
        }

        fn find_instance(&self, _service: u16, _endpoint: EndpointId) -> Option<u16> {
            None
        }

        async fn release_port(&self, _port: u16, _reliable: bool) {}
    }
}
