//! # Endpoint Manager Glue
//!
//! Construct/find local endpoints by client id for intra-host routing, and
//! track the lifecycle of the listening endpoint a host binds once per
//! network namespace. Grounded on
//! `original_source/implementation/endpoints/src/endpoint_manager_base.cpp`'s
//! `find_or_create_local`/`find_local`/`create_local_server` trio: the same
//! "look up under the lock, create-and-insert on a miss" shape, the same
//! `<base-path><hex client id>` naming for a local listening socket path,
//! generalized from a raw `shared_ptr<endpoint>` table to an owned
//! command-channel handle per endpoint.
//!
//! This module only holds the bookkeeping; it does not itself know how to
//! build a `ClientEndpoint`/`ServerEndpoint` (that needs a concrete
//! transport type chosen by the host, e.g. UDS where available, local TCP
//! otherwise), so endpoint construction is supplied by the caller as an
//! async factory.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::endpoint::client::ClientCommand;

/// A running local client endpoint's externally-visible handle: the command
/// channel the manager uses to drive it, plus the task it runs on so the
/// manager can cancel it on `remove_local`.
pub struct LocalEndpointHandle {
    pub commands: mpsc::Sender<ClientCommand>,
    pub task: JoinHandle<()>,
}

/// Tracks local endpoints by client id for one network namespace. Guards
/// its table with the server-wide connections mutex — callers that also
/// hold a clients-map or queue lock must acquire those in a fixed order
/// (connections before clients before queue) to avoid deadlock.
pub struct EndpointManager {
    network_name: String,
    local_endpoints: Mutex<HashMap<u16, LocalEndpointHandle>>,
}

impl EndpointManager {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            local_endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// The conventional local listening-socket path for `client`:
    /// `<base path><client id, 4 lowercase hex digits>`, mirroring
    /// `endpoint_manager_base::create_local_server`'s
    /// `get_base_path(network) << hex(client)` construction.
    pub fn local_endpoint_path(&self, base_path: &str, client: u16) -> String {
        format!("{base_path}{client:04x}")
    }

    /// Returns the existing handle for `client`, if one is already running.
    pub async fn find_local(&self, client: u16) -> Option<mpsc::Sender<ClientCommand>> {
        self.local_endpoints
            .lock()
            .await
            .get(&client)
            .map(|handle| handle.commands.clone())
    }

    /// Returns the existing endpoint for `client`, or builds one with
    /// `create` and registers it under the lock. `create` is only invoked
    /// on a cache miss, matching `find_or_create_local`'s "look up, then
    /// create-and-start only if absent" shape — it must not be invoked
    /// while any other local-endpoint lookup is in flight, since the whole
    /// point is to avoid two endpoints racing for the same client id.
    pub async fn find_or_create_local<F, Fut>(&self, client: u16, create: F) -> mpsc::Sender<ClientCommand>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LocalEndpointHandle>,
    {
        let mut table = self.local_endpoints.lock().await;
        if let Some(handle) = table.get(&client) {
            return handle.commands.clone();
        }
        info!(network = %self.network_name, client, "creating local endpoint");
        let handle = create().await;
        let commands = handle.commands.clone();
        table.insert(client, handle);
        commands
    }

    /// Stops and removes the endpoint for `client`, if any. Mirrors
    /// `endpoint_manager_base::remove_local`'s stop-then-erase sequencing:
    /// the endpoint is told to shut down its socket before the table entry
    /// disappears, so a concurrent `find_local` never observes a handle
    /// whose task has already exited.
    pub async fn remove_local(&self, client: u16) {
        let handle = self.local_endpoints.lock().await.remove(&client);
        if let Some(handle) = handle {
            let _ = handle.commands.send(ClientCommand::Stop).await;
            handle.task.abort();
        }
    }

    /// The set of client ids with a currently running local endpoint.
    pub async fn connected_clients(&self) -> HashSet<u16> {
        self.local_endpoints.lock().await.keys().copied().collect()
    }

    pub async fn is_connected(&self, client: u16) -> bool {
        self.local_endpoints.lock().await.contains_key(&client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::client::ClientCommand;

    fn fake_handle() -> LocalEndpointHandle {
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        LocalEndpointHandle { commands: tx, task }
    }

    #[tokio::test]
    async fn find_or_create_only_invokes_factory_once_per_client() {
        let manager = EndpointManager::new("net0");
        let mut created = 0;

        for _ in 0..3 {
            manager
                .find_or_create_local(0x0007, || async {
                    created += 1;
                    fake_handle()
                })
                .await;
        }

        assert_eq!(created, 1);
        assert!(manager.is_connected(0x0007).await);
    }

    #[tokio::test]
    async fn remove_local_drops_the_handle() {
        let manager = EndpointManager::new("net0");
        manager.find_or_create_local(3, || async { fake_handle() }).await;
        assert!(manager.is_connected(3).await);

        manager.remove_local(3).await;
        assert!(!manager.is_connected(3).await);
    }

    #[test]
    fn local_endpoint_path_matches_hex_client_convention() {
        let manager = EndpointManager::new("net0");
        assert_eq!(manager.local_endpoint_path("/run/vsomeip-", 0x0007), "/run/vsomeip-0007");
    }
}
