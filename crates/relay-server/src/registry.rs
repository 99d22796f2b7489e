//! Connection registry: the locally-attached clients of this process and
//! how many of them this process has contributed to the shared count.
//!
//! The map and the contribution counter move together under one lock, except
//! that [`ConnectionRegistry::release_local`] zeroes the contribution without
//! touching the map once the reconciler has written it back to the store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::{ConnectionId, ProcessId, RelayError, Result};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::connection::ClientConnection;

/// Returned by [`ConnectionRegistry::attach`]; used to detach and to target
/// fan-out at one client.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection: Arc<ClientConnection>,
}

impl ConnectionHandle {
    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.connection.id
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }
}

/// What the ingress planners may inspect about the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryView {
    /// Whether the handle in question is still attached.
    pub attached: bool,
    /// This process's contribution to the shared count.
    pub local_count: u64,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    local_count: u64,
}

/// Per-process registry of attached clients.
pub struct ConnectionRegistry {
    process_id: ProcessId,
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create an empty registry owned by `process_id`.
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Identity of the owning process.
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Register a new connection whose frames go to `tx`.
    pub fn attach(&self, tx: mpsc::Sender<Arc<String>>) -> ConnectionHandle {
        let connection = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        let local_count = {
            let mut state = self.state.write();
            let _ = state
                .connections
                .insert(connection.id.clone(), Arc::clone(&connection));
            state.local_count += 1;
            state.local_count
        };
        debug!(conn_id = %connection.id, local_count, "attached");
        ConnectionHandle { connection }
    }

    /// Remove a connection. Returns the new local count.
    ///
    /// Detaching a handle twice is an `InvariantViolation`; the counter is
    /// left untouched.
    pub fn detach(&self, handle: &ConnectionHandle) -> Result<u64> {
        let mut state = self.state.write();
        if state.connections.remove(handle.id()).is_none() {
            drop(state);
            let err = RelayError::InvariantViolation(format!("double detach of {}", handle.id()));
            error!(conn_id = %handle.id(), error = %err, "registry invariant violated");
            return Err(err);
        }
        // Zero after a reconcile released the contribution.
        state.local_count = state.local_count.saturating_sub(1);
        let local_count = state.local_count;
        drop(state);
        debug!(conn_id = %handle.id(), local_count, "detached");
        Ok(local_count)
    }

    /// This process's contribution to the shared count.
    pub fn local_count(&self) -> u64 {
        self.state.read().local_count
    }

    /// Number of connections currently attached.
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Snapshot of the fields the ingress planners depend on.
    pub fn view(&self, handle: &ConnectionHandle) -> RegistryView {
        let state = self.state.read();
        RegistryView {
            attached: state.connections.contains_key(handle.id()),
            local_count: state.local_count,
        }
    }

    /// Visit every attached connection. Returns how many were visited.
    ///
    /// Visits a snapshot taken under the read lock, so attaches and detaches
    /// racing the visit neither block on it nor cause a double visit.
    pub fn for_each_local(&self, mut visitor: impl FnMut(&Arc<ClientConnection>)) -> usize {
        let snapshot: Vec<Arc<ClientConnection>> =
            self.state.read().connections.values().cloned().collect();
        for connection in &snapshot {
            visitor(connection);
        }
        snapshot.len()
    }

    /// Release `amount` of the local contribution after it has been removed
    /// from the shared store. Returns what remains.
    pub fn release_local(&self, amount: u64) -> u64 {
        let mut state = self.state.write();
        state.local_count = state.local_count.saturating_sub(amount);
        state.local_count
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ConnectionRegistry")
            .field("process_id", &self.process_id)
            .field("connections", &state.connections.len())
            .field("local_count", &state.local_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(ProcessId::from("proc_test"))
    }

    fn attach(reg: &ConnectionRegistry) -> (ConnectionHandle, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (reg.attach(tx), rx)
    }

    #[test]
    fn attach_increments_local_count() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        let (b, _rb) = attach(&reg);
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.local_count(), 2);
        assert_eq!(reg.connection_count(), 2);
    }

    #[test]
    fn detach_decrements_local_count() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        let (_b, _rb) = attach(&reg);
        assert_eq!(reg.detach(&a).unwrap(), 1);
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn double_detach_is_invariant_violation() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        let (_b, _rb) = attach(&reg);
        reg.detach(&a).unwrap();

        let err = reg.detach(&a).unwrap_err();
        assert_eq!(err.error_kind(), "invariant_violation");
        assert_eq!(reg.local_count(), 1);
    }

    #[test]
    fn view_reflects_attachment() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        assert_eq!(
            reg.view(&a),
            RegistryView {
                attached: true,
                local_count: 1
            }
        );
        reg.detach(&a).unwrap();
        assert_eq!(
            reg.view(&a),
            RegistryView {
                attached: false,
                local_count: 0
            }
        );
    }

    #[test]
    fn for_each_local_visits_every_connection_once() {
        let reg = registry();
        let handles: Vec<_> = (0..3).map(|_| attach(&reg)).collect();
        let mut seen = Vec::new();
        let visited = reg.for_each_local(|c| seen.push(c.id.clone()));
        assert_eq!(visited, 3);
        seen.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        seen.dedup();
        assert_eq!(seen.len(), 3);
        drop(handles);
    }

    #[test]
    fn for_each_local_tolerates_mutation_during_visit() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        let (_b, _rb) = attach(&reg);
        let mut extra = Vec::new();
        let visited = reg.for_each_local(|_| {
            // Attaching and detaching from inside the visitor must not deadlock.
            extra.push(attach(&reg));
            let _ = reg.detach(&a);
        });
        assert_eq!(visited, 2);
        assert_eq!(reg.connection_count(), 3);
    }

    #[test]
    fn release_local_floors_at_zero_and_detach_stays_sane() {
        let reg = registry();
        let (a, _ra) = attach(&reg);
        let (_b, _rb) = attach(&reg);
        assert_eq!(reg.release_local(2), 0);
        assert_eq!(reg.release_local(5), 0);
        // Connections are still attached; a late detach does not underflow.
        assert_eq!(reg.connection_count(), 2);
        assert_eq!(reg.detach(&a).unwrap(), 0);
    }

    #[test]
    fn process_identity_is_kept() {
        let reg = registry();
        assert_eq!(reg.process_id().as_str(), "proc_test");
    }
}
