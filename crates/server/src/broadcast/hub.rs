use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use tandem_common::protocol::events::StreamEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Which workspaces a live connection may receive events from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceScope {
    All,
    Only(Uuid),
}

impl WorkspaceScope {
    pub fn admits(&self, workspace_id: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::Only(scoped) => *scoped == workspace_id,
        }
    }
}

struct Connection {
    user_id: Uuid,
    scope: WorkspaceScope,
    sender: mpsc::Sender<Arc<StreamEvent>>,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Connections whose buffer was full; they catch up from the log.
    pub dropped: usize,
}

/// Registry of this process's live push connections.
#[derive(Clone)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<Uuid, Connection>>>,
    buffer: usize,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

impl ConnectionHub {
    pub fn new(buffer: usize) -> Self {
        Self { connections: Arc::default(), buffer: buffer.max(1) }
    }

    /// Adds a connection. It stays registered until the returned handle is dropped.
    pub fn register(
        &self,
        user_id: Uuid,
        scope: WorkspaceScope,
    ) -> (ConnectionHandle, mpsc::Receiver<Arc<StreamEvent>>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let connection_id = Uuid::new_v4();
        self.write().insert(
            connection_id,
            Connection { user_id, scope, sender, connected_at: Utc::now() },
        );
        debug!(%connection_id, %user_id, "push connection registered");

        (ConnectionHandle { connection_id, hub: self.clone() }, receiver)
    }

    /// Pushes `event` to every connection whose scope admits its workspace. Never blocks.
    pub fn dispatch(&self, event: &Arc<StreamEvent>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut closed = Vec::new();

        {
            let connections = self.read();
            for (connection_id, connection) in connections.iter() {
                if !connection.scope.admits(event.workspace_id) {
                    continue;
                }
                match connection.sender.try_send(Arc::clone(event)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        warn!(
                            %connection_id,
                            user_id = %connection.user_id,
                            stream_id = %event.stream_id,
                            sequence = event.sequence,
                            "push buffer full; dropping live event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*connection_id),
                }
            }
        }

        if !closed.is_empty() {
            let mut connections = self.write();
            for connection_id in closed {
                connections.remove(&connection_id);
            }
        }

        report
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn connections_for_user(&self, user_id: Uuid) -> Vec<(Uuid, DateTime<Utc>)> {
        self.read()
            .iter()
            .filter(|(_, connection)| connection.user_id == user_id)
            .map(|(connection_id, connection)| (*connection_id, connection.connected_at))
            .collect()
    }

    /// Drops every sender so open push streams end; used on shutdown.
    pub fn close_all(&self) {
        let mut connections = self.write();
        let count = connections.len();
        connections.clear();
        debug!(count, "closed all push connections");
    }

    fn unregister(&self, connection_id: Uuid) {
        if self.write().remove(&connection_id).is_some() {
            debug!(%connection_id, "push connection unregistered");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Connection>> {
        self.connections.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Connection>> {
        self.connections.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a connection registered for as long as it lives.
pub struct ConnectionHandle {
    connection_id: Uuid,
    hub: ConnectionHub,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.connection_id
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.hub.unregister(self.connection_id);
    }
}
