use std::fmt;
use std::time::Instant;

use cp_base::{DocumentId, UserId};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::gateway::ServerMessage;

/// Identifies one WebSocket connection, distinct from the user it
/// belongs to: the same user may hold several connections (multiple
/// tabs, multiple devices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One live WebSocket connection. The socket itself is abstracted to an
/// outbound channel so the connection manager can be exercised without a
/// real `axum` upgrade in tests, matching the handle-over-socket shape
/// the sandbox pool uses for `ExecutorHandle`.
pub struct Connection {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub connected_at: Instant,
    sender: UnboundedSender<ServerMessage>,
}

impl Connection {
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Tracks every live connection by three independent indices — by
/// client, by document, and by user — so broadcast-to-document and
/// broadcast-to-user lookups never have to scan the full connection
/// set. Each index is its own `dashmap` shard rather than one lock
/// guarding all three's fine-grained-locking requirement.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ClientId, Connection>,
    by_document: DashMap<DocumentId, DashSet<ClientId>>,
    by_user: DashMap<UserId, DashSet<ClientId>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        sender: UnboundedSender<ServerMessage>,
    ) -> ClientId {
        let client_id = ClientId::new();
        self.by_document
            .entry(document_id.clone())
            .or_default()
            .insert(client_id);
        self.by_user.entry(user_id).or_default().insert(client_id);
        self.connections.insert(
            client_id,
            Connection {
                client_id,
                user_id,
                document_id,
                connected_at: Instant::now(),
                sender,
            },
        );
        client_id
    }

    pub fn disconnect(&self, client_id: ClientId) -> Option<Connection> {
        let (_, connection) = self.connections.remove(&client_id)?;
        if let Some(doc_clients) = self.by_document.get(&connection.document_id) {
            doc_clients.remove(&client_id);
        }
        if let Some(user_clients) = self.by_user.get(&connection.user_id) {
            user_clients.remove(&client_id);
        }
        Some(connection)
    }

    /// Atomically moves a connection from its current document to
    /// `document_id`, updating both document index entries.
    pub fn join_document(&self, client_id: ClientId, document_id: DocumentId) -> Result<()> {
        let mut connection = self
            .connections
            .get_mut(&client_id)
            .ok_or_else(|| CollabError::ConnectionNotFound { client_id: client_id.to_string() })?;
        let previous = connection.document_id.clone();
        if previous == document_id {
            return Ok(());
        }
        if let Some(prev_clients) = self.by_document.get(&previous) {
            prev_clients.remove(&client_id);
        }
        self.by_document
            .entry(document_id.clone())
            .or_default()
            .insert(client_id);
        connection.document_id = document_id;
        Ok(())
    }

    pub fn send_to_client(&self, client_id: ClientId, message: ServerMessage) -> Result<()> {
        let connection = self
            .connections
            .get(&client_id)
            .ok_or_else(|| CollabError::ConnectionNotFound { client_id: client_id.to_string() })?;
        connection.send(message);
        Ok(())
    }

    /// Sends `message` to every client in `document_id` except
    /// `exclude`, returning the number of clients reached.
    pub fn broadcast_to_document(
        &self,
        document_id: &DocumentId,
        message: ServerMessage,
        exclude: Option<ClientId>,
    ) -> usize {
        let Some(clients) = self.by_document.get(document_id) else {
            return 0;
        };
        let mut sent = 0;
        for client_ref in clients.iter() {
            let client_id = *client_ref;
            if Some(client_id) == exclude {
                continue;
            }
            if let Some(connection) = self.connections.get(&client_id) {
                if connection.send(message.clone()) {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn broadcast_to_user(&self, user_id: UserId, message: ServerMessage, exclude: Option<ClientId>) -> usize {
        let Some(clients) = self.by_user.get(&user_id) else {
            return 0;
        };
        let mut sent = 0;
        for client_ref in clients.iter() {
            let client_id = *client_ref;
            if Some(client_id) == exclude {
                continue;
            }
            if let Some(connection) = self.connections.get(&client_id) {
                if connection.send(message.clone()) {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn document_clients(&self, document_id: &DocumentId) -> Vec<ClientId> {
        self.by_document
            .get(document_id)
            .map(|set| set.iter().map(|c| *c).collect())
            .unwrap_or_default()
    }

    /// Unique users currently connected to `document_id`, derived from
    /// its client set.
    pub fn document_users(&self, document_id: &DocumentId) -> Vec<UserId> {
        let Some(clients) = self.by_document.get(document_id) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = clients
            .iter()
            .filter_map(|c| self.connections.get(&*c).map(|conn| conn.user_id))
            .collect();
        users.sort_by_key(|u| u.as_uuid());
        users.dedup();
        users
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn document_count(&self) -> usize {
        self.by_document.iter().filter(|e| !e.value().is_empty()).count()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.iter().filter(|e| !e.value().is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn connect(manager: &ConnectionManager, user: UserId, doc: &DocumentId) -> ClientId {
        let (tx, _rx) = unbounded_channel();
        manager.connect(user, doc.clone(), tx)
    }

    #[test]
    fn tracks_connection_document_and_user_counts() {
        let manager = ConnectionManager::new();
        let doc = DocumentId::new("doc-1");
        let user = UserId::new();
        connect(&manager, user, &doc);
        connect(&manager, user, &doc);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(manager.document_count(), 1);
        assert_eq!(manager.user_count(), 1);
        assert_eq!(manager.document_users(&doc), vec![user]);
    }

    #[test]
    fn disconnect_cleans_up_every_index() {
        let manager = ConnectionManager::new();
        let doc = DocumentId::new("doc-1");
        let user = UserId::new();
        let client = connect(&manager, user, &doc);
        manager.disconnect(client);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.document_clients(&doc).is_empty());
    }

    #[test]
    fn join_document_moves_between_document_indices() {
        let manager = ConnectionManager::new();
        let doc_a = DocumentId::new("doc-a");
        let doc_b = DocumentId::new("doc-b");
        let user = UserId::new();
        let client = connect(&manager, user, &doc_a);
        manager.join_document(client, doc_b.clone()).unwrap();
        assert!(manager.document_clients(&doc_a).is_empty());
        assert_eq!(manager.document_clients(&doc_b), vec![client]);
    }

    #[test]
    fn broadcast_to_document_excludes_the_sender() {
        let manager = ConnectionManager::new();
        let doc = DocumentId::new("doc-1");
        let user = UserId::new();
        let a = connect(&manager, user, &doc);
        let _b = connect(&manager, UserId::new(), &doc);
        let sent = manager.broadcast_to_document(&doc, ServerMessage::Ack { version: 0, batch_id: None }, Some(a));
        assert_eq!(sent, 1);
    }
}
